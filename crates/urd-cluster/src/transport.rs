use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use urd_types::{LogIndex, NodeId, Term, UrdError};

/// One replication round from the leader to a follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub leader_addr: String,
    pub prev_index: LogIndex,
    pub prev_term: Term,
    /// Codec stream of entries (optionally led by a snapshot).
    pub frames: Vec<u8>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResponse {
    /// The follower's term; higher than the request's if it was stale.
    pub term: Term,
    pub success: bool,
    /// End of the follower's log after handling the request.
    pub last_index: LogIndex,
}

/// Delivers append requests to other metadata nodes.
pub trait PeerTransport: Clone + Send + Sync + 'static {
    fn append_entries(
        &self,
        peer: NodeId,
        req: AppendRequest,
    ) -> impl Future<Output = Result<AppendResponse, UrdError>> + Send;
}

// ---------------------------------------------------------------------------
// LocalPeers: in-process delivery through channels
// ---------------------------------------------------------------------------

pub type PeerReply = oneshot::Sender<Result<AppendResponse, UrdError>>;
pub type PeerInbox = mpsc::Receiver<(AppendRequest, PeerReply)>;

#[derive(Default)]
struct LocalInner {
    nodes: HashMap<NodeId, mpsc::Sender<(AppendRequest, PeerReply)>>,
    isolated: HashSet<NodeId>,
}

/// In-process `PeerTransport`. Each node registers an inbox and serves it;
/// tests can cut a node off to simulate a partition.
#[derive(Clone, Default)]
pub struct LocalPeers {
    inner: Arc<RwLock<LocalInner>>,
}

impl LocalPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, node: NodeId) -> PeerInbox {
        let (tx, rx) = mpsc::channel(64);
        self.inner.write().await.nodes.insert(node, tx);
        rx
    }

    /// Makes every request to or from `node` fail until `heal` is called.
    pub async fn isolate(&self, node: NodeId) {
        self.inner.write().await.isolated.insert(node);
    }

    pub async fn heal(&self, node: NodeId) {
        self.inner.write().await.isolated.remove(&node);
    }
}

impl PeerTransport for LocalPeers {
    async fn append_entries(&self, peer: NodeId, req: AppendRequest) -> Result<AppendResponse, UrdError> {
        let tx = {
            let g = self.inner.read().await;
            if g.isolated.contains(&peer) || g.isolated.contains(&req.leader_id) {
                return Err(UrdError::Transport(format!("node {peer} unreachable")));
            }
            g.nodes
                .get(&peer)
                .cloned()
                .ok_or_else(|| UrdError::Transport(format!("node {peer} not registered")))?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((req, reply_tx))
            .await
            .map_err(|_| UrdError::Transport(format!("node {peer} stopped")))?;
        reply_rx
            .await
            .map_err(|_| UrdError::Transport(format!("node {peer} dropped the request")))?
    }
}
