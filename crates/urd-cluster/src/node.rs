use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use urd_storage::{decode_batch, AppendOutcome, LogEntry, LogStorage, ReplicatedLog, Snapshot, SnapshotMeta};
use urd_types::{LogIndex, MetaCommand, MetaResponse, NodeId, Term, UrdError, WriteMode, META_LOG};

use crate::config::ClusterConfig;
use crate::leadership::{LeaderState, Leadership};
use crate::transport::{AppendRequest, AppendResponse, PeerInbox, PeerTransport};

/// Mismatch round trips tried with one follower before resending from the
/// start of the log.
const BACKOFF_ROUNDS: usize = 16;

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, UrdError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| UrdError::Storage(e.to_string()))
}

/// Access to the replicated cluster metadata.
///
/// Uses RPITIT (`-> impl Future + Send`) like the storage traits.
pub trait MetaNode: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    /// Replicates `cmd` and applies it once `mode` is satisfied. Only the
    /// leader accepts proposals; other nodes answer `NotLeader`.
    fn propose(
        &self,
        cmd: MetaCommand,
        mode: WriteMode,
    ) -> impl Future<Output = Result<MetaResponse, UrdError>> + Send;

    /// The latest applied config. Never observed half-applied.
    fn config(&self) -> Arc<ClusterConfig>;

    fn subscribe(&self) -> watch::Receiver<Arc<ClusterConfig>>;

    fn leader(&self) -> impl Future<Output = LeaderState> + Send;
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Upper bound for one follower round trip, backoff included.
    pub replication_timeout: Duration,
    /// Committed entries kept before the log is compacted; 0 disables it.
    pub compact_threshold: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings { replication_timeout: Duration::from_secs(2), compact_threshold: 10_000 }
    }
}

/// Snapshot of a node's replication position, for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub leader: LeaderState,
    pub last_index: LogIndex,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub purged_index: LogIndex,
}

type ApplyReply = oneshot::Sender<Result<MetaResponse, UrdError>>;

enum ApplyMsg {
    Entry { entry: LogEntry, reply: ApplyReply },
    Restore { config: ClusterConfig, reply: oneshot::Sender<()> },
}

struct Inner<S, P> {
    id: NodeId,
    log: ReplicatedLog<S>,
    leadership: Leadership,
    peers: Vec<NodeId>,
    transport: P,
    settings: NodeSettings,
    config_rx: watch::Receiver<Arc<ClusterConfig>>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    /// Serializes proposals: dry run, append, replicate, apply.
    propose_lock: Mutex<()>,
    /// Highest index handed to the apply task.
    applied: Mutex<LogIndex>,
    next_index: Mutex<HashMap<NodeId, LogIndex>>,
}

/// Metadata node over a [`ReplicatedLog`] and a [`PeerTransport`].
///
/// All config changes go through one apply task fed by a channel, in log
/// order; readers get `Arc` snapshots through a `watch` channel.
pub struct LocalMetaNode<S, P> {
    inner: Arc<Inner<S, P>>,
}

impl<S, P> Clone for LocalMetaNode<S, P> {
    fn clone(&self) -> Self {
        LocalMetaNode { inner: self.inner.clone() }
    }
}

impl<S: LogStorage, P: PeerTransport> LocalMetaNode<S, P> {
    /// Opens the metadata log in `store`, rebuilds the config from the last
    /// snapshot plus the committed tail, and starts the apply task.
    pub async fn open(
        id: NodeId,
        addr: impl Into<String>,
        store: S,
        transport: P,
        peers: Vec<NodeId>,
        settings: NodeSettings,
    ) -> Result<Self, UrdError> {
        let log = ReplicatedLog::open(store, META_LOG).await?;
        let mut config = match log.snapshot().await? {
            Some(snapshot) => ClusterConfig::restore(&snapshot.data)?,
            None => ClusterConfig::new(),
        };

        let commit = log.commit_index().await;
        let mut cursor = log.entries_from(config.last_applied() + 1).await;
        let mut replayed = 0u64;
        while let Some(entry) = cursor.next().await? {
            if entry.index > commit {
                break;
            }
            match config.apply_bytes(entry.index, &entry.data) {
                Err(e @ (UrdError::Decode(_) | UrdError::OutOfOrderApply { .. })) => {
                    error!(index = entry.index, error = %e, "metadata replay failed");
                    return Err(e);
                }
                _ => replayed += 1,
            }
        }
        drop(cursor);
        info!(node = id, replayed, applied = config.last_applied(), "metadata log replayed");

        let applied = config.last_applied();
        let (config_tx, config_rx) = watch::channel(Arc::new(config.clone()));
        let (apply_tx, apply_rx) = mpsc::channel(256);
        tokio::spawn(apply_loop(config, apply_rx, config_tx));

        let peers = peers.into_iter().filter(|p| *p != id).collect();
        Ok(LocalMetaNode {
            inner: Arc::new(Inner {
                id,
                log,
                leadership: Leadership::new(id, addr),
                peers,
                transport,
                settings,
                config_rx,
                apply_tx,
                propose_lock: Mutex::new(()),
                applied: Mutex::new(applied),
                next_index: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn leadership(&self) -> &Leadership {
        &self.inner.leadership
    }

    pub fn log(&self) -> &ReplicatedLog<S> {
        &self.inner.log
    }

    /// Takes leadership for `term`.
    pub async fn become_leader(&self, term: Term) -> Result<(), UrdError> {
        self.inner.leadership.become_leader(term).await?;
        self.inner.next_index.lock().await.clear();
        Ok(())
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.inner.id,
            leader: self.inner.leadership.state().await,
            last_index: self.inner.log.last_index().await,
            commit_index: self.inner.log.commit_index().await,
            applied_index: *self.inner.applied.lock().await,
            purged_index: self.inner.log.purged_index().await,
        }
    }

    /// Serves append requests arriving through an in-process inbox.
    pub fn serve_local(&self, mut inbox: PeerInbox) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some((req, reply)) = inbox.recv().await {
                let _ = reply.send(node.handle_append(req).await);
            }
        })
    }

    // -----------------------------------------------------------------------
    // Leader side
    // -----------------------------------------------------------------------

    async fn propose_inner(&self, cmd: MetaCommand, mode: WriteMode) -> Result<MetaResponse, UrdError> {
        self.inner.leadership.check_leader().await?;
        let _guard = self.inner.propose_lock.lock().await;
        let term = self.inner.leadership.check_leader().await?;

        let mut trial = (*self.config()).clone();
        trial.apply(trial.last_applied() + 1, cmd.clone())?;

        let entry = self.inner.log.append(term, encode(&cmd)?).await?;
        debug!(index = entry.index, term, command = cmd.name(), "proposal appended");

        let acks = self.replicate(term, entry.index).await;
        let required = mode.required_acks(self.inner.peers.len() + 1);
        if acks < required {
            warn!(index = entry.index, acks, required, command = cmd.name(), "quorum not reached");
            self.inner.log.truncate_after(entry.index - 1).await?;
            self.inner.leadership.advance_term().await;
            return Err(UrdError::QuorumNotReached { acks, required });
        }

        self.inner.log.commit_to(entry.index).await?;
        let outcome = self.apply_committed().await?;
        self.notify_commit(term);
        if let Err(e) = self.maybe_compact().await {
            warn!(error = %e, "log compaction failed");
        }
        outcome.ok_or_else(|| UrdError::Storage(format!("entry {} was not applied", entry.index)))?
    }

    /// Sends the log tail to every peer concurrently. Returns the number of
    /// nodes, this one included, that hold the entry at `index`.
    async fn replicate(&self, term: Term, index: LogIndex) -> usize {
        let mut set = JoinSet::new();
        for &peer in &self.inner.peers {
            let node = self.clone();
            set.spawn(async move { (peer, node.sync_peer(peer, term).await) });
        }
        let mut acks = 1;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(matched))) if matched >= index => acks += 1,
                Ok((peer, Ok(matched))) => debug!(peer, matched, index, "peer behind"),
                Ok((peer, Err(e))) => warn!(peer, error = %e, "replication failed"),
                Err(e) => warn!(error = %e, "replication task failed"),
            }
        }
        acks
    }

    /// Fire-and-forget round so followers learn the new commit index.
    fn notify_commit(&self, term: Term) {
        if self.inner.peers.is_empty() {
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            node.replicate(term, 0).await;
        });
    }

    /// Brings `peer` up to date. Returns the last index it now shares with
    /// this log.
    async fn sync_peer(&self, peer: NodeId, term: Term) -> Result<LogIndex, UrdError> {
        let timeout = self.inner.settings.replication_timeout;
        tokio::time::timeout(timeout, async {
            let mut next = match self.inner.next_index.lock().await.get(&peer) {
                Some(n) => *n,
                None => self.inner.log.last_index().await.max(1),
            };
            for round in 0..=BACKOFF_ROUNDS {
                let batch = self.inner.log.replication_frames(next).await?;
                let req = AppendRequest {
                    term,
                    leader_id: self.inner.id,
                    leader_addr: self.inner.leadership.addr().to_string(),
                    prev_index: batch.prev_index,
                    prev_term: batch.prev_term,
                    frames: batch.frames,
                    leader_commit: self.inner.log.commit_index().await,
                };
                let resp = self.inner.transport.append_entries(peer, req).await?;
                if resp.term > term {
                    self.inner.leadership.follow(resp.term, None, None).await;
                    return Err(UrdError::NotLeader { leader: None });
                }
                if resp.success {
                    self.inner.next_index.lock().await.insert(peer, batch.last_index + 1);
                    return Ok(batch.last_index);
                }
                next = if round + 1 == BACKOFF_ROUNDS {
                    1
                } else {
                    (resp.last_index + 1).min(next.saturating_sub(1)).max(1)
                };
                self.inner.next_index.lock().await.insert(peer, next);
                debug!(peer, next, "follower log mismatch, backing off");
            }
            Err(UrdError::Transport(format!("node {peer} did not converge")))
        })
        .await
        .map_err(|_| UrdError::Timeout)?
    }

    // -----------------------------------------------------------------------
    // Follower side
    // -----------------------------------------------------------------------

    /// Handles one replication round from the leader.
    pub async fn handle_append(&self, req: AppendRequest) -> Result<AppendResponse, UrdError> {
        let state = self.inner.leadership.state().await;
        if req.term < state.term {
            debug!(term = req.term, current = state.term, "rejecting stale append");
            return Ok(AppendResponse {
                term: state.term,
                success: false,
                last_index: self.inner.log.last_index().await,
            });
        }
        if req.term == state.term && state.leader == Some(self.inner.id) && req.leader_id != self.inner.id {
            return Err(UrdError::InvalidArgument(format!(
                "node {} claims term {} led by this node",
                req.leader_id, req.term
            )));
        }
        self.inner
            .leadership
            .follow(req.term, Some(req.leader_id), Some(req.leader_addr.clone()))
            .await;

        let batch = decode_batch(&req.frames)?;
        let (prev_index, prev_term) = match batch.snapshot {
            Some(snapshot) => {
                let at = (snapshot.meta.last_log_index, snapshot.meta.last_log_term);
                self.install_snapshot(snapshot).await?;
                at
            }
            None => (req.prev_index, req.prev_term),
        };

        let count = batch.entries.len() as u64;
        match self.inner.log.append_entries(prev_index, prev_term, batch.entries).await? {
            AppendOutcome::Mismatch { last_index } => Ok(AppendResponse {
                term: req.term,
                success: false,
                last_index,
            }),
            AppendOutcome::Appended { last_index } => {
                self.inner.log.commit_to(req.leader_commit.min(prev_index + count)).await?;
                self.apply_committed().await?;
                Ok(AppendResponse { term: req.term, success: true, last_index })
            }
        }
    }

    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), UrdError> {
        let config = ClusterConfig::restore(&snapshot.data)?;
        let index = snapshot.meta.last_log_index;
        self.inner.log.install_snapshot(snapshot).await?;

        let mut applied = self.inner.applied.lock().await;
        if index > *applied {
            let (tx, rx) = oneshot::channel();
            self.inner
                .apply_tx
                .send(ApplyMsg::Restore { config, reply: tx })
                .await
                .map_err(|_| UrdError::Storage("apply task stopped".into()))?;
            rx.await.map_err(|_| UrdError::Storage("apply task stopped".into()))?;
            *applied = index;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Hands every committed, not yet applied entry to the apply task, in
    /// order. Returns the outcome of the last one. Decode and ordering
    /// failures are fatal and stop the walk.
    async fn apply_committed(&self) -> Result<Option<Result<MetaResponse, UrdError>>, UrdError> {
        let mut applied = self.inner.applied.lock().await;
        let commit = self.inner.log.commit_index().await;
        if commit <= *applied {
            return Ok(None);
        }
        let mut last = None;
        let mut cursor = self.inner.log.entries_from(*applied + 1).await;
        while let Some(entry) = cursor.next().await? {
            if entry.index > commit {
                break;
            }
            let index = entry.index;
            let (tx, rx) = oneshot::channel();
            self.inner
                .apply_tx
                .send(ApplyMsg::Entry { entry, reply: tx })
                .await
                .map_err(|_| UrdError::Storage("apply task stopped".into()))?;
            let result = rx.await.map_err(|_| UrdError::Storage("apply task stopped".into()))?;
            if let Err(e @ (UrdError::Decode(_) | UrdError::OutOfOrderApply { .. })) = &result {
                error!(index, error = %e, "metadata apply failed");
                return Err(e.clone());
            }
            *applied = index;
            last = Some(result);
        }
        Ok(last)
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    /// Snapshots the applied config and purges the log prefix it covers.
    pub async fn compact(&self) -> Result<Option<SnapshotMeta>, UrdError> {
        let _guard = self.inner.propose_lock.lock().await;
        self.compact_locked().await
    }

    async fn maybe_compact(&self) -> Result<(), UrdError> {
        let threshold = self.inner.settings.compact_threshold;
        if threshold == 0 {
            return Ok(());
        }
        let commit = self.inner.log.commit_index().await;
        if commit - self.inner.log.purged_index().await >= threshold {
            self.compact_locked().await?;
        }
        Ok(())
    }

    async fn compact_locked(&self) -> Result<Option<SnapshotMeta>, UrdError> {
        let config = self.config();
        let index = config.last_applied();
        if index <= self.inner.log.purged_index().await {
            return Ok(None);
        }
        let term = self
            .inner
            .log
            .term_at(index)
            .await?
            .ok_or_else(|| UrdError::Storage(format!("no term for applied index {index}")))?;
        let snapshot = Snapshot::new(index, term, config.snapshot()?);
        let meta = snapshot.meta.clone();
        self.inner.log.compact(snapshot).await?;
        Ok(Some(meta))
    }
}

impl<S: LogStorage, P: PeerTransport> MetaNode for LocalMetaNode<S, P> {
    fn node_id(&self) -> NodeId {
        self.inner.id
    }

    fn propose(
        &self,
        cmd: MetaCommand,
        mode: WriteMode,
    ) -> impl Future<Output = Result<MetaResponse, UrdError>> + Send {
        self.propose_inner(cmd, mode)
    }

    fn config(&self) -> Arc<ClusterConfig> {
        self.inner.config_rx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<ClusterConfig>> {
        self.inner.config_rx.clone()
    }

    fn leader(&self) -> impl Future<Output = LeaderState> + Send {
        self.inner.leadership.state()
    }
}

/// The single writer of the config. Publishes a fresh snapshot after every
/// entry so readers never see a command half-applied.
async fn apply_loop(
    mut config: ClusterConfig,
    mut rx: mpsc::Receiver<ApplyMsg>,
    tx: watch::Sender<Arc<ClusterConfig>>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ApplyMsg::Entry { entry, reply } => {
                let result = config.apply_bytes(entry.index, &entry.data);
                if let Err(e) = &result {
                    debug!(index = entry.index, error = %e, "command rejected");
                }
                tx.send_replace(Arc::new(config.clone()));
                let _ = reply.send(result);
            }
            ApplyMsg::Restore { config: restored, reply } => {
                info!(applied = restored.last_applied(), "config restored from snapshot");
                config = restored;
                tx.send_replace(Arc::new(config.clone()));
                let _ = reply.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use urd_storage::mem::MemLogStorage;
    use urd_types::{Server, ShardSpace};

    use super::*;
    use crate::transport::LocalPeers;

    type Node = LocalMetaNode<MemLogStorage, LocalPeers>;

    fn settings() -> NodeSettings {
        NodeSettings { replication_timeout: Duration::from_millis(500), compact_threshold: 0 }
    }

    async fn single() -> Node {
        let node = LocalMetaNode::open(1, "n1", MemLogStorage::new(), LocalPeers::new(), vec![], settings())
            .await
            .unwrap();
        node.become_leader(1).await.unwrap();
        node
    }

    async fn trio() -> (LocalPeers, Vec<Node>) {
        let peers = LocalPeers::new();
        let mut nodes = Vec::new();
        for id in 1..=3 {
            let node = LocalMetaNode::open(
                id,
                format!("n{id}"),
                MemLogStorage::new(),
                peers.clone(),
                vec![1, 2, 3],
                settings(),
            )
            .await
            .unwrap();
            node.serve_local(peers.register(id).await);
            nodes.push(node);
        }
        nodes[0].become_leader(1).await.unwrap();
        (peers, nodes)
    }

    async fn wait_for(node: &Node, applied: LogIndex) -> Arc<ClusterConfig> {
        let mut rx = node.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let cfg = rx.borrow_and_update().clone();
                if cfg.last_applied() >= applied {
                    return cfg;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("node did not catch up")
    }

    fn create_db(name: &str) -> MetaCommand {
        MetaCommand::CreateDatabase { name: name.into() }
    }

    #[tokio::test]
    async fn single_node_applies_in_order() {
        let node = single().await;
        let resp = node.propose(create_db("foo"), WriteMode::Majority).await.unwrap();
        assert_eq!(resp, MetaResponse::DatabaseCreated { id: 1 });
        assert_eq!(
            node.propose(create_db("foo"), WriteMode::Majority).await.unwrap_err(),
            UrdError::DatabaseExists
        );
        // The rejected proposal never reached the log.
        assert_eq!(node.log().last_index().await, 1);
        assert_eq!(node.config().databases(), vec!["foo"]);
    }

    #[tokio::test]
    async fn follower_refuses_proposals_with_hint() {
        let (_peers, nodes) = trio().await;
        nodes[0].propose(create_db("foo"), WriteMode::Majority).await.unwrap();
        let err = nodes[1].propose(create_db("bar"), WriteMode::Majority).await.unwrap_err();
        assert_eq!(err, UrdError::NotLeader { leader: Some("n1".into()) });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn followers_converge() {
        let (_peers, nodes) = trio().await;
        nodes[0].propose(create_db("foo"), WriteMode::Majority).await.unwrap();
        let mut space = ShardSpace::new("m", Duration::from_secs(3600));
        space.database = "foo".into();
        nodes[0].propose(MetaCommand::CreateShardSpace { space }, WriteMode::All).await.unwrap();

        for node in &nodes[1..] {
            let cfg = wait_for(node, 2).await;
            assert_eq!(cfg.shard_spaces("foo").unwrap().len(), 1);
            assert_eq!(*cfg, *nodes[0].config());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn below_quorum_is_not_committed() {
        let (peers, nodes) = trio().await;
        nodes[0].propose(create_db("a"), WriteMode::Majority).await.unwrap();
        peers.isolate(2).await;
        peers.isolate(3).await;

        let err = nodes[0].propose(create_db("b"), WriteMode::Majority).await.unwrap_err();
        assert_eq!(err, UrdError::QuorumNotReached { acks: 1, required: 2 });
        assert_eq!(nodes[0].log().last_index().await, 1);
        assert!(nodes[0].config().database("b").is_err());

        peers.heal(2).await;
        nodes[0].propose(create_db("c"), WriteMode::Majority).await.unwrap();
        let cfg = wait_for(&nodes[1], 2).await;
        assert_eq!(cfg.databases(), vec!["a", "c"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn all_mode_needs_every_replica() {
        let (peers, nodes) = trio().await;
        peers.isolate(3).await;
        nodes[0].propose(create_db("a"), WriteMode::Majority).await.unwrap();
        assert_eq!(
            nodes[0].propose(create_db("b"), WriteMode::All).await.unwrap_err(),
            UrdError::QuorumNotReached { acks: 2, required: 3 }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lagging_follower_catches_up_from_snapshot() {
        let (peers, nodes) = trio().await;
        peers.isolate(3).await;
        for i in 0..5 {
            nodes[0].propose(create_db(&format!("db{i}")), WriteMode::Majority).await.unwrap();
        }
        let meta = nodes[0].compact().await.unwrap().unwrap();
        assert_eq!(meta.last_log_index, 5);

        peers.heal(3).await;
        nodes[0].propose(create_db("late"), WriteMode::All).await.unwrap();
        let cfg = wait_for(&nodes[2], 6).await;
        assert_eq!(cfg.databases().len(), 6);
        assert_eq!(nodes[2].log().purged_index().await, 5);
    }

    #[tokio::test]
    async fn stale_term_append_is_rejected() {
        let node = single().await;
        node.leadership().follow(5, Some(2), Some("n2".into())).await;
        let resp = node
            .handle_append(AppendRequest {
                term: 4,
                leader_id: 3,
                leader_addr: "n3".into(),
                prev_index: 0,
                prev_term: 0,
                frames: Vec::new(),
                leader_commit: 0,
            })
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.term, 5);
    }

    #[tokio::test]
    async fn restart_replays_committed_log() {
        let store = MemLogStorage::new();
        {
            let node = LocalMetaNode::open(1, "n1", store.clone(), LocalPeers::new(), vec![], settings())
                .await
                .unwrap();
            node.become_leader(1).await.unwrap();
            node.propose(MetaCommand::AddServer { server: Server::new(1, "n1", "n1") }, WriteMode::Majority)
                .await
                .unwrap();
            node.propose(create_db("foo"), WriteMode::Majority).await.unwrap();
            node.compact().await.unwrap();
            node.propose(create_db("bar"), WriteMode::Majority).await.unwrap();
        }
        let node = LocalMetaNode::open(1, "n1", store, LocalPeers::new(), vec![], settings())
            .await
            .unwrap();
        let cfg = node.config();
        assert_eq!(cfg.databases(), vec!["bar", "foo"]);
        assert_eq!(cfg.last_applied(), 3);
        assert_eq!(node.status().await.applied_index, 3);
    }
}
