use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::trace;

use urd_cluster::{LocalMetaNode, PeerTransport};
use urd_proto::v1::{raft_service_server::RaftService, AppendEntriesRequest, AppendEntriesResponse};
use urd_storage::LogStorage;

use crate::convert::{append_from_proto, append_response_to_proto, urd_to_status};

pub struct RaftServiceImpl<S, P> {
    node: Arc<LocalMetaNode<S, P>>,
}

impl<S, P> RaftServiceImpl<S, P> {
    pub fn new(node: Arc<LocalMetaNode<S, P>>) -> Self {
        RaftServiceImpl { node }
    }
}

#[tonic::async_trait]
impl<S: LogStorage, P: PeerTransport> RaftService for RaftServiceImpl<S, P> {
    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = append_from_proto(request.into_inner());
        trace!(term = req.term, leader = req.leader_id, prev = req.prev_index, "append entries");
        let resp = self.node.handle_append(req).await.map_err(urd_to_status)?;
        Ok(Response::new(append_response_to_proto(resp)))
    }
}
