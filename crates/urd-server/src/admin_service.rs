use tonic::{Request, Response, Status};
use tracing::info;

use urd_cluster::{LocalMetaNode, PeerTransport};
use urd_db::{Engine, ShardTransport};
use urd_proto::v1::{
    admin_service_server::AdminService, ClusterStatusRequest, ClusterStatusResponse,
    ProposeRequest, ProposeResponse, ServerInfo,
};
use urd_storage::LogStorage;
use urd_types::MetaCommand;

use crate::convert::urd_to_status;

pub struct AdminServiceImpl<S, P, T> {
    engine: Engine<LocalMetaNode<S, P>, T>,
}

impl<S, P, T> AdminServiceImpl<S, P, T> {
    pub fn new(engine: Engine<LocalMetaNode<S, P>, T>) -> Self {
        AdminServiceImpl { engine }
    }
}

#[tonic::async_trait]
impl<S: LogStorage, P: PeerTransport, T: ShardTransport> AdminService for AdminServiceImpl<S, P, T> {
    async fn cluster_status(
        &self,
        _request: Request<ClusterStatusRequest>,
    ) -> Result<Response<ClusterStatusResponse>, Status> {
        let status = self.engine.meta().status().await;
        let config = self.engine.config();
        Ok(Response::new(ClusterStatusResponse {
            node_id: status.node_id,
            term: status.leader.term,
            leader_id: status.leader.leader.unwrap_or(0),
            leader_addr: status.leader.leader_addr.unwrap_or_default(),
            last_index: status.last_index,
            commit_index: status.commit_index,
            applied_index: status.applied_index,
            purged_index: status.purged_index,
            servers: config
                .servers()
                .map(|s| ServerInfo {
                    id: s.id,
                    raft_addr: s.raft_connect_string.clone(),
                    data_addr: s.protobuf_connect_string.clone(),
                    up: s.up,
                })
                .collect(),
            databases: config.databases(),
            under_replicated: config.under_replicated(),
        }))
    }

    async fn propose(
        &self,
        request: Request<ProposeRequest>,
    ) -> Result<Response<ProposeResponse>, Status> {
        let req = request.into_inner();
        let cmd: MetaCommand = serde_json::from_str(&req.command_json)
            .map_err(|e| Status::invalid_argument(format!("invalid command: {e}")))?;
        info!(command = cmd.name(), "admin proposal");
        let resp = self.engine.execute(cmd).await.map_err(urd_to_status)?;
        let response_json = serde_json::to_string(&resp)
            .map_err(|e| Status::internal(format!("encode response: {e}")))?;
        Ok(Response::new(ProposeResponse { response_json }))
    }
}
