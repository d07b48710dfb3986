use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use urd_db::ShardStore;
use urd_proto::v1::{
    self as pb, shard_service_server::ShardService, DropShardRequest, DropShardResponse,
    QueryShardRequest, WriteShardRequest, WriteShardResponse,
};
use urd_storage::LogStorage;

use crate::convert::{query_from_proto, series_from_proto, series_to_proto, urd_to_status};

/// Serves this server's shard replicas to coordinators.
pub struct ShardServiceImpl<S> {
    store: Arc<ShardStore<S>>,
}

impl<S> ShardServiceImpl<S> {
    pub fn new(store: Arc<ShardStore<S>>) -> Self {
        ShardServiceImpl { store }
    }
}

#[tonic::async_trait]
impl<S: LogStorage + Clone> ShardService for ShardServiceImpl<S> {
    async fn write_shard(
        &self,
        request: Request<WriteShardRequest>,
    ) -> Result<Response<WriteShardResponse>, Status> {
        let req = request.into_inner();
        let series = req.series.into_iter().map(series_from_proto).collect();
        let index = self.store.write(req.shard_id, series).await.map_err(urd_to_status)?;
        Ok(Response::new(WriteShardResponse { index }))
    }

    type QueryShardStream = ReceiverStream<Result<pb::Series, Status>>;

    async fn query_shard(
        &self,
        request: Request<QueryShardRequest>,
    ) -> Result<Response<Self::QueryShardStream>, Status> {
        let req = request.into_inner();
        let spec = req.query.ok_or_else(|| Status::invalid_argument("query required"))?;
        let query = query_from_proto(spec).map_err(urd_to_status)?;
        let chunks = self.store.query(req.shard_id, &query).await.map_err(urd_to_status)?;
        debug!(shard = req.shard_id, chunks = chunks.len(), "shard query");

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(series_to_proto(chunk))).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn drop_shard(
        &self,
        request: Request<DropShardRequest>,
    ) -> Result<Response<DropShardResponse>, Status> {
        let shard = request.into_inner().shard_id;
        self.store.drop_shard(shard).await.map_err(urd_to_status)?;
        Ok(Response::new(DropShardResponse {}))
    }
}
