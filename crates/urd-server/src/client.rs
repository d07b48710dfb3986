//! gRPC implementations of the peer and shard transports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tonic::transport::{Channel, Endpoint};

use urd_cluster::{AppendRequest, AppendResponse, ClusterConfig, PeerTransport};
use urd_db::{Query, ShardTransport};
use urd_proto::v1::{
    raft_service_client::RaftServiceClient, shard_service_client::ShardServiceClient,
    DropShardRequest, QueryShardRequest, WriteShardRequest,
};
use urd_types::{NodeId, Series, ServerId, ShardId, UrdError};

use crate::convert::{
    append_response_from_proto, append_to_proto, query_to_proto, series_from_proto,
    series_to_proto, status_to_urd,
};

/// Lazily connected channels keyed by address.
#[derive(Clone)]
struct Channels {
    cache: Arc<RwLock<HashMap<String, Channel>>>,
    timeout: Duration,
}

impl Channels {
    fn new(timeout: Duration) -> Self {
        Channels { cache: Arc::new(RwLock::new(HashMap::new())), timeout }
    }

    async fn get(&self, addr: &str) -> Result<Channel, UrdError> {
        if let Some(channel) = self.cache.read().await.get(addr) {
            return Ok(channel.clone());
        }
        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| UrdError::InvalidArgument(format!("bad address '{addr}': {e}")))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect_lazy();
        self.cache.write().await.insert(addr.to_owned(), channel.clone());
        Ok(channel)
    }
}

/// Sends append requests to a static set of metadata peers.
#[derive(Clone)]
pub struct GrpcPeers {
    addrs: Arc<HashMap<NodeId, String>>,
    channels: Channels,
}

impl GrpcPeers {
    pub fn new(addrs: HashMap<NodeId, String>, timeout: Duration) -> Self {
        GrpcPeers { addrs: Arc::new(addrs), channels: Channels::new(timeout) }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.addrs.keys().copied().collect()
    }
}

impl PeerTransport for GrpcPeers {
    async fn append_entries(&self, peer: NodeId, req: AppendRequest) -> Result<AppendResponse, UrdError> {
        let addr = self
            .addrs
            .get(&peer)
            .ok_or_else(|| UrdError::Transport(format!("no address for node {peer}")))?;
        let mut client = RaftServiceClient::new(self.channels.get(addr).await?);
        let resp = client.append_entries(append_to_proto(req)).await.map_err(status_to_urd)?;
        Ok(append_response_from_proto(resp.into_inner()))
    }
}

/// Reaches shard replicas at the data address each server registered in
/// the cluster metadata.
#[derive(Clone)]
pub struct GrpcShards {
    config: watch::Receiver<Arc<ClusterConfig>>,
    channels: Channels,
}

impl GrpcShards {
    pub fn new(config: watch::Receiver<Arc<ClusterConfig>>, timeout: Duration) -> Self {
        GrpcShards { config, channels: Channels::new(timeout) }
    }

    async fn client(&self, server: ServerId) -> Result<ShardServiceClient<Channel>, UrdError> {
        let addr = {
            let config = self.config.borrow();
            config.server(server)?.protobuf_connect_string.clone()
        };
        Ok(ShardServiceClient::new(self.channels.get(&addr).await?))
    }
}

impl ShardTransport for GrpcShards {
    async fn write_shard(&self, server: ServerId, shard: ShardId, series: Vec<Series>) -> Result<(), UrdError> {
        let req = WriteShardRequest {
            shard_id: shard,
            series: series.into_iter().map(series_to_proto).collect(),
        };
        self.client(server).await?.write_shard(req).await.map_err(status_to_urd)?;
        Ok(())
    }

    async fn query_shard(&self, server: ServerId, shard: ShardId, query: Query) -> Result<Vec<Series>, UrdError> {
        let req = QueryShardRequest { shard_id: shard, query: Some(query_to_proto(query)) };
        let mut stream = self
            .client(server)
            .await?
            .query_shard(req)
            .await
            .map_err(status_to_urd)?
            .into_inner();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.message().await.map_err(status_to_urd)? {
            chunks.push(series_from_proto(chunk));
        }
        Ok(chunks)
    }

    async fn drop_shard(&self, server: ServerId, shard: ShardId) -> Result<(), UrdError> {
        self.client(server)
            .await?
            .drop_shard(DropShardRequest { shard_id: shard })
            .await
            .map_err(status_to_urd)?;
        Ok(())
    }
}
