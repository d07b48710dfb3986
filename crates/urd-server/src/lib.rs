mod admin_service;
mod client;
mod convert;
mod raft_service;
mod series_service;
mod shard_service;

use std::net::SocketAddr;
use std::sync::Arc;

use urd_cluster::{LocalMetaNode, MetaNode, PeerTransport};
use urd_db::{Engine, ShardStore, ShardTransport};
use urd_proto::v1::{
    admin_service_server::AdminServiceServer, raft_service_server::RaftServiceServer,
    series_service_server::SeriesServiceServer, shard_service_server::ShardServiceServer,
};
use urd_storage::LogStorage;
use tonic_reflection::server::Builder as ReflectionBuilder;

use admin_service::AdminServiceImpl;
use raft_service::RaftServiceImpl;
use series_service::SeriesServiceImpl;
use shard_service::ShardServiceImpl;

pub use client::{GrpcPeers, GrpcShards};
pub use convert::{status_to_urd, urd_to_status, LEADER_ADDR_HEADER};

/// Client-facing series writes and queries.
pub async fn serve_client<M: MetaNode, T: ShardTransport>(
    addr: SocketAddr,
    engine: Engine<M, T>,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(urd_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("failed to build reflection service");
    tracing::info!(%addr, "client gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(SeriesServiceServer::new(SeriesServiceImpl::new(engine)))
        .add_service(reflection)
        .serve(addr)
        .await
        .map_err(Into::into)
}

/// Node-to-node traffic: metadata replication, shard replicas, admin.
pub async fn serve_cluster<S, P, T>(
    addr: SocketAddr,
    engine: Engine<LocalMetaNode<S, P>, T>,
    shards: Arc<ShardStore<S>>,
) -> anyhow::Result<()>
where
    S: LogStorage + Clone,
    P: PeerTransport,
    T: ShardTransport,
{
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(urd_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("failed to build reflection service");
    tracing::info!(%addr, "cluster gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(RaftServiceServer::new(RaftServiceImpl::new(engine.meta().clone())))
        .add_service(ShardServiceServer::new(ShardServiceImpl::new(shards)))
        .add_service(AdminServiceServer::new(AdminServiceImpl::new(engine)))
        .add_service(reflection)
        .serve(addr)
        .await
        .map_err(Into::into)
}
