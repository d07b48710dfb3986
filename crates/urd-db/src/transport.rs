use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

use urd_storage::LogStorage;
use urd_types::{Series, ServerId, ShardId, UrdError};

use crate::query::Query;
use crate::shard_store::ShardStore;

/// Moves shard data between servers. The coordinator talks to every
/// replica, including its own server, through this trait.
pub trait ShardTransport: Clone + Send + Sync + 'static {
    fn write_shard(
        &self,
        server: ServerId,
        shard: ShardId,
        series: Vec<Series>,
    ) -> impl Future<Output = Result<(), UrdError>> + Send;

    fn query_shard(
        &self,
        server: ServerId,
        shard: ShardId,
        query: Query,
    ) -> impl Future<Output = Result<Vec<Series>, UrdError>> + Send;

    fn drop_shard(
        &self,
        server: ServerId,
        shard: ShardId,
    ) -> impl Future<Output = Result<(), UrdError>> + Send;
}

struct LocalInner<S> {
    servers: HashMap<ServerId, Arc<ShardStore<S>>>,
    down: HashSet<ServerId>,
}

/// In-process `ShardTransport` over one `ShardStore` per server. Servers can
/// be taken down to simulate failed replicas.
pub struct LocalShards<S> {
    inner: Arc<RwLock<LocalInner<S>>>,
}

impl<S> Clone for LocalShards<S> {
    fn clone(&self) -> Self {
        LocalShards { inner: self.inner.clone() }
    }
}

impl<S: LogStorage + Clone> Default for LocalShards<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: LogStorage + Clone> LocalShards<S> {
    pub fn new() -> Self {
        LocalShards {
            inner: Arc::new(RwLock::new(LocalInner { servers: HashMap::new(), down: HashSet::new() })),
        }
    }

    pub async fn register(&self, server: ServerId, store: Arc<ShardStore<S>>) {
        self.inner.write().await.servers.insert(server, store);
    }

    pub async fn set_down(&self, server: ServerId, down: bool) {
        let mut g = self.inner.write().await;
        if down {
            g.down.insert(server);
        } else {
            g.down.remove(&server);
        }
    }

    async fn store(&self, server: ServerId) -> Result<Arc<ShardStore<S>>, UrdError> {
        let g = self.inner.read().await;
        if g.down.contains(&server) {
            return Err(UrdError::Transport(format!("server {server} unreachable")));
        }
        g.servers
            .get(&server)
            .cloned()
            .ok_or_else(|| UrdError::Transport(format!("server {server} not registered")))
    }
}

impl<S: LogStorage + Clone> ShardTransport for LocalShards<S> {
    async fn write_shard(&self, server: ServerId, shard: ShardId, series: Vec<Series>) -> Result<(), UrdError> {
        self.store(server).await?.write(shard, series).await.map(|_| ())
    }

    async fn query_shard(&self, server: ServerId, shard: ShardId, query: Query) -> Result<Vec<Series>, UrdError> {
        self.store(server).await?.query(shard, &query).await
    }

    async fn drop_shard(&self, server: ServerId, shard: ShardId) -> Result<(), UrdError> {
        self.store(server).await?.drop_shard(shard).await
    }
}
