//! Data path of a node: write and query fan-out over shards, the processor
//! pipeline that delivers results, and the `Engine`/`Database` facade.

pub mod auth;
pub mod coordinator;
pub mod database;
pub mod processor;
pub mod query;
pub mod shard_store;
pub mod transport;
pub mod wire;

pub use auth::Credentials;
pub use coordinator::Coordinator;
pub use database::{Database, Engine, ServerRemoval};
pub use processor::{ChunkWriter, Collector, PointsWriter, Processor};
pub use query::{Query, SeriesSelector};
pub use shard_store::ShardStore;
pub use transport::{LocalShards, ShardTransport};
