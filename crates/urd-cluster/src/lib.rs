//! Cluster metadata: the replicated config, its state machine, shard
//! routing and the node that replicates metadata commands between servers.

pub mod config;
pub mod leadership;
pub mod node;
pub mod retention;
pub mod router;
pub mod transport;

pub use config::{ClusterConfig, DatabaseMeta};
pub use leadership::{LeaderState, Leadership};
pub use node::{LocalMetaNode, MetaNode, NodeSettings, NodeStatus};
pub use retention::{expired_shards, RetentionTask};
pub use router::{resolve_query_targets, resolve_write_target, WriteTarget};
pub use transport::{AppendRequest, AppendResponse, LocalPeers, PeerInbox, PeerTransport};
