pub mod codec;
pub mod fjall;
pub mod keys;
pub mod log;
pub mod mem;
pub mod traits;
pub mod types;

pub use codec::{LogEntryDecoder, LogEntryEncoder};
pub use log::{decode_batch, AppendOutcome, DecodedBatch, EntryCursor, ReplicatedLog, ReplicationBatch};
pub use traits::LogStorage;
pub use types::{EntryType, LogEntry, LogState, Snapshot, SnapshotMeta};
