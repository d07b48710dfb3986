use urd_types::{LogIndex, Term};

/// Kind of a log record.
///
/// The type is a byte, but only `0x00` and `0xFF` are defined, and the
/// framing has no separate type field: a frame whose first byte is `0xFF`
/// is a snapshot boundary and any other first byte starts a command header.
/// No other type value can be stored or replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u8)]
pub enum EntryType {
    /// A state-machine command (metadata command or shard write).
    #[default]
    Command = 0x00,
    /// Snapshot boundary: history before it may be replaced by a snapshot.
    Snapshot = 0xFF,
}

/// A single record of a replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub entry_type: EntryType,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn command(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        LogEntry { term, index, entry_type: EntryType::Command, data }
    }

    /// The zero-payload boundary marker. Every other field stays zero/empty.
    pub fn snapshot_marker() -> Self {
        LogEntry { entry_type: EntryType::Snapshot, ..Default::default() }
    }

    pub fn is_snapshot_marker(&self) -> bool {
        self.entry_type == EntryType::Snapshot
    }
}

/// Summary of the current extent of one log.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogState {
    /// Smallest index currently in the log (`None` if log is empty).
    pub first_index: Option<LogIndex>,
    /// Largest index currently in the log (`None` if log is empty).
    pub last_index: Option<LogIndex>,
    /// Largest index that has been purged (compacted into a snapshot).
    pub last_purged_index: Option<LogIndex>,
    /// Term of the entry at `last_purged_index`.
    pub last_purged_term: Term,
}

/// Metadata identifying a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// UUID v4 string identifying this snapshot.
    pub snapshot_id: String,
}

/// Compacted state covering every entry up to `meta.last_log_index`.
/// `data` is opaque to the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(last_log_index: LogIndex, last_log_term: Term, data: Vec<u8>) -> Self {
        Snapshot {
            meta: SnapshotMeta {
                last_log_index,
                last_log_term,
                snapshot_id: uuid::Uuid::new_v4().to_string(),
            },
            data,
        }
    }
}
