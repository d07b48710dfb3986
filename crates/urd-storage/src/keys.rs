use urd_types::{LogId, LogIndex};

/// `log` keyspace: `log(8) ++ index(8)`, fixed 16 bytes.
/// Big-endian on both components → lexicographic order = numeric order.
pub fn log_key(log: LogId, index: LogIndex) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&log.to_be_bytes());
    key[8..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Index component of a `log` keyspace key.
pub fn index_of(key: &[u8]) -> Option<LogIndex> {
    let bytes: [u8; 8] = key.get(8..16)?.try_into().ok()?;
    Some(LogIndex::from_be_bytes(bytes))
}

/// `meta` keyspace: `log(8) ++ label_utf8`
pub fn meta_key(log: LogId, label: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + label.len());
    buf.extend_from_slice(&log.to_be_bytes());
    buf.extend_from_slice(label.as_bytes());
    buf
}

pub const LAST_PURGED: &str = "last_purged";
pub const COMMIT: &str = "commit";
pub const SNAPSHOT: &str = "snapshot";
