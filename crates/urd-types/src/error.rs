use crate::{LogIndex, ShardId, ServerId};

/// Coarse classification of [`UrdError`], used at the RPC edge and by
/// callers that only need to know which class of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Framing,
    Validation,
    NotFound,
    Consistency,
    NotLeader,
    Unavailable,
    Internal,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UrdError {
    // -- framing / decode -------------------------------------------------
    #[error("log framing error: {0}")]
    Framing(String),
    #[error("decode error: {0}")]
    Decode(String),

    // -- validation -------------------------------------------------------
    #[error("database name required")]
    DatabaseNameRequired,
    #[error("database exists")]
    DatabaseExists,
    #[error("username required")]
    UsernameRequired,
    #[error("invalid username")]
    InvalidUsername,
    #[error("user exists")]
    UserExists,
    #[error("shard space name required")]
    ShardSpaceNameRequired,
    #[error("shard space exists")]
    ShardSpaceExists,
    #[error("invalid shard space: {0}")]
    InvalidShardSpace(String),
    #[error("shard space '{space}' overlaps existing shard space '{existing}'")]
    OverlappingShardSpace { space: String, existing: String },
    #[error("no shard space matches series '{0}'")]
    NoMatchingShardSpace(String),
    #[error("insufficient replicas: need {required} up servers, got {available}")]
    InsufficientReplicas { required: usize, available: usize },
    #[error("server exists")]
    ServerExists,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("column mismatch merging series '{0}'")]
    ColumnMismatch(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // -- not found --------------------------------------------------------
    #[error("database not found")]
    DatabaseNotFound,
    #[error("user not found")]
    UserNotFound,
    #[error("shard space not found")]
    ShardSpaceNotFound,
    #[error("shard {0} not found")]
    ShardNotFound(ShardId),
    #[error("server {0} not found")]
    ServerNotFound(ServerId),

    // -- consistency ------------------------------------------------------
    #[error("quorum not reached: {acks} of {required} acknowledgements")]
    QuorumNotReached { acks: usize, required: usize },
    #[error("apply out of order: expected index {expected}, got {actual}")]
    OutOfOrderApply { expected: LogIndex, actual: LogIndex },
    #[error("entry {0} is committed and cannot be replaced")]
    CommittedEntryConflict(LogIndex),

    // -- leadership / availability ---------------------------------------
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("operation timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl UrdError {
    pub fn kind(&self) -> ErrorKind {
        use UrdError::*;
        match self {
            Framing(_) | Decode(_) => ErrorKind::Framing,
            DatabaseNameRequired
            | DatabaseExists
            | UsernameRequired
            | InvalidUsername
            | UserExists
            | ShardSpaceNameRequired
            | ShardSpaceExists
            | InvalidShardSpace(_)
            | OverlappingShardSpace { .. }
            | NoMatchingShardSpace(_)
            | InsufficientReplicas { .. }
            | ServerExists
            | InvalidPayload(_)
            | ColumnMismatch(_)
            | PermissionDenied(_)
            | InvalidArgument(_) => ErrorKind::Validation,
            DatabaseNotFound
            | UserNotFound
            | ShardSpaceNotFound
            | ShardNotFound(_)
            | ServerNotFound(_) => ErrorKind::NotFound,
            QuorumNotReached { .. } | OutOfOrderApply { .. } | CommittedEntryConflict(_) => {
                ErrorKind::Consistency
            }
            NotLeader { .. } => ErrorKind::NotLeader,
            Timeout | Transport(_) => ErrorKind::Unavailable,
            Storage(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinct_from_validation() {
        assert_eq!(UrdError::DatabaseNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(UrdError::DatabaseExists.kind(), ErrorKind::Validation);
        assert!(UrdError::ShardNotFound(3).is_not_found());
        assert!(!UrdError::UsernameRequired.is_not_found());
    }

    #[test]
    fn leader_hint_in_message() {
        let err = UrdError::NotLeader { leader: Some("10.0.0.1:8099".into()) };
        assert!(err.to_string().contains("10.0.0.1:8099"));
        assert_eq!(err.kind(), ErrorKind::NotLeader);
    }
}
