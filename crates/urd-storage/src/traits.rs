use std::future::Future;

use urd_types::{LogId, LogIndex, Term, UrdError};

use crate::types::{LogEntry, LogState, Snapshot};

/// Durable storage for any number of independent logs, addressed by
/// [`LogId`]. The metadata log is [`urd_types::META_LOG`]; every data shard
/// keeps its own log under its shard id.
///
/// Methods use RPITIT (`-> impl Future + Send`) so callers stay generic
/// without an `async-trait` dependency.
pub trait LogStorage: Send + Sync + 'static {
    /// First/last stored index plus the purged prefix of `log`.
    fn log_state(&self, log: LogId) -> impl Future<Output = Result<LogState, UrdError>> + Send;

    /// The entry at `index`, or `None` if it was purged or never written.
    fn get_entry(
        &self,
        log: LogId,
        index: LogIndex,
    ) -> impl Future<Output = Result<Option<LogEntry>, UrdError>> + Send;

    /// All stored entries in `[from, to_inclusive]`, ascending.
    fn get_entries(
        &self,
        log: LogId,
        from: LogIndex,
        to_inclusive: LogIndex,
    ) -> impl Future<Output = Result<Vec<LogEntry>, UrdError>> + Send;

    /// Writes `entries` atomically, overwriting any entry already stored at
    /// the same index. Snapshot markers are never stored.
    fn append(
        &self,
        log: LogId,
        entries: Vec<LogEntry>,
    ) -> impl Future<Output = Result<(), UrdError>> + Send;

    /// Deletes every entry with `index > after`.
    fn truncate_after(
        &self,
        log: LogId,
        after: LogIndex,
    ) -> impl Future<Output = Result<(), UrdError>> + Send;

    /// Deletes every entry with `index <= up_to` and records `(up_to, term)`
    /// as the purged prefix.
    fn purge(
        &self,
        log: LogId,
        up_to: LogIndex,
        term: Term,
    ) -> impl Future<Output = Result<(), UrdError>> + Send;

    /// Removes the log with all its entries and metadata.
    fn drop_log(&self, log: LogId) -> impl Future<Output = Result<(), UrdError>> + Send;

    fn save_commit(
        &self,
        log: LogId,
        index: LogIndex,
    ) -> impl Future<Output = Result<(), UrdError>> + Send;

    fn read_commit(
        &self,
        log: LogId,
    ) -> impl Future<Output = Result<Option<LogIndex>, UrdError>> + Send;

    fn save_snapshot(
        &self,
        log: LogId,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<(), UrdError>> + Send;

    fn read_snapshot(
        &self,
        log: LogId,
    ) -> impl Future<Output = Result<Option<Snapshot>, UrdError>> + Send;
}

impl<S: LogStorage> LogStorage for std::sync::Arc<S> {
    fn log_state(&self, log: LogId) -> impl Future<Output = Result<LogState, UrdError>> + Send {
        (**self).log_state(log)
    }

    fn get_entry(
        &self,
        log: LogId,
        index: LogIndex,
    ) -> impl Future<Output = Result<Option<LogEntry>, UrdError>> + Send {
        (**self).get_entry(log, index)
    }

    fn get_entries(
        &self,
        log: LogId,
        from: LogIndex,
        to_inclusive: LogIndex,
    ) -> impl Future<Output = Result<Vec<LogEntry>, UrdError>> + Send {
        (**self).get_entries(log, from, to_inclusive)
    }

    fn append(
        &self,
        log: LogId,
        entries: Vec<LogEntry>,
    ) -> impl Future<Output = Result<(), UrdError>> + Send {
        (**self).append(log, entries)
    }

    fn truncate_after(
        &self,
        log: LogId,
        after: LogIndex,
    ) -> impl Future<Output = Result<(), UrdError>> + Send {
        (**self).truncate_after(log, after)
    }

    fn purge(
        &self,
        log: LogId,
        up_to: LogIndex,
        term: Term,
    ) -> impl Future<Output = Result<(), UrdError>> + Send {
        (**self).purge(log, up_to, term)
    }

    fn drop_log(&self, log: LogId) -> impl Future<Output = Result<(), UrdError>> + Send {
        (**self).drop_log(log)
    }

    fn save_commit(
        &self,
        log: LogId,
        index: LogIndex,
    ) -> impl Future<Output = Result<(), UrdError>> + Send {
        (**self).save_commit(log, index)
    }

    fn read_commit(
        &self,
        log: LogId,
    ) -> impl Future<Output = Result<Option<LogIndex>, UrdError>> + Send {
        (**self).read_commit(log)
    }

    fn save_snapshot(
        &self,
        log: LogId,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<(), UrdError>> + Send {
        (**self).save_snapshot(log, snapshot)
    }

    fn read_snapshot(
        &self,
        log: LogId,
    ) -> impl Future<Output = Result<Option<Snapshot>, UrdError>> + Send {
        (**self).read_snapshot(log)
    }
}
