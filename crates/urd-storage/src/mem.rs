use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use urd_types::{LogId, LogIndex, Term, UrdError};

use crate::traits::LogStorage;
use crate::types::{LogEntry, LogState, Snapshot};

#[derive(Default)]
struct MemLog {
    entries: BTreeMap<LogIndex, LogEntry>,
    last_purged: Option<(LogIndex, Term)>,
    commit: Option<LogIndex>,
    snapshot: Option<Snapshot>,
}

/// In-memory `LogStorage` backed by one `BTreeMap` per log.
///
/// Intended for tests; not persisted across restarts. Clones share state,
/// which lets a test "restart" a node over the same storage.
#[derive(Clone, Default)]
pub struct MemLogStorage {
    inner: Arc<RwLock<HashMap<LogId, MemLog>>>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemLogStorage {
    async fn log_state(&self, log: LogId) -> Result<LogState, UrdError> {
        let g = self.inner.read().await;
        let Some(l) = g.get(&log) else {
            return Ok(LogState::default());
        };
        Ok(LogState {
            first_index: l.entries.keys().next().copied(),
            last_index: l.entries.keys().next_back().copied(),
            last_purged_index: l.last_purged.map(|(i, _)| i),
            last_purged_term: l.last_purged.map(|(_, t)| t).unwrap_or(0),
        })
    }

    async fn get_entry(&self, log: LogId, index: LogIndex) -> Result<Option<LogEntry>, UrdError> {
        let g = self.inner.read().await;
        Ok(g.get(&log).and_then(|l| l.entries.get(&index).cloned()))
    }

    async fn get_entries(
        &self,
        log: LogId,
        from: LogIndex,
        to_inclusive: LogIndex,
    ) -> Result<Vec<LogEntry>, UrdError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.get(&log)
            .map(|l| l.entries.range(from..=to_inclusive).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn append(&self, log: LogId, entries: Vec<LogEntry>) -> Result<(), UrdError> {
        if entries.iter().any(LogEntry::is_snapshot_marker) {
            return Err(UrdError::Storage("snapshot markers are not stored".into()));
        }
        let mut g = self.inner.write().await;
        let l = g.entry(log).or_default();
        for entry in entries {
            l.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    async fn truncate_after(&self, log: LogId, after: LogIndex) -> Result<(), UrdError> {
        let mut g = self.inner.write().await;
        if let Some(l) = g.get_mut(&log) {
            l.entries.retain(|&idx, _| idx <= after);
        }
        Ok(())
    }

    async fn purge(&self, log: LogId, up_to: LogIndex, term: Term) -> Result<(), UrdError> {
        let mut g = self.inner.write().await;
        let l = g.entry(log).or_default();
        l.entries.retain(|&idx, _| idx > up_to);
        l.last_purged = Some((up_to, term));
        Ok(())
    }

    async fn drop_log(&self, log: LogId) -> Result<(), UrdError> {
        self.inner.write().await.remove(&log);
        Ok(())
    }

    async fn save_commit(&self, log: LogId, index: LogIndex) -> Result<(), UrdError> {
        self.inner.write().await.entry(log).or_default().commit = Some(index);
        Ok(())
    }

    async fn read_commit(&self, log: LogId) -> Result<Option<LogIndex>, UrdError> {
        Ok(self.inner.read().await.get(&log).and_then(|l| l.commit))
    }

    async fn save_snapshot(&self, log: LogId, snapshot: Snapshot) -> Result<(), UrdError> {
        self.inner.write().await.entry(log).or_default().snapshot = Some(snapshot);
        Ok(())
    }

    async fn read_snapshot(&self, log: LogId) -> Result<Option<Snapshot>, UrdError> {
        Ok(self.inner.read().await.get(&log).and_then(|l| l.snapshot.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(index: u64, term: u64) -> LogEntry {
        LogEntry::command(term, index, index.to_be_bytes().to_vec())
    }

    #[tokio::test]
    async fn log_storage_basic() {
        let store = MemLogStorage::new();
        let log = 0;

        let state = store.log_state(log).await.unwrap();
        assert!(state.first_index.is_none());
        assert!(state.last_index.is_none());
        assert!(state.last_purged_index.is_none());

        store
            .append(log, vec![make_entry(1, 1), make_entry(2, 1), make_entry(3, 1)])
            .await
            .unwrap();

        let state = store.log_state(log).await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(3));

        let e = store.get_entry(log, 2).await.unwrap().unwrap();
        assert_eq!(e.index, 2);
        assert_eq!(store.get_entries(log, 1, 2).await.unwrap().len(), 2);

        store.truncate_after(log, 2).await.unwrap();
        assert_eq!(store.log_state(log).await.unwrap().last_index, Some(2));

        store.purge(log, 1, 1).await.unwrap();
        let state = store.log_state(log).await.unwrap();
        assert_eq!(state.first_index, Some(2));
        assert_eq!(state.last_purged_index, Some(1));
        assert_eq!(state.last_purged_term, 1);
    }

    #[tokio::test]
    async fn logs_are_independent() {
        let store = MemLogStorage::new();
        store.append(1, vec![make_entry(1, 1)]).await.unwrap();
        store.append(2, vec![make_entry(1, 1), make_entry(2, 1)]).await.unwrap();
        store.drop_log(1).await.unwrap();

        assert!(store.log_state(1).await.unwrap().last_index.is_none());
        assert_eq!(store.log_state(2).await.unwrap().last_index, Some(2));
    }

    #[tokio::test]
    async fn commit_and_snapshot_persist() {
        let store = MemLogStorage::new();
        assert!(store.read_commit(0).await.unwrap().is_none());
        store.save_commit(0, 5).await.unwrap();
        assert_eq!(store.read_commit(0).await.unwrap(), Some(5));

        let snap = Snapshot::new(5, 2, b"state".to_vec());
        store.save_snapshot(0, snap.clone()).await.unwrap();
        assert_eq!(store.read_snapshot(0).await.unwrap(), Some(snap));
    }

    #[tokio::test]
    async fn markers_are_rejected() {
        let store = MemLogStorage::new();
        assert!(store.append(0, vec![LogEntry::snapshot_marker()]).await.is_err());
    }
}
