use std::path::Path;
use std::sync::Arc;

use urd_types::{LogId, LogIndex, Term, UrdError};

use crate::codec::{decode_entry, encode_entry};
use crate::keys::{index_of, log_key, meta_key, COMMIT, LAST_PURGED, SNAPSHOT};
use crate::traits::LogStorage;
use crate::types::{LogEntry, LogState, Snapshot};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, UrdError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| UrdError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, UrdError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| UrdError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> UrdError {
    UrdError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> UrdError {
    UrdError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping both keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// Both keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches (purge + purge marker, drop of a whole log) are atomic.
pub struct FjallStore {
    pub db: fjall::Database,
    /// Log entries: `log(8) ++ index(8)` → codec-framed `LogEntry`
    pub log: fjall::Keyspace,
    /// Per-log metadata: `log(8) ++ label_utf8` → bincode(value)
    pub meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, UrdError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let log = db.keyspace("log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta = db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, log, meta }))
    }

    fn keys_in(&self, start: [u8; 16], end: [u8; 16]) -> Result<Vec<Vec<u8>>, UrdError> {
        self.log
            .range(start.to_vec()..=end.to_vec())
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FjallLogStorage
// ---------------------------------------------------------------------------

/// `LogStorage` backed by fjall. Entry values use the same framing as the
/// replication stream, so a stored value can be shipped to a follower as is.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct FjallLogStorage(pub Arc<FjallStore>);

impl FjallLogStorage {
    pub fn open(path: &Path) -> Result<Self, UrdError> {
        FjallStore::open(path).map(FjallLogStorage)
    }
}

impl LogStorage for FjallLogStorage {
    async fn log_state(&self, log: LogId) -> Result<LogState, UrdError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<LogState, UrdError> {
            let start = log_key(log, 0).to_vec();
            let end = log_key(log, u64::MAX).to_vec();

            let first_index = match store.log.range(start.clone()..=end.clone()).next() {
                Some(g) => index_of(&g.into_inner().map_err(fjall_err)?.0),
                None => None,
            };
            let last_index = match store.log.range(start..=end).next_back() {
                Some(g) => index_of(&g.into_inner().map_err(fjall_err)?.0),
                None => None,
            };

            let purged = match store.meta.get(meta_key(log, LAST_PURGED)).map_err(fjall_err)? {
                Some(b) => Some(decode::<(LogIndex, Term)>(&b)?),
                None => None,
            };

            Ok(LogState {
                first_index,
                last_index,
                last_purged_index: purged.map(|(i, _)| i),
                last_purged_term: purged.map(|(_, t)| t).unwrap_or(0),
            })
        })
        .await
        .map_err(join_err)?
    }

    async fn get_entry(&self, log: LogId, index: LogIndex) -> Result<Option<LogEntry>, UrdError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<LogEntry>, UrdError> {
            match store.log.get(log_key(log, index)).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode_entry(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
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
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>, UrdError> {
            let start = log_key(log, from).to_vec();
            let end = log_key(log, to_inclusive).to_vec();
            store
                .log
                .range(start..=end)
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode_entry(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn append(&self, log: LogId, entries: Vec<LogEntry>) -> Result<(), UrdError> {
        if entries.iter().any(LogEntry::is_snapshot_marker) {
            return Err(UrdError::Storage("snapshot markers are not stored".into()));
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), UrdError> {
            let mut batch = store.db.batch();
            for entry in &entries {
                batch.insert(&store.log, log_key(log, entry.index).to_vec(), encode_entry(entry)?);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn truncate_after(&self, log: LogId, after: LogIndex) -> Result<(), UrdError> {
        if after == u64::MAX {
            return Ok(());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), UrdError> {
            let keys = store.keys_in(log_key(log, after + 1), log_key(log, u64::MAX))?;
            if !keys.is_empty() {
                let mut batch = store.db.batch();
                for k in keys {
                    batch.remove(&store.log, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn purge(&self, log: LogId, up_to: LogIndex, term: Term) -> Result<(), UrdError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), UrdError> {
            let keys = store.keys_in(log_key(log, 0), log_key(log, up_to))?;
            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.log, k);
            }
            batch.insert(&store.meta, meta_key(log, LAST_PURGED), encode(&(up_to, term))?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn drop_log(&self, log: LogId) -> Result<(), UrdError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), UrdError> {
            let keys = store.keys_in(log_key(log, 0), log_key(log, u64::MAX))?;
            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.log, k);
            }
            for label in [LAST_PURGED, COMMIT, SNAPSHOT] {
                batch.remove(&store.meta, meta_key(log, label));
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn save_commit(&self, log: LogId, index: LogIndex) -> Result<(), UrdError> {
        self.put_meta(log, COMMIT, encode(&index)?).await
    }

    async fn read_commit(&self, log: LogId) -> Result<Option<LogIndex>, UrdError> {
        match self.get_meta(log, COMMIT).await? {
            Some(b) => Ok(Some(decode(&b)?)),
            None => Ok(None),
        }
    }

    async fn save_snapshot(&self, log: LogId, snapshot: Snapshot) -> Result<(), UrdError> {
        self.put_meta(log, SNAPSHOT, encode(&snapshot)?).await
    }

    async fn read_snapshot(&self, log: LogId) -> Result<Option<Snapshot>, UrdError> {
        match self.get_meta(log, SNAPSHOT).await? {
            Some(b) => Ok(Some(decode(&b)?)),
            None => Ok(None),
        }
    }
}

impl FjallLogStorage {
    async fn put_meta(&self, log: LogId, label: &'static str, value: Vec<u8>) -> Result<(), UrdError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || {
            store.meta.insert(meta_key(log, label), value).map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn get_meta(&self, log: LogId, label: &'static str) -> Result<Option<Vec<u8>>, UrdError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, UrdError> {
            Ok(store.meta.get(meta_key(log, label)).map_err(fjall_err)?.map(|b| b.to_vec()))
        })
        .await
        .map_err(join_err)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(index: u64, term: u64) -> LogEntry {
        LogEntry::command(term, index, format!("cmd-{index}").into_bytes())
    }

    fn open_store(dir: &std::path::Path) -> FjallLogStorage {
        FjallLogStorage::open(dir).expect("open store")
    }

    #[tokio::test]
    async fn log_storage_basic() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let log = 0u64;

        let state = store.log_state(log).await.unwrap();
        assert!(state.first_index.is_none());

        store
            .append(log, vec![make_entry(1, 1), make_entry(2, 1), make_entry(3, 2)])
            .await
            .unwrap();

        let state = store.log_state(log).await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(3));

        let e = store.get_entry(log, 3).await.unwrap().unwrap();
        assert_eq!(e, make_entry(3, 2));
        assert_eq!(store.get_entries(log, 1, 2).await.unwrap().len(), 2);

        store.truncate_after(log, 2).await.unwrap();
        assert_eq!(store.log_state(log).await.unwrap().last_index, Some(2));

        store.purge(log, 1, 1).await.unwrap();
        let state = store.log_state(log).await.unwrap();
        assert_eq!(state.last_purged_index, Some(1));
        assert_eq!(state.last_purged_term, 1);
        assert!(store.get_entry(log, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn values_are_codec_framed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.append(4, vec![LogEntry::command(3, 2, vec![4, 5, 6])]).await.unwrap();

        let raw = store.0.log.get(log_key(4, 2)).unwrap().unwrap();
        assert_eq!(raw.len(), 27);
        assert_eq!(&raw[..8], &3u64.to_be_bytes());
        assert_eq!(&raw[24..], &[4, 5, 6]);
    }

    #[tokio::test]
    async fn reopen_keeps_log_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.append(0, vec![make_entry(1, 1), make_entry(2, 1)]).await.unwrap();
            store.save_commit(0, 2).await.unwrap();
            store.save_snapshot(0, Snapshot::new(1, 1, b"cfg".to_vec())).await.unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.log_state(0).await.unwrap().last_index, Some(2));
        assert_eq!(store.read_commit(0).await.unwrap(), Some(2));
        let snap = store.read_snapshot(0).await.unwrap().unwrap();
        assert_eq!(snap.data, b"cfg");
    }

    #[tokio::test]
    async fn drop_log_leaves_other_logs() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.append(1, vec![make_entry(1, 1)]).await.unwrap();
        store.append(2, vec![make_entry(1, 1)]).await.unwrap();
        store.save_commit(1, 1).await.unwrap();

        store.drop_log(1).await.unwrap();
        assert!(store.log_state(1).await.unwrap().last_index.is_none());
        assert!(store.read_commit(1).await.unwrap().is_none());
        assert_eq!(store.log_state(2).await.unwrap().last_index, Some(1));
    }
}
