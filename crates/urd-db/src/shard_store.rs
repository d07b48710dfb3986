use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use urd_storage::{LogStorage, ReplicatedLog};
use urd_types::{LogIndex, Series, ShardId, Term, UrdError};

use crate::query::Query;

/// Term stamped on shard data entries. Shard logs are written by a single
/// coordinator call per entry and never take part in leader changes.
const DATA_TERM: Term = 1;

fn encode(series: &Series) -> Result<Vec<u8>, UrdError> {
    bincode::serde::encode_to_vec(series, bincode::config::standard())
        .map_err(|e| UrdError::Storage(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Series, UrdError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(series, _)| series)
        .map_err(|e| UrdError::Decode(e.to_string()))
}

/// Point data of the shards held by one server.
///
/// Every shard is an append-only log under its shard id in `S`; each write
/// of one series is one entry, so accepted writes are ordered by log index.
pub struct ShardStore<S> {
    store: S,
    logs: RwLock<HashMap<ShardId, Arc<ReplicatedLog<S>>>>,
}

impl<S: LogStorage + Clone> ShardStore<S> {
    pub fn new(store: S) -> Self {
        ShardStore { store, logs: RwLock::new(HashMap::new()) }
    }

    async fn log(&self, shard: ShardId) -> Result<Arc<ReplicatedLog<S>>, UrdError> {
        if let Some(log) = self.logs.read().await.get(&shard) {
            return Ok(log.clone());
        }
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.get(&shard) {
            return Ok(log.clone());
        }
        let log = Arc::new(ReplicatedLog::open(self.store.clone(), shard).await?);
        logs.insert(shard, log.clone());
        Ok(log)
    }

    /// Appends `series` to `shard`. Returns the index of the last entry.
    pub async fn write(&self, shard: ShardId, series: Vec<Series>) -> Result<LogIndex, UrdError> {
        let log = self.log(shard).await?;
        let mut last = log.last_index().await;
        for s in &series {
            s.validate()?;
        }
        for s in series {
            last = log.append(DATA_TERM, encode(&s)?).await?.index;
        }
        log.commit_to(last).await?;
        debug!(shard, last, "shard write appended");
        Ok(last)
    }

    /// Chunks of `shard` selected by `query`, in log order. The query limit
    /// caps the points returned per series name.
    pub async fn query(&self, shard: ShardId, query: &Query) -> Result<Vec<Series>, UrdError> {
        let log = self.log(shard).await?;
        let mut cursor = log.entries_from(1).await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut out = Vec::new();
        while let Some(entry) = cursor.next().await? {
            let stored = decode(&entry.data)?;
            let Some(mut chunk) = query.filter(&stored) else {
                continue;
            };
            if let Some(limit) = query.limit {
                let seen = counts.entry(chunk.name.clone()).or_default();
                chunk.points.truncate(limit.saturating_sub(*seen));
                *seen += chunk.points.len();
                if chunk.points.is_empty() {
                    continue;
                }
            }
            out.push(chunk);
        }
        Ok(out)
    }

    /// Removes every point of `shard`. Dropping an unknown shard succeeds.
    pub async fn drop_shard(&self, shard: ShardId) -> Result<(), UrdError> {
        self.logs.write().await.remove(&shard);
        self.store.drop_log(shard).await?;
        info!(shard, "shard data dropped");
        Ok(())
    }
}
