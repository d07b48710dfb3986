//! Write and query fan-out across shard replicas.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use urd_cluster::router::{assign_servers, resolve_all_targets, resolve_query_targets, resolve_write_target};
use urd_cluster::{ClusterConfig, MetaNode, WriteTarget};
use urd_types::{
    DatabaseId, MetaCommand, MetaResponse, Series, ServerId, Shard, ShardId, UrdError, WriteMode,
};

use crate::processor::Processor;
use crate::query::{Query, SeriesSelector};
use crate::transport::ShardTransport;

type BucketKey = (String, i64, u32);

/// Splits `series` into per-shard chunks. Points without a timestamp get
/// `now`. Fails before anything is written if any series is malformed or
/// any point cannot be routed.
pub fn plan_write(
    config: &ClusterConfig,
    database: &str,
    series: Vec<Series>,
    now: i64,
) -> Result<Vec<(WriteTarget, Vec<Series>)>, UrdError> {
    let mut plan: BTreeMap<BucketKey, (WriteTarget, Vec<Series>)> = BTreeMap::new();
    for s in series {
        s.validate()?;
        let mut chunks: BTreeMap<BucketKey, (WriteTarget, Series)> = BTreeMap::new();
        for mut point in s.points {
            let ts = *point.timestamp.get_or_insert(now);
            let target = resolve_write_target(config, database, &s.name, ts)?;
            chunks
                .entry(target.key())
                .or_insert_with(|| (target, Series::new(s.name.clone(), s.fields.clone())))
                .1
                .points
                .push(point);
        }
        for (key, (target, chunk)) in chunks {
            plan.entry(key).or_insert_with(|| (target, Vec::new())).1.push(chunk);
        }
    }
    Ok(plan.into_values().collect())
}

/// Replicas of `shard` in read preference order: up servers first.
fn read_order(config: &ClusterConfig, shard: &Shard) -> Vec<ServerId> {
    let mut ids = shard.server_ids.clone();
    ids.sort_by_key(|id| !config.server(*id).map(|s| s.up).unwrap_or(false));
    ids
}

async fn query_replicas<T: ShardTransport>(
    transport: T,
    shard: ShardId,
    replicas: Vec<ServerId>,
    query: Query,
) -> Result<Vec<Series>, UrdError> {
    let mut last_err = UrdError::InsufficientReplicas { required: 1, available: 0 };
    for server in replicas {
        match transport.query_shard(server, shard, query.clone()).await {
            Ok(chunks) => return Ok(chunks),
            Err(e) => {
                warn!(shard, server, error = %e, "replica read failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

pub struct Coordinator<M, T> {
    meta: Arc<M>,
    transport: T,
    write_mode: WriteMode,
}

impl<M: MetaNode, T: ShardTransport> Coordinator<M, T> {
    pub fn new(meta: Arc<M>, transport: T, write_mode: WriteMode) -> Self {
        Coordinator { meta, transport, write_mode }
    }

    pub fn meta(&self) -> &Arc<M> {
        &self.meta
    }

    /// Writes `series` to every replica of the shards they route to, in
    /// incarnation `id` of `database`. Each shard needs the configured
    /// quorum of acknowledgements.
    pub async fn write(
        &self,
        database: &str,
        id: DatabaseId,
        series: Vec<Series>,
        now: i64,
    ) -> Result<(), UrdError> {
        let config = self.meta.config();
        config.check_database(database, id)?;
        let plan = plan_write(&config, database, series, now)?;

        let mut writes = Vec::with_capacity(plan.len());
        for (target, chunks) in plan {
            let shard = match target.shard.clone() {
                Some(shard) => shard,
                None => self.create_shard(&config, id, &target).await?,
            };
            writes.push((shard, chunks));
        }
        self.replicate(writes).await
    }

    async fn create_shard(
        &self,
        config: &ClusterConfig,
        id: DatabaseId,
        target: &WriteTarget,
    ) -> Result<Shard, UrdError> {
        let space = config.shard_space(&target.database, &target.space)?;
        let server_ids = assign_servers(config, space, target.start_time, target.split)?;
        let cmd = MetaCommand::CreateShard {
            database: target.database.clone(),
            space: target.space.clone(),
            start_time: target.start_time,
            end_time: target.end_time,
            split: target.split,
            server_ids,
        };
        match self.meta.propose(cmd.in_database(id), WriteMode::Majority).await? {
            MetaResponse::ShardCreated { shard } => Ok(shard),
            other => Err(UrdError::Storage(format!("unexpected response to create_shard: {other:?}"))),
        }
    }

    /// Nothing is sent if any target shard has lost all of its replicas.
    async fn replicate(&self, writes: Vec<(Shard, Vec<Series>)>) -> Result<(), UrdError> {
        if let Some((shard, _)) = writes.iter().find(|(shard, _)| shard.server_ids.is_empty()) {
            warn!(shard = shard.id, "shard has no replicas");
            return Err(UrdError::InsufficientReplicas {
                required: self.write_mode.required_acks(0),
                available: 0,
            });
        }
        let mut set = JoinSet::new();
        let mut acks: HashMap<ShardId, usize> = HashMap::new();
        let mut replicas: Vec<(ShardId, usize)> = Vec::with_capacity(writes.len());
        for (shard, chunks) in writes {
            acks.insert(shard.id, 0);
            replicas.push((shard.id, shard.server_ids.len()));
            for &server in &shard.server_ids {
                let transport = self.transport.clone();
                let chunks = chunks.clone();
                let id = shard.id;
                set.spawn(async move { (id, server, transport.write_shard(server, id, chunks).await) });
            }
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((shard, _, Ok(()))) => *acks.entry(shard).or_default() += 1,
                Ok((shard, server, Err(e))) => warn!(shard, server, error = %e, "replica write failed"),
                Err(e) => warn!(error = %e, "replica write task failed"),
            }
        }
        for (shard, n) in replicas {
            let got = acks.get(&shard).copied().unwrap_or(0);
            let required = self.write_mode.required_acks(n);
            if got < required {
                warn!(shard, acks = got, required, "shard write below quorum");
                return Err(UrdError::QuorumNotReached { acks: got, required });
            }
            debug!(shard, acks = got, "shard write acknowledged");
        }
        Ok(())
    }

    /// Streams the result of `query` into `processor`, one shard's chunks at
    /// a time in completion order. Stops reading further shards as soon as
    /// the processor declines more input; outstanding reads are aborted and
    /// drained before returning.
    pub async fn query<P: Processor + ?Sized>(
        &self,
        database: &str,
        query: &Query,
        processor: &mut P,
    ) -> Result<(), UrdError> {
        let config = self.meta.config();
        config.database(database)?;
        let shards = match &query.series {
            SeriesSelector::Name(name) => {
                match resolve_query_targets(&config, database, name, query.start, query.end) {
                    Ok(shards) => shards,
                    Err(UrdError::NoMatchingShardSpace(_)) => Vec::new(),
                    Err(e) => return Err(e),
                }
            }
            SeriesSelector::Regex(_) => resolve_all_targets(&config, database, query.start, query.end)?,
        };
        debug!(database, shards = shards.len(), "query fan-out");

        let mut set = JoinSet::new();
        for shard in &shards {
            set.spawn(query_replicas(
                self.transport.clone(),
                shard.id,
                read_order(&config, shard),
                query.clone(),
            ));
        }

        let result = feed(&mut set, query, processor).await;
        if !set.is_empty() {
            set.abort_all();
            while set.join_next().await.is_some() {}
        }
        result
    }

    /// Drops the data of `shards` on every replica. Failures are logged; the
    /// metadata no longer references these shards either way.
    pub async fn drop_shards(&self, shards: &[Shard]) {
        let mut set = JoinSet::new();
        for shard in shards {
            for &server in &shard.server_ids {
                let transport = self.transport.clone();
                let id = shard.id;
                set.spawn(async move { (id, server, transport.drop_shard(server, id).await) });
            }
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => {}
                Ok((shard, server, Err(e))) => warn!(shard, server, error = %e, "shard drop failed"),
                Err(e) => warn!(error = %e, "shard drop task failed"),
            }
        }
    }
}

async fn feed<P: Processor + ?Sized>(
    set: &mut JoinSet<Result<Vec<Series>, UrdError>>,
    query: &Query,
    processor: &mut P,
) -> Result<(), UrdError> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    while let Some(joined) = set.join_next().await {
        let chunks = joined.map_err(|e| UrdError::Transport(format!("shard read task failed: {e}")))??;
        for mut chunk in chunks {
            if let Some(limit) = query.limit {
                let seen = counts.entry(chunk.name.clone()).or_default();
                chunk.points.truncate(limit.saturating_sub(*seen));
                *seen += chunk.points.len();
                if chunk.points.is_empty() {
                    continue;
                }
            }
            if !processor.yield_series(chunk)? {
                debug!(processor = processor.name(), "processor stopped the query");
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use urd_types::{FieldValue, Point, Server, ShardSpace};

    use super::*;

    const HOUR: i64 = 3_600_000_000;

    fn config() -> ClusterConfig {
        let mut cfg = ClusterConfig::new();
        let mut space = ShardSpace::new("m", Duration::from_secs(3600));
        space.database = "db".into();
        for cmd in [
            MetaCommand::AddServer { server: Server::new(1, "a", "a") },
            MetaCommand::CreateDatabase { name: "db".into() },
            MetaCommand::CreateShardSpace { space },
        ] {
            cfg.apply(cfg.last_applied() + 1, cmd).unwrap();
        }
        cfg
    }

    fn series(name: &str, points: Vec<Point>) -> Series {
        Series { name: name.into(), fields: vec!["v".into()], points }
    }

    #[test]
    fn plan_groups_points_by_bucket() {
        let cfg = config();
        let s = series(
            "cpu",
            vec![
                Point::new(1, vec![FieldValue::Int(1)]),
                Point::new(HOUR + 1, vec![FieldValue::Int(2)]),
                Point::new(2, vec![FieldValue::Int(3)]),
            ],
        );
        let plan = plan_write(&cfg, "db", vec![s], 0).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].0.start_time, 0);
        assert_eq!(plan[0].1[0].points.len(), 2);
        assert_eq!(plan[1].0.start_time, HOUR);
    }

    #[test]
    fn plan_stamps_missing_timestamps() {
        let cfg = config();
        let s = series(
            "cpu",
            vec![Point { timestamp: None, sequence_number: None, values: vec![FieldValue::Int(1)] }],
        );
        let plan = plan_write(&cfg, "db", vec![s], 5 * HOUR + 3).unwrap();
        assert_eq!(plan[0].0.start_time, 5 * HOUR);
        assert_eq!(plan[0].1[0].points[0].timestamp, Some(5 * HOUR + 3));
    }

    #[test]
    fn plan_rejects_whole_batch() {
        let cfg = config();
        let good = series("cpu", vec![Point::new(1, vec![FieldValue::Int(1)])]);
        let bad = series("cpu", vec![Point::new(1, vec![])]);
        assert!(matches!(plan_write(&cfg, "db", vec![good.clone(), bad], 0), Err(UrdError::InvalidPayload(_))));
        assert_eq!(plan_write(&cfg, "nope", vec![good], 0).unwrap_err(), UrdError::DatabaseNotFound);
    }
}
