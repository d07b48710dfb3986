//! Shard routing.
//!
//! Pure functions over a [`ClusterConfig`] snapshot: which shard space a
//! series belongs to, which time bucket and split slot a point falls into,
//! and which servers hold a shard. Nothing here mutates the config.

use urd_types::{ServerId, Shard, ShardSpace, UrdError};

use crate::config::ClusterConfig;

/// Seed of the split hash. Changing it moves every series of a split space.
const SPLIT_SEED: u64 = 0;

/// Where a point of one series has to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub database: String,
    pub space: String,
    pub start_time: i64,
    pub end_time: i64,
    pub split: u32,
    /// `None` if the shard for this bucket has not been created yet.
    pub shard: Option<Shard>,
}

impl WriteTarget {
    /// Bucket identity, shared by every point routed to the same shard.
    pub fn key(&self) -> (String, i64, u32) {
        (self.space.clone(), self.start_time, self.split)
    }
}

/// The shard space of `database` whose pattern matches `series`. Patterns
/// of one database never overlap, so at most one does.
pub fn resolve_space<'a>(
    config: &'a ClusterConfig,
    database: &str,
    series: &str,
) -> Result<&'a ShardSpace, UrdError> {
    config
        .shard_spaces(database)?
        .iter()
        .find(|s| s.regex.matches(series))
        .ok_or_else(|| UrdError::NoMatchingShardSpace(series.to_string()))
}

/// Stable split slot of `series` in a space with `split_n` slots.
pub fn split_for(series: &str, split_n: u32) -> u32 {
    if split_n <= 1 {
        return 0;
    }
    (xxhash_rust::xxh64::xxh64(series.as_bytes(), SPLIT_SEED) % u64::from(split_n)) as u32
}

/// Resolves the shard a point of `series` at `timestamp` (microseconds) is
/// written to.
pub fn resolve_write_target(
    config: &ClusterConfig,
    database: &str,
    series: &str,
    timestamp: i64,
) -> Result<WriteTarget, UrdError> {
    let space = resolve_space(config, database, series)?;
    let (start_time, end_time) = space.bucket(timestamp);
    let split = split_for(series, space.split_n);
    let shard = config
        .shards_in_space(database, &space.name)
        .into_iter()
        .find(|s| s.split == split && s.covers(timestamp))
        .cloned();
    Ok(WriteTarget {
        database: database.to_string(),
        space: space.name.clone(),
        start_time,
        end_time,
        split,
        shard,
    })
}

/// Every existing shard of the space `series` routes to that intersects
/// `[start, end)`, ordered by start time then split. Buckets without a
/// shard never received a write and hold no data.
///
/// With `split_n > 1` only the series' own slot is returned, since every
/// point of the series went there.
pub fn resolve_query_targets(
    config: &ClusterConfig,
    database: &str,
    series: &str,
    start: i64,
    end: i64,
) -> Result<Vec<Shard>, UrdError> {
    let space = resolve_space(config, database, series)?;
    let split = split_for(series, space.split_n);
    Ok(config
        .shards_in_space(database, &space.name)
        .into_iter()
        .filter(|s| s.split == split && s.overlaps(start, end))
        .cloned()
        .collect())
}

/// Shards of every space of `database` that intersect `[start, end)`. Used
/// when the queried series are given by pattern rather than by name.
pub fn resolve_all_targets(
    config: &ClusterConfig,
    database: &str,
    start: i64,
    end: i64,
) -> Result<Vec<Shard>, UrdError> {
    let mut shards = Vec::new();
    for space in config.shard_spaces(database)? {
        shards.extend(
            config
                .shards_in_space(database, &space.name)
                .into_iter()
                .filter(|s| s.overlaps(start, end))
                .cloned(),
        );
    }
    Ok(shards)
}

/// Servers a write to `shard` must be sent to.
pub fn replica_set(config: &ClusterConfig, shard: &Shard) -> Result<Vec<ServerId>, UrdError> {
    Ok(config.shard(shard.id)?.server_ids.clone())
}

/// Picks `replica_n` up servers for a new shard. Deterministic for a given
/// config: up servers sorted by id, rotated by the bucket number and the
/// split slot so consecutive buckets spread over the cluster.
pub fn assign_servers(
    config: &ClusterConfig,
    space: &ShardSpace,
    start_time: i64,
    split: u32,
) -> Result<Vec<ServerId>, UrdError> {
    let up = config.up_servers();
    let required = space.replica_n as usize;
    if up.len() < required {
        return Err(UrdError::InsufficientReplicas { required, available: up.len() });
    }
    let bucket = start_time.div_euclid(space.duration_micros().max(1));
    let offset = (bucket.rem_euclid(up.len() as i64) as usize + split as usize) % up.len();
    Ok((0..required).map(|i| up[(offset + i) % up.len()]).collect())
}
