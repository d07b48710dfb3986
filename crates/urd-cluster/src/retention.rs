use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use urd_types::{MetaCommand, ShardId};

use crate::config::ClusterConfig;

pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Shards whose whole time range is older than their space's retention at
/// `now` (microseconds). Spaces with zero retention never expire.
pub fn expired_shards(config: &ClusterConfig, now: i64) -> Vec<ShardId> {
    config
        .shards()
        .filter(|shard| {
            config
                .shard_space(&shard.database, &shard.space)
                .ok()
                .and_then(|space| space.retention_micros())
                .is_some_and(|retention| shard.end_time <= now.saturating_sub(retention))
        })
        .map(|shard| shard.id)
        .collect()
}

/// Watches the cluster config and emits `MetaCommand::DropShard` through
/// `cmd_tx` for every shard past its retention.
///
/// The consumer proposes the command and drops the shard's data once it is
/// applied. Only the leader's proposals succeed, so every node may run one.
pub struct RetentionTask {
    config_rx: watch::Receiver<Arc<ClusterConfig>>,
    cmd_tx: mpsc::Sender<MetaCommand>,
    interval: Duration,
}

impl RetentionTask {
    pub fn new(
        config_rx: watch::Receiver<Arc<ClusterConfig>>,
        cmd_tx: mpsc::Sender<MetaCommand>,
        interval: Duration,
    ) -> Self {
        RetentionTask { config_rx, cmd_tx, interval }
    }

    /// Runs until the receiver of `cmd_tx` is dropped.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Ids already sent; pruned once the shard leaves the config.
        let mut pending: HashSet<ShardId> = HashSet::new();
        loop {
            ticker.tick().await;
            if self.cmd_tx.is_closed() {
                return;
            }
            let config = self.config_rx.borrow().clone();
            pending.retain(|id| config.shard(*id).is_ok());

            let expired = expired_shards(&config, now_micros());
            if expired.is_empty() {
                continue;
            }
            debug!(count = expired.len(), "shards past retention");
            for id in expired {
                if !pending.insert(id) {
                    continue;
                }
                info!(shard = id, "dropping shard past retention");
                if self.cmd_tx.send(MetaCommand::DropShard { id }).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use urd_types::{MetaResponse, Server, ShardSpace};

    use super::*;

    const HOUR: i64 = 3_600_000_000;

    fn config() -> ClusterConfig {
        let mut cfg = ClusterConfig::new();
        let mut kept = ShardSpace::new("kept", Duration::from_secs(3600))
            .with_regex(urd_types::SeriesPattern::new("^kept").unwrap());
        kept.database = "db".into();
        let mut short = ShardSpace::new("short", Duration::from_secs(3600))
            .with_regex(urd_types::SeriesPattern::new("^short").unwrap())
            .with_retention(Duration::from_secs(2 * 3600));
        short.database = "db".into();
        let cmds = vec![
            MetaCommand::AddServer { server: Server::new(1, "a", "a") },
            MetaCommand::CreateDatabase { name: "db".into() },
            MetaCommand::CreateShardSpace { space: kept },
            MetaCommand::CreateShardSpace { space: short },
        ];
        for cmd in cmds {
            cfg.apply(cfg.last_applied() + 1, cmd).unwrap();
        }
        for space in ["kept", "short"] {
            for bucket in 0..4 {
                let cmd = MetaCommand::CreateShard {
                    database: "db".into(),
                    space: space.into(),
                    start_time: bucket * HOUR,
                    end_time: (bucket + 1) * HOUR,
                    split: 0,
                    server_ids: vec![1],
                };
                assert!(matches!(
                    cfg.apply(cfg.last_applied() + 1, cmd).unwrap(),
                    MetaResponse::ShardCreated { .. }
                ));
            }
        }
        cfg
    }

    fn starts(cfg: &ClusterConfig, ids: &[ShardId]) -> Vec<(String, i64)> {
        ids.iter()
            .map(|id| {
                let s = cfg.shard(*id).unwrap();
                (s.space.clone(), s.start_time)
            })
            .collect()
    }

    #[test]
    fn only_whole_shards_past_retention_expire() {
        let cfg = config();
        // now - retention = 2h: buckets [0,1h) and [1h,2h) are fully behind it.
        let expired = expired_shards(&cfg, 4 * HOUR);
        assert_eq!(starts(&cfg, &expired), vec![("short".into(), 0), ("short".into(), HOUR)]);
        assert!(expired_shards(&cfg, 2 * HOUR).is_empty());
    }

    #[tokio::test]
    async fn task_emits_each_drop_once() {
        let cfg = config();
        let (_tx, rx) = watch::channel(Arc::new(cfg));
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let task = tokio::spawn(RetentionTask::new(rx, cmd_tx, Duration::from_millis(10)).run());

        // Wall clock is far past every bucket: all four "short" shards expire.
        let mut ids = HashSet::new();
        for _ in 0..4 {
            match cmd_rx.recv().await {
                Some(MetaCommand::DropShard { id }) => assert!(ids.insert(id)),
                other => panic!("unexpected {other:?}"),
            }
        }
        let again = tokio::time::timeout(Duration::from_millis(50), cmd_rx.recv()).await;
        assert!(again.is_err(), "shard dropped twice");

        drop(cmd_rx);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
