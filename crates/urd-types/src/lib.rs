mod error;
mod meta;
mod series;

pub use error::{ErrorKind, UrdError};
pub use meta::{
    DatabaseId, MetaCommand, MetaResponse, SeriesPattern, Server, Shard, ShardSpace, User,
};
pub use series::{FieldValue, Point, Series, TimePrecision};

pub type ServerId = u32;
pub type NodeId = ServerId;
pub type ShardId = u64;
/// Identifies one replicated log on a node. `META_LOG` carries cluster
/// metadata; data shards use their `ShardId`.
pub type LogId = u64;
pub type Term = u64;
pub type LogIndex = u64;

pub const META_LOG: LogId = 0;

/// Acknowledgement policy for replicated writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Majority,
    All,
}

impl WriteMode {
    /// Number of acknowledgements (the writer included) needed out of
    /// `replicas` before a write counts as durable.
    pub fn required_acks(self, replicas: usize) -> usize {
        match self {
            WriteMode::Majority => replicas / 2 + 1,
            WriteMode::All => replicas.max(1),
        }
    }
}

impl std::str::FromStr for WriteMode {
    type Err = UrdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "majority" => Ok(WriteMode::Majority),
            "all" => Ok(WriteMode::All),
            other => Err(UrdError::InvalidArgument(format!("unknown write quorum '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_quorum_sizes() {
        assert_eq!(WriteMode::Majority.required_acks(1), 1);
        assert_eq!(WriteMode::Majority.required_acks(2), 2);
        assert_eq!(WriteMode::Majority.required_acks(3), 2);
        assert_eq!(WriteMode::Majority.required_acks(5), 3);
        assert_eq!(WriteMode::All.required_acks(3), 3);
        // An empty replica set never satisfies a write.
        assert_eq!(WriteMode::Majority.required_acks(0), 1);
        assert_eq!(WriteMode::All.required_acks(0), 1);
    }

    #[test]
    fn write_mode_parses_config_values() {
        assert_eq!("majority".parse::<WriteMode>().unwrap(), WriteMode::Majority);
        assert_eq!("all".parse::<WriteMode>().unwrap(), WriteMode::All);
        assert!("most".parse::<WriteMode>().is_err());
    }
}
