use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use regex_automata::dfa::{dense, Automaton};
use regex_automata::util::primitives::StateID;
use regex_automata::{Input, MatchKind};

use crate::{LogIndex, ShardId, ServerId, UrdError};

/// Identity of one incarnation of a database: the index of the log entry
/// that created it. A database dropped and re-created under the same name
/// gets a new id, which is how stale handles are detected.
pub type DatabaseId = LogIndex;

// ---------------------------------------------------------------------------
// SeriesPattern
// ---------------------------------------------------------------------------

/// Compiled series-name pattern. Serialized as its source text so commands
/// stay replayable.
#[derive(Clone)]
pub struct SeriesPattern(regex::Regex);

impl SeriesPattern {
    pub fn new(src: &str) -> Result<Self, UrdError> {
        regex::Regex::new(src)
            .map(SeriesPattern)
            .map_err(|e| UrdError::InvalidArgument(format!("invalid pattern '{src}': {e}")))
    }

    /// Matches every series name.
    pub fn any() -> Self {
        SeriesPattern(regex::Regex::new(".*").expect("literal pattern"))
    }

    /// Unanchored search, so `cpu` matches `cpu_load`.
    pub fn matches(&self, series: &str) -> bool {
        self.0.is_match(series)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Whether some series name is matched by both patterns. Decided by
    /// walking the product of the two patterns' DFAs. Patterns that cannot
    /// be determinized within the size limits are treated as overlapping.
    pub fn overlaps(&self, other: &SeriesPattern) -> bool {
        match (build_dfa(self.as_str()), build_dfa(other.as_str())) {
            (Some(a), Some(b)) => dfa_intersect(&a, &b),
            _ => true,
        }
    }
}

const DFA_SIZE_LIMIT: usize = 1 << 20;
const MAX_PRODUCT_STATES: usize = 1 << 16;

type Dfa = dense::DFA<Vec<u32>>;

fn build_dfa(src: &str) -> Option<Dfa> {
    dense::Builder::new()
        .configure(
            dense::Config::new()
                .match_kind(MatchKind::All)
                .dfa_size_limit(Some(DFA_SIZE_LIMIT))
                .determinize_size_limit(Some(DFA_SIZE_LIMIT)),
        )
        .build(src)
        .ok()
}

/// Position of one pattern while reading a candidate name byte by byte.
/// Matching is an unanchored search, so once a match is seen every longer
/// name matches too.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Walk {
    Searching(StateID),
    Matched,
    Dead,
    /// The DFA gave up on this input (e.g. a Unicode word boundary).
    Unknown,
}

impl Walk {
    fn classify(dfa: &Dfa, id: StateID) -> Walk {
        if dfa.is_match_state(id) {
            Walk::Matched
        } else if dfa.is_dead_state(id) {
            Walk::Dead
        } else if dfa.is_quit_state(id) {
            Walk::Unknown
        } else {
            Walk::Searching(id)
        }
    }

    /// `None` feeds end-of-input.
    fn advance(self, dfa: &Dfa, byte: Option<u8>) -> Walk {
        match self {
            Walk::Searching(id) => {
                let next = match byte {
                    Some(b) => dfa.next_state(id, b),
                    None => dfa.next_eoi_state(id),
                };
                Walk::classify(dfa, next)
            }
            other => other,
        }
    }
}

/// Breadth-first search over reachable state pairs for a name both DFAs
/// accept.
fn dfa_intersect(a: &Dfa, b: &Dfa) -> bool {
    let input = Input::new("");
    let (Ok(sa), Ok(sb)) = (a.start_state_forward(&input), b.start_state_forward(&input)) else {
        return true;
    };
    let start = (Walk::classify(a, sa), Walk::classify(b, sb));
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some((x, y)) = queue.pop_front() {
        let steps = std::iter::once(None).chain((0..=u8::MAX).map(Some));
        for byte in steps {
            let pair = (x.advance(a, byte), y.advance(b, byte));
            match pair {
                (Walk::Matched, Walk::Matched) => return true,
                (Walk::Dead, _) | (_, Walk::Dead) => {}
                (Walk::Unknown, _) | (_, Walk::Unknown) => return true,
                _ if byte.is_none() => {}
                _ => {
                    if seen.insert(pair) {
                        if seen.len() > MAX_PRODUCT_STATES {
                            return true;
                        }
                        queue.push_back(pair);
                    }
                }
            }
        }
    }
    false
}

impl Default for SeriesPattern {
    fn default() -> Self {
        Self::any()
    }
}

impl PartialEq for SeriesPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for SeriesPattern {}

impl fmt::Debug for SeriesPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.as_str())
    }
}

impl serde::Serialize for SeriesPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for SeriesPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let src = String::deserialize(deserializer)?;
        SeriesPattern::new(&src).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub raft_connect_string: String,
    pub protobuf_connect_string: String,
    pub up: bool,
}

impl Server {
    pub fn new(id: ServerId, raft: impl Into<String>, protobuf: impl Into<String>) -> Self {
        Server {
            id,
            raft_connect_string: raft.into(),
            protobuf_connect_string: protobuf.into(),
            up: true,
        }
    }
}

/// Partitioning policy for the series of one database that match `regex`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ShardSpace {
    pub name: String,
    pub database: String,
    /// Zero keeps data forever.
    pub retention: Duration,
    pub duration: Duration,
    pub replica_n: u32,
    pub split_n: u32,
    pub regex: SeriesPattern,
}

impl ShardSpace {
    /// A space matching every series, one replica, no split, kept forever.
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        ShardSpace {
            name: name.into(),
            database: String::new(),
            retention: Duration::ZERO,
            duration,
            replica_n: 1,
            split_n: 1,
            regex: SeriesPattern::any(),
        }
    }

    pub fn with_regex(mut self, regex: SeriesPattern) -> Self {
        self.regex = regex;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_replication(mut self, replica_n: u32, split_n: u32) -> Self {
        self.replica_n = replica_n;
        self.split_n = split_n;
        self
    }

    pub fn duration_micros(&self) -> i64 {
        i64::try_from(self.duration.as_micros()).unwrap_or(i64::MAX)
    }

    pub fn retention_micros(&self) -> Option<i64> {
        if self.retention.is_zero() {
            None
        } else {
            Some(i64::try_from(self.retention.as_micros()).unwrap_or(i64::MAX))
        }
    }

    /// Half-open `[start, end)` window of width `duration`, aligned to the
    /// epoch, that contains `timestamp` (microseconds). The lowest window
    /// is cut off at `i64::MIN` where its aligned start is unrepresentable.
    pub fn bucket(&self, timestamp: i64) -> (i64, i64) {
        let width = self.duration_micros().max(1);
        let n = timestamp.div_euclid(width);
        let start = n.checked_mul(width).unwrap_or(i64::MIN);
        let end = n
            .checked_add(1)
            .and_then(|next| next.checked_mul(width))
            .unwrap_or(i64::MAX);
        (start, end)
    }

    pub fn validate(&self) -> Result<(), UrdError> {
        if self.name.is_empty() {
            return Err(UrdError::ShardSpaceNameRequired);
        }
        if self.duration_micros() <= 0 {
            return Err(UrdError::InvalidShardSpace("duration must be positive".into()));
        }
        if self.replica_n == 0 {
            return Err(UrdError::InvalidShardSpace("replica_n must be positive".into()));
        }
        if self.split_n == 0 {
            return Err(UrdError::InvalidShardSpace("split_n must be positive".into()));
        }
        Ok(())
    }
}

/// One time bucket (and split slot) of a shard space, held by `server_ids`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub database: String,
    pub space: String,
    pub start_time: i64,
    pub end_time: i64,
    pub split: u32,
    pub server_ids: Vec<ServerId>,
}

impl Shard {
    pub fn covers(&self, timestamp: i64) -> bool {
        timestamp >= self.start_time && timestamp < self.end_time
    }

    /// Intersection test against the half-open range `[start, end)`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start_time < end && start < self.end_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct User {
    pub name: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub read_permission: SeriesPattern,
    pub write_permission: SeriesPattern,
}

impl User {
    pub fn new(name: impl Into<String>, password_hash: impl Into<String>) -> Self {
        User {
            name: name.into(),
            password_hash: password_hash.into(),
            is_admin: false,
            read_permission: SeriesPattern::any(),
            write_permission: SeriesPattern::any(),
        }
    }

    /// Names are non-empty and limited to `[A-Za-z0-9_.-]`.
    pub fn validate_name(name: &str) -> Result<(), UrdError> {
        if name.is_empty() {
            return Err(UrdError::UsernameRequired);
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid {
            return Err(UrdError::InvalidUsername);
        }
        Ok(())
    }

    pub fn can_read(&self, series: &str) -> bool {
        self.is_admin || self.read_permission.matches(series)
    }

    pub fn can_write(&self, series: &str) -> bool {
        self.is_admin || self.write_permission.matches(series)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Mutations of the cluster metadata. Every node applies the same sequence
/// of these, in log order, to derive its `ClusterConfig`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MetaCommand {
    CreateDatabase { name: String },
    DeleteDatabase { name: String },
    CreateUser { database: String, user: User },
    UpdateUser { database: String, user: User },
    DeleteUser { database: String, name: String },
    CreateClusterAdmin { user: User },
    UpdateClusterAdmin { user: User },
    DeleteClusterAdmin { name: String },
    CreateShardSpace { space: ShardSpace },
    UpdateShardSpace { space: ShardSpace },
    DeleteShardSpace { database: String, name: String },
    CreateShard {
        database: String,
        space: String,
        start_time: i64,
        end_time: i64,
        split: u32,
        server_ids: Vec<ServerId>,
    },
    ReassignShard { id: ShardId, server_ids: Vec<ServerId> },
    DropShard { id: ShardId },
    AddServer { server: Server },
    RemoveServer { id: ServerId },
    SetServerState { id: ServerId, up: bool },
    /// `cmd` issued through a handle to incarnation `id` of `database`.
    /// Rejected with `DatabaseNotFound` once that incarnation is gone, even
    /// if the name has been re-created since.
    InDatabase { database: String, id: DatabaseId, cmd: Box<MetaCommand> },
}

impl MetaCommand {
    pub fn name(&self) -> &'static str {
        match self {
            MetaCommand::CreateDatabase { .. } => "create_database",
            MetaCommand::DeleteDatabase { .. } => "delete_database",
            MetaCommand::CreateUser { .. } => "create_user",
            MetaCommand::UpdateUser { .. } => "update_user",
            MetaCommand::DeleteUser { .. } => "delete_user",
            MetaCommand::CreateClusterAdmin { .. } => "create_cluster_admin",
            MetaCommand::UpdateClusterAdmin { .. } => "update_cluster_admin",
            MetaCommand::DeleteClusterAdmin { .. } => "delete_cluster_admin",
            MetaCommand::CreateShardSpace { .. } => "create_shard_space",
            MetaCommand::UpdateShardSpace { .. } => "update_shard_space",
            MetaCommand::DeleteShardSpace { .. } => "delete_shard_space",
            MetaCommand::CreateShard { .. } => "create_shard",
            MetaCommand::ReassignShard { .. } => "reassign_shard",
            MetaCommand::DropShard { .. } => "drop_shard",
            MetaCommand::AddServer { .. } => "add_server",
            MetaCommand::RemoveServer { .. } => "remove_server",
            MetaCommand::SetServerState { .. } => "set_server_state",
            MetaCommand::InDatabase { cmd, .. } => cmd.name(),
        }
    }

    /// The database a database-scoped command acts on.
    pub fn database(&self) -> Option<&str> {
        match self {
            MetaCommand::CreateUser { database, .. }
            | MetaCommand::UpdateUser { database, .. }
            | MetaCommand::DeleteUser { database, .. }
            | MetaCommand::DeleteShardSpace { database, .. }
            | MetaCommand::CreateShard { database, .. }
            | MetaCommand::InDatabase { database, .. } => Some(database),
            MetaCommand::CreateShardSpace { space } | MetaCommand::UpdateShardSpace { space } => {
                Some(&space.database)
            }
            _ => None,
        }
    }

    /// Binds a database-scoped command to incarnation `id` of its database.
    pub fn in_database(self, id: DatabaseId) -> MetaCommand {
        match self.database() {
            Some(database) => MetaCommand::InDatabase {
                database: database.to_owned(),
                id,
                cmd: Box::new(self),
            },
            None => self,
        }
    }
}

/// Result of applying one `MetaCommand`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MetaResponse {
    Done,
    DatabaseCreated { id: DatabaseId },
    ShardCreated { shard: Shard },
    /// Shards removed by `DropShard`, `DeleteShardSpace` or `DeleteDatabase`;
    /// their data has to be dropped on every replica.
    ShardsDropped { shards: Vec<Shard> },
    ShardReassigned { id: ShardId, under_replicated: bool },
    /// `under_replicated` lists the affected shards now holding fewer than
    /// `replica_n` servers; an operator is expected to reassign them.
    ServerRemoved { affected: Vec<ShardId>, under_replicated: Vec<ShardId> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_is_origin_aligned() {
        let space = ShardSpace::new("m", Duration::from_secs(3600));
        let hour = 3_600_000_000;
        assert_eq!(space.bucket(0), (0, hour));
        assert_eq!(space.bucket(hour - 1), (0, hour));
        assert_eq!(space.bucket(hour), (hour, 2 * hour));
        assert_eq!(space.bucket(-1), (-hour, 0));
    }

    #[test]
    fn bucket_at_the_edges_of_time() {
        let space = ShardSpace::new("m", Duration::from_secs(3600));
        let hour = 3_600_000_000;
        let (start, end) = space.bucket(i64::MIN);
        assert_eq!(start, i64::MIN);
        assert!(end > i64::MIN && end <= i64::MIN + hour);
        assert_eq!(space.bucket(i64::MIN + 1), (start, end));
        let (start, end) = space.bucket(i64::MAX);
        assert!(start > i64::MAX - hour);
        assert_eq!(end, i64::MAX);
    }

    #[test]
    fn shard_space_validation() {
        let ok = ShardSpace::new("m", Duration::from_secs(60));
        assert!(ok.validate().is_ok());
        assert_eq!(
            ShardSpace::new("", Duration::from_secs(60)).validate(),
            Err(UrdError::ShardSpaceNameRequired)
        );
        assert!(ShardSpace::new("m", Duration::ZERO).validate().is_err());
        assert!(ok.clone().with_replication(0, 1).validate().is_err());
        assert!(ok.with_replication(1, 0).validate().is_err());
    }

    #[test]
    fn username_rules() {
        assert_eq!(User::validate_name(""), Err(UrdError::UsernameRequired));
        assert_eq!(User::validate_name("my%user"), Err(UrdError::InvalidUsername));
        assert!(User::validate_name("susy.q-1").is_ok());
    }

    #[test]
    fn permissions_follow_patterns() {
        let mut user = User::new("susy", "hash");
        user.read_permission = SeriesPattern::new("^cpu").unwrap();
        user.write_permission = SeriesPattern::new("^$").unwrap();
        assert!(user.can_read("cpu_load"));
        assert!(!user.can_read("mem"));
        assert!(!user.can_write("cpu_load"));
        user.is_admin = true;
        assert!(user.can_write("cpu_load"));
    }

    #[test]
    fn pattern_serializes_as_source() {
        let p = SeriesPattern::new("^cpu.*").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"^cpu.*\"");
        let back: SeriesPattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(serde_json::from_str::<SeriesPattern>("\"(\"").is_err());
    }

    #[test]
    fn scoped_commands_name_their_database() {
        let cmd = MetaCommand::DeleteUser { database: "db".into(), name: "bob".into() };
        assert_eq!(cmd.database(), Some("db"));
        let scoped = cmd.clone().in_database(7);
        assert_eq!(scoped, MetaCommand::InDatabase { database: "db".into(), id: 7, cmd: Box::new(cmd) });
        assert_eq!(scoped.name(), "delete_user");

        let global = MetaCommand::DropShard { id: 3 };
        assert_eq!(global.database(), None);
        assert_eq!(global.clone().in_database(7), global);
    }

    #[test]
    fn pattern_overlap() {
        let p = |src: &str| SeriesPattern::new(src).unwrap();
        assert!(p(".*").overlaps(&p("^cpu")));
        assert!(p("^cpu").overlaps(&p("^cpu")));
        assert!(p("^cpu").overlaps(&p("load$")));
        assert!(p("cpu").overlaps(&p("^mem")), "unanchored search finds memcpu");
        assert!(p("^(cpu|mem)$").overlaps(&p("^m[a-z]+$")));
        assert!(p("^$").overlaps(&p(".*")));

        assert!(!p("^cpu").overlaps(&p("^mem")));
        assert!(!p("^cpu$").overlaps(&p("^cpu_load$")));
        assert!(!p("^[0-9]+$").overlaps(&p("^[a-z]+$")));
        assert!(!p("^a").overlaps(&p("^$")));
    }

    #[test]
    fn shard_ranges_are_half_open() {
        let shard = Shard {
            id: 1,
            database: "db".into(),
            space: "m".into(),
            start_time: 10,
            end_time: 20,
            split: 0,
            server_ids: vec![1],
        };
        assert!(shard.covers(10));
        assert!(!shard.covers(20));
        assert!(shard.overlaps(19, 30));
        assert!(!shard.overlaps(20, 30));
        assert!(!shard.overlaps(0, 10));
    }
}
