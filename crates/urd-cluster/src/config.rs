use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{info, warn};

use urd_types::{
    DatabaseId, LogIndex, MetaCommand, MetaResponse, ServerId, Server, Shard, ShardId, ShardSpace,
    UrdError, User,
};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, UrdError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| UrdError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, UrdError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| UrdError::Decode(e.to_string()))
}

/// Metadata of one logical database.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DatabaseMeta {
    pub id: DatabaseId,
    pub name: String,
    pub users: BTreeMap<String, User>,
    /// Creation order; routing takes the first matching space.
    pub spaces: Vec<ShardSpace>,
}

impl DatabaseMeta {
    pub fn space(&self, name: &str) -> Option<&ShardSpace> {
        self.spaces.iter().find(|s| s.name == name)
    }
}

/// Cluster metadata derived by applying the metadata log in order.
///
/// Only [`ClusterConfig::apply`] mutates it. Every command is validated
/// completely before anything changes, so a rejected command leaves the
/// state untouched.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClusterConfig {
    servers: BTreeMap<ServerId, Server>,
    databases: BTreeMap<String, DatabaseMeta>,
    cluster_admins: BTreeMap<String, User>,
    shards: BTreeMap<ShardId, Shard>,
    last_shard_id: ShardId,
    under_replicated: BTreeSet<ShardId>,
    last_applied: LogIndex,
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Decodes and applies a committed log entry payload.
    pub fn apply_bytes(&mut self, index: LogIndex, data: &[u8]) -> Result<MetaResponse, UrdError> {
        let cmd: MetaCommand = decode(data)?;
        self.apply(index, cmd)
    }

    /// Applies `cmd`, committed at log `index`.
    ///
    /// `index` must directly follow the last applied one; otherwise the call
    /// fails with `OutOfOrderApply` and nothing changes. A command that fails
    /// validation still consumes its index: every replica rejects it the
    /// same way.
    pub fn apply(&mut self, index: LogIndex, cmd: MetaCommand) -> Result<MetaResponse, UrdError> {
        if index != self.last_applied + 1 {
            return Err(UrdError::OutOfOrderApply { expected: self.last_applied + 1, actual: index });
        }
        self.last_applied = index;
        self.validate(&cmd)?;
        Ok(self.mutate(index, cmd))
    }

    /// Checks `cmd` against the current state without changing anything.
    pub fn validate(&self, cmd: &MetaCommand) -> Result<(), UrdError> {
        match cmd {
            MetaCommand::CreateDatabase { name } => {
                if name.is_empty() {
                    return Err(UrdError::DatabaseNameRequired);
                }
                if self.databases.contains_key(name) {
                    return Err(UrdError::DatabaseExists);
                }
            }
            MetaCommand::DeleteDatabase { name } => {
                self.db(name)?;
            }
            MetaCommand::CreateUser { database, user } => {
                User::validate_name(&user.name)?;
                if self.db(database)?.users.contains_key(&user.name) {
                    return Err(UrdError::UserExists);
                }
            }
            MetaCommand::UpdateUser { database, user } => {
                User::validate_name(&user.name)?;
                if !self.db(database)?.users.contains_key(&user.name) {
                    return Err(UrdError::UserNotFound);
                }
            }
            MetaCommand::DeleteUser { database, name } => {
                if name.is_empty() {
                    return Err(UrdError::UsernameRequired);
                }
                if !self.db(database)?.users.contains_key(name) {
                    return Err(UrdError::UserNotFound);
                }
            }
            MetaCommand::CreateClusterAdmin { user } => {
                User::validate_name(&user.name)?;
                if self.cluster_admins.contains_key(&user.name) {
                    return Err(UrdError::UserExists);
                }
            }
            MetaCommand::UpdateClusterAdmin { user } => {
                User::validate_name(&user.name)?;
                if !self.cluster_admins.contains_key(&user.name) {
                    return Err(UrdError::UserNotFound);
                }
            }
            MetaCommand::DeleteClusterAdmin { name } => {
                if name.is_empty() {
                    return Err(UrdError::UsernameRequired);
                }
                if !self.cluster_admins.contains_key(name) {
                    return Err(UrdError::UserNotFound);
                }
            }
            MetaCommand::CreateShardSpace { space } => {
                if space.name.is_empty() {
                    return Err(UrdError::ShardSpaceNameRequired);
                }
                let db = self.db(&space.database)?;
                if db.space(&space.name).is_some() {
                    return Err(UrdError::ShardSpaceExists);
                }
                space.validate()?;
                check_overlap(db, space)?;
            }
            MetaCommand::UpdateShardSpace { space } => {
                if space.name.is_empty() {
                    return Err(UrdError::ShardSpaceNameRequired);
                }
                let db = self.db(&space.database)?;
                if db.space(&space.name).is_none() {
                    return Err(UrdError::ShardSpaceNotFound);
                }
                space.validate()?;
                check_overlap(db, space)?;
            }
            MetaCommand::DeleteShardSpace { database, name } => {
                if name.is_empty() {
                    return Err(UrdError::ShardSpaceNameRequired);
                }
                if self.db(database)?.space(name).is_none() {
                    return Err(UrdError::ShardSpaceNotFound);
                }
            }
            MetaCommand::CreateShard { database, space, start_time, end_time, split, server_ids } => {
                let space = self.db(database)?.space(space).ok_or(UrdError::ShardSpaceNotFound)?;
                if space.bucket(*start_time) != (*start_time, *end_time) {
                    return Err(UrdError::InvalidArgument(format!(
                        "[{start_time}, {end_time}) is not a bucket of shard space '{}'",
                        space.name
                    )));
                }
                if *split >= space.split_n {
                    return Err(UrdError::InvalidArgument(format!(
                        "split {split} out of range for split_n {}",
                        space.split_n
                    )));
                }
                let clash = self.shards.values().find(|s| {
                    s.database == *database
                        && s.space == space.name
                        && s.split == *split
                        && s.overlaps(*start_time, *end_time)
                });
                // An identical shard already exists: creation is idempotent.
                if clash.is_none() {
                    self.check_servers(server_ids, space.replica_n as usize)?;
                }
            }
            MetaCommand::ReassignShard { id, server_ids } => {
                self.shards.get(id).ok_or(UrdError::ShardNotFound(*id))?;
                self.check_servers(server_ids, 1)?;
            }
            MetaCommand::DropShard { id } => {
                self.shards.get(id).ok_or(UrdError::ShardNotFound(*id))?;
            }
            MetaCommand::AddServer { server } => {
                if self.servers.contains_key(&server.id) {
                    return Err(UrdError::ServerExists);
                }
            }
            MetaCommand::RemoveServer { id } | MetaCommand::SetServerState { id, .. } => {
                self.servers.get(id).ok_or(UrdError::ServerNotFound(*id))?;
            }
            MetaCommand::InDatabase { database, id, cmd } => {
                let nested = matches!(**cmd, MetaCommand::InDatabase { .. });
                if nested || cmd.database() != Some(database.as_str()) {
                    return Err(UrdError::InvalidArgument(format!(
                        "{} cannot be scoped to database '{database}'",
                        cmd.name()
                    )));
                }
                self.check_database(database, *id)?;
                self.validate(cmd)?;
            }
        }
        Ok(())
    }

    /// Requires `ids` to be distinct, known, up servers, at least `required`
    /// of them.
    fn check_servers(&self, ids: &[ServerId], required: usize) -> Result<(), UrdError> {
        let mut seen = HashSet::with_capacity(ids.len());
        for id in ids {
            let server = self.servers.get(id).ok_or(UrdError::ServerNotFound(*id))?;
            if !seen.insert(*id) {
                return Err(UrdError::InvalidArgument(format!("server {id} listed twice")));
            }
            if !server.up {
                return Err(UrdError::InsufficientReplicas {
                    required,
                    available: ids.iter().filter(|i| self.is_up(**i)).count(),
                });
            }
        }
        if ids.len() < required {
            return Err(UrdError::InsufficientReplicas { required, available: ids.len() });
        }
        Ok(())
    }

    fn is_up(&self, id: ServerId) -> bool {
        self.servers.get(&id).map(|s| s.up).unwrap_or(false)
    }

    /// Infallible once `validate` passed.
    fn mutate(&mut self, index: LogIndex, cmd: MetaCommand) -> MetaResponse {
        match cmd {
            MetaCommand::CreateDatabase { name } => {
                info!(database = %name, id = index, "database created");
                self.databases.insert(
                    name.clone(),
                    DatabaseMeta { id: index, name, users: BTreeMap::new(), spaces: Vec::new() },
                );
                MetaResponse::DatabaseCreated { id: index }
            }
            MetaCommand::DeleteDatabase { name } => {
                self.databases.remove(&name);
                let shards = self.remove_shards(|s| s.database == name);
                info!(database = %name, shards = shards.len(), "database deleted");
                MetaResponse::ShardsDropped { shards }
            }
            MetaCommand::CreateUser { database, user } | MetaCommand::UpdateUser { database, user } => {
                if let Some(db) = self.databases.get_mut(&database) {
                    db.users.insert(user.name.clone(), user);
                }
                MetaResponse::Done
            }
            MetaCommand::DeleteUser { database, name } => {
                if let Some(db) = self.databases.get_mut(&database) {
                    db.users.remove(&name);
                }
                MetaResponse::Done
            }
            MetaCommand::CreateClusterAdmin { user } | MetaCommand::UpdateClusterAdmin { user } => {
                self.cluster_admins.insert(user.name.clone(), user);
                MetaResponse::Done
            }
            MetaCommand::DeleteClusterAdmin { name } => {
                self.cluster_admins.remove(&name);
                MetaResponse::Done
            }
            MetaCommand::CreateShardSpace { space } => {
                if let Some(db) = self.databases.get_mut(&space.database) {
                    db.spaces.push(space);
                }
                MetaResponse::Done
            }
            MetaCommand::UpdateShardSpace { space } => {
                if let Some(existing) = self
                    .databases
                    .get_mut(&space.database)
                    .and_then(|db| db.spaces.iter_mut().find(|s| s.name == space.name))
                {
                    *existing = space;
                }
                MetaResponse::Done
            }
            MetaCommand::DeleteShardSpace { database, name } => {
                if let Some(db) = self.databases.get_mut(&database) {
                    db.spaces.retain(|s| s.name != name);
                }
                let shards = self.remove_shards(|s| s.database == database && s.space == name);
                MetaResponse::ShardsDropped { shards }
            }
            MetaCommand::CreateShard { database, space, start_time, end_time, split, server_ids } => {
                if let Some(existing) = self.shards.values().find(|s| {
                    s.database == database
                        && s.space == space
                        && s.split == split
                        && s.overlaps(start_time, end_time)
                }) {
                    return MetaResponse::ShardCreated { shard: existing.clone() };
                }
                self.last_shard_id += 1;
                let shard = Shard {
                    id: self.last_shard_id,
                    database,
                    space,
                    start_time,
                    end_time,
                    split,
                    server_ids,
                };
                info!(shard = shard.id, space = %shard.space, start = start_time, servers = ?shard.server_ids, "shard created");
                self.shards.insert(shard.id, shard.clone());
                MetaResponse::ShardCreated { shard }
            }
            MetaCommand::ReassignShard { id, server_ids } => {
                let required = self.required_replicas(id);
                let under = server_ids.len() < required;
                if let Some(shard) = self.shards.get_mut(&id) {
                    shard.server_ids = server_ids;
                }
                if under {
                    self.under_replicated.insert(id);
                } else {
                    self.under_replicated.remove(&id);
                }
                MetaResponse::ShardReassigned { id, under_replicated: under }
            }
            MetaCommand::DropShard { id } => {
                let shards = self.remove_shards(|s| s.id == id);
                MetaResponse::ShardsDropped { shards }
            }
            MetaCommand::AddServer { server } => {
                info!(server = server.id, addr = %server.raft_connect_string, "server added");
                self.servers.insert(server.id, server);
                MetaResponse::Done
            }
            MetaCommand::RemoveServer { id } => {
                self.servers.remove(&id);
                let mut affected = Vec::new();
                let mut under_replicated = Vec::new();
                let ids: Vec<ShardId> = self.shards.keys().copied().collect();
                for shard_id in ids {
                    let required = self.required_replicas(shard_id);
                    let Some(shard) = self.shards.get_mut(&shard_id) else { continue };
                    let before = shard.server_ids.len();
                    shard.server_ids.retain(|s| *s != id);
                    if shard.server_ids.len() == before {
                        continue;
                    }
                    affected.push(shard_id);
                    if shard.server_ids.len() < required {
                        warn!(shard = shard_id, removed = id, left = shard.server_ids.len(), required, "shard under-replicated");
                        under_replicated.push(shard_id);
                        self.under_replicated.insert(shard_id);
                    }
                }
                info!(server = id, affected = affected.len(), "server removed");
                MetaResponse::ServerRemoved { affected, under_replicated }
            }
            MetaCommand::SetServerState { id, up } => {
                if let Some(server) = self.servers.get_mut(&id) {
                    server.up = up;
                }
                MetaResponse::Done
            }
            MetaCommand::InDatabase { cmd, .. } => self.mutate(index, *cmd),
        }
    }

    fn required_replicas(&self, shard_id: ShardId) -> usize {
        self.shards
            .get(&shard_id)
            .and_then(|s| self.databases.get(&s.database)?.space(&s.space))
            .map(|space| space.replica_n as usize)
            .unwrap_or(1)
    }

    fn remove_shards(&mut self, pred: impl Fn(&Shard) -> bool) -> Vec<Shard> {
        let ids: Vec<ShardId> = self.shards.values().filter(|s| pred(s)).map(|s| s.id).collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            self.under_replicated.remove(&id);
            if let Some(shard) = self.shards.remove(&id) {
                removed.push(shard);
            }
        }
        removed
    }

    fn db(&self, name: &str) -> Result<&DatabaseMeta, UrdError> {
        self.databases.get(name).ok_or(UrdError::DatabaseNotFound)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Database names, sorted.
    pub fn databases(&self) -> Vec<String> {
        self.databases.keys().cloned().collect()
    }

    pub fn database(&self, name: &str) -> Result<&DatabaseMeta, UrdError> {
        self.db(name)
    }

    /// Fails with `DatabaseNotFound` unless database `name` still exists as
    /// the incarnation `id`.
    pub fn check_database(&self, name: &str, id: DatabaseId) -> Result<&DatabaseMeta, UrdError> {
        match self.databases.get(name) {
            Some(db) if db.id == id => Ok(db),
            _ => Err(UrdError::DatabaseNotFound),
        }
    }

    /// Users of `database`, sorted by name.
    pub fn users(&self, database: &str) -> Result<Vec<&User>, UrdError> {
        Ok(self.db(database)?.users.values().collect())
    }

    pub fn user(&self, database: &str, name: &str) -> Result<&User, UrdError> {
        self.db(database)?.users.get(name).ok_or(UrdError::UserNotFound)
    }

    pub fn cluster_admins(&self) -> Vec<&User> {
        self.cluster_admins.values().collect()
    }

    pub fn cluster_admin(&self, name: &str) -> Result<&User, UrdError> {
        self.cluster_admins.get(name).ok_or(UrdError::UserNotFound)
    }

    pub fn shard_spaces(&self, database: &str) -> Result<&[ShardSpace], UrdError> {
        Ok(&self.db(database)?.spaces)
    }

    pub fn shard_space(&self, database: &str, name: &str) -> Result<&ShardSpace, UrdError> {
        self.db(database)?.space(name).ok_or(UrdError::ShardSpaceNotFound)
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    pub fn shard(&self, id: ShardId) -> Result<&Shard, UrdError> {
        self.shards.get(&id).ok_or(UrdError::ShardNotFound(id))
    }

    /// Shards of one space, ordered by start time then split.
    pub fn shards_in_space(&self, database: &str, space: &str) -> Vec<&Shard> {
        let mut shards: Vec<&Shard> = self
            .shards
            .values()
            .filter(|s| s.database == database && s.space == space)
            .collect();
        shards.sort_by_key(|s| (s.start_time, s.split, s.id));
        shards
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn server(&self, id: ServerId) -> Result<&Server, UrdError> {
        self.servers.get(&id).ok_or(UrdError::ServerNotFound(id))
    }

    /// Ids of servers currently up, ascending.
    pub fn up_servers(&self) -> Vec<ServerId> {
        self.servers.values().filter(|s| s.up).map(|s| s.id).collect()
    }

    /// Shards holding fewer servers than their space's `replica_n`.
    pub fn under_replicated(&self) -> Vec<ShardId> {
        self.under_replicated.iter().copied().collect()
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> Result<Vec<u8>, UrdError> {
        encode(self)
    }

    pub fn restore(bytes: &[u8]) -> Result<Self, UrdError> {
        decode(bytes)
    }
}

/// No series name may be matched by two spaces of one database; routing
/// would depend on creation order.
fn check_overlap(db: &DatabaseMeta, space: &ShardSpace) -> Result<(), UrdError> {
    match db
        .spaces
        .iter()
        .find(|s| s.name != space.name && s.regex.overlaps(&space.regex))
    {
        Some(existing) => Err(UrdError::OverlappingShardSpace {
            space: space.name.clone(),
            existing: existing.name.clone(),
        }),
        None => Ok(()),
    }
}
