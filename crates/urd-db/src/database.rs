//! The facade external callers use: an [`Engine`] per node and a
//! [`Database`] handle per logical database.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use urd_cluster::retention::now_micros;
use urd_cluster::{ClusterConfig, MetaNode};
use urd_types::{
    DatabaseId, MetaCommand, MetaResponse, Series, SeriesPattern, Server, ServerId, Shard, ShardId,
    ShardSpace, TimePrecision, UrdError, User, WriteMode,
};

use crate::auth::Credentials;
use crate::coordinator::Coordinator;
use crate::processor::Processor;
use crate::query::{Query, SeriesSelector};
use crate::transport::ShardTransport;
use crate::wire::parse_payload;

/// Result of removing a server from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRemoval {
    /// Shards that listed the server.
    pub affected: Vec<ShardId>,
    /// Affected shards now holding fewer than `replica_n` servers.
    pub under_replicated: Vec<ShardId>,
}

struct EngineInner<M, T> {
    meta: Arc<M>,
    coordinator: Coordinator<M, T>,
    credentials: Credentials,
    write_mode: WriteMode,
}

/// One node's entry point for metadata changes, writes and queries.
pub struct Engine<M, T> {
    inner: Arc<EngineInner<M, T>>,
}

impl<M, T> Clone for Engine<M, T> {
    fn clone(&self) -> Self {
        Engine { inner: self.inner.clone() }
    }
}

impl<M: MetaNode, T: ShardTransport> Engine<M, T> {
    pub fn new(meta: Arc<M>, transport: T, write_mode: WriteMode, credentials: Credentials) -> Self {
        Engine {
            inner: Arc::new(EngineInner {
                coordinator: Coordinator::new(meta.clone(), transport, write_mode),
                meta,
                credentials,
                write_mode,
            }),
        }
    }

    pub fn meta(&self) -> &Arc<M> {
        &self.inner.meta
    }

    pub fn config(&self) -> Arc<ClusterConfig> {
        self.inner.meta.config()
    }

    pub fn coordinator(&self) -> &Coordinator<M, T> {
        &self.inner.coordinator
    }

    /// Proposes `cmd` and, once applied, drops the data of any shard the
    /// command removed.
    pub async fn execute(&self, cmd: MetaCommand) -> Result<MetaResponse, UrdError> {
        let resp = self.inner.meta.propose(cmd, self.inner.write_mode).await?;
        if let MetaResponse::ShardsDropped { shards } = &resp {
            if !shards.is_empty() {
                self.inner.coordinator.drop_shards(shards).await;
            }
        }
        Ok(resp)
    }

    // -- databases ---------------------------------------------------------

    pub async fn create_database(&self, name: &str) -> Result<Database<M, T>, UrdError> {
        match self.execute(MetaCommand::CreateDatabase { name: name.to_string() }).await? {
            MetaResponse::DatabaseCreated { id } => Ok(self.handle(name, id)),
            other => Err(unexpected("create_database", other)),
        }
    }

    pub async fn delete_database(&self, name: &str) -> Result<(), UrdError> {
        self.execute(MetaCommand::DeleteDatabase { name: name.to_string() }).await?;
        Ok(())
    }

    /// A handle bound to the current incarnation of `name`. Once the
    /// database is deleted every call on the handle fails with
    /// `DatabaseNotFound`, even if the name is re-created.
    pub fn database(&self, name: &str) -> Result<Database<M, T>, UrdError> {
        let id = self.config().database(name)?.id;
        Ok(self.handle(name, id))
    }

    pub fn databases(&self) -> Vec<String> {
        self.config().databases()
    }

    fn handle(&self, name: &str, id: DatabaseId) -> Database<M, T> {
        Database { engine: self.clone(), name: name.to_string(), id }
    }

    // -- servers and shards -----------------------------------------------

    pub async fn add_server(&self, server: Server) -> Result<(), UrdError> {
        self.execute(MetaCommand::AddServer { server }).await?;
        Ok(())
    }

    /// Registers this node as a cluster server, unless it already is.
    pub async fn join(&self, server: Server) -> Result<(), UrdError> {
        if self.config().server(server.id).is_ok() {
            return Ok(());
        }
        let id = server.id;
        self.add_server(server).await?;
        info!(server = id, "server joined the cluster");
        Ok(())
    }

    pub async fn remove_server(&self, id: ServerId) -> Result<ServerRemoval, UrdError> {
        match self.execute(MetaCommand::RemoveServer { id }).await? {
            MetaResponse::ServerRemoved { affected, under_replicated } => {
                Ok(ServerRemoval { affected, under_replicated })
            }
            other => Err(unexpected("remove_server", other)),
        }
    }

    pub async fn set_server_state(&self, id: ServerId, up: bool) -> Result<(), UrdError> {
        self.execute(MetaCommand::SetServerState { id, up }).await?;
        Ok(())
    }

    pub fn servers(&self) -> Vec<Server> {
        self.config().servers().cloned().collect()
    }

    /// Moves shard `id` to `server_ids`. Returns whether it is still under
    /// replicated afterwards.
    pub async fn reassign_shard(&self, id: ShardId, server_ids: Vec<ServerId>) -> Result<bool, UrdError> {
        match self.execute(MetaCommand::ReassignShard { id, server_ids }).await? {
            MetaResponse::ShardReassigned { under_replicated, .. } => Ok(under_replicated),
            other => Err(unexpected("reassign_shard", other)),
        }
    }

    pub async fn drop_shard(&self, id: ShardId) -> Result<(), UrdError> {
        self.execute(MetaCommand::DropShard { id }).await?;
        Ok(())
    }

    pub fn shards(&self) -> Vec<Shard> {
        self.config().shards().cloned().collect()
    }

    pub fn under_replicated(&self) -> Vec<ShardId> {
        self.config().under_replicated()
    }

    // -- cluster admins ----------------------------------------------------

    pub async fn create_cluster_admin(&self, name: &str, password: &str) -> Result<(), UrdError> {
        User::validate_name(name)?;
        let mut user = User::new(name, self.inner.credentials.hash(password).await?);
        user.is_admin = true;
        self.execute(MetaCommand::CreateClusterAdmin { user }).await?;
        Ok(())
    }

    pub async fn change_cluster_admin_password(&self, name: &str, password: &str) -> Result<(), UrdError> {
        let mut user = self.config().cluster_admin(name)?.clone();
        user.password_hash = self.inner.credentials.hash(password).await?;
        self.execute(MetaCommand::UpdateClusterAdmin { user }).await?;
        Ok(())
    }

    pub async fn delete_cluster_admin(&self, name: &str) -> Result<(), UrdError> {
        self.execute(MetaCommand::DeleteClusterAdmin { name: name.to_string() }).await?;
        Ok(())
    }

    pub fn cluster_admins(&self) -> Vec<User> {
        self.config().cluster_admins().into_iter().cloned().collect()
    }

    pub async fn authenticate_cluster_admin(&self, name: &str, password: &str) -> Result<User, UrdError> {
        let user = self.config().cluster_admin(name)?.clone();
        self.check_password(user, password).await
    }

    async fn check_password(&self, user: User, password: &str) -> Result<User, UrdError> {
        if self.inner.credentials.verify(password, &user.password_hash).await {
            Ok(user)
        } else {
            Err(UrdError::PermissionDenied(format!("invalid credentials for '{}'", user.name)))
        }
    }

    // -- retention ---------------------------------------------------------

    /// Proposes the `DropShard` commands emitted by a
    /// [`urd_cluster::RetentionTask`] until its sender is dropped. Only the
    /// leader succeeds; other nodes skip silently.
    pub async fn run_retention(&self, mut rx: mpsc::Receiver<MetaCommand>) {
        while let Some(cmd) = rx.recv().await {
            match self.execute(cmd).await {
                Ok(_) => {}
                Err(UrdError::NotLeader { .. }) => debug!("not leader, retention drop skipped"),
                Err(UrdError::ShardNotFound(id)) => debug!(shard = id, "shard already dropped"),
                Err(e) => warn!(error = %e, "retention drop failed"),
            }
        }
    }
}

fn unexpected(op: &str, resp: MetaResponse) -> UrdError {
    UrdError::Storage(format!("unexpected response to {op}: {resp:?}"))
}

/// Handle to one incarnation of a database.
pub struct Database<M, T> {
    engine: Engine<M, T>,
    name: String,
    id: DatabaseId,
}

impl<M, T> Clone for Database<M, T> {
    fn clone(&self) -> Self {
        Database { engine: self.engine.clone(), name: self.name.clone(), id: self.id }
    }
}

impl<M: MetaNode, T: ShardTransport> Database<M, T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> DatabaseId {
        self.id
    }

    /// Current config, provided this handle is not stale.
    fn live(&self) -> Result<Arc<ClusterConfig>, UrdError> {
        let config = self.engine.config();
        config.check_database(&self.name, self.id)?;
        Ok(config)
    }

    /// Proposes a command bound to this incarnation, so it is rejected if
    /// the database is dropped (and maybe re-created) before it applies.
    async fn execute(&self, cmd: MetaCommand) -> Result<MetaResponse, UrdError> {
        self.engine.execute(cmd.in_database(self.id)).await
    }

    // -- users -------------------------------------------------------------

    pub async fn create_user(&self, name: &str, password: &str) -> Result<(), UrdError> {
        User::validate_name(name)?;
        self.live()?;
        let user = User::new(name, self.engine.inner.credentials.hash(password).await?);
        self.execute(MetaCommand::CreateUser { database: self.name.clone(), user }).await?;
        Ok(())
    }

    async fn update_user(&self, name: &str, change: impl FnOnce(&mut User)) -> Result<(), UrdError> {
        let mut user = self.live()?.user(&self.name, name)?.clone();
        change(&mut user);
        self.execute(MetaCommand::UpdateUser { database: self.name.clone(), user }).await?;
        Ok(())
    }

    pub async fn change_password(&self, name: &str, password: &str) -> Result<(), UrdError> {
        self.live()?.user(&self.name, name)?;
        let hash = self.engine.inner.credentials.hash(password).await?;
        self.update_user(name, |u| u.password_hash = hash).await
    }

    pub async fn set_permissions(
        &self,
        name: &str,
        read: SeriesPattern,
        write: SeriesPattern,
    ) -> Result<(), UrdError> {
        self.update_user(name, |u| {
            u.read_permission = read;
            u.write_permission = write;
        })
        .await
    }

    pub async fn set_admin(&self, name: &str, is_admin: bool) -> Result<(), UrdError> {
        self.update_user(name, |u| u.is_admin = is_admin).await
    }

    pub async fn delete_user(&self, name: &str) -> Result<(), UrdError> {
        if name.is_empty() {
            return Err(UrdError::UsernameRequired);
        }
        self.live()?;
        let cmd = MetaCommand::DeleteUser { database: self.name.clone(), name: name.to_string() };
        self.execute(cmd).await?;
        Ok(())
    }

    pub fn user(&self, name: &str) -> Result<User, UrdError> {
        Ok(self.live()?.user(&self.name, name)?.clone())
    }

    /// Users sorted by name.
    pub fn users(&self) -> Result<Vec<User>, UrdError> {
        Ok(self.live()?.users(&self.name)?.into_iter().cloned().collect())
    }

    pub async fn authenticate(&self, name: &str, password: &str) -> Result<User, UrdError> {
        let user = self.user(name)?;
        self.engine.check_password(user, password).await
    }

    // -- shard spaces ------------------------------------------------------

    pub async fn create_shard_space(&self, mut space: ShardSpace) -> Result<(), UrdError> {
        self.live()?;
        space.database = self.name.clone();
        self.execute(MetaCommand::CreateShardSpace { space }).await?;
        Ok(())
    }

    pub async fn update_shard_space(&self, mut space: ShardSpace) -> Result<(), UrdError> {
        self.live()?;
        space.database = self.name.clone();
        self.execute(MetaCommand::UpdateShardSpace { space }).await?;
        Ok(())
    }

    /// Deletes the space together with its shards and their data.
    pub async fn delete_shard_space(&self, name: &str) -> Result<(), UrdError> {
        self.live()?;
        let cmd = MetaCommand::DeleteShardSpace { database: self.name.clone(), name: name.to_string() };
        self.execute(cmd).await?;
        Ok(())
    }

    pub fn shard_space(&self, name: &str) -> Result<ShardSpace, UrdError> {
        Ok(self.live()?.shard_space(&self.name, name)?.clone())
    }

    /// Spaces in routing order.
    pub fn shard_spaces(&self) -> Result<Vec<ShardSpace>, UrdError> {
        Ok(self.live()?.shard_spaces(&self.name)?.to_vec())
    }

    pub fn shards(&self) -> Result<Vec<Shard>, UrdError> {
        let config = self.live()?;
        Ok(config.shards().filter(|s| s.database == self.name).cloned().collect())
    }

    // -- data --------------------------------------------------------------

    /// Writes `series`. With a `user`, every series name must be writable by
    /// them. Nothing is written if any series is rejected.
    pub async fn write_series(&self, user: Option<&User>, series: Vec<Series>) -> Result<(), UrdError> {
        self.live()?;
        if let Some(user) = user {
            if let Some(denied) = series.iter().find(|s| !user.can_write(&s.name)) {
                return Err(UrdError::PermissionDenied(format!(
                    "user '{}' cannot write '{}'",
                    user.name, denied.name
                )));
            }
        }
        let points: usize = series.iter().map(|s| s.points.len()).sum();
        self.engine.inner.coordinator.write(&self.name, self.id, series, now_micros()).await?;
        debug!(database = %self.name, points, "series written");
        Ok(())
    }

    /// Parses a JSON write payload and writes it.
    pub async fn write_payload(
        &self,
        user: Option<&User>,
        payload: &[u8],
        precision: TimePrecision,
    ) -> Result<(), UrdError> {
        let series = parse_payload(payload, precision)?;
        self.write_series(user, series).await
    }

    /// Runs `query` into `processor` and closes it. With a `user`, a named
    /// series must be readable by them; a pattern query silently skips the
    /// series they cannot read.
    pub async fn execute_query<P: Processor + ?Sized>(
        &self,
        user: Option<&User>,
        query: &Query,
        processor: &mut P,
    ) -> Result<(), UrdError> {
        self.live()?;
        match (user, &query.series) {
            (Some(user), SeriesSelector::Name(name)) if !user.can_read(name) => {
                return Err(UrdError::PermissionDenied(format!(
                    "user '{}' cannot read '{name}'",
                    user.name
                )));
            }
            (Some(user), SeriesSelector::Regex(_)) if !user.is_admin => {
                let mut readable = Readable { user, inner: &mut *processor };
                self.engine.inner.coordinator.query(&self.name, query, &mut readable).await?;
            }
            _ => self.engine.inner.coordinator.query(&self.name, query, processor).await?,
        }
        processor.close()
    }
}

/// Forwards only the series `user` may read.
struct Readable<'a, P: ?Sized> {
    user: &'a User,
    inner: &'a mut P,
}

impl<P: Processor + ?Sized> Processor for Readable<'_, P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn yield_series(&mut self, series: Series) -> Result<bool, UrdError> {
        if self.user.can_read(&series.name) {
            self.inner.yield_series(series)
        } else {
            Ok(true)
        }
    }

    fn close(&mut self) -> Result<(), UrdError> {
        Ok(())
    }
}
