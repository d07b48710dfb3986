use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::sync::mpsc;

use urd_cluster::{LocalMetaNode, MetaNode, NodeSettings, RetentionTask};
use urd_db::{Credentials, Engine, ShardStore, ShardTransport};
use urd_server::{serve_client, serve_cluster, GrpcPeers, GrpcShards};
use urd_storage::fjall::FjallLogStorage;
use urd_types::{NodeId, Server, UrdError, WriteMode};

#[derive(clap::Parser, Debug)]
#[command(name = "urd-node", about = "Urd time-series cluster node")]
struct Cli {
    #[arg(long)]
    node_id: NodeId,
    #[arg(long, default_value = "0.0.0.0:18086")]
    client_addr: String,
    #[arg(long, default_value = "0.0.0.0:18099")]
    cluster_addr: String,
    /// Address other nodes reach this one at; defaults to --cluster-addr
    #[arg(long)]
    advertise_addr: Option<String>,
    /// Peer specs: "id=addr" format, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,
    /// Start as metadata leader and register every peer as a server
    #[arg(long)]
    leader: bool,
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Overrides storage.data_dir
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: String,
    compact_threshold: u64,
}

#[derive(Debug, Deserialize)]
struct ClusterSection {
    term: u64,
    write_quorum: String,
    replication_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RetentionConfig {
    interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    request_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    cluster: ClusterSection,
    retention: RetentionConfig,
    server: ServerConfig,
    observability: ObservabilityConfig,
}

fn parse_peer(spec: &str) -> anyhow::Result<(NodeId, String)> {
    let (id, addr) = spec
        .split_once('=')
        .with_context(|| format!("peer '{spec}' is not in id=addr form"))?;
    let id = id.parse().with_context(|| format!("invalid peer id in '{spec}'"))?;
    Ok((id, addr.to_owned()))
}

/// Registers every known node as a server. Retries while peers are still
/// starting and the metadata write cannot reach quorum.
async fn bootstrap<M: MetaNode, T: ShardTransport>(
    engine: &Engine<M, T>,
    servers: Vec<Server>,
) -> anyhow::Result<()> {
    for server in servers {
        let id = server.id;
        let mut attempt = 0;
        loop {
            match engine.join(server.clone()).await {
                Ok(()) => break,
                Err(e @ (UrdError::QuorumNotReached { .. } | UrdError::Timeout | UrdError::Transport(_)))
                    if attempt < 30 =>
                {
                    attempt += 1;
                    tracing::warn!(server = id, attempt, error = %e, "join failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e).with_context(|| format!("failed to register server {id}")),
            }
        }
    }
    tracing::info!("cluster bootstrapped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("URD_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let client_addr: SocketAddr = cli
        .client_addr
        .parse()
        .with_context(|| format!("invalid client_addr: {}", cli.client_addr))?;
    let cluster_addr: SocketAddr = cli
        .cluster_addr
        .parse()
        .with_context(|| format!("invalid cluster_addr: {}", cli.cluster_addr))?;
    let advertise = cli.advertise_addr.clone().unwrap_or_else(|| cli.cluster_addr.clone());
    let peers: HashMap<NodeId, String> =
        cli.peers.iter().map(|p| parse_peer(p)).collect::<anyhow::Result<_>>()?;
    let write_mode: WriteMode = config
        .cluster
        .write_quorum
        .parse()
        .context("invalid cluster.write_quorum")?;

    tracing::info!(
        node_id = cli.node_id,
        client_addr = %client_addr,
        cluster_addr = %cluster_addr,
        peers = peers.len(),
        leader = cli.leader,
        "node starting"
    );

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| config.storage.data_dir.clone().into());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let store = FjallLogStorage::open(&data_dir).context("failed to open storage")?;

    let replication_timeout = Duration::from_millis(config.cluster.replication_timeout_ms);
    let transport = GrpcPeers::new(peers.clone(), replication_timeout);
    let mut members = transport.ids();
    members.push(cli.node_id);
    let meta = LocalMetaNode::open(
        cli.node_id,
        advertise.clone(),
        store.clone(),
        transport,
        members,
        NodeSettings { replication_timeout, compact_threshold: config.storage.compact_threshold },
    )
    .await
    .context("failed to open metadata log")?;
    if cli.leader {
        meta.become_leader(config.cluster.term).await?;
    }
    let meta = Arc::new(meta);

    let request_timeout = Duration::from_millis(config.server.request_timeout_ms);
    let shards = GrpcShards::new(meta.subscribe(), request_timeout);
    let engine = Engine::new(meta.clone(), shards, write_mode, Credentials::default());
    let shard_store = Arc::new(ShardStore::new(store));

    let (drop_tx, drop_rx) = mpsc::channel(64);
    let retention = RetentionTask::new(
        meta.subscribe(),
        drop_tx,
        Duration::from_secs(config.retention.interval_secs),
    );
    tokio::spawn(retention.run());
    let retention_engine = engine.clone();
    tokio::spawn(async move { retention_engine.run_retention(drop_rx).await });

    let mut servers = vec![Server::new(cli.node_id, advertise.clone(), advertise)];
    servers.extend(peers.into_iter().map(|(id, addr)| Server::new(id, addr.clone(), addr)));
    servers.sort_by_key(|s| s.id);

    tokio::try_join!(
        serve_client(client_addr, engine.clone()),
        serve_cluster(cluster_addr, engine.clone(), shard_store),
        async {
            if cli.leader {
                bootstrap(&engine, servers).await?;
            }
            Ok::<_, anyhow::Error>(())
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_specs() {
        assert_eq!(parse_peer("2=10.0.0.2:18099").unwrap(), (2, "10.0.0.2:18099".to_string()));
        assert!(parse_peer("10.0.0.2:18099").is_err());
        assert!(parse_peer("two=10.0.0.2:18099").is_err());
    }

    #[test]
    fn default_config_parses() {
        let config: Config = Figment::new()
            .merge(Toml::string(include_str!("../../../config/default.toml")))
            .extract()
            .unwrap();
        assert_eq!(config.cluster.write_quorum.parse::<WriteMode>().unwrap(), WriteMode::Majority);
        assert_eq!(config.observability.log_format, "json");
    }
}
