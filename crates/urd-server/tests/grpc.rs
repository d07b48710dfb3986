use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Channel;
use tonic::Code;

use urd_cluster::{LocalMetaNode, MetaNode, NodeSettings};
use urd_db::{Credentials, Engine, ShardStore};
use urd_proto::v1::{
    admin_service_client::AdminServiceClient, query_spec::Selector,
    series_service_client::SeriesServiceClient, ClusterStatusRequest, OutputMode, ProposeRequest,
    QueryRequest, QuerySpec, UserCredentials, WriteSeriesRequest,
};
use urd_server::{serve_client, serve_cluster, GrpcPeers, GrpcShards};
use urd_storage::mem::MemLogStorage;
use urd_types::{Server, ShardSpace, WriteMode};

const TIMEOUT: Duration = Duration::from_secs(2);

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn connect(addr: SocketAddr) -> Channel {
    for _ in 0..100 {
        if let Ok(channel) = Channel::from_shared(format!("http://{addr}")).unwrap().connect().await {
            return channel;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server at {addr} never came up");
}

struct TestNode {
    engine: Engine<LocalMetaNode<MemLogStorage, GrpcPeers>, GrpcShards>,
    client: Channel,
    cluster: Channel,
}

async fn start_node() -> TestNode {
    let client_addr = free_addr();
    let cluster_addr = free_addr();
    let store = MemLogStorage::new();
    let meta = LocalMetaNode::open(
        1,
        cluster_addr.to_string(),
        store.clone(),
        GrpcPeers::new(HashMap::new(), TIMEOUT),
        vec![1],
        NodeSettings::default(),
    )
    .await
    .unwrap();
    meta.become_leader(1).await.unwrap();
    let meta = Arc::new(meta);
    let shards = GrpcShards::new(meta.subscribe(), TIMEOUT);
    let engine = Engine::new(meta, shards, WriteMode::Majority, Credentials::with_cost(64, 1, 1).unwrap());

    tokio::spawn(serve_client(client_addr, engine.clone()));
    tokio::spawn(serve_cluster(cluster_addr, engine.clone(), Arc::new(ShardStore::new(store))));

    let addr = cluster_addr.to_string();
    engine.join(Server::new(1, addr.clone(), addr)).await.unwrap();
    TestNode { engine, client: connect(client_addr).await, cluster: connect(cluster_addr).await }
}

fn select(name: &str) -> QuerySpec {
    QuerySpec {
        selector: Some(Selector::Name(name.into())),
        fields: Vec::new(),
        start: i64::MIN,
        end: i64::MAX,
        limit: None,
    }
}

async fn query_chunks(
    client: &mut SeriesServiceClient<Channel>,
    req: QueryRequest,
) -> Result<Vec<serde_json::Value>, tonic::Status> {
    let mut stream = client.query(req).await?.into_inner();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.message().await? {
        chunks.push(serde_json::from_slice(&chunk.json).unwrap());
    }
    Ok(chunks)
}

#[tokio::test(flavor = "multi_thread")]
async fn write_and_query_over_grpc() {
    let node = start_node().await;
    let db = node.engine.create_database("foo").await.unwrap();
    db.create_shard_space(ShardSpace::new("m", Duration::from_secs(3600))).await.unwrap();

    let mut client = SeriesServiceClient::new(node.client.clone());
    let payload = serde_json::json!([
        {"name": "cpu", "columns": ["time", "v"], "points": [[1, 10], [2, 20]]},
        {"name": "mem", "columns": ["time", "v"], "points": [[1, 5]]}
    ]);
    client
        .write_series(WriteSeriesRequest {
            database: "foo".into(),
            payload: payload.to_string().into_bytes(),
            time_precision: "s".into(),
            credentials: None,
        })
        .await
        .unwrap();

    let buffered = query_chunks(
        &mut client,
        QueryRequest {
            database: "foo".into(),
            query: Some(select("cpu")),
            mode: OutputMode::Buffered as i32,
            pretty: false,
            time_precision: "s".into(),
            credentials: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(buffered.len(), 1);
    let mut times: Vec<i64> = buffered[0][0]["points"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p[0].as_i64().unwrap())
        .collect();
    times.sort_unstable();
    assert_eq!(times, vec![1, 2]);

    let chunked = query_chunks(
        &mut client,
        QueryRequest {
            database: "foo".into(),
            query: Some(QuerySpec { selector: Some(Selector::Regex(".*".into())), ..select("") }),
            mode: OutputMode::Chunked as i32,
            pretty: false,
            time_precision: "s".into(),
            credentials: None,
        },
    )
    .await
    .unwrap();
    let mut names: Vec<&str> = chunked.iter().map(|c| c[0]["name"].as_str().unwrap()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["cpu", "mem"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_credentials_are_rejected() {
    let node = start_node().await;
    let db = node.engine.create_database("foo").await.unwrap();
    db.create_user("alice", "secret").await.unwrap();

    let mut client = SeriesServiceClient::new(node.client.clone());
    let req = |password: &str| QueryRequest {
        database: "foo".into(),
        query: Some(select("cpu")),
        mode: OutputMode::Buffered as i32,
        pretty: false,
        time_precision: String::new(),
        credentials: Some(UserCredentials { user: "alice".into(), password: password.into() }),
    };
    let err = query_chunks(&mut client, req("wrong")).await.unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
    assert_eq!(query_chunks(&mut client, req("secret")).await.unwrap(), vec![serde_json::json!([])]);

    let missing = query_chunks(&mut client, QueryRequest { database: "nope".into(), ..req("secret") })
        .await
        .unwrap_err();
    assert_eq!(missing.code(), Code::NotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_proposes_json_commands() {
    let node = start_node().await;
    let mut admin = AdminServiceClient::new(node.cluster.clone());

    let resp = admin
        .propose(ProposeRequest { command_json: r#"{"CreateDatabase":{"name":"metrics"}}"#.into() })
        .await
        .unwrap()
        .into_inner();
    assert!(resp.response_json.contains("DatabaseCreated"));

    let dup = admin
        .propose(ProposeRequest { command_json: r#"{"CreateDatabase":{"name":"metrics"}}"#.into() })
        .await
        .unwrap_err();
    assert_eq!(dup.code(), Code::AlreadyExists);

    let garbage = admin.propose(ProposeRequest { command_json: "{".into() }).await.unwrap_err();
    assert_eq!(garbage.code(), Code::InvalidArgument);

    let status = admin.cluster_status(ClusterStatusRequest {}).await.unwrap().into_inner();
    assert_eq!(status.node_id, 1);
    assert_eq!(status.leader_id, 1);
    assert_eq!(status.databases, vec!["metrics".to_string()]);
    assert_eq!(status.servers.len(), 1);
    assert!(status.commit_index >= 2);
    assert_eq!(node.engine.meta().config().databases(), vec!["metrics".to_string()]);
}
