//! Router-level tests against a single node, with stand-in peers where a
//! round needs someone to talk to

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, Uri};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceExt;
use zooweeper::common::{FORWARDED_HEADER, SENDER_HEADER};
use zooweeper::ensemble::{create_router, AppState};
use zooweeper::zab::ElectionOutcome;
use zooweeper::{NodeConfig, ZTree};

const ME: &str = "7000";

struct TestNode {
    _dir: TempDir,
    state: AppState,
}

impl TestNode {
    /// Lone node with no leader yet
    fn new() -> Self {
        Self::with_ensemble(&[ME], "")
    }

    /// Node `ME` in `peers`, with `leader` already recorded
    fn with_ensemble(peers: &[&str], leader: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let peers: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
        let config = NodeConfig {
            node_address: ME.to_string(),
            peers: peers.clone(),
            base_url: "http://127.0.0.1".to_string(),
            db_path: Some(dir.path().join("ztree")),
            request_timeout_ms: 300,
            proposal_timeout_ms: 1_000,
            sync_timeout_ms: 500,
            election_timeout_ms: 500,
            ..Default::default()
        };
        let config = Arc::new(config);
        let store = Arc::new(ZTree::open(config.db_path()).unwrap());
        store.ensure_local(ME, leader, &peers).unwrap();
        let state = AppState::new(config, store).unwrap();
        Self { _dir: dir, state }
    }

    async fn elected() -> Self {
        let node = Self::new();
        let outcome = node.state.election.run().await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Won);
        node
    }

    async fn call(
        &self,
        method: &str,
        uri: &str,
        sender: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        send(self.state.clone(), method, uri, sender, body).await
    }

    async fn write(&self, timestamp: Value, sender: &str, clients: &[&str]) -> (StatusCode, Value) {
        self.call("POST", "/metadata", None, Some(write_body(timestamp, sender, clients)))
            .await
    }

    fn leader(&self) -> String {
        self.state.store.get_local().unwrap().leader
    }
}

fn write_body(timestamp: Value, sender: &str, clients: &[&str]) -> Value {
    json!({
        "timestamp": timestamp,
        "metadata": { "senderAddress": sender, "clients": clients },
    })
}

async fn send(
    state: AppState,
    method: &str,
    uri: &str,
    sender: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(sender) = sender {
        builder = builder.header(SENDER_HEADER, sender);
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = create_router(state)
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

// ============================================================================
// Stand-in peers
// ============================================================================

type Inbox = mpsc::UnboundedReceiver<(String, Value)>;

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().port().to_string();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    address
}

/// A peer that answers every POST with ok and records what it got
async fn recording_peer() -> (String, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let router = Router::new().fallback(move |uri: Uri, Json(body): Json<Value>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((uri.path().to_string(), body));
            Json(json!({ "status": "ok" }))
        }
    });
    (serve(router).await, rx)
}

/// An address nothing listens on
async fn unused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port().to_string()
}

async fn next_message(inbox: &mut Inbox, path: &str) -> Value {
    loop {
        let (got, body) = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap_or_else(|_| panic!("no {} received", path))
            .unwrap();
        if got == path {
            return body;
        }
    }
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn test_write_commits_on_single_node() {
    let node = TestNode::elected().await;

    let (status, record) = node.write(json!(1), "9090", &["9091"]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["id"], 2);
    assert_eq!(record["version"], 1);
    assert_eq!(record["parentId"], 1);
    assert_eq!(record["receiverAddress"], ME);
    assert_eq!(record["timestamp"], "1");

    let (status, records) = node.call("GET", "/metadata", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["leader"], ME);
}

#[tokio::test]
async fn test_identical_writes_keep_version() {
    let node = TestNode::elected().await;

    for ts in 1..=3 {
        let (status, record) = node.write(json!(ts), "9090", &["9091", "9092"]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["version"], 1);
    }
    // same set, different order
    let (_, record) = node.write(json!(4), "9090", &["9092", "9091"]).await;
    assert_eq!(record["version"], 1);

    let (_, record) = node.write(json!("5"), "9090", &["9093"]).await;
    assert_eq!(record["version"], 2);
    assert_eq!(record["id"], 2);
}

#[tokio::test]
async fn test_undecodable_write_is_rejected() {
    let node = TestNode::elected().await;

    let (status, body) = node
        .call("POST", "/metadata", None, Some(json!({ "metadata": {} })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let request = Request::builder()
        .method("POST")
        .uri("/metadata")
        .body(Body::from("not json"))
        .unwrap();
    let response = create_router(node.state.clone())
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, _) = node.write(json!(1), "", &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(node.state.sequencer.is_empty());
}

#[tokio::test]
async fn test_write_without_leader() {
    let node = TestNode::new();
    let (status, body) = node.write(json!(1), "9090", &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("No leader"));
}

#[tokio::test]
async fn test_write_without_majority_is_aborted() {
    let absent = unused_address().await;
    let node = TestNode::with_ensemble(&[ME, absent.as_str()], ME);

    let (status, body) = node.write(json!(1), "9090", &["9091"]).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body["error"].as_str().unwrap().contains("majority"));

    // nothing was applied and the gate is open again
    let (_, records) = node.call("GET", "/metadata", None, None).await;
    assert_eq!(records.as_array().unwrap().len(), 1);
    let (_, health) = node.call("GET", "/health", None, None).await;
    assert_eq!(health["proposal"], "committed");
    assert_eq!(health["round"], 1);

    // the next write gets a fresh round instead of waiting on the old one
    let (status, _) = node.write(json!(2), "9090", &["9091"]).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    let (_, health) = node.call("GET", "/health", None, None).await;
    assert_eq!(health["round"], 2);
    assert!(node.state.store.version_of("9090").unwrap().is_none());
    assert!(node.state.sequencer.is_empty());
}

#[tokio::test]
async fn test_late_ack_gets_its_own_commit() {
    let (fast, mut fast_inbox) = recording_peer().await;
    let (slow, mut slow_inbox) = recording_peer().await;
    let node = TestNode::with_ensemble(&[ME, fast.as_str(), slow.as_str()], ME);

    let state = node.state.clone();
    let write = tokio::spawn(async move {
        let body = write_body(json!(1), "9090", &["9091"]);
        send(state, "POST", "/metadata", None, Some(body)).await
    });

    let proposal = next_message(&mut fast_inbox, "/proposeWrite").await;
    let round = proposal["round"].as_u64().unwrap();
    assert_eq!(proposal["request"]["metadata"]["senderAddress"], "9090");
    next_message(&mut slow_inbox, "/proposeWrite").await;

    // one follower is enough for a majority of three
    let ack = json!({ "round": round, "address": fast });
    let (status, _) = node
        .call("POST", "/acknowledgeProposal", Some(fast.as_str()), Some(ack))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, record) = write.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    let commit = next_message(&mut fast_inbox, "/commitWrite").await;
    assert_eq!(commit["round"], round);
    assert_eq!(commit["record"]["id"], record["id"]);

    // the other follower acknowledges after the round committed
    let late = json!({ "round": round, "address": slow });
    let (status, _) = node
        .call("POST", "/acknowledgeProposal", Some(slow.as_str()), Some(late.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    let commit = next_message(&mut slow_inbox, "/commitWrite").await;
    assert_eq!(commit["record"]["id"], record["id"]);
    assert_eq!(commit["record"]["version"], 1);

    // served once only
    node.call("POST", "/acknowledgeProposal", Some(slow.as_str()), Some(late))
        .await;
    let again = tokio::time::timeout(Duration::from_millis(300), slow_inbox.recv()).await;
    assert!(again.is_err());
}

#[tokio::test]
async fn test_commit_notifies_clients() {
    let (client, mut client_inbox) = recording_peer().await;
    let node = TestNode::elected().await;

    let mut body = write_body(json!(1), "9090", &[client.as_str()]);
    body["payload"] = json!({ "score": 3 });
    let (status, _) = node.call("POST", "/metadata", None, Some(body)).await;
    assert_eq!(status, StatusCode::OK);

    let delivered = next_message(&mut client_inbox, "/updateScore").await;
    assert_eq!(delivered["score"], 3);
}

#[tokio::test]
async fn test_forwarded_write_outlasts_peer_timeout() {
    let (tx, mut forwarded_by) = mpsc::unbounded_channel();
    let leader_api = Router::new().route(
        "/metadata",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                // longer than a peer call may take, shorter than a write may
                tokio::time::sleep(Duration::from_millis(700)).await;
                let origin = headers
                    .get(FORWARDED_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let _ = tx.send(origin);
                Json(json!({
                    "id": 2,
                    "parentId": 1,
                    "version": 1,
                    "senderAddress": body["metadata"]["senderAddress"],
                }))
            }
        }),
    );
    let leader = serve(leader_api).await;
    let node = TestNode::with_ensemble(&[ME, leader.as_str()], &leader);

    let (status, record) = node.write(json!(1), "9090", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["senderAddress"], "9090");
    assert_eq!(forwarded_by.recv().await.unwrap().as_deref(), Some(ME));
}

#[tokio::test]
async fn test_admin_delete() {
    let node = TestNode::elected().await;
    node.write(json!(1), "9090", &[]).await;

    let (status, _) = node.call("DELETE", "/metadata/1", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = node.call("DELETE", "/metadata/99", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, removed) = node.call("DELETE", "/metadata/2", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed["senderAddress"], "9090");

    let (_, records) = node.call("GET", "/metadata", None, None).await;
    assert_eq!(records.as_array().unwrap().len(), 1);

    // the gate is free again
    let (status, record) = node.write(json!(2), "9090", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["version"], 1);
}

// ============================================================================
// Peer messages
// ============================================================================

#[tokio::test]
async fn test_leader_only_messages_reject_strangers() {
    let node = TestNode::elected().await;
    let proposal = json!({
        "round": 1,
        "request": { "timestamp": 1, "metadata": { "senderAddress": "9090" } },
    });
    let (status, _) = node
        .call("POST", "/proposeWrite", Some("6000"), Some(proposal))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let record = json!({ "id": 5, "parentId": 1, "version": 1, "senderAddress": "9090" });
    let (status, _) = node
        .call("POST", "/writeMetadata", Some("6000"), Some(record.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = node
        .call("POST", "/writeMetadata", Some(ME), Some(record))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);

    let (status, _) = node
        .call("POST", "/deleteMetadata", Some("6000"), Some(json!({ "id": 5 })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let declare = json!({ "leader": "6000", "peers": [ME] });
    let (status, _) = node
        .call("POST", "/declareLeaderReceive", Some("6001"), Some(declare))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_and_ping() {
    let node = TestNode::elected().await;

    let (status, health) = node.call("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["address"], ME);
    assert_eq!(health["role"], "leader");
    assert_eq!(health["election"], "leader");
    assert_eq!(health["proposal"], "committed");
    assert_eq!(health["sync"], "synced");

    let ping = json!({ "message": "ping", "address": "7001" });
    let (status, pong) = node.call("POST", "/", Some("7001"), Some(ping)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pong["message"], "pong");
    assert_eq!(pong["address"], ME);
}

#[tokio::test]
async fn test_elect_message_ranking() {
    let node = TestNode::elected().await;

    let (_, reply) = node
        .call("POST", "/electLeader", Some("9000"), Some(json!({ "address": "9000" })))
        .await;
    assert_eq!(reply["success"], true);

    let (_, reply) = node
        .call("POST", "/electLeader", Some("6000"), Some(json!({ "address": "6000" })))
        .await;
    assert_eq!(reply["success"], false);
    assert_eq!(reply["address"], ME);
}

#[tokio::test]
async fn test_declare_from_higher_node_is_applied() {
    let node = TestNode::new();
    let declare = json!({ "leader": "9000", "peers": [ME, "9000"] });
    let (status, _) = node
        .call("POST", "/declareLeaderReceive", Some("9000"), Some(declare))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node.leader(), "9000");
    assert_eq!(node.state.election.tracker().state().to_string(), "follower");
}

#[tokio::test]
async fn test_declare_from_outranked_node_starts_election() {
    let node = TestNode::new();
    let declare = json!({ "leader": "6000", "peers": [ME, "6000"] });
    let (status, _) = node
        .call("POST", "/declareLeaderReceive", Some("6000"), Some(declare))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(node.leader(), "6000");

    // this node challenges nobody above it and takes over
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while node.leader() != ME {
        assert!(tokio::time::Instant::now() < deadline, "no election followed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_sync_endpoints() {
    let node = TestNode::elected().await;
    node.write(json!(1), "9090", &[]).await;

    let (status, list) = node
        .call("POST", "/requestMetadata", Some(ME), Some(json!({ "highestId": 1 })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["records"].as_array().unwrap().len(), 1);

    let push = json!({
        "records": [
            { "id": 2, "parentId": 1, "version": 9, "senderAddress": "other" },
            { "id": 3, "parentId": 1, "version": 1, "senderAddress": "9095" },
        ]
    });
    let (status, body) = node
        .call("POST", "/updateMetadata", Some(ME), Some(push.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted"], 1);

    // idempotent
    let (_, body) = node
        .call("POST", "/updateMetadata", Some(ME), Some(push))
        .await;
    assert_eq!(body["inserted"], 0);

    let (_, records) = node.call("GET", "/metadata", None, None).await;
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1]["senderAddress"], "9090");
}

#[tokio::test]
async fn test_sync_messages_reject_strangers() {
    let node = TestNode::elected().await;

    let (status, _) = node
        .call("POST", "/syncRequest", Some("6000"), Some(json!({ "address": "6000" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = node
        .call("POST", "/requestMetadata", Some("6000"), Some(json!({ "highestId": 0 })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let push = json!({
        "records": [{ "id": 7, "parentId": 1, "version": 1, "senderAddress": "9095" }]
    });
    let (status, _) = node
        .call("POST", "/updateMetadata", Some("6000"), Some(push))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!node.state.store.id_exists(7).unwrap());

    // an answer must come from the node it names
    let answer = json!({ "address": "6000", "highestId": 4 });
    let (status, _) = node
        .call("POST", "/syncResponse", Some("6001"), Some(answer))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
