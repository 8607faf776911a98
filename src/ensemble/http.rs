//! HTTP API of an ensemble node
//!
//! One router serves both clients (`/metadata`, `/health`) and peers (the
//! Zab, election and sync messages). Peers identify themselves with the
//! `X-Sender-Address` header.

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{sender_of, Error, NodeConfig, Result, FORWARDED_HEADER};
use crate::zab::messages::{
    Ack, Commit, DeclareLeader, DeleteRequest, ElectRequest, ElectResponse, HealthCheck,
    Proposal, RecordList, RequestMetadata, SyncRequest, SyncResponse, WriteRequest,
};
use crate::zab::{
    Election, ElectionTracker, PeerClient, Pipeline, ProposalTracker, Sequencer, Synchronizer,
    SyncTracker,
};
use crate::ztree::{MetadataRecord, ZTree};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub store: Arc<ZTree>,
    pub peers: PeerClient,
    pub sequencer: Arc<Sequencer>,
    pub pipeline: Arc<Pipeline>,
    pub sync: Arc<Synchronizer>,
    pub election: Arc<Election>,
}

impl AppState {
    /// Wire every component around an opened store
    pub fn new(config: Arc<NodeConfig>, store: Arc<ZTree>) -> Result<Self> {
        let ensemble_size = config.peers.len();
        let peers = PeerClient::new(config.clone())?;

        let proposal = Arc::new(ProposalTracker::new(ensemble_size));
        let sync_tracker = Arc::new(SyncTracker::new(ensemble_size));

        let sync = Arc::new(Synchronizer::new(
            config.clone(),
            store.clone(),
            peers.clone(),
            sync_tracker.clone(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            config.clone(),
            store.clone(),
            peers.clone(),
            proposal,
            sync_tracker,
        ));
        let election = Arc::new(Election::new(
            config.clone(),
            store.clone(),
            peers.clone(),
            Arc::new(ElectionTracker::new()),
            sync.clone(),
        ));

        Ok(Self {
            config,
            store,
            peers,
            sequencer: Arc::new(Sequencer::new()),
            pipeline,
            sync,
            election,
        })
    }

    fn me(&self) -> &str {
        &self.config.node_address
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Client API
        .route("/metadata", get(list_metadata).post(write_metadata_request))
        .route("/metadata/:id", delete(delete_metadata_request))
        .route("/health", get(health))
        // Write pipeline
        .route("/proposeWrite", post(propose_write))
        .route("/acknowledgeProposal", post(acknowledge_proposal))
        .route("/commitWrite", post(commit_write))
        .route("/writeMetadata", post(write_metadata))
        .route("/deleteMetadata", post(replicated_delete))
        // Health probe
        .route("/", post(ping))
        // Election
        .route("/electLeader", post(elect_leader))
        .route("/declareLeaderReceive", post(declare_leader))
        // Synchronization
        .route("/syncRequest", post(sync_request))
        .route("/syncResponse", post(sync_response))
        .route("/requestMetadata", post(request_metadata))
        .route("/updateMetadata", post(update_metadata))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(axum::middleware::from_fn(request_tracing_middleware)),
        )
        .with_state(state)
}

fn ok() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// Client API
// ============================================================================

async fn list_metadata(State(state): State<AppState>) -> Result<Json<Vec<MetadataRecord>>> {
    Ok(Json(state.store.all_records()?))
}

/// Client write: ordered by the sequencer, then led here or forwarded
async fn write_metadata_request(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request: WriteRequest = serde_json::from_slice(&body)?;
    let _admission = state.sequencer.admit(request.timestamp.clone()).await;

    let leader = state.pipeline.leader()?;
    if leader != state.me() {
        return forward(&state, &leader, method, "/metadata", &headers, body).await;
    }

    let receiver = headers
        .get(FORWARDED_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(state.me())
        .to_string();
    let record = state.pipeline.lead(request, &receiver).await?;
    Ok(Json(record).into_response())
}

async fn delete_metadata_request(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let leader = state.pipeline.leader()?;
    if leader != state.me() {
        let path = format!("/metadata/{}", id);
        return forward(&state, &leader, method, &path, &headers, body).await;
    }
    let removed = state.pipeline.delete(id).await?;
    Ok(Json(removed).into_response())
}

/// Relay a client request to the leader and its answer back
async fn forward(
    state: &AppState,
    leader: &str,
    method: Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    if leader.is_empty() {
        return Err(Error::NoLeader);
    }
    if headers.contains_key(FORWARDED_HEADER) {
        // already forwarded once; leadership is moving
        return Err(Error::NotLeader(leader.to_string()));
    }

    tracing::debug!(leader = %leader, path, "Forwarding to leader");
    let (status, content_type, bytes) = state
        .peers
        .forward(leader, method, path, headers, body)
        .await?;

    let mut response = (status, bytes).into_response();
    if let Some(ct) = content_type {
        response.headers_mut().insert(header::CONTENT_TYPE, ct);
    }
    Ok(response)
}

/// Node status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub address: String,
    pub leader: String,
    pub role: String,
    pub election: String,
    pub proposal: String,
    pub round: u64,
    pub sync: String,
    pub records: usize,
    pub version: String,
}

async fn health(State(state): State<AppState>) -> Result<Json<NodeStatus>> {
    let local = state.store.get_local()?;
    let proposal = state.pipeline.proposal();
    Ok(Json(NodeStatus {
        address: state.me().to_string(),
        role: if local.leader == state.me() {
            "leader"
        } else {
            "follower"
        }
        .to_string(),
        leader: local.leader,
        election: state.election.tracker().state().to_string(),
        proposal: proposal.state().to_string(),
        round: proposal.round(),
        sync: state.sync.tracker().state().to_string(),
        records: state.store.all_records()?.len(),
        version: crate::VERSION.to_string(),
    }))
}

// ============================================================================
// Write pipeline
// ============================================================================

async fn propose_write(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(proposal): Json<Proposal>,
) -> Result<Json<Value>> {
    let sender = sender_of(&headers);
    state.pipeline.on_proposal(sender.as_deref(), &proposal)?;
    Ok(ok())
}

async fn acknowledge_proposal(
    State(state): State<AppState>,
    Json(ack): Json<Ack>,
) -> Result<Json<Value>> {
    let proposal_state = state.pipeline.on_ack(ack).await?;
    Ok(Json(json!({ "status": "ok", "state": proposal_state.to_string() })))
}

async fn commit_write(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(commit): Json<Commit>,
) -> Result<Json<Value>> {
    let sender = sender_of(&headers);
    let applied = state.pipeline.on_commit(sender.as_deref(), &commit)?;
    Ok(Json(json!({ "status": "ok", "applied": applied })))
}

async fn write_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(record): Json<MetadataRecord>,
) -> Result<Json<Value>> {
    let sender = sender_of(&headers);
    let applied = state.pipeline.write_metadata(sender.as_deref(), &record)?;
    Ok(Json(json!({ "status": "ok", "applied": applied })))
}

async fn replicated_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<MetadataRecord>> {
    let sender = sender_of(&headers);
    Ok(Json(state.pipeline.on_delete(sender.as_deref(), &request)?))
}

// ============================================================================
// Health, election and synchronization
// ============================================================================

async fn ping(State(state): State<AppState>, Json(check): Json<HealthCheck>) -> Json<HealthCheck> {
    tracing::debug!(from = %check.address, message = %check.message, "Health probe");
    Json(HealthCheck {
        message: "pong".to_string(),
        address: state.me().to_string(),
    })
}

async fn elect_leader(
    State(state): State<AppState>,
    Json(request): Json<ElectRequest>,
) -> Json<ElectResponse> {
    Json(state.election.on_elect(&request))
}

async fn declare_leader(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(declare): Json<DeclareLeader>,
) -> Result<Json<Value>> {
    let sender = sender_of(&headers);
    state.election.on_declare(sender.as_deref(), &declare)?;
    Ok(ok())
}

async fn sync_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SyncRequest>,
) -> Result<Json<Value>> {
    let sender = sender_of(&headers);
    state.sync.on_sync_request(sender.as_deref(), request)?;
    Ok(ok())
}

async fn sync_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(response): Json<SyncResponse>,
) -> Result<Json<Value>> {
    let sender = sender_of(&headers);
    let sync_state = state.sync.on_sync_response(sender.as_deref(), response)?;
    Ok(Json(json!({ "status": "ok", "state": sync_state.to_string() })))
}

async fn request_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RequestMetadata>,
) -> Result<Json<RecordList>> {
    let sender = sender_of(&headers);
    Ok(Json(state.sync.on_request_metadata(sender.as_deref(), &request)?))
}

async fn update_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(list): Json<RecordList>,
) -> Result<Json<Value>> {
    let sender = sender_of(&headers);
    let inserted = state.sync.on_update_metadata(sender.as_deref(), &list)?;
    Ok(Json(json!({ "status": "ok", "inserted": inserted })))
}
