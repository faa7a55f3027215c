//! HTTP API Server
//!
//! Peer-facing replication endpoints plus content upload, local writes
//! and replica set administration.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tower_http::cors;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::ledger::{Clock, NewRecord, SourceTable};
use crate::node::Node;
use crate::registry::ReplicaSet;
use crate::replication::protocol::{
    BatchClockStatusRequest, BatchClockStatusResponse, ClockStatusResponse, ExportQuery, ExportResponse,
    HealthCheckResponse, SyncReport, SyncRequest, UserClockStatus,
};
use crate::state::health::memory_snapshot;

/// Shared application state
pub struct AppState {
    pub node: Arc<Node>,
}

/// HTTP API server
pub struct HttpServer {
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            state: Arc::new(AppState { node }),
        }
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>) -> Router {
        let cors_enabled = state.node.config().api.cors_enabled;

        let app = Router::new()
            // Peer replication
            .route("/export", get(handle_export))
            .route("/sync", post(handle_sync))
            .route("/users/batch_clock_status", post(handle_batch_clock_status))
            .route("/users/clock_status/:wallet", get(handle_clock_status))
            .route("/health_check", get(handle_health_check))
            // Content
            .route("/content", put(handle_put_content))
            .route("/content/:hash", get(handle_get_content))
            // Local writes and administration
            .route("/users/:wallet/records", post(handle_append_record))
            .route(
                "/replica_sets/:wallet",
                get(handle_get_replica_set).put(handle_put_replica_set),
            )
            .route("/state_machine", get(handle_state_machine))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if cors_enabled {
            app.layer(
                cors::CorsLayer::new()
                    .allow_origin(cors::Any)
                    .allow_headers(cors::Any)
                    .allow_methods(cors::Any),
            )
        } else {
            app
        }
    }

    /// Serve until the listener fails
    pub async fn start(&self) -> Result<()> {
        let bind_address = self.state.node.config().node.bind_address.clone();
        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        tracing::info!("HTTP API listening on {}", bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Local write request
#[derive(Debug, Deserialize, Serialize)]
pub struct AppendRecordRequest {
    pub source_table: SourceTable,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AppendRecordResponse {
    pub clock: Clock,
}

/// Replica set assignment written by an operator
#[derive(Debug, Deserialize, Serialize)]
pub struct ReplicaSetRequest {
    pub user_id: u64,
    pub primary: String,
    pub secondary1: String,
    pub secondary2: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ContentResponse {
    pub hash: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QueuedResponse {
    pub status: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::UserNotFound(_) | Error::ContentNotFound(_) => StatusCode::NOT_FOUND,
        Error::SyncInProgress(_) => StatusCode::CONFLICT,
        Error::Config(_) | Error::ConfigParse(_) | Error::ContentHashMismatch { .. } => StatusCode::BAD_REQUEST,
        Error::PeerUnreachable { .. } | Error::Network(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    let status = error_status(&e);
    if status.is_server_error() {
        tracing::error!(code = e.code(), error = %e, "Request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
        .into_response()
}

fn bad_request(code: &str, error: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_export(State(state): State<Arc<AppState>>, Query(query): Query<ExportQuery>) -> Response {
    match state.node.ledger.export_range(&query.user, query.clock_range_min).await {
        Ok(Some(export)) => {
            let mut body = ExportResponse::new();
            body.insert(query.user, export);
            Json(body).into_response()
        }
        Ok(None) => Json(ExportResponse::new()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_sync(State(state): State<Arc<AppState>>, Json(req): Json<SyncRequest>) -> Response {
    let node = &state.node;

    if req.wallet.is_empty() {
        return bad_request("INVALID_REQUEST", "wallet must name at least one user".into());
    }
    if req.creator_node_endpoint == node.endpoint() {
        return bad_request("INVALID_REQUEST", "cannot sync from self".into());
    }
    if let Some(user) = req.wallet.iter().find(|u| node.replication.is_syncing(u)) {
        return error_response(Error::SyncInProgress(user.clone()));
    }

    tracing::info!(
        users = req.wallet.len(),
        primary = %req.creator_node_endpoint,
        sync_type = %req.sync_type,
        immediate = req.immediate,
        "Sync requested"
    );

    if req.immediate {
        let mut reports: Vec<SyncReport> = Vec::with_capacity(req.wallet.len());
        for user in &req.wallet {
            match node
                .replication
                .sync_from_primary(user, &req.creator_node_endpoint, req.force_resync)
                .await
            {
                Ok(report) => reports.push(report),
                Err(e) => return error_response(e),
            }
        }
        return Json(reports).into_response();
    }

    for user in req.wallet {
        let replication = node.replication.clone();
        let primary = req.creator_node_endpoint.clone();
        let force_resync = req.force_resync;
        tokio::spawn(async move {
            // Failures are logged and recorded by the engine
            let _ = replication.sync_from_primary(&user, &primary, force_resync).await;
        });
    }

    (
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            status: "queued".into(),
        }),
    )
        .into_response()
}

async fn handle_batch_clock_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchClockStatusRequest>,
) -> Response {
    let limit = state.node.config().sync.max_batch_clock_status_size;
    if req.wallet_public_keys.len() > limit {
        return bad_request(
            "BATCH_TOO_LARGE",
            format!(
                "{} users requested, at most {} allowed",
                req.wallet_public_keys.len(),
                limit
            ),
        );
    }

    match state.node.ledger.clocks(&req.wallet_public_keys).await {
        Ok(clocks) => {
            let users = req
                .wallet_public_keys
                .into_iter()
                .map(|key| UserClockStatus {
                    clock: clocks.get(&key).copied().unwrap_or(0),
                    wallet_public_key: key,
                })
                .collect();
            Json(BatchClockStatusResponse { users }).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_clock_status(State(state): State<Arc<AppState>>, Path(wallet): Path<String>) -> Response {
    match state.node.ledger.clock(&wallet).await {
        Ok(clock_value) => Json(ClockStatusResponse { clock_value }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let node = &state.node;
    let verdict = node.health.self_health(node.endpoint());
    let (available, total) = memory_snapshot();
    let history = node.history.snapshot(node.endpoint()).await;

    Json(HealthCheckResponse {
        healthy: verdict.healthy,
        endpoint: node.endpoint().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: node.uptime().as_secs(),
        available_memory: Some(available),
        total_memory: Some(total),
        daily_sync_success_count: history.daily.success,
        daily_sync_fail_count: history.daily.fail,
        rolling_sync_success_count: history.rolling.success,
        rolling_sync_fail_count: history.rolling.fail,
        latest_sync_success: history.latest_success,
        latest_sync_fail: history.latest_fail,
    })
}

async fn handle_put_content(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match state.node.content.put(&body).await {
        Ok(hash) => Json(ContentResponse { hash }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_get_content(State(state): State<Arc<AppState>>, Path(hash): Path<String>) -> Response {
    match state.node.content.get(&hash).await {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response(),
        Ok(None) => error_response(Error::ContentNotFound(hash)),
        Err(e) => error_response(e),
    }
}

async fn handle_append_record(
    State(state): State<Arc<AppState>>,
    Path(wallet): Path<String>,
    Json(req): Json<AppendRecordRequest>,
) -> Response {
    let record = NewRecord {
        source_table: req.source_table,
        content_hash: req.content_hash,
        payload: req.payload,
    };

    match state.node.write_record(&wallet, record).await {
        Ok(clock) => Json(AppendRecordResponse { clock }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_get_replica_set(State(state): State<Arc<AppState>>, Path(wallet): Path<String>) -> Response {
    match state.node.registry.get_replica_set(&wallet).await {
        Ok(Some(assignment)) => Json(assignment).into_response(),
        Ok(None) => error_response(Error::UserNotFound(wallet)),
        Err(e) => error_response(e),
    }
}

async fn handle_put_replica_set(
    State(state): State<Arc<AppState>>,
    Path(wallet): Path<String>,
    Json(req): Json<ReplicaSetRequest>,
) -> Response {
    let replica_set = ReplicaSet::new(req.primary, req.secondary1, req.secondary2);
    let members = replica_set.members();
    if members[0] == members[1] || members[0] == members[2] || members[1] == members[2] {
        return bad_request("INVALID_REPLICA_SET", format!("replica set {} repeats a node", replica_set));
    }

    match state.node.registry.register(&wallet, req.user_id, &replica_set).await {
        Ok(()) => {
            tracing::info!(user = %wallet, user_id = req.user_id, replica_set = %replica_set, "Replica set registered");
            Json(replica_set).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_state_machine(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.machine.status().await)
}
