use crate::config::Config;
use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fluxio_core::{
    CacheManager, CoordMessage, FluxError, HealthMonitor, NodeFilter, NodeMessage, NodeRegistry,
    NodeRole, ParticleTransport, PendingTransmissionStore, RegistryBuilder, Resources, RestMirror,
    Result, SessionBus, SortKey, StorageClusterManager, StreamOrchestrator, StreamSource,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc::UnboundedReceiver};
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub registry: Arc<dyn NodeRegistry>,
    pub orchestrator: Arc<StreamOrchestrator>,
    pub bus: Arc<SessionBus>,
    pub pending: Arc<PendingTransmissionStore>,
    pub mirror: Option<RestMirror>,
    /// Inbound halves of attached session channels, drained by the poll
    /// endpoint. A node registers, then polls for coordination messages.
    sessions: Mutex<HashMap<String, UnboundedReceiver<CoordMessage>>>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        axum::Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

fn fail(error: FluxError) -> Response {
    let status = match &error {
        FluxError::NodeNotFound(_) | FluxError::StreamNotFound(_) => StatusCode::NOT_FOUND,
        FluxError::InvalidTransition { .. } => StatusCode::CONFLICT,
        FluxError::NoCandidateNode { .. }
        | FluxError::IncompleteStream { .. }
        | FluxError::ClusterUnavailable { .. }
        | FluxError::TransmissionFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
        FluxError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        axum::Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    node_id: String,
    role: NodeRole,
    resources: Resources,
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    node_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateStreamRequest {
    source_id: String,
    source_uri: String,
    #[serde(default = "default_resolution")]
    resolution: String,
    #[serde(default = "default_fps")]
    fps: u32,
}

fn default_resolution() -> String {
    "1920x1080".to_string()
}

fn default_fps() -> u32 {
    30
}

pub async fn run_server(config: Config) -> Result<()> {
    let mut builder = RegistryBuilder::new()
        .backend(config.registry.backend.as_str())
        .namespace(config.registry.namespace_or_default());
    if let Some(redis) = &config.registry.redis {
        builder = builder.redis_url(redis.url.as_str());
    }
    let registry = builder.build().await?;

    let bus = Arc::new(SessionBus::new());
    let pending = Arc::new(PendingTransmissionStore::new(config.recovery.db_path.clone())?);
    let transport = Arc::new(ParticleTransport::new(config.transport.chunk_size));
    let clusters = Arc::new(StorageClusterManager::new(registry.clone(), bus.clone()));
    let mirror = config.mirror.as_ref().map(|m| RestMirror::new(&m.base_url));
    let mut cache = CacheManager::with_threshold(
        registry.clone(),
        bus.clone(),
        pending.clone(),
        config.transport.flush_threshold_bytes,
    );
    if let Some(mirror) = &mirror {
        cache = cache.with_mirror(mirror.clone());
    }
    let cache = Arc::new(cache);
    let orchestrator = Arc::new(StreamOrchestrator::new(
        registry.clone(),
        transport,
        clusters.clone(),
        cache,
        bus.clone(),
    ));

    let monitor = Arc::new(HealthMonitor::new(registry.clone(), clusters));
    tokio::spawn(monitor.run(Duration::from_secs(config.intervals.health_sweep_secs)));

    let sweep_orchestrator = orchestrator.clone();
    let cache_sweep = Duration::from_secs(config.intervals.cache_sweep_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cache_sweep);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match sweep_orchestrator.sweep_caches().await {
                Ok(0) => {}
                Ok(flushed) => tracing::info!(flushed, "cache sweep flushed stale batches"),
                Err(error) => tracing::warn!(%error, "cache sweep failed"),
            }
        }
    });

    let bind_addr = config.bind_addr.clone();

    let state = Arc::new(ServerState {
        registry,
        orchestrator,
        bus,
        pending,
        mirror,
        sessions: Mutex::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/nodes/register", post(register_node))
        .route("/nodes/heartbeat", post(heartbeat))
        .route("/nodes/:node_id/disconnect", post(disconnect_node))
        .route("/nodes", get(list_nodes))
        .route("/sessions/message", post(session_message))
        .route("/sessions/:node_id/poll", get(poll_session))
        .route("/streams", post(create_stream).get(list_streams))
        .route("/streams/:stream_id", get(get_stream))
        .route("/streams/:stream_id/start", post(start_stream))
        .route("/streams/:stream_id/stop", post(stop_stream))
        .route("/streams/:stream_id/pause", post(pause_stream))
        .route("/streams/:stream_id/resume", post(resume_stream))
        .route("/streams/:stream_id/ingest", post(ingest_payload))
        .route("/streams/:stream_id/serve", post(serve_stream))
        .route("/recovery", get(list_recovery))
        .route("/recovery/:pk/recovered", post(mark_recovered))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let streams = state.orchestrator.list_streams().await;
    let response = serde_json::json!({
        "status": "ok",
        "streams": streams.len(),
    });
    (StatusCode::OK, axum::Json(response))
}

async fn register_node(
    State(state): State<Arc<ServerState>>,
    axum::Json(request): axum::Json<RegisterRequest>,
) -> Response {
    let registered = state
        .orchestrator
        .handle_node_message(NodeMessage::Register {
            node_id: request.node_id.clone(),
            role: request.role,
            resources: request.resources,
        })
        .await;
    if let Err(error) = registered {
        return fail(error);
    }

    // Open the node's session channel; its coordination messages queue
    // here until the node polls them.
    let receiver = state.bus.attach(request.role, &request.node_id);
    state
        .sessions
        .lock()
        .await
        .insert(request.node_id.clone(), receiver);

    if let Some(mirror) = &state.mirror {
        let node = state.registry.get_node(&request.node_id).await;
        if let Ok(Some(node)) = node {
            if let Err(error) = mirror
                .register_node(&node.id, node.role, node.resources)
                .await
            {
                tracing::warn!(node_id = %request.node_id, %error, "registry mirror unreachable");
            }
        }
    }

    match state.registry.get_node(&request.node_id).await {
        Ok(Some(node)) => ok(node),
        Ok(None) => fail(FluxError::NodeNotFound(request.node_id)),
        Err(error) => fail(error),
    }
}

async fn heartbeat(
    State(state): State<Arc<ServerState>>,
    axum::Json(request): axum::Json<HeartbeatRequest>,
) -> Response {
    if let Err(error) = state.registry.touch_heartbeat(&request.node_id).await {
        return fail(error);
    }
    if let Some(mirror) = &state.mirror {
        if let Err(error) = mirror.heartbeat(&request.node_id).await {
            tracing::warn!(node_id = %request.node_id, %error, "heartbeat mirror unreachable");
        }
    }
    ok(serde_json::json!({ "node_id": request.node_id }))
}

async fn disconnect_node(
    State(state): State<Arc<ServerState>>,
    Path(node_id): Path<String>,
) -> Response {
    match state.orchestrator.handle_disconnect(&node_id).await {
        Ok(()) => {
            state.sessions.lock().await.remove(&node_id);
            ok(serde_json::json!({ "node_id": node_id }))
        }
        Err(error) => fail(error),
    }
}

/// Drain the coordination messages queued for a node since its last poll.
async fn poll_session(
    State(state): State<Arc<ServerState>>,
    Path(node_id): Path<String>,
) -> Response {
    let mut sessions = state.sessions.lock().await;
    let Some(receiver) = sessions.get_mut(&node_id) else {
        return fail(FluxError::NodeNotFound(node_id));
    };
    let mut messages = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        messages.push(message);
    }
    ok(messages)
}

async fn list_nodes(State(state): State<Arc<ServerState>>) -> Response {
    let mut nodes = Vec::new();
    for role in [
        NodeRole::Ingest,
        NodeRole::Cache,
        NodeRole::Storage,
        NodeRole::Coordinator,
    ] {
        match state
            .registry
            .find_by_role(role, NodeFilter::default(), SortKey::HeartbeatDesc, usize::MAX)
            .await
        {
            Ok(found) => nodes.extend(found),
            Err(error) => return fail(error),
        }
    }
    ok(nodes)
}

async fn session_message(
    State(state): State<Arc<ServerState>>,
    axum::Json(message): axum::Json<NodeMessage>,
) -> Response {
    match state.orchestrator.handle_node_message(message).await {
        Ok(()) => ok(serde_json::json!({ "applied": true })),
        Err(error) => fail(error),
    }
}

async fn create_stream(
    State(state): State<Arc<ServerState>>,
    axum::Json(request): axum::Json<CreateStreamRequest>,
) -> Response {
    let source = StreamSource {
        source_id: request.source_id,
        source_uri: request.source_uri,
        resolution: request.resolution,
        fps: request.fps,
    };
    match state.orchestrator.initialize(source).await {
        Ok(stream) => ok(stream),
        Err(error) => fail(error),
    }
}

async fn list_streams(State(state): State<Arc<ServerState>>) -> Response {
    ok(state.orchestrator.list_streams().await)
}

async fn get_stream(
    State(state): State<Arc<ServerState>>,
    Path(stream_id): Path<String>,
) -> Response {
    match state.orchestrator.status(&stream_id).await {
        Ok(stream) => ok(stream),
        Err(error) => fail(error),
    }
}

async fn start_stream(
    State(state): State<Arc<ServerState>>,
    Path(stream_id): Path<String>,
) -> Response {
    match state.orchestrator.start(&stream_id).await {
        Ok(stream) => ok(stream),
        Err(error) => fail(error),
    }
}

async fn stop_stream(
    State(state): State<Arc<ServerState>>,
    Path(stream_id): Path<String>,
) -> Response {
    match state.orchestrator.stop(&stream_id).await {
        Ok(stream) => ok(stream),
        Err(error) => fail(error),
    }
}

async fn pause_stream(
    State(state): State<Arc<ServerState>>,
    Path(stream_id): Path<String>,
) -> Response {
    match state.orchestrator.pause(&stream_id).await {
        Ok(stream) => ok(stream),
        Err(error) => fail(error),
    }
}

async fn resume_stream(
    State(state): State<Arc<ServerState>>,
    Path(stream_id): Path<String>,
) -> Response {
    match state.orchestrator.resume(&stream_id).await {
        Ok(stream) => ok(stream),
        Err(error) => fail(error),
    }
}

async fn ingest_payload(
    State(state): State<Arc<ServerState>>,
    Path(stream_id): Path<String>,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return fail(FluxError::Config("ingest payload cannot be empty".to_string()));
    }
    match state.orchestrator.ingest_payload(&stream_id, body).await {
        Ok(report) => ok(serde_json::json!({
            "particle_ids": report.particle_ids,
            "cached_bytes": report.cached_bytes,
            "flushed": report.flushed,
            "capacity_warning": report.capacity_warning,
        })),
        Err(error) => fail(error),
    }
}

async fn list_recovery(State(state): State<Arc<ServerState>>) -> Response {
    match state.pending.list_pending() {
        Ok(records) => ok(records),
        Err(error) => fail(error),
    }
}

/// Close out a pending-transmission record once its particles have been
/// re-forwarded, propagating the status to the mirrored recovery task.
async fn mark_recovered(
    State(state): State<Arc<ServerState>>,
    Path(pk): Path<i64>,
) -> Response {
    let record = match state.pending.get(pk) {
        Ok(Some(record)) => record,
        Ok(None) => return fail(FluxError::Internal(format!("no recovery record {}", pk))),
        Err(error) => return fail(error),
    };
    let recovered = match state.pending.mark_recovered(pk) {
        Ok(recovered) => recovered,
        Err(error) => return fail(error),
    };
    if recovered {
        if let (Some(mirror), Some(task_id)) = (&state.mirror, &record.task_id) {
            if let Err(error) = mirror.update_task(task_id, "recovered").await {
                tracing::warn!(task_id = %task_id, %error, "recovery task mirror unreachable");
            }
        }
    }
    ok(serde_json::json!({ "pk": pk, "recovered": recovered }))
}

async fn serve_stream(
    State(state): State<Arc<ServerState>>,
    Path(stream_id): Path<String>,
) -> Response {
    match state.orchestrator.serve(&stream_id).await {
        Ok(report) => ok(serde_json::json!({
            "source_storage_id": report.source_storage_id,
            "relay_cache_id": report.relay_cache_id,
            "particle_ids": report.particle_ids,
        })),
        Err(error) => fail(error),
    }
}
