use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::node::auth;
use crate::node::bundles::{BundleStore, PutOutcome};
use crate::node::host::{ProcessHost, WorkerHost};
use crate::node::registry::WorkerRegistry;
use crate::node::stats::CpuSampler;
use crate::protocol::{ControlFrame, CreateWorkerRequest, LineParser};

/// Product token sent in the `server` header, checked by clients for
/// version compatibility.
pub const SERVER_PRODUCT: &str = concat!("worker-fleet/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub bundles: Arc<BundleStore>,
    pub registry: Arc<WorkerRegistry>,
    pub cpu: Arc<CpuSampler>,
}

/// Assemble the node state with the production process host.
pub async fn build_state(config: NodeConfig) -> Result<AppState> {
    let host = Arc::new(ProcessHost::new(config.runtime.clone()));
    build_state_with_host(config, host).await
}

/// Assemble the node state with a caller-supplied worker host.
pub async fn build_state_with_host(
    config: NodeConfig,
    host: Arc<dyn WorkerHost>,
) -> Result<AppState> {
    let bundles = BundleStore::open(&config.bundle_dir, config.cache_clear_threshold).await?;
    let registry = Arc::new(WorkerRegistry::new(host, config.exit_grace));
    Ok(AppState {
        config: Arc::new(config),
        bundles: Arc::new(bundles),
        registry,
        cpu: Arc::new(CpuSampler::new()),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(identity))
        .route("/health", get(health))
        .route("/bundles/create", post(bundle_create))
        .route("/bundles/{hash}", get(bundle_describe))
        .route("/bundles/{hash}/data", post(bundle_data))
        .route("/workers", get(list_workers))
        .route("/worker", post(create_worker))
        .route(
            "/worker/{id}/streams-pipe",
            get(attach_stream).post(control_stream),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_basic_auth,
        ))
        // Bundle artifacts can exceed the default extractor cap.
        .layer(axum::extract::DefaultBodyLimit::max(64 * 1024 * 1024))
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            header::HeaderValue::from_static(SERVER_PRODUCT),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the node server until the shutdown token fires. Streaming responses
/// are indefinite; no idle or response timeouts apply.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Starting node server");
    let registry = state.registry.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            // Ending the open event streams lets in-flight connections
            // complete so the graceful shutdown can finish.
            registry.drain();
        })
        .await?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    name: String,
    node_version: &'static str,
}

async fn identity(State(state): State<AppState>) -> Json<IdentityResponse> {
    Json(IdentityResponse {
        name: state.config.name.clone(),
        node_version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    workers_running: usize,
    cpu_usage: Vec<f64>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        workers_running: state.registry.running_count().await,
        cpu_usage: state.cpu.sample(),
    })
}

#[derive(Deserialize)]
struct CreateBundleRequest {
    hash: String,
}

async fn bundle_create(
    State(state): State<AppState>,
    Json(req): Json<CreateBundleRequest>,
) -> StatusCode {
    match state.bundles.create(&req.hash).await {
        Ok(()) => StatusCode::CREATED,
        Err(e) => {
            tracing::warn!(hash = %req.hash, error = %e, "Bundle create rejected");
            StatusCode::BAD_REQUEST
        }
    }
}

async fn bundle_describe(State(state): State<AppState>, Path(hash): Path<String>) -> Response {
    match state.bundles.describe(&hash).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

#[derive(Deserialize)]
struct DataQuery {
    compression: Option<String>,
}

async fn bundle_data(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<DataQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !is_binary_body(&headers) {
        return StatusCode::BAD_REQUEST;
    }
    match state
        .bundles
        .put_data(&hash, &body, query.compression.as_deref())
        .await
    {
        Ok(PutOutcome::Stored) => StatusCode::NO_CONTENT,
        Ok(PutOutcome::NoSlot) => StatusCode::NOT_FOUND,
        Ok(PutOutcome::UnknownCompression) => StatusCode::BAD_REQUEST,
        Err(e) => {
            tracing::warn!(hash = %hash, error = %e, "Bundle upload failed");
            StatusCode::BAD_REQUEST
        }
    }
}

fn is_binary_body(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/octet-stream"))
        .unwrap_or(false)
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<Uuid>> {
    Json(state.registry.live_ids().await)
}

async fn create_worker(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkerRequest>,
) -> Response {
    let cached = matches!(state.bundles.describe(&req.bundle_hash).await, Ok(Some(_)));
    if !cached {
        return (StatusCode::BAD_REQUEST, "unknown bundle fingerprint").into_response();
    }
    let artifact = match state.bundles.artifact_path(&req.bundle_hash) {
        Ok(path) => path,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let entry = match state
        .registry
        .create_worker(req.bundle_hash, artifact, req.extra_data)
        .await
    {
        Ok(entry) => entry,
        Err(e) => {
            tracing::error!(error = %e, "Worker spawn failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let stream = state
        .registry
        .event_stream(entry.clone(), req.exit_on_request_end);
    state.registry.start_pump(&entry);
    event_stream_response(Some(entry.id), stream)
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PipeQuery {
    exit_on_request_end: Option<String>,
}

impl PipeQuery {
    /// The flag may be presence-only (`?exitOnRequestEnd`) or explicit.
    fn flag(&self) -> bool {
        matches!(&self.exit_on_request_end, Some(v) if v != "false")
    }
}

async fn attach_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PipeQuery>,
) -> Response {
    match state.registry.get(&id).await {
        Some(entry) => {
            let stream = state.registry.event_stream(entry.clone(), query.flag());
            state.registry.start_pump(&entry);
            event_stream_response(None, stream)
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn control_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Body,
) -> StatusCode {
    let Some(entry) = state.registry.get(&id).await else {
        return StatusCode::NOT_FOUND;
    };

    let mut parser = LineParser::new();
    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                for (name, value) in parser.push(&bytes) {
                    if let Some(frame) = ControlFrame::decode(&name, &value) {
                        state.registry.deliver(&entry, frame).await;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(worker_id = %id, error = %e, "Control stream broke");
                break;
            }
        }
    }
    StatusCode::NO_CONTENT
}

fn event_stream_response(
    worker_id: Option<Uuid>,
    stream: impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
    if let Some(id) = worker_id {
        builder = builder.header("x-worker-id", id.to_string());
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
