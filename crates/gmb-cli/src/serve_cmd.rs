use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use gmb_core::webhook::parse_webhook_url;
use gmb_core::{
    BusinessRecord, JobRegistry, LaunchError, Launcher, ScrapeQuery, Stats, StreamConfig,
    ValidationError, WebhookNotifier, aggregate, record_outcome, run_stream_job, run_webhook_job,
};

use crate::config::GmbConfig;

/// Frames buffered between the streaming task and the HTTP body.
const STREAM_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid API key".to_string(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<LaunchError> for AppError {
    fn from(err: LaunchError) -> Self {
        let status = match &err {
            LaunchError::AtCapacity { .. } | LaunchError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            LaunchError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and wire types
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub registry: JobRegistry,
    pub launcher: Arc<dyn Launcher>,
    pub notifier: WebhookNotifier,
    pub stream: StreamConfig,
    pub api_keys: Arc<[String]>,
}

impl AppState {
    pub fn from_config(config: &GmbConfig) -> Self {
        Self {
            registry: config.registry(),
            launcher: Arc::new(config.launcher()),
            notifier: config.notifier(),
            stream: config.stream,
            api_keys: config.api_keys.clone().into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiKeyParam {
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    #[serde(flatten)]
    pub query: ScrapeQuery,
    pub webhook_url: String,
}

#[derive(Debug, Serialize)]
pub struct ScrapeResponse {
    pub job_id: Uuid,
    pub query: ScrapeQuery,
    pub stats: Stats,
    pub businesses: Vec<BusinessRecord>,
    pub total_businesses: usize,
}

#[derive(Debug, Serialize)]
pub struct WebhookAccepted {
    pub job_id: Uuid,
    pub message: String,
    pub webhook_url: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let scrape = Router::new()
        .route("/scrape", post(scrape_sync))
        .route("/scrape/stream", get(scrape_stream))
        .route("/scrape/webhook", post(scrape_webhook))
        .route("/scrape/{job_id}", get(get_job))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .merge(scrape)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(config: &GmbConfig) -> Result<()> {
    let app = build_router(AppState::from_config(config));
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    tracing::info!(
        worker = %config.worker.program,
        max_workers = ?config.worker.max_concurrent,
        auth = !config.api_keys.is_empty(),
        "gmb serve listening on http://{addr}"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("gmb serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Reject `/scrape*` requests without a configured API key, passed as the
/// `api_key` query parameter or the `x-api-key` header. No keys configured
/// means no check.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if state.api_keys.is_empty() {
        return Ok(next.run(request).await);
    }
    let from_query = Query::<ApiKeyParam>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(p)| p.api_key);
    let from_header = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match from_query.or(from_header) {
        Some(key) if state.api_keys.iter().any(|k| *k == key) => Ok(next.run(request).await),
        _ => {
            tracing::debug!(path = %request.uri().path(), "rejecting request without valid API key");
            Err(AppError::unauthorized())
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn new_job(registry: &JobRegistry) -> Result<Uuid, AppError> {
    let job_id = Uuid::new_v4();
    registry
        .create(job_id)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(job_id)
}

async fn scrape_stream(
    State(state): State<AppState>,
    query: Result<Query<ScrapeQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|e| AppError::bad_request(e.body_text()))?;
    query.validate()?;
    let job_id = new_job(&state.registry).await?;
    tracing::info!(job_id = %job_id, activity = %query.activity, city = %query.city, "stream job accepted");

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(run_stream_job(
        job_id,
        query,
        Arc::clone(&state.launcher),
        state.registry.clone(),
        state.stream,
        tx,
    ));

    let frames = ReceiverStream::new(rx)
        .map(|frame| Ok::<_, Infallible>(SseEvent::default().event(frame.event).data(frame.data)));
    let headers = [
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ];
    Ok((headers, Sse::new(frames)).into_response())
}

async fn scrape_sync(
    State(state): State<AppState>,
    body: Result<Json<ScrapeQuery>, JsonRejection>,
) -> Result<Json<ScrapeResponse>, AppError> {
    let Json(query) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    query.validate()?;
    let job_id = new_job(&state.registry).await?;
    tracing::info!(job_id = %job_id, activity = %query.activity, city = %query.city, "sync job accepted");

    // Launched and drained on its own task so the registry is updated even if
    // the client stops waiting, including while queued for a worker slot.
    let launcher = Arc::clone(&state.launcher);
    let registry = state.registry.clone();
    let echo = query.clone();
    let outcome = tokio::spawn(async move {
        let bridge = match launcher.launch(&echo).await {
            Ok(bridge) => bridge,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "failed to launch worker");
                if let Err(recorded) = registry.fail(job_id, e.to_string()).await {
                    tracing::warn!(job_id = %job_id, error = %recorded, "failed to record job failure");
                }
                return Err(e);
            }
        };
        let outcome = aggregate(bridge).await;
        record_outcome(&registry, job_id, &echo, &outcome).await;
        Ok(outcome)
    })
    .await
    .map_err(|e| AppError::internal(format!("scrape task failed: {e}")))??;

    if !outcome.is_success() {
        return Err(AppError::internal(outcome.failure_message()));
    }
    Ok(Json(ScrapeResponse {
        job_id,
        query,
        stats: outcome.stats,
        total_businesses: outcome.businesses.len(),
        businesses: outcome.businesses,
    }))
}

async fn scrape_webhook(
    State(state): State<AppState>,
    body: Result<Json<WebhookRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<WebhookAccepted>), AppError> {
    let Json(request) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    request.query.validate()?;
    let url = parse_webhook_url(&request.webhook_url).map_err(|e| AppError::bad_request(e.to_string()))?;
    let job_id = new_job(&state.registry).await?;
    tracing::info!(job_id = %job_id, url = %url, "webhook job accepted");

    tokio::spawn(run_webhook_job(
        job_id,
        request.query,
        url,
        Arc::clone(&state.launcher),
        state.registry.clone(),
        state.notifier.clone(),
    ));

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            job_id,
            message: "scrape started, results will be posted to the webhook".to_string(),
            webhook_url: request.webhook_url,
        }),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let not_found = || AppError::not_found(format!("job {job_id} not found"));
    let id = Uuid::parse_str(&job_id).map_err(|_| not_found())?;
    let job = state.registry.get(id).await.ok_or_else(not_found)?;
    Ok(Json(job).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
