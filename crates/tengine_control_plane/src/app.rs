use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tengine_engine::{
    DownloadRequest, EngineError, EngineEvent, EngineHandle, SyncRequest, UploadRequest,
};
use tengine_transfer::{TransferId, TransferStatus, UploadContent, INVALID_TRANSFER_ID};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
}

impl AppState {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

/// Body returned by every create route. A failed create still answers 200
/// with `transfer_id == -1`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedTransfer {
    pub transfer_id: TransferId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRequest {
    pub status: TransferStatus,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressRequest {
    pub progress: f64,
}

#[derive(Debug, Deserialize)]
struct UploadContentRequest {
    content: UploadContent,
    plugin_id: String,
    #[serde(default)]
    user_data: Map<String, Value>,
}

#[derive(Debug, Deserialize, Serialize)]
struct NotificationsBody {
    enabled: bool,
}

type ApiError = (StatusCode, Json<Value>);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/v1/transfers", get(list_transfers).delete(clear_transfers))
        .route("/v1/transfers/uploads", post(upload_media_item))
        .route("/v1/transfers/uploads/content", post(upload_content))
        .route("/v1/transfers/downloads", post(create_download))
        .route("/v1/transfers/syncs", post(create_sync))
        .route("/v1/transfers/{transfer_id}/start", post(start_transfer))
        .route("/v1/transfers/{transfer_id}/restart", post(restart_transfer))
        .route("/v1/transfers/{transfer_id}/cancel", post(cancel_transfer))
        .route("/v1/transfers/{transfer_id}/finish", post(finish_transfer))
        .route("/v1/transfers/{transfer_id}/progress", post(update_progress))
        .route("/v1/transfer-methods", get(transfer_methods))
        .route(
            "/v1/notifications",
            get(notifications_enabled).put(enable_notifications),
        )
        .route("/v1/events/stream", get(stream_events))
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.engine.is_running();
    let payload = Json(json!({
        "status": if ready { "ready" } else { "stopped" },
        "timestamp": Utc::now().to_rfc3339()
    }));

    if ready {
        (StatusCode::OK, payload).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, payload).into_response()
    }
}

async fn upload_media_item(
    State(state): State<AppState>,
    Json(payload): Json<UploadRequest>,
) -> Json<CreatedTransfer> {
    created("upload", state.engine.upload_media_item(payload).await)
}

async fn upload_content(
    State(state): State<AppState>,
    Json(payload): Json<UploadContentRequest>,
) -> Json<CreatedTransfer> {
    let result = state
        .engine
        .upload_content(payload.content, payload.plugin_id, payload.user_data)
        .await;
    created("upload content", result)
}

async fn create_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Json<CreatedTransfer> {
    created("download", state.engine.create_download(payload).await)
}

async fn create_sync(
    State(state): State<AppState>,
    Json(payload): Json<SyncRequest>,
) -> Json<CreatedTransfer> {
    created("sync", state.engine.create_sync(payload).await)
}

async fn start_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<TransferId>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .start_transfer(transfer_id)
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<TransferId>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .restart_transfer(transfer_id)
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<TransferId>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .cancel_transfer(transfer_id)
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn finish_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<TransferId>,
    Json(payload): Json<FinishRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .finish_transfer(transfer_id, payload.status, payload.reason)
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_progress(
    State(state): State<AppState>,
    Path(transfer_id): Path<TransferId>,
    Json(payload): Json<ProgressRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .update_transfer_progress(transfer_id, payload.progress)
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_transfers(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let transfers = state.engine.transfers().await.map_err(engine_error)?;
    Ok(Json(json!({ "items": transfers })))
}

async fn clear_transfers(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let removed = state.engine.clear_transfers().await.map_err(engine_error)?;
    Ok(Json(json!({ "removed": removed })))
}

async fn transfer_methods(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let methods = state.engine.transfer_methods().await.map_err(engine_error)?;
    Ok(Json(json!({ "items": methods })))
}

async fn notifications_enabled(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let enabled = state
        .engine
        .notifications_enabled()
        .await
        .map_err(engine_error)?;
    Ok(Json(NotificationsBody { enabled }))
}

async fn enable_notifications(
    State(state): State<AppState>,
    Json(payload): Json<NotificationsBody>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .enable_notifications(payload.enabled)
        .await
        .map_err(engine_error)?;
    Ok(Json(payload))
}

async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.engine.subscribe();
    let engine = state.engine.clone();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(event_name(&event)).data(data)))
            }
            Err(err) => {
                warn!(error = %err, "event stream subscriber lagged");
                None
            }
        }
    });
    // the engine keeps the event bus open, so end the stream when it stops
    let stream = stream.take_until(async move { engine.closed().await });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

fn event_name(event: &EngineEvent) -> &'static str {
    match event {
        EngineEvent::ProgressChanged { .. } => "progress_changed",
        EngineEvent::StatusChanged { .. } => "status_changed",
        EngineEvent::TransfersChanged => "transfers_changed",
        EngineEvent::TransferMethodListChanged => "transfer_method_list_changed",
    }
}

fn created(kind: &str, result: Result<TransferId, EngineError>) -> Json<CreatedTransfer> {
    let transfer_id = match result {
        Ok(transfer_id) => transfer_id,
        Err(err) => {
            warn!(kind, error = %err, "transfer creation failed");
            INVALID_TRANSFER_ID
        }
    };
    Json(CreatedTransfer { transfer_id })
}

fn engine_error(err: EngineError) -> ApiError {
    let (status, code) = match &err {
        EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "transfer_not_found"),
        EngineError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
        EngineError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        EngineError::CallbackUnavailable { .. } => (StatusCode::BAD_GATEWAY, "callback_unavailable"),
        EngineError::PluginUnavailable(_) | EngineError::Plugin(_) | EngineError::Capability(_) => {
            (StatusCode::BAD_GATEWAY, "plugin_failure")
        }
        EngineError::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "engine_stopped"),
        EngineError::Storage(_) => {
            error!(error = %err, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    };
    (
        status,
        Json(json!({ "error": code, "detail": err.to_string() })),
    )
}
