//! Axum REST API handlers

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
    extract::{Path, State, Multipart, Query, DefaultBodyLimit},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::TraceLayer;
use tower_http::services::ServeDir;
use tracing::{debug, error};

use crate::config::Config;
use crate::engine::ModelStatus;
use crate::error::DetectionError;
use crate::service::{
    BackgroundExecutor, BatchScheduler, DetectionService, NotificationBoard,
    CompletionMode, DetectOptions, DetectionResponse, RawImage, User,
};
use crate::storage::DetectionStore;

use super::dto::*;

/// Header carrying the caller's id; token verification happens upstream
pub const USER_ID_HEADER: &str = "x-user-id";

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Application state shared across handlers
pub struct AppState<S: DetectionStore> {
    pub service: Arc<DetectionService<S>>,
    pub batch: BatchScheduler<S>,
    pub executor: BackgroundExecutor,
    pub notifications: Arc<NotificationBoard>,
    pub model_status: Option<Arc<dyn ModelStatus>>,
}

/// Create the REST API router
pub fn create_rest_router<S: DetectionStore>(state: Arc<AppState<S>>, config: &Config) -> Router {
    let mut router = Router::new()
        // Detection
        .route("/api/v1/detect", post(detect_handler::<S>))
        .route("/api/v1/detect/batch", post(batch_detect_handler::<S>))
        // History
        .route("/api/v1/history", get(history_handler::<S>))
        .route(
            "/api/v1/history/:detection_id",
            get(history_detail_handler::<S>).delete(delete_history_handler::<S>),
        )
        .route("/api/v1/notifications/:detection_id", get(notification_handler::<S>))
        // System endpoints
        .route("/health", get(health_handler::<S>))
        .route("/api/v1/health", get(health_handler::<S>))
        .route("/metrics", get(metrics_handler::<S>));

    // Uploaded originals, when served from this process
    let public_base = config.upload.public_base.trim_end_matches('/');
    if public_base.starts_with('/') && public_base.len() > 1 {
        router = router.nest_service(public_base, ServeDir::new(&config.upload.dir));
    }

    router
        .layer(DefaultBodyLimit::max(config.body_limit_bytes()))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Caller identity from the `x-user-id` header
///
/// Missing header: a fresh guest. Ids starting with `guest_` are guests too.
pub fn caller_from_headers(headers: &HeaderMap) -> User {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match user_id {
        Some(id) if id.starts_with(User::GUEST_PREFIX) => User::guest(id),
        Some(id) => User::registered(id),
        None => User::anonymous(),
    }
}

fn detection_error(e: DetectionError) -> ApiError {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        error!("Detection failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(ErrorResponse::new(&e.to_string(), e.code())))
}

fn storage_error(e: anyhow::Error, code: &str) -> ApiError {
    error!("Storage request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse::new(&e.to_string(), code)))
}

fn not_found() -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new("Detection not found", "NOT_FOUND")))
}

/// Collect every file part whose field name is in `accepted`
async fn read_images(multipart: &mut Multipart, accepted: &[&str]) -> Result<Vec<RawImage>, ApiError> {
    let mut images = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string(), "MULTIPART_ERROR")))
    })? {
        let name = field.name().unwrap_or("").to_string();
        if !accepted.contains(&name.as_str()) {
            debug!("Ignoring multipart field '{}'", name);
            continue;
        }

        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string(), "READ_ERROR")))
        })?;

        images.push(RawImage::upload(filename, content_type, data));
    }

    Ok(images)
}

/// Detect emotions in one uploaded image
async fn detect_handler<S: DetectionStore>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<DetectQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<DetectionResponse>, ApiError> {
    let user = caller_from_headers(&headers);

    let image = read_images(&mut multipart, &["file", "image"])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse::new("Missing file field", "MISSING_FILE")))
        })?;

    let options = if query.background {
        DetectOptions::background()
    } else {
        DetectOptions::default()
    };

    let outcome = state
        .service
        .detect(&image, &user, options)
        .await
        .map_err(detection_error)?;

    if let Some(task) = outcome.task {
        state.executor.submit(task);
    }

    Ok(Json(outcome.response))
}

/// Detect emotions in several uploaded images
async fn batch_detect_handler<S: DetectionStore>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<DetectQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<BatchResponse>, ApiError> {
    let user = caller_from_headers(&headers);

    let files = read_images(&mut multipart, &["files", "file"]).await?;
    if files.is_empty() {
        return Err((StatusCode::BAD_REQUEST, Json(ErrorResponse::new("No files uploaded", "MISSING_FILE"))));
    }

    let completion = if query.background {
        CompletionMode::Background
    } else {
        CompletionMode::Synchronous
    };

    let outcome = state
        .batch
        .run_batch(files, &user, completion)
        .await
        .map_err(detection_error)?;

    state.executor.submit_all(outcome.background_tasks);

    Ok(Json(BatchResponse::new(outcome.results)))
}

/// List the caller's detections, newest first
async fn history_handler<S: DetectionStore>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<DetectionResponse>>, ApiError> {
    let user = caller_from_headers(&headers);
    if user.is_guest {
        return Ok(Json(Vec::new()));
    }

    let detections = state
        .service
        .storage()
        .list_detections(&user.user_id, query.skip(), query.limit())
        .await
        .map_err(|e| storage_error(e, "HISTORY_FAILED"))?;

    Ok(Json(detections))
}

async fn history_detail_handler<S: DetectionStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(detection_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DetectionResponse>, ApiError> {
    let user = caller_from_headers(&headers);
    if user.is_guest {
        return Err(not_found());
    }

    let detection = state
        .service
        .storage()
        .get_detection(&detection_id)
        .await
        .map_err(|e| storage_error(e, "HISTORY_FAILED"))?;

    match detection {
        Some(d) if d.user_id == user.user_id => Ok(Json(d)),
        _ => Err(not_found()),
    }
}

async fn delete_history_handler<S: DetectionStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(detection_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user = caller_from_headers(&headers);
    if user.is_guest {
        return Err(not_found());
    }

    let deleted = state
        .service
        .storage()
        .delete_detection(&detection_id, &user.user_id)
        .await
        .map_err(|e| storage_error(e, "DELETE_FAILED"))?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found())
    }
}

/// Background completion status for a detection
async fn notification_handler<S: DetectionStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(detection_id): Path<String>,
) -> Json<NotificationResponse> {
    let status = state.notifications.status(&detection_id);
    Json(NotificationResponse { detection_id, status })
}

async fn health_handler<S: DetectionStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    let models_loaded = state
        .model_status
        .as_ref()
        .map(|m| m.loaded_models())
        .unwrap_or_default();

    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        models_loaded,
    })
}

async fn metrics_handler<S: DetectionStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<MetricsResponse> {
    let snapshot = state.service.metrics().snapshot();
    let stored_detections = state.service.storage().count_detections().await.unwrap_or(0);

    Json(MetricsResponse {
        face_detection_accuracy: snapshot.face_detection_accuracy,
        detection_requests_total: snapshot.detection_requests_total,
        degraded_inferences_total: snapshot.degraded_inferences_total,
        faces_detected_total: snapshot.faces_detected_total,
        stored_detections,
        pending_notifications: state.notifications.len(),
        uptime_seconds: snapshot.uptime_seconds,
    })
}
