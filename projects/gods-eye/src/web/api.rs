use crate::error::EnrollmentError;
use crate::event_log::EventLog;
use crate::face_registry::{validate_name, IdentityRegistry};
use crate::pipeline::broadcaster::{Broadcaster, MULTIPART_BOUNDARY};
use crate::pipeline::types::{DetectionEvent, PipelineState, PipelineStatus};
use crate::web::error::{ApiError, ApiResult};
use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything the handlers read. The pipeline thread is the only writer of
/// `pipeline` and `broadcaster`.
pub struct AppState {
    pub pipeline: Arc<PipelineState>,
    pub broadcaster: Arc<Broadcaster>,
    pub events: Arc<EventLog>,
    pub registry: Arc<IdentityRegistry>,
    pub default_log_limit: usize,
}

#[derive(Serialize)]
pub struct Health {
    pub system: &'static str,
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub data: PipelineStatus,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct LogsResponse {
    pub status: &'static str,
    pub count: usize,
    pub logs: Vec<DetectionEvent>,
}

#[derive(Serialize)]
pub struct FacesResponse {
    pub faces: Vec<String>,
}

#[derive(Serialize)]
pub struct EnrolledFace {
    pub name: String,
}

#[derive(Serialize)]
pub struct RemovedFace {
    pub removed: bool,
}

pub async fn health() -> Json<Health> {
    Json(Health {
        system: "GODS_EYE",
        status: "ONLINE",
        message: "Tactical Surveillance System Active",
    })
}

pub async fn get_status(State(app): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "success",
        data: app.pipeline.status(),
    })
}

pub async fn get_logs(
    State(app): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<LogsResponse> {
    let logs = app.events.recent(query.limit.unwrap_or(app.default_log_limit));
    Json(LogsResponse {
        status: "success",
        count: logs.len(),
        logs,
    })
}

pub async fn list_faces(State(app): State<Arc<AppState>>) -> Json<FacesResponse> {
    Json(FacesResponse {
        faces: app.registry.list(),
    })
}

/// Enroll the uploaded `file` field, named after its file stem.
pub async fn enroll_face(
    State(app): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<EnrolledFace>)> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request("uploaded file has no file name"))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        upload = Some((file_name, data));
        break;
    }
    let (file_name, data) =
        upload.ok_or_else(|| ApiError::bad_request("missing multipart field `file`"))?;

    let stem = std::path::Path::new(&file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let name = validate_name(stem)?;

    let registry = app.registry.clone();
    let enrolled = tokio::task::spawn_blocking(move || -> Result<String, EnrollmentError> {
        let image = image::load_from_memory(&data)
            .map_err(|e| EnrollmentError::UndecodableImage(e.to_string()))?
            .to_rgb8();
        registry.enroll(&name, &image)?;
        Ok(name)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(EnrolledFace { name: enrolled })))
}

pub async fn remove_face(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<RemovedFace>> {
    let registry = app.registry.clone();
    let removed = tokio::task::spawn_blocking(move || registry.remove(&name))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(Json(RemovedFace { removed }))
}

/// Live annotated stream; one part per frame published after the client attached.
pub async fn video_feed(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let subscription = app.broadcaster.subscribe();
    let content_type = format!("multipart/x-mixed-replace; boundary={}", MULTIPART_BOUNDARY);
    let body = Body::from_stream(subscription.into_multipart_stream());

    let mut response = Response::new(body);
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
}
