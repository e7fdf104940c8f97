//! HTTP routes: streamed multi-file upload, progress polling and health.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{future, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::coordinator::{Coordinator, UploadedFile};
use crate::error::ApiError;
use crate::models::{FileProgress, ProgressEvent};

/// Multipart field name the upload form uses for each file.
pub const FILE_FIELD: &str = "file";

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

pub struct AppState {
    pub coordinator: Coordinator,
}

pub fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/healthz", get(healthz))
        .route("/api/grades/upload", post(upload_grades))
        .route("/api/grades/progress", get(processing_progress))
        .route("/api/grades/progress/:file_id", get(file_progress))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "OK"
}

async fn processing_progress(State(state): State<Arc<AppState>>) -> Json<Vec<FileProgress>> {
    Json(state.coordinator.registry().snapshot())
}

async fn file_progress(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<FileProgress>, ApiError> {
    state
        .coordinator
        .registry()
        .get(file_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no upload tracked with id {file_id}")))
}

/// `POST /api/grades/upload`
///
/// Buffers every file part, then streams one JSON line per progress event
/// until all files are completed or failed.
async fn upload_grades(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let file_name = field.file_name().map(str::to_owned);
        if field.name() != Some(FILE_FIELD) && file_name.is_none() {
            continue;
        }
        let name = file_name.unwrap_or_else(|| format!("upload-{}", files.len()));
        let contents = field.bytes().await?;
        files.push(UploadedFile { name, contents });
    }

    if files.is_empty() {
        return Err(ApiError::BadRequest("No file provided".to_string()));
    }

    info!(
        files = files.len(),
        bytes = files.iter().map(|f| f.contents.len()).sum::<usize>(),
        "grades upload accepted"
    );

    let lines = state
        .coordinator
        .ingest_all(files)
        .filter(|event| future::ready(event.is_streamed_to_uploader()))
        .map(|event| encode_line(&event));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .header("x-accel-buffering", HeaderValue::from_static("no"))
        .body(Body::from_stream(lines))
        .map_err(|err| ApiError::Internal(err.to_string()))
}

fn encode_line(event: &ProgressEvent) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}
