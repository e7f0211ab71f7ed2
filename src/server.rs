//! HTTP interface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Ask a question; answers as a `text/event-stream` |
//! | `POST` | `/upload` | Multipart upload (field `file`), parsed and indexed |
//! | `GET`  | `/uploads` | Manifest of indexed uploads |
//! | `DELETE` | `/upload/{filename}` | Remove an upload from the index and storage |
//! | `GET`  | `/health` | Dependency availability and upload count |
//! | `POST` | `/reload` | Clear the data dictionary cache |
//!
//! # Query stream
//!
//! Each SSE message carries the event name (`routing`, `sql`, `token`,
//! `done`) and the JSON-encoded [`QueryEvent`]:
//!
//! ```text
//! event: routing
//! data: {"event":"routing","sources":["bigquery"],"query_type":"single_source",...}
//!
//! event: token
//! data: {"event":"token","token":"Current ARR is "}
//!
//! event: done
//! data: {"event":"done","done":true,"metadata":{"sources_used":["bigquery"],...}}
//! ```
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "file_too_large", "message": "File too large (21.0 MB). Max: 20 MB." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unsupported_type` (400),
//! `file_too_large` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser clients.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app::App;
use crate::models::{QueryEvent, SourceType, StorageLocation, UploadSummary};
use crate::pipeline::QueryRequest;
use crate::status::StatusReport;
use crate::uploads::{check_size, validate_upload, UploadError};

/// Build the router with every route and layer. Used by [`run_server`] and
/// by tests that drive the service without a socket.
pub fn build_router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Headroom over the upload limit so oversized files reach our own check
    // and get a descriptive error.
    let body_limit = (app.uploads.max_upload_mb() as usize + 1) * 1024 * 1024;

    Router::new()
        .route("/query", post(handle_query))
        .route("/upload", post(handle_upload))
        .route("/uploads", get(handle_list_uploads))
        .route("/upload/{filename}", delete(handle_delete_upload))
        .route("/health", get(handle_health))
        .route("/reload", post(handle_reload))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app)
}

/// Serve on `[server].bind` until the process is stopped.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let router = build_router(app);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, "listening");
    axum::serve(listener, router).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let (status, code) = match &err {
            UploadError::UnsupportedType { .. } => (StatusCode::BAD_REQUEST, "unsupported_type"),
            UploadError::FileTooLarge { .. } => (StatusCode::BAD_REQUEST, "file_too_large"),
            UploadError::InvalidFilename(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            UploadError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            UploadError::Storage { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ POST /query ============

async fn handle_query(
    State(app): State<Arc<App>>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    if request.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let events = app.pipeline.submit(request).map(sse_event);
    let sse = Sse::new(events).keep_alive(KeepAlive::default());

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response())
}

fn sse_event(event: QueryEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().event(event.name()).data(data))
}

// ============ POST /upload ============

#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    filename: String,
    source_type: SourceType,
    size_kb: f64,
    storage: StorageLocation,
    preview: String,
}

async fn handle_upload(
    State(app): State<Arc<App>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let max_mb = app.uploads.max_upload_mb();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("file field has no filename"))?;
        validate_upload(&filename, 0, max_mb)?;

        let mut content = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| bad_request(e.body_text()))?
        {
            content.extend_from_slice(&chunk);
            check_size(content.len(), max_mb)?;
        }

        let entry = app.uploads.upload(&filename, &content).await.map_err(|e| {
            warn!(filename = %filename, error = %e, "upload rejected");
            AppError::from(e)
        })?;

        return Ok(Json(UploadResponse {
            success: true,
            filename: entry.filename,
            source_type: entry.source_type,
            size_kb: entry.size_kb,
            storage: entry.storage,
            preview: entry.preview,
        }));
    }

    Err(bad_request("multipart field 'file' is required"))
}

// ============ GET /uploads ============

#[derive(Serialize)]
struct UploadListResponse {
    files: Vec<UploadSummary>,
    count: usize,
}

async fn handle_list_uploads(State(app): State<Arc<App>>) -> Json<UploadListResponse> {
    let files = app.uploads.manifest().await;
    Json(UploadListResponse {
        count: files.len(),
        files,
    })
}

// ============ DELETE /upload/{filename} ============

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    filename: String,
}

async fn handle_delete_upload(
    State(app): State<Arc<App>>,
    Path(filename): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    app.uploads.remove(&filename).await?;
    Ok(Json(DeleteResponse {
        success: true,
        filename,
    }))
}

// ============ GET /health ============

async fn handle_health(State(app): State<Arc<App>>) -> Json<StatusReport> {
    Json(app.status().await)
}

// ============ POST /reload ============

#[derive(Serialize)]
struct ReloadResponse {
    status: &'static str,
}

async fn handle_reload(State(app): State<Arc<App>>) -> Json<ReloadResponse> {
    app.dictionary.clear().await;
    Json(ReloadResponse {
        status: "source cache cleared",
    })
}
