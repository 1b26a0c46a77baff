use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path, State,
        multipart::{Field, MultipartError},
    },
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use ferry_transfer::{
    Backend, CancellationToken, ChunkAck, TransferError, TransferRecord, TransferService,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: TransferService<Backend>,
    /// Prefix for the `downloadURL` handed back to uploaders.
    pub base_url: Arc<str>,
    /// Where whole-file uploads are spooled before chunking.
    pub upload_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(service: TransferService<Backend>, base_url: &str, upload_dir: PathBuf) -> Self {
        Self {
            service,
            base_url: base_url.into(),
            upload_dir: Arc::new(upload_dir),
        }
    }

    fn download_url(&self, transfer_id: &str) -> String {
        format!("{}/download/{}", self.base_url, transfer_id)
    }
}

/// Full application router with CORS, tracing and the body limit applied.
pub fn app(state: AppState, max_body_bytes: usize) -> Router {
    // Permissive: browsers upload from arbitrary origins.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_LENGTH])
        .allow_credentials(false)
        .max_age(Duration::from_secs(12 * 60 * 60));

    Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/upload/chunk", post(upload_chunk))
        .route("/upload/complete", post(complete_upload))
        .route("/download/{file_id}", get(download))
        .route("/transfers/{id}", get(transfer_status))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Handler error, rendered as `{"error", "details"}` JSON.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Transfer(TransferError),
    Internal {
        error: &'static str,
        details: String,
    },
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        Self::Transfer(e)
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::BadRequest(format!("malformed multipart body: {}", e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            Self::BadRequest(error) => (StatusCode::BAD_REQUEST, error, None),
            Self::NotFound(error) => (StatusCode::NOT_FOUND, error, None),
            Self::Internal { error, details } => {
                (StatusCode::INTERNAL_SERVER_ERROR, error.to_string(), Some(details))
            }
            Self::Transfer(e) => {
                let (status, error) = match &e {
                    TransferError::InvalidTransferId(_) => {
                        (StatusCode::BAD_REQUEST, "invalid fileID")
                    }
                    TransferError::TooManyChunks { .. } => {
                        (StatusCode::BAD_REQUEST, "too many chunks")
                    }
                    TransferError::ManifestNotFound { .. } => {
                        (StatusCode::NOT_FOUND, "failed to fetch manifest")
                    }
                    TransferError::ChunkUpload { .. } => {
                        (StatusCode::BAD_GATEWAY, "failed to upload to object store")
                    }
                    TransferError::ManifestWrite(_) => {
                        (StatusCode::BAD_GATEWAY, "failed to write manifest")
                    }
                    TransferError::ChunksUnavailable { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "chunks unavailable")
                    }
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "transfer failed"),
                };
                (status, error.to_string(), Some(e.to_string()))
            }
        };

        if status.is_server_error() {
            warn!(status = status.as_u16(), "{}: {}", error, details.as_deref().unwrap_or(""));
        }
        (status, Json(ErrorBody { error, details })).into_response()
    }
}

// ── Request/response types ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(rename = "fileID")]
    pub file_id: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteUploadRequest {
    #[serde(rename = "fileID")]
    pub file_id: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u64,
}

#[derive(Debug, Serialize)]
pub struct CompleteUploadResponse {
    pub message: &'static str,
    #[serde(rename = "fileID")]
    pub file_id: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u64,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
}

// ── Handlers ────────────────────────────────────────────────────────────

/// GET /ping
pub async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "pong" }))
}

/// GET /health: liveness check.
pub async fn health() -> &'static str {
    "ok"
}

/// POST /upload: whole-file upload.
///
/// The `file` field is spooled to disk and chunked into the store in the
/// background; the response only promises a transfer id. Poll
/// `/transfers/{id}` to learn whether it became downloadable.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let display_name = field.file_name().unwrap_or_default().to_string();
        let (spool, size) = spool_field(&state.upload_dir, field).await?;

        let file_id = state.service.begin_upload(spool, &display_name);
        info!(transfer_id = %file_id, size, "File spooled for upload");

        return Ok(Json(UploadResponse {
            download_url: state.download_url(&file_id),
            file_id,
        }));
    }

    Err(ApiError::BadRequest("file is required".into()))
}

/// POST /upload/chunk: store one chunk a client split itself.
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkAck>, ApiError> {
    let mut file_id = None;
    let mut chunk_no = None;
    let mut file_name = None;
    let mut chunk: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "fileID" => file_id = Some(field.text().await?),
            "chunkNo" => chunk_no = Some(field.text().await?),
            "fileName" => file_name = Some(field.text().await?),
            "chunk" => chunk = Some(field.bytes().await?),
            _ => {}
        }
    }

    let (Some(file_id), Some(chunk_no)) = (file_id, chunk_no) else {
        return Err(ApiError::BadRequest("fileID and chunkNo are required".into()));
    };
    let index: u64 = chunk_no
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest("chunkNo must be an integer".into()))?;
    let chunk = chunk.ok_or_else(|| ApiError::BadRequest("chunk file is required".into()))?;

    let ack = state
        .service
        .upload_chunk(&file_id, index, file_name.as_deref().unwrap_or_default(), chunk)
        .await?;
    Ok(Json(ack))
}

/// POST /upload/complete: publish the manifest for a client-chunked upload.
pub async fn complete_upload(
    State(state): State<AppState>,
    Json(req): Json<CompleteUploadRequest>,
) -> Result<Json<CompleteUploadResponse>, ApiError> {
    let manifest = state
        .service
        .complete_upload(&req.file_id, &req.file_name, req.total_chunks)
        .await?;

    Ok(Json(CompleteUploadResponse {
        message: "Upload completed",
        download_url: state.download_url(&manifest.transfer_id),
        file_id: manifest.transfer_id,
        file_name: manifest.file_name,
        total_chunks: manifest.total_chunks,
    }))
}

/// GET /download/{file_id}: reassemble and stream a transfer.
///
/// Nothing is sent until every chunk is staged; a transfer with a chunk that
/// never appears keeps this request open until the client goes away.
pub async fn download(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Response, ApiError> {
    let cancel = CancellationToken::new();
    // A client disconnect drops this future, which stops outstanding fetches.
    let _stop_on_drop = cancel.clone().drop_guard();

    let staged = state.service.download(&file_id, &cancel).await?;

    let disposition = format!("attachment; filename=\"{}\"", staged.manifest().file_name);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );

    info!(transfer_id = %file_id, "Streaming download");
    let body = Body::from_stream(staged.into_stream());
    Ok((StatusCode::OK, headers, body).into_response())
}

/// GET /transfers/{id}: progress of an upload accepted by this server.
pub async fn transfer_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TransferRecord>, ApiError> {
    state
        .service
        .status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("transfer {} not found", id)))
}

// ── Helpers ─────────────────────────────────────────────────────────────

/// Write a multipart field to a fresh file under `dir`. Returns its path and size.
async fn spool_field(dir: &FsPath, mut field: Field<'_>) -> Result<(PathBuf, u64), ApiError> {
    let internal = |error: &'static str| {
        move |e: std::io::Error| ApiError::Internal {
            error,
            details: e.to_string(),
        }
    };

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(internal("failed to create temp file"))?;
    let path = dir.join(format!("upload-{}.tmp", Uuid::new_v4().simple()));
    let mut out = tokio::fs::File::create(&path)
        .await
        .map_err(internal("failed to create temp file"))?;

    let mut size = 0u64;
    let written: Result<(), ApiError> = async {
        while let Some(bytes) = field.chunk().await? {
            size += bytes.len() as u64;
            out.write_all(&bytes)
                .await
                .map_err(internal("failed to save temp file"))?;
        }
        out.flush().await.map_err(internal("failed to save temp file"))
    }
    .await;

    if let Err(e) = written {
        drop(out);
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e);
    }
    Ok((path, size))
}
