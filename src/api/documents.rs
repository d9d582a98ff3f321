//! Document upload, download, stat and delete by entity reference.

use super::ApiError;
use crate::documents::DocumentService;
use crate::storage::{ByteStream, ObjectStat, StoreHints, StoredFile, DEFAULT_CONTENT_TYPE};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Header carrying the original file name.
pub const FILE_NAME_HEADER: &str = "x-file-name";

/// Header carrying the hex SHA-256 recorded at upload.
pub const CHECKSUM_HEADER: &str = "x-content-sha256";

/// Shared state for the document API
#[derive(Clone)]
pub struct DocumentAppState {
    pub documents: DocumentService,
}

#[derive(Serialize)]
struct StatResponse {
    file: StoredFile,
    stat: ObjectStat,
}

#[derive(Serialize)]
struct DeleteResponse {
    entity_ref: String,
    deleted: bool,
}

/// Create document API router
pub fn create_document_router(state: DocumentAppState) -> Router {
    Router::new()
        .route(
            "/api/documents/:entity_ref",
            post(upload_document)
                .get(download_document)
                .delete(delete_document),
        )
        .route("/api/documents/:entity_ref/stat", get(stat_document))
        .layer(DefaultBodyLimit::disable())
        .with_state(Arc::new(state))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// POST /api/documents/:entity_ref
///
/// Streams the request body into storage. Size comes from `Content-Length`
/// (absent means the body is measured first), type from `Content-Type`.
///
/// The store runs in its own task. If the client goes away this handler is
/// dropped, its guard fires the cancellation token, and the task cleans up any
/// partial object before exiting.
async fn upload_document(
    State(state): State<Arc<DocumentAppState>>,
    Path(entity_ref): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<StoredFile>), ApiError> {
    let size_bytes = match header_str(&headers, CONTENT_LENGTH.as_str()) {
        Some(value) => Some(
            value
                .parse::<u64>()
                .map_err(|_| ApiError::BadRequest(format!("invalid Content-Length '{}'", value)))?,
        ),
        None => None,
    };
    let content_type = header_str(&headers, CONTENT_TYPE.as_str())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let hints = StoreHints {
        file_name: header_str(&headers, FILE_NAME_HEADER).map(str::to_string),
    };

    debug!(
        entity_ref = %entity_ref,
        size_bytes = ?size_bytes,
        content_type = %content_type,
        "Upload requested"
    );

    let stream: ByteStream = body
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        .boxed();

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let documents = state.documents.clone();

    let task = tokio::spawn(async move {
        documents
            .upload(&entity_ref, stream, size_bytes, &content_type, &hints, &cancel)
            .await
    });

    let stored = task
        .await
        .map_err(|e| ApiError::Internal(format!("upload task failed: {}", e)))??;
    guard.disarm();

    Ok((StatusCode::CREATED, Json(stored)))
}

/// GET /api/documents/:entity_ref
async fn download_document(
    State(state): State<Arc<DocumentAppState>>,
    Path(entity_ref): Path<String>,
) -> Result<Response, ApiError> {
    let cancel = CancellationToken::new();
    let (file, content) = state.documents.download(&entity_ref, &cancel).await?;

    Ok((
        [
            (CONTENT_TYPE.as_str(), file.content_type),
            (CHECKSUM_HEADER, file.checksum),
        ],
        Body::from_stream(content),
    )
        .into_response())
}

/// GET /api/documents/:entity_ref/stat
async fn stat_document(
    State(state): State<Arc<DocumentAppState>>,
    Path(entity_ref): Path<String>,
) -> Result<Json<StatResponse>, ApiError> {
    let cancel = CancellationToken::new();
    let (file, stat) = state.documents.stat(&entity_ref, &cancel).await?;
    Ok(Json(StatResponse { file, stat }))
}

/// DELETE /api/documents/:entity_ref
///
/// Idempotent: deleting an unknown entity reports `deleted: false`.
async fn delete_document(
    State(state): State<Arc<DocumentAppState>>,
    Path(entity_ref): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let cancel = CancellationToken::new();
    let deleted = state.documents.delete(&entity_ref, &cancel).await?;
    Ok(Json(DeleteResponse {
        entity_ref,
        deleted,
    }))
}
