// HTTP surface over the document service and credential manager

pub mod credentials;
pub mod documents;
mod error;

pub use credentials::{create_credential_router, CredentialAppState};
pub use documents::{create_document_router, DocumentAppState};
pub use error::ApiError;

use crate::credentials::CredentialManager;
use crate::documents::DocumentService;
use axum::Router;
use tower_http::trace::TraceLayer;

/// All routes, with request tracing.
pub fn create_app(documents: DocumentService, credentials: CredentialManager) -> Router {
    Router::new()
        .merge(create_document_router(DocumentAppState { documents }))
        .merge(create_credential_router(CredentialAppState { credentials }))
        .layer(TraceLayer::new_for_http())
}
