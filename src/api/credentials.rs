//! OAuth credential bootstrap and status.
//!
//! The interactive consent redirect happens elsewhere; this endpoint only
//! receives the resulting authorization code and exchanges it.

use super::ApiError;
use crate::credentials::{CredentialManager, CredentialSummary};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Shared state for the credential API
#[derive(Clone)]
pub struct CredentialAppState {
    pub credentials: CredentialManager,
}

/// Authorization code returned by the provider's consent redirect
#[derive(Deserialize)]
pub struct ExchangeRequest {
    code: String,
    redirect_uri: String,
}

#[derive(Serialize)]
struct RevokeResponse {
    credential_id: String,
    revoked: bool,
}

/// Create credential API router
pub fn create_credential_router(state: CredentialAppState) -> Router {
    Router::new()
        .route(
            "/api/credentials/:credential_id",
            get(get_credential).delete(revoke_credential),
        )
        .route(
            "/api/credentials/:credential_id/exchange",
            post(exchange_code),
        )
        .with_state(Arc::new(state))
}

/// POST /api/credentials/:credential_id/exchange
///
/// A rejected code maps to 401 (reconnect required).
async fn exchange_code(
    State(state): State<Arc<CredentialAppState>>,
    Path(credential_id): Path<String>,
    Json(request): Json<ExchangeRequest>,
) -> Result<Json<CredentialSummary>, ApiError> {
    if request.code.trim().is_empty() {
        return Err(ApiError::BadRequest("code must not be empty".to_string()));
    }

    state
        .credentials
        .exchange(&credential_id, &request.code, &request.redirect_uri)
        .await?;

    info!(credential_id = %credential_id, "Credential connected via API");

    Ok(Json(state.credentials.summary(&credential_id)?))
}

/// GET /api/credentials/:credential_id
///
/// Lifecycle state, expiry and scope. Never includes token material.
async fn get_credential(
    State(state): State<Arc<CredentialAppState>>,
    Path(credential_id): Path<String>,
) -> Result<Json<CredentialSummary>, ApiError> {
    Ok(Json(state.credentials.summary(&credential_id)?))
}

/// DELETE /api/credentials/:credential_id
async fn revoke_credential(
    State(state): State<Arc<CredentialAppState>>,
    Path(credential_id): Path<String>,
) -> Result<Json<RevokeResponse>, ApiError> {
    let revoked = state.credentials.revoke(&credential_id)?;
    Ok(Json(RevokeResponse {
        credential_id,
        revoked,
    }))
}
