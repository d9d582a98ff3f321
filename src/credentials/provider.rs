//! OAuth token endpoint client.
//!
//! Handles the authorization-code exchange and the refresh-token grant. The
//! response shape is provider-defined; only `access_token` is required.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Tokens returned by a successful grant.
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present on exchange, and on refresh when the provider rotates it.
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Why a grant failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused the grant (`invalid_grant` or equivalent).
    /// Retrying with the same refresh token cannot succeed.
    #[error("grant rejected by provider: {0}")]
    Rejected(String),

    /// Network failure, timeout, throttling or 5xx.
    #[error("token endpoint unavailable: {0}")]
    Transient(String),
}

/// External token endpoint.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Exchanges a one-time authorization code for the first token pair.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, ProviderError>;

    /// Uses a refresh token to obtain a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError>;
}

/// OAuth client registration for the secondary backend.
#[derive(Clone)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl OAuthClientConfig {
    /// Reads client id and secret from `DOCSTORE_SECONDARY_CLIENT_ID` /
    /// `DOCSTORE_SECONDARY_CLIENT_SECRET`. Missing values become empty strings;
    /// public clients do not need a secret.
    pub fn from_env(token_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: std::env::var("DOCSTORE_SECONDARY_CLIENT_ID").unwrap_or_default(),
            client_secret: std::env::var("DOCSTORE_SECONDARY_CLIENT_SECRET").unwrap_or_default(),
        }
    }
}

impl fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth error response body
#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Token endpoint client over HTTPS.
pub struct HttpTokenProvider {
    config: OAuthClientConfig,
    http_client: reqwest::Client,
}

impl HttpTokenProvider {
    pub fn new(config: OAuthClientConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transient(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    async fn request_grant(&self, mut form: HashMap<&str, String>) -> Result<TokenGrant, ProviderError> {
        if !self.config.client_id.is_empty() {
            form.insert("client_id", self.config.client_id.clone());
        }
        if !self.config.client_secret.is_empty() {
            form.insert("client_secret", self.config.client_secret.clone());
        }

        let response = self
            .http_client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("failed to reach token endpoint: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), &body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("failed to parse token response: {}", e)))?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token grant successful"
        );

        Ok(TokenGrant {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_in: token_response.expires_in,
            scope: token_response.scope,
        })
    }
}

/// Maps a non-2xx token endpoint response to a provider error.
///
/// 400/401/403 mean the grant itself was refused; everything else may clear up.
fn classify_failure(status: u16, body: &str) -> ProviderError {
    let reason = match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => match err.error_description {
            Some(description) => format!("{} ({})", err.error, description),
            None => err.error,
        },
        Err(_) => format!("status {}", status),
    };

    match status {
        400 | 401 | 403 => ProviderError::Rejected(reason),
        _ => ProviderError::Transient(reason),
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, ProviderError> {
        debug!(token_url = %self.config.token_url, "Exchanging authorization code for token");

        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code".to_string());
        form.insert("code", code.to_string());
        form.insert("redirect_uri", redirect_uri.to_string());

        self.request_grant(form).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        debug!(token_url = %self.config.token_url, "Refreshing access token");

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token".to_string());
        form.insert("refresh_token", refresh_token.to_string());

        self.request_grant(form).await
    }
}
