//! Encrypted OAuth credentials for the secondary backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialManager                  │
//! │  - Serves access tokens                  │
//! │  - Single-flight refresh per credential  │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - One sealed row per credential         │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//! ┌─────────────────────────────────────────┐
//! │       EncryptionService                  │
//! │  - AES-256-GCM, fresh nonce per seal     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Access and refresh tokens are sealed together in one envelope
//! - The envelope is bound to its `credential_id` (rows cannot be swapped)
//! - Tampered rows surface as `Error::Integrity`, never as "not found"
//! - Master key is held in memory only (from env var)

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod manager;
mod provider;
mod storage;

pub use encryption::{EncryptionEnvelope, EncryptionService, ENCRYPTION_KEY_ENV, KEY_SIZE};
pub use manager::CredentialManager;
pub use provider::{HttpTokenProvider, OAuthClientConfig, ProviderError, TokenGrant, TokenProvider};
pub use storage::CredentialStore;

/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// One external account's OAuth grant.
///
/// Tokens are plaintext only in memory. `Debug` never prints them.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub credential_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scope: Vec<String>,
}

impl Credential {
    /// True once `now` has entered the refresh buffer before expiry.
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now >= self.expires_at - buffer
    }

    /// Scopes in OAuth wire form (space separated).
    pub fn scope_string(&self) -> String {
        self.scope.join(" ")
    }

    /// Parses an OAuth scope string.
    pub fn parse_scope(scope: &str) -> Vec<String> {
        scope.split_whitespace().map(str::to_string).collect()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("credential_id", &self.credential_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// The sealed part of a credential row.
#[derive(Serialize, Deserialize)]
struct SecretPayload {
    access_token: String,
    refresh_token: String,
}

/// Observable lifecycle state of a credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    /// Not yet read from the store in this process.
    Unloaded,
    /// Cached token is outside the refresh buffer.
    Valid,
    /// Cached token is inside the refresh buffer; the next request refreshes.
    Expiring,
    /// A refresh call is in flight.
    Refreshing,
    /// The provider rejected the refresh token; reconnect required.
    Failed,
}

/// Non-secret view of a credential for operators and API responses.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialSummary {
    pub credential_id: String,
    pub state: CredentialState,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Vec<String>,
}
