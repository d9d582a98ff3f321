//! Credential lifecycle: exchange, cached access tokens, single-flight refresh.
//!
//! Each credential id owns a slot holding the cached credential and a phase:
//!
//! ```text
//!   Idle(valid) ──expiring──▶ Refreshing ──ok──────▶ Idle(valid)
//!                                 │
//!                                 ├──transient──▶ Idle (next call retries)
//!                                 └──rejected───▶ Failed (until exchange)
//! ```
//!
//! The refresh itself runs in a spawned task and publishes its outcome on a
//! watch channel. Every caller that arrives while it runs awaits the same
//! channel, so a credential sees at most one refresh call at a time, and a
//! caller that gives up waiting never cancels the refresh for the others.

use super::{
    Credential, CredentialState, CredentialStore, CredentialSummary, ProviderError, TokenProvider,
    DEFAULT_TOKEN_LIFETIME_SECS,
};
use crate::error::{Error, Result};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest token lifetime accepted from the provider.
const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

/// Attempts at writing a refreshed credential before serving it unpersisted.
const PERSIST_ATTEMPTS: u32 = 3;

/// Lifetime of a freshly issued token, clamped to a sane range.
fn token_lifetime(expires_in: Option<i64>) -> Duration {
    let secs = expires_in
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
        .clamp(0, MAX_TOKEN_LIFETIME_SECS);
    Duration::try_seconds(secs).unwrap_or_else(Duration::zero)
}

/// Result of one refresh, shared by every waiter.
#[derive(Clone)]
enum RefreshOutcome {
    Ready(Credential),
    Rejected,
    Missing,
    Integrity(String),
    Transient(String),
}

impl RefreshOutcome {
    fn into_token(self, credential_id: &str) -> Result<String> {
        match self {
            RefreshOutcome::Ready(credential) => Ok(credential.access_token),
            RefreshOutcome::Rejected => Err(Error::AuthExpired {
                credential_id: credential_id.to_string(),
            }),
            RefreshOutcome::Missing => Err(Error::CredentialNotFound(credential_id.to_string())),
            RefreshOutcome::Integrity(reason) => Err(Error::Integrity(reason)),
            RefreshOutcome::Transient(reason) => Err(Error::TransientBackend(reason)),
        }
    }
}

type OutcomeReceiver = watch::Receiver<Option<RefreshOutcome>>;

/// What a refresh task starts from.
struct RefreshRequest {
    cached: Option<Credential>,
    rejected: Option<String>,
    generation: u64,
}

enum Phase {
    Idle,
    Refreshing(OutcomeReceiver),
    Failed,
}

struct SlotState {
    credential: Option<Credential>,
    phase: Phase,
    /// Bumped by exchange/revoke so a refresh started earlier cannot
    /// overwrite the newer credential when it completes.
    generation: u64,
}

struct Slot {
    state: Mutex<SlotState>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState {
                credential: None,
                phase: Phase::Idle,
                generation: 0,
            }),
        }
    }
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ManagerInner {
    store: Arc<CredentialStore>,
    provider: Arc<dyn TokenProvider>,
    refresh_buffer: Duration,
    slots: DashMap<String, Arc<Slot>>,
}

/// Serves valid access tokens for the secondary backend.
///
/// The only component that reads or writes token fields. Cheap to clone; all
/// clones share the same per-credential state.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<ManagerInner>,
}

impl CredentialManager {
    /// Creates a manager.
    ///
    /// # Arguments
    /// * `store` - Encrypted persistence for credential rows
    /// * `provider` - External token endpoint
    /// * `refresh_buffer` - How long before expiry a token stops being served
    pub fn new(
        store: Arc<CredentialStore>,
        provider: Arc<dyn TokenProvider>,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                provider,
                refresh_buffer,
                slots: DashMap::new(),
            }),
        }
    }

    fn slot(&self, credential_id: &str) -> Arc<Slot> {
        self.inner
            .slots
            .entry(credential_id.to_string())
            .or_default()
            .clone()
    }

    /// Returns an access token valid for at least the refresh buffer.
    ///
    /// No network call while the cached token is outside the buffer. Inside it,
    /// the first caller starts a refresh and every concurrent caller awaits the
    /// same result.
    ///
    /// # Errors
    /// * `Error::AuthExpired` - provider rejected the refresh token (terminal)
    /// * `Error::CredentialNotFound` - nothing stored for this id
    /// * `Error::Integrity` - stored envelope failed authentication
    /// * `Error::TransientBackend` - token endpoint unavailable
    pub async fn get_access_token(&self, credential_id: &str) -> Result<String> {
        self.acquire(credential_id, None).await
    }

    /// Replaces a token the backend rejected even though it looked valid.
    ///
    /// If another caller already replaced `rejected_token`, returns the
    /// replacement without contacting the provider again.
    pub async fn force_refresh(&self, credential_id: &str, rejected_token: &str) -> Result<String> {
        self.acquire(credential_id, Some(rejected_token)).await
    }

    async fn acquire(&self, credential_id: &str, rejected: Option<&str>) -> Result<String> {
        let slot = self.slot(credential_id);

        let mut rx = {
            let mut state = slot.lock();

            let in_flight = match &state.phase {
                Phase::Failed => {
                    return Err(Error::AuthExpired {
                        credential_id: credential_id.to_string(),
                    })
                }
                Phase::Refreshing(rx) => Some(rx.clone()),
                Phase::Idle => None,
            };

            match in_flight {
                Some(rx) => {
                    debug!(credential_id = %credential_id, "Awaiting in-flight token refresh");
                    rx
                }
                None => {
                    if let Some(credential) = &state.credential {
                        let usable = match rejected {
                            Some(token) => token != credential.access_token,
                            None => !credential.needs_refresh(Utc::now(), self.inner.refresh_buffer),
                        };
                        if usable {
                            return Ok(credential.access_token.clone());
                        }
                    }

                    let (tx, rx) = watch::channel(None);
                    state.phase = Phase::Refreshing(rx.clone());
                    let generation = state.generation;

                    tokio::spawn(self.clone().run_refresh(
                        credential_id.to_string(),
                        Arc::clone(&slot),
                        tx,
                        RefreshRequest {
                            cached: state.credential.clone(),
                            rejected: rejected.map(str::to_string),
                            generation,
                        },
                    ));
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| (*value).clone());

        match outcome {
            Some(outcome) => outcome.into_token(credential_id),
            None => {
                // The refresh task ended without publishing; unblock the slot.
                let mut state = slot.lock();
                let dead = matches!(&state.phase, Phase::Refreshing(current) if current.has_changed().is_err());
                if dead {
                    state.phase = Phase::Idle;
                }
                Err(Error::TransientBackend(
                    "token refresh ended without a result".to_string(),
                ))
            }
        }
    }

    async fn run_refresh(
        self,
        credential_id: String,
        slot: Arc<Slot>,
        tx: watch::Sender<Option<RefreshOutcome>>,
        request: RefreshRequest,
    ) {
        let outcome = self
            .load_or_refresh(&credential_id, request.cached, request.rejected.as_deref())
            .await;

        {
            let mut state = slot.lock();
            if state.generation == request.generation {
                let (credential, phase) = match &outcome {
                    RefreshOutcome::Ready(credential) => (Some(credential.clone()), Phase::Idle),
                    RefreshOutcome::Rejected => (None, Phase::Failed),
                    RefreshOutcome::Missing => (None, Phase::Idle),
                    RefreshOutcome::Integrity(_) | RefreshOutcome::Transient(_) => {
                        (state.credential.take(), Phase::Idle)
                    }
                };
                state.credential = credential;
                state.phase = phase;
            } else {
                // Superseded by exchange or revoke; keep their credential.
                state.phase = Phase::Idle;
            }
        }

        // Every waiter may have given up; nobody listening is fine.
        let _ = tx.send(Some(outcome));
    }

    /// Refreshes from the cached credential when this process holds one, and
    /// from the stored row otherwise.
    ///
    /// The cached copy is authoritative once loaded: it carries any rotated
    /// refresh token even if persisting that token failed.
    async fn load_or_refresh(
        &self,
        credential_id: &str,
        cached: Option<Credential>,
        rejected: Option<&str>,
    ) -> RefreshOutcome {
        let loaded = match cached {
            Some(credential) => Ok(Some(credential)),
            None => self.inner.store.get(credential_id),
        };
        let stored = match loaded {
            Ok(Some(credential)) => credential,
            Ok(None) => return RefreshOutcome::Missing,
            Err(Error::Integrity(reason)) => {
                error!(
                    credential_id = %credential_id,
                    "Stored credential failed integrity check"
                );
                return RefreshOutcome::Integrity(reason);
            }
            Err(e) => return RefreshOutcome::Transient(format!("failed to load credential: {}", e)),
        };

        let now = Utc::now();
        let must_refresh = match rejected {
            Some(token) => stored.access_token == token,
            None => stored.needs_refresh(now, self.inner.refresh_buffer),
        };
        if !must_refresh {
            return RefreshOutcome::Ready(stored);
        }

        info!(
            credential_id = %credential_id,
            expires_at = %stored.expires_at,
            forced = rejected.is_some(),
            "Refreshing OAuth token"
        );

        let grant = match self.inner.provider.refresh(&stored.refresh_token).await {
            Ok(grant) => grant,
            Err(ProviderError::Rejected(reason)) => {
                warn!(
                    credential_id = %credential_id,
                    reason = %reason,
                    "Refresh token rejected by provider, reconnect required"
                );
                return RefreshOutcome::Rejected;
            }
            Err(ProviderError::Transient(reason)) => {
                warn!(
                    credential_id = %credential_id,
                    reason = %reason,
                    "Token refresh failed"
                );
                return RefreshOutcome::Transient(reason);
            }
        };

        let rotated = grant.refresh_token.is_some();

        let refreshed = Credential {
            credential_id: credential_id.to_string(),
            access_token: grant.access_token,
            // Keep the existing refresh token if the provider did not rotate it
            refresh_token: grant.refresh_token.unwrap_or(stored.refresh_token),
            expires_at: Utc::now() + token_lifetime(grant.expires_in),
            scope: grant
                .scope
                .map(|scope| Credential::parse_scope(&scope))
                .unwrap_or(stored.scope),
        };

        self.persist_refreshed(&refreshed, rotated).await;

        info!(
            credential_id = %credential_id,
            expires_at = %refreshed.expires_at,
            rotated_refresh_token = rotated,
            "OAuth token refreshed successfully"
        );

        RefreshOutcome::Ready(refreshed)
    }

    /// Writes a refreshed credential, retrying briefly on failure.
    ///
    /// If every attempt fails the credential is still served from memory and
    /// later refreshes start from that copy, so a rotated refresh token stays
    /// usable for the life of the process.
    async fn persist_refreshed(&self, refreshed: &Credential, rotated: bool) {
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.inner.store.store(refreshed) {
                Ok(()) => return,
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        credential_id = %refreshed.credential_id,
                        attempt,
                        error = %e,
                        "Failed to persist refreshed credential, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(50 * u64::from(attempt)))
                        .await;
                }
                Err(e) => error!(
                    credential_id = %refreshed.credential_id,
                    rotated_refresh_token = rotated,
                    error = %e,
                    "Failed to persist refreshed credential, serving it from memory"
                ),
            }
        }
    }

    /// Exchanges an authorization code for the first token pair and stores it.
    ///
    /// Also clears a `Failed` credential: this is the re-consent path.
    pub async fn exchange(
        &self,
        credential_id: &str,
        authorization_code: &str,
        redirect_uri: &str,
    ) -> Result<Credential> {
        let grant = self
            .inner
            .provider
            .exchange_code(authorization_code, redirect_uri)
            .await
            .map_err(|e| match e {
                ProviderError::Rejected(reason) => {
                    warn!(credential_id = %credential_id, reason = %reason, "Authorization code rejected");
                    Error::AuthExpired {
                        credential_id: credential_id.to_string(),
                    }
                }
                ProviderError::Transient(reason) => Error::TransientBackend(reason),
            })?;

        let refresh_token = grant.refresh_token.ok_or_else(|| {
            Error::Config(
                "token endpoint did not issue a refresh token; offline access must be requested"
                    .to_string(),
            )
        })?;

        let credential = Credential {
            credential_id: credential_id.to_string(),
            access_token: grant.access_token,
            refresh_token,
            expires_at: Utc::now() + token_lifetime(grant.expires_in),
            scope: grant
                .scope
                .map(|scope| Credential::parse_scope(&scope))
                .unwrap_or_default(),
        };

        self.inner.store.store(&credential)?;

        let slot = self.slot(credential_id);
        {
            let mut state = slot.lock();
            state.generation += 1;
            state.credential = Some(credential.clone());
            if !matches!(state.phase, Phase::Refreshing(_)) {
                state.phase = Phase::Idle;
            }
        }

        info!(
            credential_id = %credential_id,
            expires_at = %credential.expires_at,
            "OAuth credential connected"
        );

        Ok(credential)
    }

    /// Administrative revocation: removes the stored row and cached tokens.
    ///
    /// Returns `true` if a row existed.
    pub fn revoke(&self, credential_id: &str) -> Result<bool> {
        let deleted = self.inner.store.delete(credential_id)?;

        let slot = self.slot(credential_id);
        let mut state = slot.lock();
        state.generation += 1;
        state.credential = None;
        if !matches!(state.phase, Phase::Refreshing(_)) {
            state.phase = Phase::Idle;
        }

        info!(credential_id = %credential_id, deleted, "OAuth credential revoked");
        Ok(deleted)
    }

    /// Current lifecycle state as seen by this process.
    pub fn state(&self, credential_id: &str) -> CredentialState {
        let slot = self.slot(credential_id);
        let state = slot.lock();
        match (&state.phase, &state.credential) {
            (Phase::Failed, _) => CredentialState::Failed,
            (Phase::Refreshing(_), _) => CredentialState::Refreshing,
            (Phase::Idle, None) => CredentialState::Unloaded,
            (Phase::Idle, Some(credential)) => {
                if credential.needs_refresh(Utc::now(), self.inner.refresh_buffer) {
                    CredentialState::Expiring
                } else {
                    CredentialState::Valid
                }
            }
        }
    }

    /// Non-secret view of a credential.
    ///
    /// Reads the store when nothing is cached, without installing the result.
    pub fn summary(&self, credential_id: &str) -> Result<CredentialSummary> {
        let state = self.state(credential_id);

        let cached = {
            let slot = self.slot(credential_id);
            let guard = slot.lock();
            guard
                .credential
                .as_ref()
                .map(|c| (c.expires_at, c.scope.clone()))
        };

        let (expires_at, scope) = match cached {
            Some((expires_at, scope)) => (Some(expires_at), scope),
            None if state == CredentialState::Failed => (None, Vec::new()),
            None => match self.inner.store.get(credential_id)? {
                Some(credential) => (Some(credential.expires_at), credential.scope),
                None => return Err(Error::CredentialNotFound(credential_id.to_string())),
            },
        };

        Ok(CredentialSummary {
            credential_id: credential_id.to_string(),
            state,
            expires_at,
            scope,
        })
    }
}
