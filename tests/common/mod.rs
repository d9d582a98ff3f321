// Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use chrono::{Duration, Utc};
use docstore::credentials::{
    Credential, CredentialManager, CredentialStore, EncryptionService, ProviderError, TokenGrant,
    TokenProvider,
};
use docstore::storage::{ByteStream, SecondaryAdapter, SecondaryConfig};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const CREDENTIAL_ID: &str = "secondary";
pub const MIB: u64 = 1024 * 1024;

/// Token endpoint stand-in. Refreshed tokens are `refreshed-1`, `refreshed-2`, ...
pub struct StubProvider {
    pub refresh_calls: AtomicUsize,
    pub reject: AtomicBool,
}

impl StubProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        let provider = Self::new();
        provider.reject.store(true, Ordering::SeqCst);
        provider
    }

    pub fn calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StubProvider {
    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenGrant, ProviderError> {
        if code == "bad-code" {
            return Err(ProviderError::Rejected("invalid_grant".to_string()));
        }
        Ok(TokenGrant {
            access_token: "exchanged-access".to_string(),
            refresh_token: Some("exchanged-refresh".to_string()),
            expires_in: Some(3600),
            scope: Some("drive.file".to_string()),
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProviderError::Rejected("invalid_grant".to_string()));
        }
        Ok(TokenGrant {
            access_token: format!("refreshed-{}", n),
            refresh_token: None,
            expires_in: Some(3600),
            scope: None,
        })
    }
}

pub fn encryption() -> Arc<EncryptionService> {
    Arc::new(EncryptionService::from_base64_key(&BASE64.encode([7u8; 32])).unwrap())
}

/// Credential store holding one credential with `access_token` that expires in
/// `expires_in`.
pub fn seeded_store(access_token: &str, expires_in: Duration) -> Arc<CredentialStore> {
    let store = CredentialStore::new(":memory:", encryption()).unwrap();
    store
        .store(&Credential {
            credential_id: CREDENTIAL_ID.to_string(),
            access_token: access_token.to_string(),
            refresh_token: "long-lived-refresh".to_string(),
            expires_at: Utc::now() + expires_in,
            scope: vec!["drive.file".to_string()],
        })
        .unwrap();
    Arc::new(store)
}

/// Manager over a seeded store with the default five minute buffer.
pub fn manager(
    access_token: &str,
    expires_in: Duration,
    provider: Arc<StubProvider>,
) -> CredentialManager {
    CredentialManager::new(
        seeded_store(access_token, expires_in),
        provider,
        Duration::minutes(5),
    )
}

pub fn secondary_adapter(base_url: &str, credentials: CredentialManager) -> SecondaryAdapter {
    SecondaryAdapter::new(
        SecondaryConfig {
            api_base_url: base_url.to_string(),
            upload_base_url: format!("{}/upload", base_url),
            folder_id: None,
            credential_id: CREDENTIAL_ID.to_string(),
            request_timeout: std::time::Duration::from_secs(10),
        },
        credentials,
    )
    .unwrap()
}

/// `total` bytes of a repeating pattern, in 1 MiB chunks that share storage.
pub fn patterned_body(total: u64) -> ByteStream {
    let chunk = Bytes::from((0..MIB).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
    let mut remaining = total;
    let mut chunks = Vec::new();
    while remaining > 0 {
        let len = remaining.min(MIB) as usize;
        chunks.push(chunk.slice(..len));
        remaining -= len as u64;
    }
    docstore::storage::stream_from_chunks(chunks)
}

pub fn patterned_bytes(total: u64) -> Vec<u8> {
    (0..total).map(|i| ((i % MIB) % 251) as u8).collect()
}

/// Yields `first` and then never finishes.
pub fn stalled_body(first: &'static [u8]) -> ByteStream {
    futures::stream::iter(vec![Ok(Bytes::from_static(first))])
        .chain(futures::stream::pending())
        .boxed()
}
