//! Uniform storage adapter contract and the two backends behind it.
//!
//! # Architecture
//!
//! ```text
//!                 StorageRouter
//!                 ↓           ↓
//! ┌──────────────────┐  ┌──────────────────────────┐
//! │  PrimaryAdapter  │  │  SecondaryAdapter         │
//! │  - local disk    │  │  - third-party REST store │
//! │  - atomic rename │  │  - OAuth via credentials  │
//! └──────────────────┘  └──────────────────────────┘
//! ```
//!
//! Both implement [`StorageAdapter`]. Content is streamed in and out as
//! [`ByteStream`]s; neither adapter holds a whole file in memory.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

mod primary;
mod secondary;

pub use primary::PrimaryAdapter;
pub use secondary::{SecondaryAdapter, SecondaryConfig};

/// File content in flight. Dropping the stream releases the underlying
/// file handle or connection.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Content type assumed when the caller declares none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Which backend holds a file. Fixed at upload time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    Primary,
    Secondary,
}

impl BackendId {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendId::Primary => "primary",
            BackendId::Secondary => "secondary",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(BackendId::Primary),
            "secondary" => Ok(BackendId::Secondary),
            other => Err(Error::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// Result of a successful store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub backend: BackendId,
    /// Backend-native identifier, opaque outside the owning adapter.
    pub native_ref: String,
    pub size_bytes: u64,
    pub content_type: String,
    /// Hex SHA-256 of the content as streamed.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// What an adapter reports after writing an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    pub native_ref: String,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Object metadata as the backend reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    pub exists: bool,
    pub size_bytes: u64,
    pub content_type: Option<String>,
}

impl ObjectStat {
    pub fn missing() -> Self {
        Self {
            exists: false,
            size_bytes: 0,
            content_type: None,
        }
    }
}

/// Caller-supplied details that do not affect routing.
#[derive(Clone, Debug, Default)]
pub struct StoreHints {
    /// Display name passed to backends that keep one.
    pub file_name: Option<String>,
}

/// Uniform contract for a storage backend.
///
/// Every call takes a cancellation token. `delete` is idempotent: a missing
/// object is success.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn backend(&self) -> BackendId;

    /// Streams `body` into a new object and returns its native reference.
    async fn put(
        &self,
        body: ByteStream,
        size_hint: Option<u64>,
        content_type: &str,
        hints: &StoreHints,
        cancel: &CancellationToken,
    ) -> Result<PutOutcome>;

    /// Opens an object for reading.
    ///
    /// # Errors
    /// `Error::NotFound` if the backend no longer has the object.
    async fn get(&self, native_ref: &str, cancel: &CancellationToken) -> Result<ByteStream>;

    async fn delete(&self, native_ref: &str, cancel: &CancellationToken) -> Result<()>;

    async fn stat(&self, native_ref: &str, cancel: &CancellationToken) -> Result<ObjectStat>;

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<String>>;
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Running size and SHA-256 of content passing through a stream.
#[derive(Clone, Default)]
pub(crate) struct ContentDigest {
    inner: Arc<Mutex<DigestState>>,
}

#[derive(Default)]
struct DigestState {
    hasher: Sha256,
    bytes: u64,
}

impl ContentDigest {
    pub(crate) fn update(&self, chunk: &[u8]) {
        let mut state = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.hasher.update(chunk);
        state.bytes += chunk.len() as u64;
    }

    /// Wraps `stream` so every chunk is counted and hashed on its way through.
    pub(crate) fn observe(&self, stream: ByteStream) -> ByteStream {
        let digest = self.clone();
        stream.inspect_ok(move |chunk| digest.update(chunk)).boxed()
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .bytes
    }

    /// Total bytes seen and the hex digest.
    pub(crate) fn finish(&self) -> (u64, String) {
        let state = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (state.bytes, hex::encode(state.hasher.clone().finalize()))
    }
}

/// Builds a [`ByteStream`] from in-memory chunks.
pub fn stream_from_chunks<I>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = Bytes>,
    I::IntoIter: Send + 'static,
{
    futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// Collects a [`ByteStream`] into memory. Intended for small objects and tests.
pub async fn collect_stream(stream: ByteStream) -> std::io::Result<Vec<u8>> {
    stream
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_id_roundtrip() {
        assert_eq!("primary".parse::<BackendId>().unwrap(), BackendId::Primary);
        assert_eq!("secondary".parse::<BackendId>().unwrap(), BackendId::Secondary);
        assert!("dropbox".parse::<BackendId>().is_err());
        assert_eq!(serde_json::to_string(&BackendId::Secondary).unwrap(), "\"secondary\"");
    }

    #[tokio::test]
    async fn test_digest_observes_stream() {
        let digest = ContentDigest::default();
        let stream = digest.observe(stream_from_chunks(vec![
            Bytes::from_static(b"hello "),
            Bytes::from_static(b"world"),
        ]));

        let content = collect_stream(stream).await.unwrap();
        assert_eq!(content, b"hello world");

        let (bytes, checksum) = digest.finish();
        assert_eq!(bytes, 11);
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = cancellable(&cancel, async { Ok(1) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        let live = CancellationToken::new();
        assert_eq!(cancellable(&live, async { Ok(2) }).await.unwrap(), 2);
    }
}
