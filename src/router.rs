//! Size- and type-based placement of documents across the two backends.
//!
//! Classification is pure data ([`RoutingRules`]) so it can be tested without
//! any I/O. [`StorageRouter`] applies it once per upload; every later call is
//! plain dispatch on the recorded [`BackendId`].

use crate::error::{Error, Result};
use crate::storage::{
    BackendId, ByteStream, ObjectStat, StorageAdapter, StoreHints, StoredFile,
    DEFAULT_CONTENT_TYPE,
};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Files at or above this size go to the secondary backend (50 MiB).
pub const DEFAULT_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;

/// Ceiling for measuring input that declared no size (2 GiB).
pub const DEFAULT_SPOOL_CAP_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Large-format design files routed to the secondary backend regardless of size.
pub const DEFAULT_ALWAYS_SECONDARY_TYPES: &[&str] = &[
    "image/vnd.adobe.photoshop",
    "application/postscript",
    "application/illustrator",
    "application/x-indesign",
    "image/vnd.dwg",
    "image/vnd.dxf",
    "application/acad",
    "model/step",
    "application/sla",
];

/// Strips MIME parameters and case: `Image/PNG; q=1` becomes `image/png`.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Data-driven classification rules.
#[derive(Clone, Debug)]
pub struct RoutingRules {
    pub threshold_bytes: u64,
    /// Normalized content types.
    always_secondary: HashSet<String>,
    pub spool_cap_bytes: u64,
}

impl Default for RoutingRules {
    fn default() -> Self {
        Self::new(
            DEFAULT_THRESHOLD_BYTES,
            DEFAULT_ALWAYS_SECONDARY_TYPES.iter().copied(),
            DEFAULT_SPOOL_CAP_BYTES,
        )
    }
}

impl RoutingRules {
    pub fn new<I, S>(threshold_bytes: u64, always_secondary: I, spool_cap_bytes: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            threshold_bytes,
            always_secondary: always_secondary
                .into_iter()
                .map(|t| normalize_content_type(t.as_ref()))
                .filter(|t| !t.is_empty())
                .collect(),
            spool_cap_bytes,
        }
    }

    /// Picks the backend for a file.
    ///
    /// In order: an always-secondary type, then size at or above the
    /// threshold, go Secondary; everything else goes Primary.
    pub fn classify(&self, size_bytes: u64, content_type: &str) -> BackendId {
        if self
            .always_secondary
            .contains(&normalize_content_type(content_type))
        {
            return BackendId::Secondary;
        }
        if size_bytes >= self.threshold_bytes {
            return BackendId::Secondary;
        }
        BackendId::Primary
    }
}

/// Temporary file holding unsized input while it is measured.
/// Removed when dropped, on every exit path.
struct SpoolFile {
    path: PathBuf,
    len: u64,
}

impl SpoolFile {
    async fn reader(&self) -> Result<ByteStream> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(ReaderStream::new(file).boxed())
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove spool file");
            }
        }
    }
}

/// Places new documents and dispatches later operations to the owning backend.
pub struct StorageRouter {
    rules: RoutingRules,
    primary: Arc<dyn StorageAdapter>,
    secondary: Arc<dyn StorageAdapter>,
    spool_dir: PathBuf,
}

impl StorageRouter {
    pub fn new(
        rules: RoutingRules,
        primary: Arc<dyn StorageAdapter>,
        secondary: Arc<dyn StorageAdapter>,
        spool_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            rules,
            primary,
            secondary,
            spool_dir: spool_dir.into(),
        }
    }

    pub fn rules(&self) -> &RoutingRules {
        &self.rules
    }

    fn adapter(&self, backend: BackendId) -> &Arc<dyn StorageAdapter> {
        match backend {
            BackendId::Primary => &self.primary,
            BackendId::Secondary => &self.secondary,
        }
    }

    /// Classifies and stores one file.
    ///
    /// With no declared size the body is first spooled to disk to measure it.
    /// Adapter failures come back annotated with the backend; there is no
    /// fallback to the other backend.
    ///
    /// # Errors
    /// * `Error::ClassificationInput` - unsized body exceeded the spool cap
    /// * `Error::Cancelled` - `cancel` fired
    /// * `Error::Backend` - the chosen adapter failed
    pub async fn store(
        &self,
        body: ByteStream,
        size_bytes: Option<u64>,
        content_type: &str,
        hints: &StoreHints,
        cancel: &CancellationToken,
    ) -> Result<StoredFile> {
        let content_type = match content_type.trim() {
            "" => DEFAULT_CONTENT_TYPE,
            declared => declared,
        };

        // The spool file lives until the adapter has finished reading it
        let (body, size, _spool) = match size_bytes {
            Some(size) => (body, size, None),
            None => {
                let spool = self.spool(body, cancel).await?;
                let reader = spool.reader().await?;
                let size = spool.len;
                (reader, size, Some(spool))
            }
        };

        let backend = self.rules.classify(size, content_type);
        debug!(
            backend = %backend,
            size_bytes = size,
            content_type = %content_type,
            "Classified document"
        );

        let outcome = self
            .adapter(backend)
            .put(body, Some(size), content_type, hints, cancel)
            .await
            .map_err(|e| {
                warn!(backend = %backend, error = %e, "Store failed");
                e.in_backend(backend)
            })?;

        info!(
            backend = %backend,
            native_ref = %outcome.native_ref,
            size_bytes = outcome.size_bytes,
            "Document stored"
        );

        Ok(StoredFile {
            backend,
            native_ref: outcome.native_ref,
            size_bytes: outcome.size_bytes,
            content_type: content_type.to_string(),
            checksum: outcome.checksum,
            created_at: Utc::now(),
        })
    }

    async fn spool(&self, mut body: ByteStream, cancel: &CancellationToken) -> Result<SpoolFile> {
        let mut spool = SpoolFile {
            path: self
                .spool_dir
                .join(format!("docstore-spool-{}", Uuid::new_v4())),
            len: 0,
        };
        let mut file = tokio::fs::File::create(&spool.path).await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            spool.len += chunk.len() as u64;
            if spool.len > self.rules.spool_cap_bytes {
                warn!(
                    limit = self.rules.spool_cap_bytes,
                    "Unsized upload exceeded spool cap"
                );
                return Err(Error::ClassificationInput {
                    limit: self.rules.spool_cap_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        debug!(size_bytes = spool.len, "Spooled unsized upload");
        Ok(spool)
    }

    pub async fn retrieve(
        &self,
        backend: BackendId,
        native_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        self.adapter(backend)
            .get(native_ref, cancel)
            .await
            .map_err(|e| e.in_backend(backend))
    }

    /// Deletes an object. Already-absent objects are success.
    pub async fn remove(
        &self,
        backend: BackendId,
        native_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.adapter(backend)
            .delete(native_ref, cancel)
            .await
            .map_err(|e| e.in_backend(backend))?;
        debug!(backend = %backend, native_ref = %native_ref, "Document removed");
        Ok(())
    }

    pub async fn stat(
        &self,
        backend: BackendId,
        native_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectStat> {
        self.adapter(backend)
            .stat(native_ref, cancel)
            .await
            .map_err(|e| e.in_backend(backend))
    }

    pub async fn list(&self, backend: BackendId, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.adapter(backend)
            .list(cancel)
            .await
            .map_err(|e| e.in_backend(backend))
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{collect_stream, stream_from_chunks, PutOutcome};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory adapter that records every put.
    struct MemoryAdapter {
        id: BackendId,
        objects: Mutex<HashMap<String, Vec<u8>>>,
        puts: AtomicUsize,
        fail_puts: bool,
    }

    impl MemoryAdapter {
        fn new(id: BackendId) -> Arc<Self> {
            Arc::new(Self {
                id,
                objects: Mutex::new(HashMap::new()),
                puts: AtomicUsize::new(0),
                fail_puts: false,
            })
        }

        fn failing(id: BackendId) -> Arc<Self> {
            Arc::new(Self {
                id,
                objects: Mutex::new(HashMap::new()),
                puts: AtomicUsize::new(0),
                fail_puts: true,
            })
        }
    }

    #[async_trait]
    impl StorageAdapter for MemoryAdapter {
        fn backend(&self) -> BackendId {
            self.id
        }

        async fn put(
            &self,
            body: ByteStream,
            _size_hint: Option<u64>,
            _content_type: &str,
            _hints: &StoreHints,
            _cancel: &CancellationToken,
        ) -> Result<PutOutcome> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail_puts {
                return Err(Error::TransientBackend("status 503".to_string()));
            }
            let content = collect_stream(body).await?;
            let key = Uuid::new_v4().to_string();
            let size_bytes = content.len() as u64;
            self.objects.lock().unwrap().insert(key.clone(), content);
            Ok(PutOutcome {
                native_ref: key,
                size_bytes,
                checksum: String::new(),
            })
        }

        async fn get(&self, native_ref: &str, _cancel: &CancellationToken) -> Result<ByteStream> {
            let content = self
                .objects
                .lock()
                .unwrap()
                .get(native_ref)
                .cloned()
                .ok_or_else(|| Error::NotFound(native_ref.to_string()))?;
            Ok(stream_from_chunks(vec![Bytes::from(content)]))
        }

        async fn delete(&self, native_ref: &str, _cancel: &CancellationToken) -> Result<()> {
            self.objects.lock().unwrap().remove(native_ref);
            Ok(())
        }

        async fn stat(&self, native_ref: &str, _cancel: &CancellationToken) -> Result<ObjectStat> {
            Ok(match self.objects.lock().unwrap().get(native_ref) {
                Some(content) => ObjectStat {
                    exists: true,
                    size_bytes: content.len() as u64,
                    content_type: None,
                },
                None => ObjectStat::missing(),
            })
        }

        async fn list(&self, _cancel: &CancellationToken) -> Result<Vec<String>> {
            Ok(self.objects.lock().unwrap().keys().cloned().collect())
        }
    }

    fn rules(threshold: u64, spool_cap: u64) -> RoutingRules {
        RoutingRules::new(threshold, ["image/vnd.adobe.photoshop"], spool_cap)
    }

    fn router(
        rules: RoutingRules,
        primary: Arc<MemoryAdapter>,
        secondary: Arc<MemoryAdapter>,
        spool_dir: &Path,
    ) -> StorageRouter {
        StorageRouter::new(rules, primary, secondary, spool_dir)
    }

    #[test]
    fn test_classify_by_size() {
        let rules = RoutingRules::default();

        assert_eq!(rules.classify(0, "application/pdf"), BackendId::Primary);
        assert_eq!(
            rules.classify(DEFAULT_THRESHOLD_BYTES - 1, "application/pdf"),
            BackendId::Primary
        );
        assert_eq!(
            rules.classify(DEFAULT_THRESHOLD_BYTES, "application/pdf"),
            BackendId::Secondary
        );
        assert_eq!(
            rules.classify(DEFAULT_THRESHOLD_BYTES + 1, "application/pdf"),
            BackendId::Secondary
        );
    }

    #[test]
    fn test_classify_always_secondary_type_ignores_size_and_case() {
        let rules = RoutingRules::default();

        assert_eq!(rules.classify(10, "image/vnd.adobe.photoshop"), BackendId::Secondary);
        assert_eq!(
            rules.classify(10, "Image/VND.Adobe.Photoshop; charset=binary"),
            BackendId::Secondary
        );
        assert_eq!(rules.classify(10, "image/png"), BackendId::Primary);
    }

    #[test]
    fn test_normalize_content_type() {
        assert_eq!(normalize_content_type(" Text/Plain ; charset=utf-8"), "text/plain");
        assert_eq!(normalize_content_type(""), "");
    }

    #[tokio::test]
    async fn test_unsized_input_is_measured_then_routed() {
        let spool_dir = tempfile::tempdir().unwrap();
        let primary = MemoryAdapter::new(BackendId::Primary);
        let secondary = MemoryAdapter::new(BackendId::Secondary);
        let router = router(rules(8, 1024), primary.clone(), secondary.clone(), spool_dir.path());
        let cancel = CancellationToken::new();

        let small = router
            .store(
                stream_from_chunks(vec![Bytes::from_static(b"tiny")]),
                None,
                "text/plain",
                &StoreHints::default(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(small.backend, BackendId::Primary);
        assert_eq!(small.size_bytes, 4);

        let large = router
            .store(
                stream_from_chunks(vec![
                    Bytes::from_static(b"0123"),
                    Bytes::from_static(b"4567"),
                    Bytes::from_static(b"89"),
                ]),
                None,
                "text/plain",
                &StoreHints::default(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(large.backend, BackendId::Secondary);

        let content = collect_stream(
            router
                .retrieve(BackendId::Secondary, &large.native_ref, &cancel)
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(content, b"0123456789");

        let leftovers = std::fs::read_dir(spool_dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_spool_cap_is_a_classification_error() {
        let spool_dir = tempfile::tempdir().unwrap();
        let primary = MemoryAdapter::new(BackendId::Primary);
        let secondary = MemoryAdapter::new(BackendId::Secondary);
        let router = router(rules(1024, 6), primary.clone(), secondary.clone(), spool_dir.path());

        let err = router
            .store(
                stream_from_chunks(vec![Bytes::from_static(b"0123"), Bytes::from_static(b"4567")]),
                None,
                "text/plain",
                &StoreHints::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ClassificationInput { limit: 6 }));
        assert_eq!(primary.puts.load(Ordering::SeqCst), 0);
        assert_eq!(secondary.puts.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(spool_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_secondary_failure_is_annotated_without_fallback() {
        let spool_dir = tempfile::tempdir().unwrap();
        let primary = MemoryAdapter::new(BackendId::Primary);
        let secondary = MemoryAdapter::failing(BackendId::Secondary);
        let router = router(rules(4, 1024), primary.clone(), secondary.clone(), spool_dir.path());

        let err = router
            .store(
                stream_from_chunks(vec![Bytes::from_static(b"too big for primary")]),
                Some(19),
                "text/plain",
                &StoreHints::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.backend(), Some(BackendId::Secondary));
        assert!(matches!(err.root(), Error::TransientBackend(_)));
        assert_eq!(secondary.puts.load(Ordering::SeqCst), 1);
        assert_eq!(primary.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_content_type_defaults() {
        let spool_dir = tempfile::tempdir().unwrap();
        let router = router(
            rules(1024, 1024),
            MemoryAdapter::new(BackendId::Primary),
            MemoryAdapter::new(BackendId::Secondary),
            spool_dir.path(),
        );

        let stored = router
            .store(
                stream_from_chunks(vec![Bytes::from_static(b"x")]),
                Some(1),
                "  ",
                &StoreHints::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(stored.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_dispatch_goes_to_recorded_backend() {
        let spool_dir = tempfile::tempdir().unwrap();
        let primary = MemoryAdapter::new(BackendId::Primary);
        let router = router(
            rules(1024, 1024),
            primary.clone(),
            MemoryAdapter::new(BackendId::Secondary),
            spool_dir.path(),
        );
        let cancel = CancellationToken::new();

        let stored = router
            .store(
                stream_from_chunks(vec![Bytes::from_static(b"abc")]),
                Some(3),
                "text/plain",
                &StoreHints::default(),
                &cancel,
            )
            .await
            .unwrap();

        let err = router
            .retrieve(BackendId::Secondary, &stored.native_ref, &cancel)
            .await
            .err()
            .unwrap();
        assert_eq!(err.backend(), Some(BackendId::Secondary));
        assert!(matches!(err.root(), Error::NotFound(_)));

        assert!(router.stat(BackendId::Primary, &stored.native_ref, &cancel).await.unwrap().exists);
        router.remove(BackendId::Primary, &stored.native_ref, &cancel).await.unwrap();
        router.remove(BackendId::Primary, &stored.native_ref, &cancel).await.unwrap();
        assert!(router.list(BackendId::Primary, &cancel).await.unwrap().is_empty());
    }
}
