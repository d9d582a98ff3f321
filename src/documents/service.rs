//! Upload, download and delete by entity reference.

use super::MetadataRecorder;
use crate::error::{Error, Result};
use crate::router::StorageRouter;
use crate::storage::{ByteStream, ObjectStat, StoreHints, StoredFile};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Keeps document rows and stored objects in step.
#[derive(Clone)]
pub struct DocumentService {
    router: Arc<StorageRouter>,
    recorder: Arc<dyn MetadataRecorder>,
}

impl DocumentService {
    pub fn new(router: Arc<StorageRouter>, recorder: Arc<dyn MetadataRecorder>) -> Self {
        Self { router, recorder }
    }

    pub fn router(&self) -> &StorageRouter {
        &self.router
    }

    /// Stores a file and records it against `entity_ref`.
    ///
    /// If the row cannot be written the new object is removed again, so no
    /// stored object is left without a record. The file the new row replaced
    /// is removed once the row is in place; concurrent uploads to one entity
    /// each remove only the row they themselves replaced.
    pub async fn upload(
        &self,
        entity_ref: &str,
        body: ByteStream,
        size_bytes: Option<u64>,
        content_type: &str,
        hints: &StoreHints,
        cancel: &CancellationToken,
    ) -> Result<StoredFile> {
        let stored = self
            .router
            .store(body, size_bytes, content_type, hints, cancel)
            .await?;

        let replaced = match self.recorder.record_file(entity_ref, &stored).await {
            Ok(replaced) => replaced,
            Err(e) => {
                warn!(
                    entity_ref = %entity_ref,
                    backend = %stored.backend,
                    native_ref = %stored.native_ref,
                    error = %e,
                    "Failed to record document, removing stored object"
                );
                self.discard(&stored).await;
                return Err(e);
            }
        };

        if let Some(previous) = replaced {
            if previous.backend != stored.backend || previous.native_ref != stored.native_ref {
                self.discard(&previous).await;
            }
        }

        info!(
            entity_ref = %entity_ref,
            backend = %stored.backend,
            size_bytes = stored.size_bytes,
            "Document uploaded"
        );

        Ok(stored)
    }

    /// Opens the content attached to `entity_ref`.
    pub async fn download(
        &self,
        entity_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<(StoredFile, ByteStream)> {
        let file = self.require(entity_ref).await?;
        let content = self
            .router
            .retrieve(file.backend, &file.native_ref, cancel)
            .await?;
        Ok((file, content))
    }

    /// The recorded row together with what the backend reports now.
    pub async fn stat(
        &self,
        entity_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<(StoredFile, ObjectStat)> {
        let file = self.require(entity_ref).await?;
        let stat = self.router.stat(file.backend, &file.native_ref, cancel).await?;
        Ok((file, stat))
    }

    /// Forgets the row, then removes the object.
    ///
    /// Returns `false` when nothing was recorded for `entity_ref`.
    pub async fn delete(&self, entity_ref: &str, cancel: &CancellationToken) -> Result<bool> {
        let Some(file) = self.recorder.forget_file(entity_ref).await? else {
            return Ok(false);
        };

        self.router
            .remove(file.backend, &file.native_ref, cancel)
            .await?;

        info!(
            entity_ref = %entity_ref,
            backend = %file.backend,
            native_ref = %file.native_ref,
            "Document deleted"
        );
        Ok(true)
    }

    async fn require(&self, entity_ref: &str) -> Result<StoredFile> {
        self.recorder
            .lookup(entity_ref)
            .await?
            .ok_or_else(|| Error::NotFound(entity_ref.to_string()))
    }

    /// Best-effort removal that only logs failure.
    async fn discard(&self, file: &StoredFile) {
        if let Err(e) = self
            .router
            .remove(file.backend, &file.native_ref, &CancellationToken::new())
            .await
        {
            warn!(
                backend = %file.backend,
                native_ref = %file.native_ref,
                error = %e,
                "Failed to remove orphaned object"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::SqliteMetadataRecorder;
    use crate::router::RoutingRules;
    use crate::storage::{
        collect_stream, stream_from_chunks, BackendId, PrimaryAdapter, StorageAdapter,
    };
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Recorder whose writes always fail.
    struct BrokenRecorder;

    #[async_trait]
    impl MetadataRecorder for BrokenRecorder {
        async fn record_file(&self, _entity_ref: &str, _file: &StoredFile) -> Result<Option<StoredFile>> {
            Err(Error::Config("read-only database".to_string()))
        }

        async fn forget_file(&self, _entity_ref: &str) -> Result<Option<StoredFile>> {
            Ok(None)
        }

        async fn lookup(&self, _entity_ref: &str) -> Result<Option<StoredFile>> {
            Ok(None)
        }
    }

    /// Both backends are local disk here; routing is exercised elsewhere.
    fn service(
        dir: &tempfile::TempDir,
        recorder: Arc<dyn MetadataRecorder>,
    ) -> (DocumentService, Arc<PrimaryAdapter>) {
        let primary = Arc::new(PrimaryAdapter::new(dir.path().join("primary"), 1024).unwrap());
        let secondary = Arc::new(PrimaryAdapter::new(dir.path().join("secondary"), 1024).unwrap());
        let router = StorageRouter::new(
            RoutingRules::new(512, Vec::<String>::new(), 1024),
            primary.clone(),
            secondary,
            dir.path(),
        );
        (DocumentService::new(Arc::new(router), recorder), primary)
    }

    fn body(content: &'static [u8]) -> ByteStream {
        stream_from_chunks(vec![Bytes::from_static(content)])
    }

    #[tokio::test]
    async fn test_upload_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(&dir, Arc::new(SqliteMetadataRecorder::new(":memory:").unwrap()));
        let cancel = CancellationToken::new();

        let stored = service
            .upload("order/7", body(b"signed contract"), Some(15), "application/pdf", &StoreHints::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(stored.backend, BackendId::Primary);

        let (file, content) = service.download("order/7", &cancel).await.unwrap();
        assert_eq!(file, stored);
        assert_eq!(collect_stream(content).await.unwrap(), b"signed contract");

        assert!(service.delete("order/7", &cancel).await.unwrap());
        assert!(!service.delete("order/7", &cancel).await.unwrap());
        assert!(matches!(
            service.download("order/7", &cancel).await.err().unwrap(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_reupload_removes_previous_object() {
        let dir = tempfile::tempdir().unwrap();
        let (service, primary) =
            service(&dir, Arc::new(SqliteMetadataRecorder::new(":memory:").unwrap()));
        let cancel = CancellationToken::new();

        let first = service
            .upload("order/7", body(b"v1"), Some(2), "text/plain", &StoreHints::default(), &cancel)
            .await
            .unwrap();
        let second = service
            .upload("order/7", body(b"v2"), Some(2), "text/plain", &StoreHints::default(), &cancel)
            .await
            .unwrap();

        let remaining = primary.list(&cancel).await.unwrap();
        assert_eq!(remaining, vec![second.native_ref]);
        assert!(!primary.stat(&first.native_ref, &cancel).await.unwrap().exists);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reuploads_leave_exactly_one_object() {
        let dir = tempfile::tempdir().unwrap();
        let (service, primary) =
            service(&dir, Arc::new(SqliteMetadataRecorder::new(":memory:").unwrap()));
        let cancel = CancellationToken::new();

        service
            .upload("order/7", body(b"v0"), Some(2), "text/plain", &StoreHints::default(), &cancel)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .upload(
                        "order/7",
                        body(b"vN"),
                        Some(2),
                        "text/plain",
                        &StoreHints::default(),
                        &CancellationToken::new(),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let (recorded, _) = service.stat("order/7", &cancel).await.unwrap();
        let remaining = primary.list(&cancel).await.unwrap();
        assert_eq!(remaining, vec![recorded.native_ref]);
    }

    #[tokio::test]
    async fn test_failed_record_removes_stored_object() {
        let dir = tempfile::tempdir().unwrap();
        let (service, primary) = service(&dir, Arc::new(BrokenRecorder));
        let cancel = CancellationToken::new();

        let err = service
            .upload("order/7", body(b"orphan"), Some(6), "text/plain", &StoreHints::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        assert!(primary.list(&cancel).await.unwrap().is_empty());
    }
}
