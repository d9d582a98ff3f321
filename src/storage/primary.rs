//! Primary backend: low-latency object store on local disk.
//!
//! Objects are keyed by UUIDv7. Each write goes to a hidden temporary file in
//! the same directory and is renamed into place only after the content and its
//! JSON sidecar are on disk, so readers never observe a partial object.

use super::{
    cancellable, BackendId, ByteStream, ContentDigest, ObjectStat, PutOutcome, StorageAdapter,
    StoreHints,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const SIDECAR_SUFFIX: &str = ".meta.json";

/// Per-object metadata kept next to the content file.
#[derive(Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    size_bytes: u64,
    checksum: String,
    created_at: DateTime<Utc>,
}

/// Local-disk object store with a hard per-object ceiling.
pub struct PrimaryAdapter {
    root: PathBuf,
    max_object_bytes: u64,
}

impl PrimaryAdapter {
    /// Opens (and creates if needed) an object directory.
    pub fn new<P: AsRef<Path>>(root: P, max_object_bytes: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            max_object_bytes,
        })
    }

    /// Maps a key to its content path. Anything that is not one of our keys
    /// (including path tricks like `../x`) has no object.
    fn object_path(&self, native_ref: &str) -> Option<PathBuf> {
        Uuid::parse_str(native_ref)
            .ok()
            .map(|key| self.root.join(key.to_string()))
    }

    fn sidecar_path(content_path: &Path) -> PathBuf {
        let mut name = content_path.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    async fn write_object(
        &self,
        mut body: ByteStream,
        temp_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(u64, String)> {
        let mut file = fs::File::create(temp_path).await?;
        let digest = ContentDigest::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            let written = digest.bytes() + chunk.len() as u64;
            if written > self.max_object_bytes {
                return Err(Error::ObjectTooLarge {
                    size: written,
                    limit: self.max_object_bytes,
                });
            }

            file.write_all(&chunk).await?;
            digest.update(&chunk);
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(digest.finish())
    }
}

/// Removes a file, treating "already gone" as success.
async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl StorageAdapter for PrimaryAdapter {
    fn backend(&self) -> BackendId {
        BackendId::Primary
    }

    async fn put(
        &self,
        body: ByteStream,
        size_hint: Option<u64>,
        content_type: &str,
        _hints: &StoreHints,
        cancel: &CancellationToken,
    ) -> Result<PutOutcome> {
        if let Some(size) = size_hint {
            if size > self.max_object_bytes {
                return Err(Error::ObjectTooLarge {
                    size,
                    limit: self.max_object_bytes,
                });
            }
        }

        let key = Uuid::now_v7().to_string();
        let final_path = self.root.join(&key);
        let temp_path = self.root.join(format!(".{}.partial", key));

        let (size_bytes, checksum) = match self.write_object(body, &temp_path, cancel).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&temp_path).await {
                    warn!(
                        path = %temp_path.display(),
                        error = %cleanup,
                        "Failed to remove partial object"
                    );
                }
                return Err(e);
            }
        };

        let sidecar = serde_json::to_vec(&Sidecar {
            content_type: content_type.to_string(),
            size_bytes,
            checksum: checksum.clone(),
            created_at: Utc::now(),
        })?;

        let committed = async {
            fs::write(Self::sidecar_path(&final_path), sidecar).await?;
            fs::rename(&temp_path, &final_path).await
        }
        .await;

        if let Err(e) = committed {
            let _ = remove_if_exists(&temp_path).await;
            let _ = remove_if_exists(&Self::sidecar_path(&final_path)).await;
            return Err(e.into());
        }

        debug!(native_ref = %key, size_bytes, "Stored object on primary backend");

        Ok(PutOutcome {
            native_ref: key,
            size_bytes,
            checksum,
        })
    }

    async fn get(&self, native_ref: &str, cancel: &CancellationToken) -> Result<ByteStream> {
        let path = self
            .object_path(native_ref)
            .ok_or_else(|| Error::NotFound(native_ref.to_string()))?;

        let file = cancellable(cancel, async {
            fs::File::open(&path).await.map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::NotFound(native_ref.to_string()),
                _ => Error::Io(e),
            })
        })
        .await?;

        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, native_ref: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(path) = self.object_path(native_ref) else {
            return Ok(());
        };

        cancellable(cancel, async {
            remove_if_exists(&path).await?;
            remove_if_exists(&Self::sidecar_path(&path)).await?;
            Ok::<_, Error>(())
        })
        .await
    }

    async fn stat(&self, native_ref: &str, cancel: &CancellationToken) -> Result<ObjectStat> {
        let Some(path) = self.object_path(native_ref) else {
            return Ok(ObjectStat::missing());
        };

        cancellable(cancel, async {
            let metadata = match fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ObjectStat::missing()),
                Err(e) => return Err(e.into()),
            };

            let content_type = match fs::read(Self::sidecar_path(&path)).await {
                Ok(raw) => serde_json::from_slice::<Sidecar>(&raw)
                    .ok()
                    .map(|sidecar| sidecar.content_type),
                Err(_) => None,
            };

            Ok::<_, Error>(ObjectStat {
                exists: true,
                size_bytes: metadata.len(),
                content_type,
            })
        })
        .await
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        cancellable(cancel, async {
            let mut entries = fs::read_dir(&self.root).await?;
            let mut keys = Vec::new();

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if Uuid::parse_str(name).is_ok() {
                    keys.push(name.to_string());
                }
            }

            // UUIDv7 keys sort by creation time
            keys.sort();
            Ok::<_, Error>(keys)
        })
        .await
    }
}
