//! Document records: which backend holds the bytes for a business entity.
//!
//! The storage core hands every [`StoredFile`] to a [`MetadataRecorder`];
//! [`DocumentService`] composes the two so callers work in terms of entity
//! references rather than backend-native identifiers.

use crate::error::Result;
use crate::storage::StoredFile;
use async_trait::async_trait;

mod service;
mod store;

pub use service::DocumentService;
pub use store::SqliteMetadataRecorder;

/// Durable owner of document rows, keyed by entity reference.
#[async_trait]
pub trait MetadataRecorder: Send + Sync {
    /// Records (or replaces) the file attached to `entity_ref`.
    ///
    /// Returns the row it replaced. Reading and replacing happen atomically, so
    /// each replaced file is handed to exactly one caller.
    async fn record_file(&self, entity_ref: &str, file: &StoredFile) -> Result<Option<StoredFile>>;

    /// Removes the row and returns what it pointed at, so the caller can delete
    /// the bytes.
    async fn forget_file(&self, entity_ref: &str) -> Result<Option<StoredFile>>;

    async fn lookup(&self, entity_ref: &str) -> Result<Option<StoredFile>>;
}
