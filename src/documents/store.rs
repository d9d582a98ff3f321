//! SQLite-backed document rows.

use super::MetadataRecorder;
use crate::error::{Error, Result};
use crate::storage::{BackendId, StoredFile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// # Schema
/// ```sql
/// CREATE TABLE documents (
///     entity_ref TEXT PRIMARY KEY,
///     backend TEXT NOT NULL,        -- "primary" | "secondary"
///     native_ref TEXT NOT NULL,
///     size_bytes INTEGER NOT NULL,
///     content_type TEXT NOT NULL,
///     checksum TEXT NOT NULL,       -- hex SHA-256
///     created_at TEXT NOT NULL      -- RFC 3339
/// );
/// ```
pub struct SqliteMetadataRecorder {
    conn: Mutex<Connection>,
}

type DocumentRow = (String, String, i64, String, String, String);

impl SqliteMetadataRecorder {
    /// Creates or opens the documents table. `":memory:"` is accepted.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                entity_ref TEXT PRIMARY KEY,
                backend TEXT NOT NULL,
                native_ref TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                checksum TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn select(conn: &Connection, entity_ref: &str) -> Result<Option<StoredFile>> {
        let row: Option<DocumentRow> = conn
            .query_row(
                r#"
                SELECT backend, native_ref, size_bytes, content_type, checksum, created_at
                FROM documents
                WHERE entity_ref = ?1
                "#,
                params![entity_ref],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|row| Self::decode(entity_ref, row)).transpose()
    }

    fn decode(entity_ref: &str, row: DocumentRow) -> Result<StoredFile> {
        let (backend, native_ref, size_bytes, content_type, checksum, created_at) = row;

        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                Error::Config(format!(
                    "invalid created_at in document row '{}': {}",
                    entity_ref, e
                ))
            })?;

        Ok(StoredFile {
            backend: backend.parse::<BackendId>()?,
            native_ref,
            size_bytes: u64::try_from(size_bytes).unwrap_or(0),
            content_type,
            checksum,
            created_at,
        })
    }
}

#[async_trait]
impl MetadataRecorder for SqliteMetadataRecorder {
    async fn record_file(&self, entity_ref: &str, file: &StoredFile) -> Result<Option<StoredFile>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let replaced = Self::select(&tx, entity_ref)?;

        tx.execute(
            r#"
            INSERT INTO documents (
                entity_ref, backend, native_ref, size_bytes,
                content_type, checksum, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(entity_ref) DO UPDATE SET
                backend = excluded.backend,
                native_ref = excluded.native_ref,
                size_bytes = excluded.size_bytes,
                content_type = excluded.content_type,
                checksum = excluded.checksum,
                created_at = excluded.created_at
            "#,
            params![
                entity_ref,
                file.backend.as_str(),
                file.native_ref,
                i64::try_from(file.size_bytes).unwrap_or(i64::MAX),
                file.content_type,
                file.checksum,
                file.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(replaced)
    }

    async fn forget_file(&self, entity_ref: &str) -> Result<Option<StoredFile>> {
        let conn = self.conn();
        let existing = Self::select(&conn, entity_ref)?;
        if existing.is_some() {
            conn.execute(
                "DELETE FROM documents WHERE entity_ref = ?1",
                params![entity_ref],
            )?;
        }
        Ok(existing)
    }

    async fn lookup(&self, entity_ref: &str) -> Result<Option<StoredFile>> {
        Self::select(&self.conn(), entity_ref)
    }
}
