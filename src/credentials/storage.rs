//! Encrypted credential persistence using SQLite.
//!
//! One row per credential. The tokens are sealed into a single envelope bound
//! to the row's `credential_id`; only expiry and scope are stored in the clear.

use super::{Credential, EncryptionEnvelope, EncryptionService, SecretPayload};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     credential_id TEXT PRIMARY KEY,
///     ciphertext TEXT NOT NULL,   -- base64, sealed {access_token, refresh_token}
///     nonce TEXT NOT NULL,        -- base64, 96-bit
///     auth_tag TEXT NOT NULL,     -- base64, 128-bit
///     expires_at TEXT NOT NULL,   -- RFC 3339
///     scope TEXT NOT NULL,        -- space separated
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
/// ```
///
/// # Thread Safety
/// The connection is wrapped in a Mutex; every call holds it only for the
/// duration of one statement.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    encryption: Arc<EncryptionService>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// `":memory:"` opens a private in-memory database.
    pub fn new<P: AsRef<Path>>(db_path: P, encryption: Arc<EncryptionService>) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                credential_id TEXT PRIMARY KEY,
                ciphertext TEXT NOT NULL,
                nonce TEXT NOT NULL,
                auth_tag TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                scope TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite itself consistent.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seals and stores a credential (upsert).
    pub fn store(&self, credential: &Credential) -> Result<()> {
        let payload = serde_json::to_vec(&SecretPayload {
            access_token: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
        })?;

        let envelope = self
            .encryption
            .seal(&payload, credential.credential_id.as_bytes())?;
        let (ciphertext, nonce, auth_tag) = envelope.to_base64();

        let now = Utc::now().to_rfc3339();

        self.conn().execute(
            r#"
            INSERT INTO credentials (
                credential_id, ciphertext, nonce, auth_tag,
                expires_at, scope, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(credential_id) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                nonce = excluded.nonce,
                auth_tag = excluded.auth_tag,
                expires_at = excluded.expires_at,
                scope = excluded.scope,
                updated_at = excluded.updated_at
            "#,
            params![
                credential.credential_id,
                ciphertext,
                nonce,
                auth_tag,
                credential.expires_at.to_rfc3339(),
                credential.scope_string(),
                now,
                now,
            ],
        )?;

        Ok(())
    }

    /// Loads and unseals a credential.
    ///
    /// # Returns
    /// * `Ok(Some(_))` - found and authenticated
    /// * `Ok(None)` - no row for this id
    /// * `Err(Error::Integrity)` - row present but the envelope does not verify
    pub fn get(&self, credential_id: &str) -> Result<Option<Credential>> {
        let row = self
            .conn()
            .query_row(
                r#"
                SELECT ciphertext, nonce, auth_tag, expires_at, scope
                FROM credentials
                WHERE credential_id = ?1
                "#,
                params![credential_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((ciphertext, nonce, auth_tag, expires_at, scope)) = row else {
            return Ok(None);
        };

        let envelope = EncryptionEnvelope::from_base64(&ciphertext, &nonce, &auth_tag)?;
        let plaintext = self.encryption.open(&envelope, credential_id.as_bytes())?;
        let payload: SecretPayload = serde_json::from_slice(&plaintext)
            .map_err(|_| Error::Integrity("sealed payload is not a credential".to_string()))?;

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Config(format!("invalid expires_at in credential row: {}", e)))?;

        Ok(Some(Credential {
            credential_id: credential_id.to_string(),
            access_token: payload.access_token,
            refresh_token: payload.refresh_token,
            expires_at,
            scope: Credential::parse_scope(&scope),
        }))
    }

    /// Deletes a credential row.
    ///
    /// Returns `true` if a row was removed.
    pub fn delete(&self, credential_id: &str) -> Result<bool> {
        let rows_affected = self.conn().execute(
            "DELETE FROM credentials WHERE credential_id = ?1",
            params![credential_id],
        )?;

        Ok(rows_affected > 0)
    }
}
