//! AES-256-GCM envelope encryption for credential secrets.
//!
//! Each call draws a fresh random 96-bit nonce. The authentication tag is kept
//! detached from the ciphertext so the persisted row carries all three parts
//! of the envelope separately. The master key is a base64-encoded 32-byte value
//! validated once at startup.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Environment variable holding the base64-encoded master key.
pub const ENCRYPTION_KEY_ENV: &str = "DOCSTORE_ENCRYPTION_KEY";

/// At-rest representation of one encrypted secret.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionEnvelope {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

impl EncryptionEnvelope {
    /// Encodes the three parts as base64 strings for text columns.
    pub fn to_base64(&self) -> (String, String, String) {
        (
            BASE64.encode(&self.ciphertext),
            BASE64.encode(&self.nonce),
            BASE64.encode(&self.auth_tag),
        )
    }

    /// Decodes an envelope from base64 text columns.
    ///
    /// Undecodable columns are an integrity failure: the row was not written
    /// by [`EncryptionEnvelope::to_base64`].
    pub fn from_base64(ciphertext: &str, nonce: &str, auth_tag: &str) -> Result<Self> {
        let decode = |field: &str, value: &str| {
            BASE64
                .decode(value)
                .map_err(|_| Error::Integrity(format!("{} is not valid base64", field)))
        };

        Ok(Self {
            ciphertext: decode("ciphertext", ciphertext)?,
            nonce: decode("nonce", nonce)?,
            auth_tag: decode("auth_tag", auth_tag)?,
        })
    }
}

impl fmt::Debug for EncryptionEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionEnvelope")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("nonce_len", &self.nonce.len())
            .field("auth_tag_len", &self.auth_tag.len())
            .finish()
    }
}

/// Symmetric encryption with a process-wide key.
///
/// The key lives only inside the cipher instance; it is never logged and never
/// appears in error messages. Safe to share across threads without locking.
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Builds the service from a base64-encoded 32-byte key.
    ///
    /// # Errors
    /// `Error::Config` if the key is not valid base64 or not exactly 32 bytes.
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|_| Error::Config("encryption key is not valid base64".to_string()))?;

        if key_bytes.len() != KEY_SIZE {
            return Err(Error::Config(format!(
                "encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|_| Error::Config("failed to initialise cipher".to_string()))?;

        Ok(Self { cipher })
    }

    /// Loads the key from `DOCSTORE_ENCRYPTION_KEY`.
    ///
    /// Absence is a startup error; nothing defers it to the first request.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(ENCRYPTION_KEY_ENV)
            .map_err(|_| Error::Config(format!("{} is not set", ENCRYPTION_KEY_ENV)))?;
        Self::from_base64_key(&key)
    }

    /// Generates a fresh random key, base64-encoded.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        BASE64.encode(key)
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptionEnvelope> {
        self.seal(plaintext, b"")
    }

    /// Decrypts an envelope produced by [`EncryptionService::encrypt`].
    ///
    /// # Errors
    /// `Error::Integrity` if the tag does not verify. Callers must treat this as
    /// a security incident, never as "no credential".
    pub fn decrypt(&self, envelope: &EncryptionEnvelope) -> Result<Vec<u8>> {
        self.open(envelope, b"")
    }

    /// Encrypts `plaintext` and binds it to `associated_data`.
    ///
    /// The associated data is authenticated but not stored; the same bytes must
    /// be supplied to [`EncryptionService::open`].
    pub fn seal(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<EncryptionEnvelope> {
        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, associated_data, &mut buffer)
            .map_err(|_| Error::Config("plaintext exceeds the AES-GCM message limit".to_string()))?;

        Ok(EncryptionEnvelope {
            ciphertext: buffer,
            nonce: nonce.to_vec(),
            auth_tag: tag.to_vec(),
        })
    }

    /// Decrypts an envelope sealed with the same `associated_data`.
    pub fn open(&self, envelope: &EncryptionEnvelope, associated_data: &[u8]) -> Result<Vec<u8>> {
        if envelope.nonce.len() != NONCE_SIZE {
            return Err(Error::Integrity(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                envelope.nonce.len()
            )));
        }
        if envelope.auth_tag.len() != TAG_SIZE {
            return Err(Error::Integrity(format!(
                "invalid tag size: expected {}, got {}",
                TAG_SIZE,
                envelope.auth_tag.len()
            )));
        }

        let nonce = Nonce::from_slice(&envelope.nonce);
        let tag = Tag::from_slice(&envelope.auth_tag);

        let mut buffer = envelope.ciphertext.clone();
        self.cipher
            .decrypt_in_place_detached(nonce, associated_data, &mut buffer, tag)
            .map_err(|_| {
                Error::Integrity("authentication tag mismatch (wrong key or corrupted data)".to_string())
            })?;

        Ok(buffer)
    }
}

impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionService { key: <redacted> }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(byte: u8) -> EncryptionService {
        EncryptionService::from_base64_key(&BASE64.encode([byte; KEY_SIZE])).unwrap()
    }

    #[test]
    fn test_key_validation() {
        // Valid 32-byte key (base64-encoded)
        assert!(EncryptionService::from_base64_key(&BASE64.encode([0u8; 32])).is_ok());

        // Too short
        let err = EncryptionService::from_base64_key(&BASE64.encode([0u8; 16])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // Too long
        assert!(EncryptionService::from_base64_key(&BASE64.encode([0u8; 64])).is_err());

        // Invalid base64
        assert!(EncryptionService::from_base64_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_key_never_in_error_message() {
        let key = BASE64.encode([7u8; 31]);
        let err = EncryptionService::from_base64_key(&key).unwrap_err();
        assert!(!err.to_string().contains(&key));
    }

    #[test]
    fn test_generated_key_is_usable() {
        let key = EncryptionService::generate_key();
        let service = EncryptionService::from_base64_key(&key).unwrap();
        let envelope = service.encrypt(b"hello").unwrap();
        assert_eq!(service.decrypt(&envelope).unwrap(), b"hello");
        assert_ne!(key, EncryptionService::generate_key());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let service = service(0);
        let plaintext = b"my-secret-refresh-token-12345";

        let envelope = service.encrypt(plaintext).unwrap();
        assert_ne!(envelope.ciphertext, plaintext.to_vec());
        assert_eq!(envelope.nonce.len(), NONCE_SIZE);
        assert_eq!(envelope.auth_tag.len(), TAG_SIZE);

        assert_eq!(service.decrypt(&envelope).unwrap(), plaintext.to_vec());
    }

    #[test]
    fn test_roundtrip_empty_and_large() {
        let service = service(3);

        let empty = service.encrypt(b"").unwrap();
        assert!(service.decrypt(&empty).unwrap().is_empty());

        let large: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let envelope = service.encrypt(&large).unwrap();
        assert_eq!(service.decrypt(&envelope).unwrap(), large);
    }

    #[test]
    fn test_different_nonces() {
        let service = service(0);

        let first = service.encrypt(b"same-plaintext").unwrap();
        let second = service.encrypt(b"same-plaintext").unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let envelope = service(0).encrypt(b"secret").unwrap();
        let err = service(1).decrypt(&envelope).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_single_bit_tamper_detected() {
        let service = service(9);
        let envelope = service.encrypt(b"refresh-token").unwrap();

        for byte in 0..envelope.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = envelope.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                assert!(matches!(service.decrypt(&tampered), Err(Error::Integrity(_))));
            }
        }

        for byte in 0..TAG_SIZE {
            for bit in 0..8 {
                let mut tampered = envelope.clone();
                tampered.auth_tag[byte] ^= 1 << bit;
                assert!(matches!(service.decrypt(&tampered), Err(Error::Integrity(_))));
            }
        }
    }

    #[test]
    fn test_truncated_parts_rejected() {
        let service = service(0);
        let envelope = service.encrypt(b"secret").unwrap();

        let mut short_nonce = envelope.clone();
        short_nonce.nonce.pop();
        assert!(matches!(service.decrypt(&short_nonce), Err(Error::Integrity(_))));

        let mut short_tag = envelope;
        short_tag.auth_tag.truncate(4);
        assert!(matches!(service.decrypt(&short_tag), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_associated_data_binds_envelope() {
        let service = service(0);
        let envelope = service.seal(b"secret", b"credential-a").unwrap();

        assert_eq!(service.open(&envelope, b"credential-a").unwrap(), b"secret");
        assert!(matches!(
            service.open(&envelope, b"credential-b"),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_base64_columns() {
        let service = service(0);
        let envelope = service.encrypt(b"secret").unwrap();

        let (ciphertext, nonce, tag) = envelope.to_base64();
        let decoded = EncryptionEnvelope::from_base64(&ciphertext, &nonce, &tag).unwrap();
        assert_eq!(decoded, envelope);

        assert!(matches!(
            EncryptionEnvelope::from_base64("%%%", &nonce, &tag),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_debug_is_redacted() {
        let service = service(0);
        assert_eq!(format!("{:?}", service), "EncryptionService { key: <redacted> }");
    }
}
