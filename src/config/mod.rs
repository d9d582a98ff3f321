use crate::router::{
    RoutingRules, DEFAULT_ALWAYS_SECONDARY_TYPES, DEFAULT_SPOOL_CAP_BYTES, DEFAULT_THRESHOLD_BYTES,
};
use crate::storage::SecondaryConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "DOCSTORE_CONFIG";

/// Config file read when `DOCSTORE_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "docstore.toml";

/// Complete docstore configuration. Secrets are never read from here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocStoreConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub primary: PrimaryConfig,
    #[serde(default)]
    pub secondary: SecondaryBackendConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Placement rules
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: u64,
    /// Content types that always go to the secondary backend
    #[serde(default = "default_always_secondary_types")]
    pub always_secondary_types: Vec<String>,
    /// Largest body measured when no size is declared
    #[serde(default = "default_spool_cap_bytes")]
    pub spool_cap_bytes: u64,
    /// Where unsized bodies are measured (system temp dir when unset)
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

fn default_threshold_bytes() -> u64 {
    DEFAULT_THRESHOLD_BYTES
}

fn default_always_secondary_types() -> Vec<String> {
    DEFAULT_ALWAYS_SECONDARY_TYPES
        .iter()
        .map(|t| t.to_string())
        .collect()
}

fn default_spool_cap_bytes() -> u64 {
    DEFAULT_SPOOL_CAP_BYTES
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: default_threshold_bytes(),
            always_secondary_types: default_always_secondary_types(),
            spool_cap_bytes: default_spool_cap_bytes(),
            spool_dir: None,
        }
    }
}

impl RoutingConfig {
    pub fn rules(&self) -> RoutingRules {
        RoutingRules::new(
            self.threshold_bytes,
            &self.always_secondary_types,
            self.spool_cap_bytes,
        )
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Credential persistence and refresh policy
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// SQLite file holding credentials and document rows
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Tokens this close to expiry are refreshed before use
    #[serde(default = "default_refresh_buffer_seconds")]
    pub refresh_buffer_seconds: i64,
    #[serde(default = "default_secondary_credential_id")]
    pub secondary_credential_id: String,
}

fn default_database_path() -> String {
    "docstore.db".to_string()
}

fn default_refresh_buffer_seconds() -> i64 {
    300
}

fn default_secondary_credential_id() -> String {
    "secondary".to_string()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            refresh_buffer_seconds: default_refresh_buffer_seconds(),
            secondary_credential_id: default_secondary_credential_id(),
        }
    }
}

impl CredentialsConfig {
    pub fn refresh_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_buffer_seconds)
    }
}

/// Local object store
#[derive(Debug, Clone, Deserialize)]
pub struct PrimaryConfig {
    #[serde(default = "default_primary_root")]
    pub root: PathBuf,
    /// Hard per-object ceiling
    #[serde(default = "default_max_object_bytes")]
    pub max_object_bytes: u64,
}

fn default_primary_root() -> PathBuf {
    PathBuf::from("data/objects")
}

fn default_max_object_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            root: default_primary_root(),
            max_object_bytes: default_max_object_bytes(),
        }
    }
}

/// Third-party document store and its token endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct SecondaryBackendConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_upload_base_url")]
    pub upload_base_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_api_base_url() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_upload_base_url() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    60
}

impl Default for SecondaryBackendConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            upload_base_url: default_upload_base_url(),
            token_url: default_token_url(),
            folder_id: None,
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl SecondaryBackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Adapter settings, authorized by `credential_id`.
    pub fn adapter_config(&self, credential_id: &str) -> SecondaryConfig {
        SecondaryConfig {
            api_base_url: self.api_base_url.clone(),
            upload_base_url: self.upload_base_url.clone(),
            folder_id: self.folder_id.clone(),
            credential_id: credential_id.to_string(),
            request_timeout: self.request_timeout(),
        }
    }
}

/// HTTP surface
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:3100".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

/// Path from `DOCSTORE_CONFIG`, or `docstore.toml`.
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration from TOML file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<DocStoreConfig> {
    if !path.exists() {
        return Ok(DocStoreConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: DocStoreConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;

    if config.routing.spool_cap_bytes < config.routing.threshold_bytes {
        anyhow::bail!(
            "routing.spool_cap_bytes ({}) must not be below routing.threshold_bytes ({})",
            config.routing.spool_cap_bytes,
            config.routing.threshold_bytes
        );
    }
    if config.credentials.refresh_buffer_seconds < 0 {
        anyhow::bail!("credentials.refresh_buffer_seconds must not be negative");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendId;

    #[test]
    fn test_default_config() {
        let config = DocStoreConfig::default();
        assert_eq!(config.routing.threshold_bytes, 52_428_800);
        assert_eq!(config.routing.spool_cap_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.credentials.refresh_buffer_seconds, 300);
        assert_eq!(config.credentials.secondary_credential_id, "secondary");
        assert_eq!(config.primary.max_object_bytes, 100 * 1024 * 1024);
        assert_eq!(config.secondary.request_timeout_seconds, 60);
        assert_eq!(config.api.bind_address, "0.0.0.0:3100");
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [routing]
            threshold_bytes = 1048576
            always_secondary_types = ["model/step"]
            spool_dir = "/var/spool/docstore"

            [credentials]
            database_path = "/var/lib/docstore/docstore.db"
            refresh_buffer_seconds = 120

            [secondary]
            api_base_url = "http://localhost:9000/drive/v3"
            folder_id = "0AExampleFolder"

            [api]
            bind_address = "127.0.0.1:8080"
        "#;

        let config: DocStoreConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.routing.threshold_bytes, 1_048_576);
        assert_eq!(config.routing.spool_dir(), PathBuf::from("/var/spool/docstore"));
        assert_eq!(config.credentials.refresh_buffer(), chrono::Duration::seconds(120));
        assert_eq!(config.credentials.secondary_credential_id, "secondary");
        assert_eq!(config.secondary.folder_id.as_deref(), Some("0AExampleFolder"));
        assert_eq!(
            config.secondary.upload_base_url,
            "https://www.googleapis.com/upload/drive/v3"
        );
        assert_eq!(config.api.bind_address, "127.0.0.1:8080");

        let rules = config.routing.rules();
        assert_eq!(rules.classify(10, "model/step"), BackendId::Secondary);
        assert_eq!(rules.classify(10, "image/vnd.adobe.photoshop"), BackendId::Primary);
        assert_eq!(rules.classify(1_048_576, "text/plain"), BackendId::Secondary);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.routing.threshold_bytes, DEFAULT_THRESHOLD_BYTES);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docstore.toml");

        std::fs::write(&path, "[routing]\nthreshold_bytes = \"lots\"\n").unwrap();
        assert!(load_config(&path).is_err());

        std::fs::write(&path, "[routing]\nthreshold_bytes = 100\nspool_cap_bytes = 10\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("spool_cap_bytes"));
    }
}
