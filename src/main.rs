use anyhow::{Context, Result};
use docstore::api::create_app;
use docstore::config::{config_path, load_config};
use docstore::credentials::{
    CredentialManager, CredentialStore, EncryptionService, HttpTokenProvider, OAuthClientConfig,
};
use docstore::documents::{DocumentService, SqliteMetadataRecorder};
use docstore::router::StorageRouter;
use docstore::storage::{PrimaryAdapter, SecondaryAdapter};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|arg| arg == "--generate-key") {
        println!("{}", EncryptionService::generate_key());
        return Ok(());
    }

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docstore=info".into()),
        )
        .init();

    info!("Docstore starting...");

    let path = config_path();
    let config = load_config(&path)?;
    info!(
        config_path = %path.display(),
        threshold_bytes = config.routing.threshold_bytes,
        database_path = %config.credentials.database_path,
        primary_root = %config.primary.root.display(),
        "Configuration loaded"
    );

    // A missing or malformed key stops startup here
    let encryption = Arc::new(
        EncryptionService::from_env()
            .context("DOCSTORE_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?,
    );

    let credential_store = Arc::new(
        CredentialStore::new(&config.credentials.database_path, encryption)
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let oauth = OAuthClientConfig::from_env(config.secondary.token_url.clone());
    if oauth.client_id.is_empty() {
        warn!("DOCSTORE_SECONDARY_CLIENT_ID not set; token refresh will be rejected");
    }
    let provider = Arc::new(
        HttpTokenProvider::new(oauth, config.secondary.request_timeout())
            .context("Failed to initialize token endpoint client")?,
    );

    let credentials = CredentialManager::new(
        credential_store,
        provider,
        config.credentials.refresh_buffer(),
    );

    let primary = Arc::new(
        PrimaryAdapter::new(&config.primary.root, config.primary.max_object_bytes)
            .context("Failed to initialize primary object store")?,
    );
    let secondary = Arc::new(
        SecondaryAdapter::new(
            config
                .secondary
                .adapter_config(&config.credentials.secondary_credential_id),
            credentials.clone(),
        )
        .context("Failed to initialize secondary backend client")?,
    );

    let router = Arc::new(StorageRouter::new(
        config.routing.rules(),
        primary,
        secondary,
        config.routing.spool_dir(),
    ));

    let recorder = Arc::new(
        SqliteMetadataRecorder::new(&config.credentials.database_path)
            .context("Failed to initialize document records")?,
    );
    let documents = DocumentService::new(router, recorder);

    let app = create_app(documents, credentials);
    let listener = tokio::net::TcpListener::bind(&config.api.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.api.bind_address))?;
    info!(bind_address = %config.api.bind_address, "Docstore API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl_c signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("Docstore API server error")?;

    info!("Docstore stopped");
    Ok(())
}
