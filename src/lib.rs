// Error taxonomy shared by every layer
pub mod error;

// Encrypted OAuth credentials and single-flight refresh
pub mod credentials;

// Storage adapter contract and the primary/secondary backends
pub mod storage;

// Size- and type-based placement
pub mod router;

// Document rows and the upload/download service
pub mod documents;

// TOML configuration
pub mod config;

// HTTP API
pub mod api;

pub use error::{Error, Result};
