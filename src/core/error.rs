use rusqlite;
use std::io;
use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// Precondition failures (task in the wrong status, retries exhausted, worker
/// already busy) are not errors: they come back as `Ok` outcome values that
/// callers branch on. Only malformed input, missing records, and store
/// failures land here.
#[derive(Error, Debug)]
pub enum GatehouseError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl GatehouseError {
    /// Stable machine-readable kind used in RPC error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RusqliteError(_) => "store_error",
            Self::IoError(_) => "io_error",
            Self::JsonError(_) => "invalid_json",
            Self::ConfigError(_) => "invalid_config",
            Self::ValidationError(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Timeout(_) => "timeout",
        }
    }
}
