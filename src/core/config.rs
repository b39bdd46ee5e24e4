//! Per-project configuration loaded from `.gatehouse/config.toml`.
//!
//! Every key is optional. A missing file yields the defaults; a file that
//! fails to parse is a validation error rather than being silently ignored.

use crate::core::error::GatehouseError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Upper bound on `store.max_busy_retries`.
pub const MAX_BUSY_RETRIES: u32 = 32;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub router: RouterConfig,
    pub proofs: ProofConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite busy_timeout applied to every connection.
    pub busy_timeout_secs: u32,
    /// Backoff retries for SQLITE_BUSY before reporting the store unavailable.
    pub max_busy_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_secs: 5,
            max_busy_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    pub required_weight: f64,
    pub preferred_weight: f64,
    pub spec_weight: f64,
    pub max_alternatives: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            required_weight: 10.0,
            preferred_weight: 5.0,
            spec_weight: 3.0,
            max_alternatives: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProofConfig {
    /// Upper bound on hashing a single proof file.
    pub hash_timeout_secs: u64,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            hash_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or `gatehouse=debug`.
    pub filter: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Load config from `<state_dir>/config.toml`.
pub fn load_config(state_dir: &Path) -> Result<Config, GatehouseError> {
    let path = state_dir.join(CONFIG_FILE_NAME);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&raw).map_err(|e| {
        GatehouseError::ValidationError(format!("invalid config {}: {}", path.display(), e))
    })?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), GatehouseError> {
        let weights = [
            self.router.required_weight,
            self.router.preferred_weight,
            self.router.spec_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(GatehouseError::ValidationError(
                "router weights must be finite and non-negative".to_string(),
            ));
        }
        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(GatehouseError::ValidationError(format!(
                    "logging.format must be 'text' or 'json', got '{}'",
                    other
                )));
            }
        }
        if self.store.max_busy_retries > MAX_BUSY_RETRIES {
            return Err(GatehouseError::ValidationError(format!(
                "store.max_busy_retries must be at most {}, got {}",
                MAX_BUSY_RETRIES, self.store.max_busy_retries
            )));
        }
        if self.proofs.hash_timeout_secs == 0 {
            return Err(GatehouseError::ValidationError(
                "proofs.hash_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = tempdir().unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.router.max_alternatives, 3);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let tmp = tempdir().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[router]\nspec_weight = 7.5\n\n[logging]\nformat = \"json\"\n",
        )
        .unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.router.spec_weight, 7.5);
        assert_eq!(config.router.required_weight, 10.0);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.store.busy_timeout_secs, 5);
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE_NAME), "[router\nbroken").unwrap();
        assert!(matches!(
            load_config(tmp.path()),
            Err(GatehouseError::ValidationError(_))
        ));
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        let tmp = tempdir().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[logging]\nformat = \"xml\"\n",
        )
        .unwrap();
        assert!(load_config(tmp.path()).is_err());
    }

    #[test]
    fn test_excessive_busy_retries_are_rejected() {
        let tmp = tempdir().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[store]\nmax_busy_retries = 65\n",
        )
        .unwrap();
        assert!(matches!(
            load_config(tmp.path()),
            Err(GatehouseError::ValidationError(_))
        ));

        fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            format!("[store]\nmax_busy_retries = {}\n", MAX_BUSY_RETRIES),
        )
        .unwrap();
        assert_eq!(
            load_config(tmp.path()).unwrap().store.max_busy_retries,
            MAX_BUSY_RETRIES
        );
    }
}
