//! Per-project store handle.
//!
//! A `Store` is opened for one project root and passed explicitly into every
//! operation. Each handle owns its own write pool, so stores for different
//! projects never contend with each other and there is no process-wide state.

use crate::core::config::{self, Config};
use crate::core::db;
use crate::core::error::GatehouseError;
use crate::core::model::{EventType, GateId, NewEvent};
use crate::core::pool::SqlitePool;
use crate::core::schemas;
use crate::core::time::now_ms;
use crate::core::truth;
use rusqlite::{Connection, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Handle to one project's truth store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the project root (the directory proofs and file
    /// validators are resolved against).
    pub project_root: PathBuf,
    /// `<project_root>/.gatehouse`
    pub state_dir: PathBuf,
    pool: Arc<SqlitePool>,
    config: Arc<Config>,
}

impl Store {
    /// Open (creating if needed) the store for `project_root`, loading
    /// `.gatehouse/config.toml` when present.
    pub fn open(project_root: &Path) -> Result<Self, GatehouseError> {
        let state_dir = project_root.join(schemas::STATE_DIR_NAME);
        fs::create_dir_all(&state_dir).map_err(|e| {
            GatehouseError::StoreUnavailable(format!(
                "cannot create state dir {}: {}",
                state_dir.display(),
                e
            ))
        })?;
        let config = config::load_config(&state_dir)?;
        Self::open_with_config(project_root, config)
    }

    pub fn open_with_config(project_root: &Path, config: Config) -> Result<Self, GatehouseError> {
        config.validate()?;
        let project_root = project_root
            .canonicalize()
            .unwrap_or_else(|_| project_root.to_path_buf());
        let state_dir = project_root.join(schemas::STATE_DIR_NAME);
        fs::create_dir_all(&state_dir).map_err(|e| {
            GatehouseError::StoreUnavailable(format!(
                "cannot create state dir {}: {}",
                state_dir.display(),
                e
            ))
        })?;

        let db_path = state_dir.join(schemas::TRUTH_DB_NAME);
        let pool = SqlitePool::new(
            &db_path,
            config.store.busy_timeout_secs,
            config.store.max_busy_retries,
        );
        let store = Self {
            project_root,
            state_dir,
            pool: Arc::new(pool),
            config: Arc::new(config),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), GatehouseError> {
        self.with_tx(|tx| {
            db::ensure_schema(tx)?;
            let ts = now_ms();
            let mut seeded = 0usize;
            for gate in GateId::ALL {
                seeded += tx.execute(
                    "INSERT OR IGNORE INTO gates(id, status, updated_at) VALUES(?1, 'pending', ?2)",
                    rusqlite::params![gate, ts],
                )?;
            }
            if seeded > 0 {
                truth::append_event(
                    tx,
                    NewEvent::new(
                        EventType::ProjectInitialized,
                        "gatehouse",
                        format!("Truth store initialized with {} gates", seeded),
                    )
                    .details(serde_json::json!({
                        "project_root": self.project_root.to_string_lossy(),
                    })),
                )?;
                info!(project = %self.project_root.display(), "truth store initialized");
            }
            Ok(())
        })?;
        debug!(db = %self.db_path().display(), "truth store open");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    /// One atomic read-check-write unit. See [`SqlitePool::with_write`].
    pub fn with_tx<F, R>(&self, f: F) -> Result<R, GatehouseError>
    where
        F: FnMut(&Transaction<'_>) -> Result<R, GatehouseError>,
    {
        self.pool.with_write(f)
    }

    pub fn with_read<F, R>(&self, f: F) -> Result<R, GatehouseError>
    where
        F: FnOnce(&Connection) -> Result<R, GatehouseError>,
    {
        self.pool.with_read(f)
    }

    /// Resolve a possibly-relative path against the project root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.project_root.join(p)
        }
    }
}
