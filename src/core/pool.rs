//! SQLite access with read/write separation and busy retry.
//!
//! - Writes are serialized through a per-database mutex and run inside a single
//!   `BEGIN IMMEDIATE` transaction, so a check-then-act sequence cannot interleave
//!   with another writer in this process or any other process.
//! - Reads open a fresh connection without the mutex (WAL allows concurrent readers).
//!
//! Connections are opened fresh for each operation rather than cached, which keeps
//! the pool free of WAL/SHM handle sharing when child processes touch the same file.

use crate::core::db;
use crate::core::error::GatehouseError;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 50;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 2_000;

/// Write-serializing connection source for one database file.
#[derive(Debug)]
pub struct SqlitePool {
    db_path: PathBuf,
    write_lock: Mutex<()>,
    busy_timeout_secs: u32,
    max_busy_retries: u32,
}

impl SqlitePool {
    pub fn new(db_path: &Path, busy_timeout_secs: u32, max_busy_retries: u32) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            write_lock: Mutex::new(()),
            busy_timeout_secs,
            max_busy_retries,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, GatehouseError> {
        db::db_connect(&self.db_path.to_string_lossy(), self.busy_timeout_secs)
    }

    /// Run `f` inside one immediate transaction. Commits on `Ok`, rolls back on `Err`.
    ///
    /// The closure may be invoked more than once when SQLite reports the database
    /// busy; it must not have side effects outside the transaction.
    pub fn with_write<F, R>(&self, mut f: F) -> Result<R, GatehouseError>
    where
        F: FnMut(&Transaction<'_>) -> Result<R, GatehouseError>,
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| GatehouseError::StoreUnavailable("write lock poisoned".to_string()))?;

        retry_on_busy(self.max_busy_retries, || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Run `f` with a fresh read connection (no write serialization).
    pub fn with_read<F, R>(&self, f: F) -> Result<R, GatehouseError>
    where
        F: FnOnce(&Connection) -> Result<R, GatehouseError>,
    {
        let conn = self.connect()?;
        f(&conn)
    }
}

/// Retry a closure on `SQLITE_BUSY` / `SQLITE_LOCKED` with exponential backoff.
/// Exhausting the budget is reported as `StoreUnavailable`.
fn retry_on_busy<F, R>(max_retries: u32, mut f: F) -> Result<R, GatehouseError>
where
    F: FnMut() -> Result<R, GatehouseError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_error(&e) => {
                if attempt >= max_retries {
                    return Err(GatehouseError::StoreUnavailable(format!(
                        "database busy after {} retries: {}",
                        attempt, e
                    )));
                }
                attempt += 1;
                let delay_ms = backoff_delay_ms(attempt);
                warn!(attempt, delay_ms, "truth store busy, backing off");
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Delay before retry `attempt` (1-based): doubles from the base, capped at the max.
fn backoff_delay_ms(attempt: u32) -> u64 {
    attempt
        .checked_sub(1)
        .and_then(|exp| 2u64.checked_pow(exp))
        .and_then(|factor| BASE_DELAY_MS.checked_mul(factor))
        .map_or(MAX_DELAY_MS, |ms| ms.min(MAX_DELAY_MS))
}

/// Check if an error is a SQLite busy/locked error that is retryable.
fn is_busy_error(err: &GatehouseError) -> bool {
    match err {
        GatehouseError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
