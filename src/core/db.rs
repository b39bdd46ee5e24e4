use crate::core::error::GatehouseError;
use crate::core::schemas;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::time::Duration;

/// Open a connection with WAL, busy timeout, and foreign keys.
///
/// Failing to open the file at all is reported as `StoreUnavailable`, which
/// callers must not confuse with an ordinary query error.
pub fn db_connect(db_path: &str, busy_timeout_secs: u32) -> Result<Connection, GatehouseError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    let conn = Connection::open_with_flags(db_path, flags).map_err(|e| {
        GatehouseError::StoreUnavailable(format!("cannot open {}: {}", db_path, e))
    })?;
    conn.busy_timeout(Duration::from_secs(u64::from(busy_timeout_secs)))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/// Create tables, indexes and triggers if the stored schema version is behind.
pub fn ensure_schema(conn: &Connection) -> Result<(), GatehouseError> {
    conn.execute_batch(schemas::SCHEMA_META)?;

    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let current_version: u32 = current
        .as_deref()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    if current_version >= schemas::TRUTH_SCHEMA_VERSION {
        return Ok(());
    }

    for table in schemas::TRUTH_TABLES {
        conn.execute_batch(table)?;
    }
    conn.execute_batch(schemas::SCHEMA_INDEXES)?;
    conn.execute_batch(schemas::SCHEMA_EVENTS_IMMUTABLE)?;

    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [schemas::TRUTH_SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}
