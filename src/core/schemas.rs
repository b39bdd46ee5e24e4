//! Database schema for the per-project truth store.
//!
//! One SQLite file (`truth.db`) holds every entity table plus the append-only
//! event log. Set-valued columns (dependencies, refs, capabilities) are JSON arrays.

pub const STATE_DIR_NAME: &str = ".gatehouse";
pub const TRUTH_DB_NAME: &str = "truth.db";
pub const PROJECT_TYPE_MARKER: &str = "project_type";

pub const TRUTH_SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const SCHEMA_TASKS: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        task_type TEXT NOT NULL,
        priority TEXT NOT NULL,
        priority_rank INTEGER NOT NULL,
        worker_category TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        dependencies TEXT NOT NULL DEFAULT '[]',
        gate_dependency TEXT,
        spec_refs TEXT NOT NULL DEFAULT '[]',
        story_refs TEXT NOT NULL DEFAULT '[]',
        file_refs TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL,
        assigned_worker TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count BETWEEN 0 AND 3),
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        output TEXT,
        error TEXT
    )
";

pub const SCHEMA_WORKERS: &str = "
    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        category TEXT NOT NULL,
        capabilities TEXT NOT NULL DEFAULT '[]',
        spec_consumption TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL,
        current_task TEXT,
        tasks_completed INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        average_task_duration_ms REAL NOT NULL DEFAULT 0,
        registered_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

pub const SCHEMA_GATES: &str = "
    CREATE TABLE IF NOT EXISTS gates (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        approved_by TEXT,
        approved_at INTEGER,
        rejection_reason TEXT,
        updated_at INTEGER NOT NULL
    )
";

pub const SCHEMA_PROOF_ARTIFACTS: &str = "
    CREATE TABLE IF NOT EXISTS proof_artifacts (
        id TEXT PRIMARY KEY,
        gate TEXT NOT NULL,
        proof_type TEXT NOT NULL,
        file_path TEXT NOT NULL,
        file_hash TEXT NOT NULL,
        content_summary TEXT NOT NULL DEFAULT '',
        pass_fail TEXT NOT NULL,
        verified INTEGER NOT NULL DEFAULT 0,
        metrics TEXT,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY(gate) REFERENCES gates(id)
    )
";

pub const SCHEMA_EVENTS: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type TEXT NOT NULL,
        actor TEXT NOT NULL,
        summary TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT 'null',
        related_task_id TEXT,
        related_gate TEXT,
        ts INTEGER NOT NULL
    )
";

pub const SCHEMA_EVENTS_IMMUTABLE: &str = "
    CREATE TRIGGER IF NOT EXISTS events_no_update BEFORE UPDATE ON events
    BEGIN
        SELECT RAISE(ABORT, 'event log is append-only');
    END;
    CREATE TRIGGER IF NOT EXISTS events_no_delete BEFORE DELETE ON events
    BEGIN
        SELECT RAISE(ABORT, 'event log is append-only');
    END;
";

pub const SCHEMA_ERROR_HISTORY: &str = "
    CREATE TABLE IF NOT EXISTS error_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        code TEXT NOT NULL,
        message TEXT NOT NULL,
        recoverable INTEGER NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolution TEXT,
        created_at INTEGER NOT NULL,
        resolved_at INTEGER
    )
";

pub const SCHEMA_TASK_RESULTS: &str = "
    CREATE TABLE IF NOT EXISTS task_results (
        task_id TEXT PRIMARY KEY,
        output TEXT NOT NULL,
        output_hash TEXT NOT NULL,
        cached_at INTEGER NOT NULL
    )
";

pub const SCHEMA_AGENT_SPAWNS: &str = "
    CREATE TABLE IF NOT EXISTS agent_spawns (
        id TEXT PRIMARY KEY,
        gate TEXT NOT NULL,
        role TEXT NOT NULL,
        status TEXT NOT NULL,
        spawned_at INTEGER NOT NULL,
        completed_at INTEGER
    )
";

pub const SCHEMA_INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS idx_tasks_status_category ON tasks(status, worker_category, priority_rank, seq);
    CREATE INDEX IF NOT EXISTS idx_tasks_gate ON tasks(gate_dependency);
    CREATE INDEX IF NOT EXISTS idx_proofs_gate ON proof_artifacts(gate);
    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
    CREATE INDEX IF NOT EXISTS idx_events_task ON events(related_task_id);
    CREATE INDEX IF NOT EXISTS idx_events_gate ON events(related_gate);
    CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
    CREATE INDEX IF NOT EXISTS idx_error_history_task ON error_history(task_id);
    CREATE INDEX IF NOT EXISTS idx_agent_spawns_gate ON agent_spawns(gate, role);
";

/// Every table statement in creation order.
pub const TRUTH_TABLES: &[&str] = &[
    SCHEMA_TASKS,
    SCHEMA_WORKERS,
    SCHEMA_GATES,
    SCHEMA_PROOF_ARTIFACTS,
    SCHEMA_EVENTS,
    SCHEMA_ERROR_HISTORY,
    SCHEMA_TASK_RESULTS,
    SCHEMA_AGENT_SPAWNS,
];
