//! Typed accessors over the truth store tables.
//!
//! Functions taking `&Connection` are the building blocks that subsystems
//! compose inside one `Store::with_tx` transaction. They enforce the
//! cross-entity invariants (legal task transitions, one task per worker,
//! append-only events) regardless of which subsystem calls them, so a caller
//! that skipped its own precondition check still cannot corrupt state.
//!
//! `impl Store` at the bottom exposes the read-only accessors the CRUD and
//! dashboard consumers use.

use crate::core::error::GatehouseError;
use crate::core::model::{
    EventLogEntry, EventType, Gate, GateId, GateStatus, MAX_RETRIES, NewEvent,
    Priority, ProofArtifact, ProofType, Task, TaskError, TaskOutput, TaskStatus, Worker,
    WorkerCategory, WorkerStatus,
};
use crate::core::store::Store;
use crate::core::time::now_ms;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

const TASK_COLUMNS: &str = "id, task_type, priority, worker_category, description, dependencies, \
    gate_dependency, spec_refs, story_refs, file_refs, status, assigned_worker, retry_count, \
    created_at, started_at, completed_at, output, error";

const WORKER_COLUMNS: &str = "id, category, capabilities, spec_consumption, status, current_task, \
    tasks_completed, error_count, average_task_duration_ms, registered_at, updated_at";

const PROOF_COLUMNS: &str = "id, gate, proof_type, file_path, file_hash, content_summary, \
    pass_fail, verified, metrics, created_by, created_at";

const EVENT_COLUMNS: &str =
    "id, event_type, actor, summary, details, related_task_id, related_gate, ts";

fn json_text<T: Serialize>(value: &T) -> Result<String, GatehouseError> {
    Ok(serde_json::to_string(value)?)
}

fn json_column<T: for<'de> Deserialize<'de>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn optional_json_column<T: for<'de> Deserialize<'de>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

// --- Tasks ---

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        task_type: row.get(1)?,
        priority: row.get(2)?,
        worker_category: row.get(3)?,
        description: row.get(4)?,
        dependencies: json_column(row, 5)?,
        gate_dependency: row.get(6)?,
        spec_refs: json_column(row, 7)?,
        story_refs: json_column(row, 8)?,
        file_refs: json_column(row, 9)?,
        status: row.get(10)?,
        assigned_worker: row.get(11)?,
        retry_count: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        completed_at: row.get(15)?,
        output: optional_json_column(row, 16)?,
        error: optional_json_column(row, 17)?,
    })
}

/// Filters for task listing. `None` fields do not constrain.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub worker_category: Option<WorkerCategory>,
    pub priority: Option<Priority>,
    pub gate_dependency: Option<GateId>,
    pub assigned_worker: Option<String>,
    pub limit: Option<i64>,
}

pub fn insert_task(conn: &Connection, task: &Task) -> Result<(), GatehouseError> {
    let exists: bool = conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", [&task.id], |_| Ok(true))
        .optional()?
        .unwrap_or(false);
    if exists {
        return Err(GatehouseError::ValidationError(format!(
            "task '{}' already exists",
            task.id
        )));
    }
    conn.execute(
        &format!(
            "INSERT INTO tasks({}, priority_rank) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            TASK_COLUMNS
        ),
        params![
            task.id,
            task.task_type,
            task.priority,
            task.worker_category,
            task.description,
            json_text(&task.dependencies)?,
            task.gate_dependency,
            json_text(&task.spec_refs)?,
            json_text(&task.story_refs)?,
            json_text(&task.file_refs)?,
            task.status,
            task.assigned_worker,
            task.retry_count,
            task.created_at,
            task.started_at,
            task.completed_at,
            task.output.as_ref().map(json_text).transpose()?,
            task.error.as_ref().map(json_text).transpose()?,
            task.priority.rank(),
        ],
    )?;
    Ok(())
}

pub fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>, GatehouseError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            [id],
            task_from_row,
        )
        .optional()?)
}

pub fn require_task(conn: &Connection, id: &str) -> Result<Task, GatehouseError> {
    get_task(conn, id)?.ok_or_else(|| GatehouseError::NotFound(format!("task '{}'", id)))
}

/// Tasks matching `filter`, in dequeue order (priority, then creation order).
pub fn list_tasks(conn: &Connection, filter: &TaskFilter) -> Result<Vec<Task>, GatehouseError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(s) = filter.status {
        clauses.push("status = ?");
        values.push(Box::new(s));
    }
    if let Some(c) = filter.worker_category {
        clauses.push("worker_category = ?");
        values.push(Box::new(c));
    }
    if let Some(p) = filter.priority {
        clauses.push("priority = ?");
        values.push(Box::new(p));
    }
    if let Some(g) = filter.gate_dependency {
        clauses.push("gate_dependency = ?");
        values.push(Box::new(g));
    }
    if let Some(w) = &filter.assigned_worker {
        clauses.push("assigned_worker = ?");
        values.push(Box::new(w.clone()));
    }
    let mut sql = format!("SELECT {} FROM tasks", TASK_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY priority_rank ASC, seq ASC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit.max(0)));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), task_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Task statuses for a set of ids; ids with no row are absent from the map.
pub fn task_statuses(
    conn: &Connection,
    ids: &[String],
) -> Result<std::collections::HashMap<String, TaskStatus>, GatehouseError> {
    let mut out = std::collections::HashMap::new();
    let mut stmt = conn.prepare("SELECT status FROM tasks WHERE id = ?1")?;
    for id in ids {
        if let Some(status) = stmt
            .query_row([id], |row| row.get::<_, TaskStatus>(0))
            .optional()?
        {
            out.insert(id.clone(), status);
        }
    }
    Ok(out)
}

fn check_transition(task: &Task, next: TaskStatus) -> Result<(), GatehouseError> {
    if task.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(GatehouseError::ValidationError(format!(
            "illegal transition for task '{}': {} -> {}",
            task.id, task.status, next
        )))
    }
}

/// `queued -> in_progress`, binding the task to `worker_id`.
pub fn mark_task_started(
    conn: &Connection,
    task: &Task,
    worker_id: &str,
    ts: i64,
) -> Result<(), GatehouseError> {
    check_transition(task, TaskStatus::InProgress)?;
    conn.execute(
        "UPDATE tasks SET status = 'in_progress', assigned_worker = ?1, started_at = ?2 WHERE id = ?3",
        params![worker_id, ts, task.id],
    )?;
    Ok(())
}

/// `in_progress -> complete | failed`.
pub fn mark_task_finished(
    conn: &Connection,
    task: &Task,
    status: TaskStatus,
    output: Option<&TaskOutput>,
    error: Option<&TaskError>,
    ts: i64,
) -> Result<(), GatehouseError> {
    if !matches!(status, TaskStatus::Complete | TaskStatus::Failed) {
        return Err(GatehouseError::ValidationError(format!(
            "finish status must be complete or failed, got {}",
            status
        )));
    }
    check_transition(task, status)?;
    conn.execute(
        "UPDATE tasks SET status = ?1, completed_at = ?2, output = ?3, error = ?4 WHERE id = ?5",
        params![
            status,
            ts,
            output.map(json_text).transpose()?,
            error.map(json_text).transpose()?,
            task.id
        ],
    )?;
    Ok(())
}

/// `failed -> queued`, consuming one retry.
pub fn requeue_task(conn: &Connection, task: &Task) -> Result<i64, GatehouseError> {
    check_transition(task, TaskStatus::Queued)?;
    if task.retry_count >= MAX_RETRIES {
        return Err(GatehouseError::ValidationError(format!(
            "task '{}' has exhausted its {} retries",
            task.id, MAX_RETRIES
        )));
    }
    let next = task.retry_count + 1;
    conn.execute(
        "UPDATE tasks SET status = 'queued', retry_count = ?1, assigned_worker = NULL,
         started_at = NULL, completed_at = NULL, output = NULL, error = NULL WHERE id = ?2",
        params![next, task.id],
    )?;
    Ok(next)
}

/// `queued -> cancelled`.
pub fn mark_task_cancelled(conn: &Connection, task: &Task, ts: i64) -> Result<(), GatehouseError> {
    check_transition(task, TaskStatus::Cancelled)?;
    conn.execute(
        "UPDATE tasks SET status = 'cancelled', completed_at = ?1 WHERE id = ?2",
        params![ts, task.id],
    )?;
    Ok(())
}

// --- Workers ---

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<Worker> {
    Ok(Worker {
        id: row.get(0)?,
        category: row.get(1)?,
        capabilities: json_column(row, 2)?,
        spec_consumption: json_column(row, 3)?,
        status: row.get(4)?,
        current_task: row.get(5)?,
        tasks_completed: row.get(6)?,
        error_count: row.get(7)?,
        average_task_duration_ms: row.get(8)?,
        registered_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub fn insert_worker(conn: &Connection, worker: &Worker) -> Result<(), GatehouseError> {
    conn.execute(
        &format!(
            "INSERT INTO workers({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            WORKER_COLUMNS
        ),
        params![
            worker.id,
            worker.category,
            json_text(&worker.capabilities)?,
            json_text(&worker.spec_consumption)?,
            worker.status,
            worker.current_task,
            worker.tasks_completed,
            worker.error_count,
            worker.average_task_duration_ms,
            worker.registered_at,
            worker.updated_at,
        ],
    )?;
    Ok(())
}

/// Re-registration keeps counters and any current assignment; only the
/// declared profile changes.
pub fn update_worker_profile(
    conn: &Connection,
    id: &str,
    category: WorkerCategory,
    capabilities: &[String],
    spec_consumption: &[String],
    ts: i64,
) -> Result<(), GatehouseError> {
    conn.execute(
        "UPDATE workers SET category = ?1, capabilities = ?2, spec_consumption = ?3, updated_at = ?4
         WHERE id = ?5",
        params![
            category,
            json_text(&capabilities)?,
            json_text(&spec_consumption)?,
            ts,
            id
        ],
    )?;
    Ok(())
}

pub fn get_worker(conn: &Connection, id: &str) -> Result<Option<Worker>, GatehouseError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM workers WHERE id = ?1", WORKER_COLUMNS),
            [id],
            worker_from_row,
        )
        .optional()?)
}

pub fn require_worker(conn: &Connection, id: &str) -> Result<Worker, GatehouseError> {
    get_worker(conn, id)?.ok_or_else(|| GatehouseError::NotFound(format!("worker '{}'", id)))
}

pub fn list_workers(
    conn: &Connection,
    status: Option<WorkerStatus>,
    category: Option<WorkerCategory>,
) -> Result<Vec<Worker>, GatehouseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM workers
         WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR category = ?2)
         ORDER BY registered_at ASC, id ASC",
        WORKER_COLUMNS
    ))?;
    let rows = stmt.query_map(params![status, category], worker_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn set_worker_status(
    conn: &Connection,
    id: &str,
    status: WorkerStatus,
    ts: i64,
) -> Result<(), GatehouseError> {
    let worker = require_worker(conn, id)?;
    if worker.current_task.is_some() && status != WorkerStatus::Active {
        return Err(GatehouseError::ValidationError(format!(
            "worker '{}' holds task '{}'; complete it before changing status to {}",
            id,
            worker.current_task.unwrap_or_default(),
            status
        )));
    }
    conn.execute(
        "UPDATE workers SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, ts, id],
    )?;
    Ok(())
}

/// Bind a task to a worker. A worker holds at most one task.
pub fn assign_worker(
    conn: &Connection,
    worker_id: &str,
    task_id: &str,
    ts: i64,
) -> Result<(), GatehouseError> {
    let changed = conn.execute(
        "UPDATE workers SET current_task = ?1, status = 'active', updated_at = ?2
         WHERE id = ?3 AND current_task IS NULL",
        params![task_id, ts, worker_id],
    )?;
    if changed == 0 {
        let worker = require_worker(conn, worker_id)?;
        return Err(GatehouseError::ValidationError(format!(
            "worker '{}' already holds task '{}'",
            worker_id,
            worker.current_task.unwrap_or_default()
        )));
    }
    Ok(())
}

/// Clear a worker's assignment and fold the finished task into its stats.
pub fn release_worker(
    conn: &Connection,
    worker_id: &str,
    succeeded: bool,
    duration_ms: Option<i64>,
    ts: i64,
) -> Result<(), GatehouseError> {
    let worker = require_worker(conn, worker_id)?;
    let (completed, errors) = if succeeded {
        (worker.tasks_completed + 1, worker.error_count)
    } else {
        (worker.tasks_completed, worker.error_count + 1)
    };
    let avg = match (succeeded, duration_ms) {
        (true, Some(d)) => {
            let n = completed as f64;
            worker.average_task_duration_ms + (d as f64 - worker.average_task_duration_ms) / n
        }
        _ => worker.average_task_duration_ms,
    };
    conn.execute(
        "UPDATE workers SET current_task = NULL, status = 'idle', tasks_completed = ?1,
         error_count = ?2, average_task_duration_ms = ?3, updated_at = ?4 WHERE id = ?5",
        params![completed, errors, avg, ts, worker_id],
    )?;
    Ok(())
}

// --- Gates ---

fn gate_from_row(row: &Row<'_>) -> rusqlite::Result<Gate> {
    Ok(Gate {
        id: row.get(0)?,
        status: row.get(1)?,
        approved_by: row.get(2)?,
        approved_at: row.get(3)?,
        rejection_reason: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

pub fn get_gate(conn: &Connection, id: GateId) -> Result<Gate, GatehouseError> {
    conn.query_row(
        "SELECT id, status, approved_by, approved_at, rejection_reason, updated_at
         FROM gates WHERE id = ?1",
        [id],
        gate_from_row,
    )
    .optional()?
    .ok_or_else(|| GatehouseError::NotFound(format!("gate '{}'", id)))
}

pub fn list_gates(conn: &Connection) -> Result<Vec<Gate>, GatehouseError> {
    let mut stmt = conn.prepare(
        "SELECT id, status, approved_by, approved_at, rejection_reason, updated_at FROM gates",
    )?;
    let rows = stmt.query_map([], gate_from_row)?;
    let mut gates = rows.collect::<Result<Vec<_>, _>>()?;
    gates.sort_by_key(|g| g.id);
    Ok(gates)
}

pub fn set_gate_status(
    conn: &Connection,
    id: GateId,
    status: GateStatus,
    actor: Option<&str>,
    reason: Option<&str>,
    ts: i64,
) -> Result<(), GatehouseError> {
    match status {
        GateStatus::Approved => conn.execute(
            "UPDATE gates SET status = 'approved', approved_by = ?1, approved_at = ?2,
             rejection_reason = NULL, updated_at = ?2 WHERE id = ?3",
            params![actor, ts, id],
        )?,
        _ => conn.execute(
            "UPDATE gates SET status = ?1, rejection_reason = ?2, updated_at = ?3 WHERE id = ?4",
            params![status, reason, ts, id],
        )?,
    };
    Ok(())
}

// --- Proof artifacts ---

fn proof_from_row(row: &Row<'_>) -> rusqlite::Result<ProofArtifact> {
    Ok(ProofArtifact {
        id: row.get(0)?,
        gate: row.get(1)?,
        proof_type: row.get(2)?,
        file_path: row.get(3)?,
        file_hash: row.get(4)?,
        content_summary: row.get(5)?,
        pass_fail: row.get(6)?,
        verified: row.get::<_, i64>(7)? != 0,
        metrics: optional_json_column(row, 8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub fn insert_proof(conn: &Connection, proof: &ProofArtifact) -> Result<(), GatehouseError> {
    conn.execute(
        &format!(
            "INSERT INTO proof_artifacts({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            PROOF_COLUMNS
        ),
        params![
            proof.id,
            proof.gate,
            proof.proof_type,
            proof.file_path,
            proof.file_hash,
            proof.content_summary,
            proof.pass_fail,
            proof.verified as i64,
            proof.metrics.as_ref().map(json_text).transpose()?,
            proof.created_by,
            proof.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_proof(conn: &Connection, id: &str) -> Result<Option<ProofArtifact>, GatehouseError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM proof_artifacts WHERE id = ?1", PROOF_COLUMNS),
            [id],
            proof_from_row,
        )
        .optional()?)
}

/// Proofs in submission order, optionally for one gate.
pub fn list_proofs(
    conn: &Connection,
    gate: Option<GateId>,
) -> Result<Vec<ProofArtifact>, GatehouseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM proof_artifacts WHERE (?1 IS NULL OR gate = ?1)
         ORDER BY created_at ASC, rowid ASC",
        PROOF_COLUMNS
    ))?;
    let rows = stmt.query_map([gate], proof_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn set_proof_verified(conn: &Connection, id: &str, verified: bool) -> Result<(), GatehouseError> {
    conn.execute(
        "UPDATE proof_artifacts SET verified = ?1 WHERE id = ?2",
        params![verified as i64, id],
    )?;
    Ok(())
}

/// Latest submission per proof type for a gate. Later submissions supersede
/// earlier ones, so a failing proof can be fixed by resubmitting.
pub fn latest_proofs_by_type(
    conn: &Connection,
    gate: GateId,
) -> Result<std::collections::BTreeMap<ProofType, ProofArtifact>, GatehouseError> {
    let mut latest = std::collections::BTreeMap::new();
    for proof in list_proofs(conn, Some(gate))? {
        latest.insert(proof.proof_type, proof);
    }
    Ok(latest)
}

// --- Events ---

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventLogEntry> {
    Ok(EventLogEntry {
        id: row.get(0)?,
        event_type: row.get(1)?,
        actor: row.get(2)?,
        summary: row.get(3)?,
        details: json_column(row, 4)?,
        related_task_id: row.get(5)?,
        related_gate: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

/// Append one entry. The log has no update or delete path; triggers in the
/// schema reject both.
pub fn append_event(conn: &Connection, event: NewEvent) -> Result<EventLogEntry, GatehouseError> {
    if event.actor.trim().is_empty() {
        return Err(GatehouseError::ValidationError(
            "event actor cannot be empty".to_string(),
        ));
    }
    let ts = now_ms();
    conn.execute(
        "INSERT INTO events(event_type, actor, summary, details, related_task_id, related_gate, ts)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_type,
            event.actor,
            event.summary,
            json_text(&event.details)?,
            event.related_task_id,
            event.related_gate,
            ts
        ],
    )?;
    let id = conn.last_insert_rowid();
    Ok(EventLogEntry {
        id,
        event_type: event.event_type,
        actor: event.actor,
        summary: event.summary,
        details: event.details,
        related_task_id: event.related_task_id,
        related_gate: event.related_gate,
        timestamp: ts,
    })
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub actor: Option<String>,
    pub related_task_id: Option<String>,
    pub related_gate: Option<GateId>,
    /// Inclusive lower bound on the event timestamp (epoch ms).
    pub since: Option<i64>,
    pub limit: Option<i64>,
}

/// Events matching `filter` in append order.
pub fn query_events(
    conn: &Connection,
    filter: &EventFilter,
) -> Result<Vec<EventLogEntry>, GatehouseError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(t) = filter.event_type {
        clauses.push("event_type = ?");
        values.push(Box::new(t));
    }
    if let Some(a) = &filter.actor {
        clauses.push("actor = ?");
        values.push(Box::new(a.clone()));
    }
    if let Some(t) = &filter.related_task_id {
        clauses.push("related_task_id = ?");
        values.push(Box::new(t.clone()));
    }
    if let Some(g) = filter.related_gate {
        clauses.push("related_gate = ?");
        values.push(Box::new(g));
    }
    if let Some(s) = filter.since {
        clauses.push("ts >= ?");
        values.push(Box::new(s));
    }
    let mut sql = format!("SELECT {} FROM events", EVENT_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id ASC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit.max(0)));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), event_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn count_events(conn: &Connection) -> Result<i64, GatehouseError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
}

// --- Error history ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub task_id: String,
    pub attempt: i64,
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    pub resolved: bool,
    pub resolution: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

fn error_record_from_row(row: &Row<'_>) -> rusqlite::Result<ErrorRecord> {
    Ok(ErrorRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        attempt: row.get(2)?,
        code: row.get(3)?,
        message: row.get(4)?,
        recoverable: row.get::<_, i64>(5)? != 0,
        resolved: row.get::<_, i64>(6)? != 0,
        resolution: row.get(7)?,
        created_at: row.get(8)?,
        resolved_at: row.get(9)?,
    })
}

const ERROR_COLUMNS: &str =
    "id, task_id, attempt, code, message, recoverable, resolved, resolution, created_at, resolved_at";

pub fn insert_error_record(
    conn: &Connection,
    task_id: &str,
    attempt: i64,
    error: &TaskError,
    ts: i64,
) -> Result<(), GatehouseError> {
    conn.execute(
        "INSERT INTO error_history(task_id, attempt, code, message, recoverable, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            task_id,
            attempt,
            error.code,
            error.message,
            error.recoverable as i64,
            ts
        ],
    )?;
    Ok(())
}

pub fn error_records_for_task(
    conn: &Connection,
    task_id: &str,
) -> Result<Vec<ErrorRecord>, GatehouseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM error_history WHERE task_id = ?1 ORDER BY id ASC",
        ERROR_COLUMNS
    ))?;
    let rows = stmt.query_map([task_id], error_record_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Resolved errors belonging to tasks other than `exclude_task_id`.
pub fn resolved_error_records(
    conn: &Connection,
    exclude_task_id: &str,
) -> Result<Vec<ErrorRecord>, GatehouseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM error_history WHERE resolved = 1 AND task_id != ?1 ORDER BY id DESC",
        ERROR_COLUMNS
    ))?;
    let rows = stmt.query_map([exclude_task_id], error_record_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn resolve_error_records(
    conn: &Connection,
    task_id: &str,
    resolution: &str,
    ts: i64,
) -> Result<usize, GatehouseError> {
    Ok(conn.execute(
        "UPDATE error_history SET resolved = 1, resolution = ?1, resolved_at = ?2
         WHERE task_id = ?3 AND resolved = 0",
        params![resolution, ts, task_id],
    )?)
}

// --- Result cache ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub task_id: String,
    pub output: TaskOutput,
    pub output_hash: String,
    pub cached_at: i64,
}

pub fn cache_result(
    conn: &Connection,
    task_id: &str,
    output: &TaskOutput,
    ts: i64,
) -> Result<String, GatehouseError> {
    use sha2::{Digest, Sha256};
    let body = json_text(output)?;
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    conn.execute(
        "INSERT INTO task_results(task_id, output, output_hash, cached_at) VALUES(?1, ?2, ?3, ?4)
         ON CONFLICT(task_id) DO UPDATE SET output = excluded.output,
         output_hash = excluded.output_hash, cached_at = excluded.cached_at",
        params![task_id, body, hash, ts],
    )?;
    Ok(hash)
}

pub fn get_cached_result(
    conn: &Connection,
    task_id: &str,
) -> Result<Option<CachedResult>, GatehouseError> {
    Ok(conn
        .query_row(
            "SELECT task_id, output, output_hash, cached_at FROM task_results WHERE task_id = ?1",
            [task_id],
            |row| {
                Ok(CachedResult {
                    task_id: row.get(0)?,
                    output: json_column(row, 1)?,
                    output_hash: row.get(2)?,
                    cached_at: row.get(3)?,
                })
            },
        )
        .optional()?)
}

// --- Agent spawns ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpawn {
    pub id: String,
    pub gate: GateId,
    pub role: String,
    pub status: String,
    pub spawned_at: i64,
    pub completed_at: Option<i64>,
}

fn spawn_from_row(row: &Row<'_>) -> rusqlite::Result<AgentSpawn> {
    Ok(AgentSpawn {
        id: row.get(0)?,
        gate: row.get(1)?,
        role: row.get(2)?,
        status: row.get(3)?,
        spawned_at: row.get(4)?,
        completed_at: row.get(5)?,
    })
}

pub fn insert_spawn(conn: &Connection, spawn: &AgentSpawn) -> Result<(), GatehouseError> {
    conn.execute(
        "INSERT INTO agent_spawns(id, gate, role, status, spawned_at, completed_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            spawn.id,
            spawn.gate,
            spawn.role,
            spawn.status,
            spawn.spawned_at,
            spawn.completed_at
        ],
    )?;
    Ok(())
}

pub fn get_spawn(conn: &Connection, id: &str) -> Result<Option<AgentSpawn>, GatehouseError> {
    Ok(conn
        .query_row(
            "SELECT id, gate, role, status, spawned_at, completed_at FROM agent_spawns WHERE id = ?1",
            [id],
            spawn_from_row,
        )
        .optional()?)
}

pub fn complete_spawn(conn: &Connection, id: &str, ts: i64) -> Result<(), GatehouseError> {
    conn.execute(
        "UPDATE agent_spawns SET status = 'completed', completed_at = ?1 WHERE id = ?2",
        params![ts, id],
    )?;
    Ok(())
}

pub fn list_spawns(conn: &Connection, gate: GateId) -> Result<Vec<AgentSpawn>, GatehouseError> {
    let mut stmt = conn.prepare(
        "SELECT id, gate, role, status, spawned_at, completed_at FROM agent_spawns
         WHERE gate = ?1 ORDER BY spawned_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([gate], spawn_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// --- Read API for consumers ---

impl Store {
    pub fn get_task(&self, id: &str) -> Result<Option<Task>, GatehouseError> {
        self.with_read(|conn| get_task(conn, id))
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, GatehouseError> {
        self.with_read(|conn| list_tasks(conn, filter))
    }

    pub fn get_worker(&self, id: &str) -> Result<Option<Worker>, GatehouseError> {
        self.with_read(|conn| get_worker(conn, id))
    }

    pub fn list_workers(
        &self,
        status: Option<WorkerStatus>,
        category: Option<WorkerCategory>,
    ) -> Result<Vec<Worker>, GatehouseError> {
        self.with_read(|conn| list_workers(conn, status, category))
    }

    pub fn get_gate(&self, id: GateId) -> Result<Gate, GatehouseError> {
        self.with_read(|conn| get_gate(conn, id))
    }

    pub fn list_gates(&self) -> Result<Vec<Gate>, GatehouseError> {
        self.with_read(list_gates)
    }

    pub fn get_proof(&self, id: &str) -> Result<Option<ProofArtifact>, GatehouseError> {
        self.with_read(|conn| get_proof(conn, id))
    }

    pub fn list_proofs(&self, gate: Option<GateId>) -> Result<Vec<ProofArtifact>, GatehouseError> {
        self.with_read(|conn| list_proofs(conn, gate))
    }

    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<EventLogEntry>, GatehouseError> {
        self.with_read(|conn| query_events(conn, filter))
    }

    pub fn cached_result(&self, task_id: &str) -> Result<Option<CachedResult>, GatehouseError> {
        self.with_read(|conn| get_cached_result(conn, task_id))
    }

    pub fn error_history(&self, task_id: &str) -> Result<Vec<ErrorRecord>, GatehouseError> {
        self.with_read(|conn| error_records_for_task(conn, task_id))
    }

    /// Raw JSON snapshot of every entity table, for dashboards and debugging.
    pub fn snapshot(&self) -> Result<JsonValue, GatehouseError> {
        self.with_read(|conn| {
            Ok(serde_json::json!({
                "tasks": list_tasks(conn, &TaskFilter::default())?,
                "workers": list_workers(conn, None, None)?,
                "gates": list_gates(conn)?,
                "proof_artifacts": list_proofs(conn, None)?,
                "event_count": count_events(conn)?,
            }))
        })
    }
}
