//! Task queue and scheduler.
//!
//! Lifecycle: `queued -> in_progress -> complete | failed`, with `failed -> queued`
//! only through [`retry`] while the retry budget lasts. Every check-then-act
//! sequence (eligibility + assignment, status check + completion) runs inside a
//! single store transaction, so two workers polling the same project can never
//! receive the same task.

use crate::core::error::GatehouseError;
use crate::core::model::{
    EventType, GateId, GateStatus, MAX_RETRIES, NewEvent, Priority, Task, TaskError, TaskOutput,
    TaskSpec, TaskStatus, TaskType, WorkerCategory, WorkerStatus,
};
use crate::core::store::Store;
use crate::core::time::{is_valid_id, new_id, now_ms};
use crate::core::truth::{self, ErrorRecord, TaskFilter};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, instrument};

/// Why a queued task cannot be dequeued yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    DependencyIncomplete { task_id: String, status: TaskStatus },
    DependencyMissing { task_id: String },
    GateNotApproved { gate: GateId, status: GateStatus },
}

impl BlockReason {
    pub fn describe(&self) -> String {
        match self {
            Self::DependencyIncomplete { task_id, status } => {
                format!("dependency {} is {}", task_id, status)
            }
            Self::DependencyMissing { task_id } => format!("dependency {} does not exist", task_id),
            Self::GateNotApproved { gate, status } => format!("gate {} is {}", gate, status),
        }
    }
}

/// Reasons `task` is not dequeue-eligible; empty means eligible.
pub(crate) fn block_reasons(conn: &Connection, task: &Task) -> Result<Vec<BlockReason>, GatehouseError> {
    let mut reasons = Vec::new();
    let statuses = truth::task_statuses(conn, &task.dependencies)?;
    for dep in &task.dependencies {
        match statuses.get(dep) {
            None => reasons.push(BlockReason::DependencyMissing {
                task_id: dep.clone(),
            }),
            Some(TaskStatus::Complete) => {}
            Some(status) => reasons.push(BlockReason::DependencyIncomplete {
                task_id: dep.clone(),
                status: *status,
            }),
        }
    }
    if let Some(gate) = task.gate_dependency {
        let g = truth::get_gate(conn, gate)?;
        if g.status != GateStatus::Approved {
            reasons.push(BlockReason::GateNotApproved {
                gate,
                status: g.status,
            });
        }
    }
    Ok(reasons)
}

fn normalize_refs(field: &str, refs: &[String]) -> Result<Vec<String>, GatehouseError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for r in refs {
        let trimmed = r.trim();
        if trimmed.is_empty() {
            return Err(GatehouseError::ValidationError(format!(
                "{} entries cannot be empty",
                field
            )));
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

/// Validate a caller-supplied spec into a fresh `queued` task.
pub fn build_task(spec: &TaskSpec, ts: i64) -> Result<Task, GatehouseError> {
    let task_type: TaskType = spec
        .task_type
        .ok_or_else(|| GatehouseError::ValidationError("task type is required".to_string()))?;
    let worker_category: WorkerCategory = spec.worker_category.ok_or_else(|| {
        GatehouseError::ValidationError("worker_category is required".to_string())
    })?;
    let id = match &spec.id {
        Some(id) if is_valid_id(id) => id.clone(),
        Some(id) => {
            return Err(GatehouseError::ValidationError(format!(
                "invalid task id '{}': allowed characters are [A-Za-z0-9_.-]",
                id
            )));
        }
        None => new_id("task"),
    };
    let dependencies = normalize_refs("dependencies", &spec.dependencies)?;
    if let Some(bad) = dependencies.iter().find(|d| !is_valid_id(d)) {
        return Err(GatehouseError::ValidationError(format!(
            "invalid dependency id '{}'",
            bad
        )));
    }
    if dependencies.contains(&id) {
        return Err(GatehouseError::ValidationError(format!(
            "task '{}' cannot depend on itself",
            id
        )));
    }

    Ok(Task {
        id,
        task_type,
        priority: spec.priority.unwrap_or(Priority::Medium),
        worker_category,
        description: spec.description.trim().to_string(),
        dependencies,
        gate_dependency: spec.gate_dependency,
        spec_refs: normalize_refs("spec_refs", &spec.spec_refs)?,
        story_refs: normalize_refs("story_refs", &spec.story_refs)?,
        file_refs: normalize_refs("file_refs", &spec.file_refs)?,
        status: TaskStatus::Queued,
        assigned_worker: None,
        retry_count: 0,
        created_at: ts,
        started_at: None,
        completed_at: None,
        output: None,
        error: None,
    })
}

/// Create a task in `queued` state.
#[instrument(skip(store, spec), fields(task_id = ?spec.id))]
pub fn enqueue(store: &Store, spec: &TaskSpec, actor: &str) -> Result<Task, GatehouseError> {
    let task = build_task(spec, now_ms())?;
    store.with_tx(|tx| {
        truth::insert_task(tx, &task)?;
        truth::append_event(
            tx,
            NewEvent::new(
                EventType::TaskCreated,
                actor,
                format!("Task {} queued ({}, {})", task.id, task.task_type, task.priority),
            )
            .task(&task.id)
            .details(serde_json::json!({
                "type": task.task_type,
                "priority": task.priority,
                "worker_category": task.worker_category,
                "dependencies": task.dependencies,
                "gate_dependency": task.gate_dependency,
                "spec_refs": task.spec_refs,
            })),
        )?;
        Ok(())
    })?;
    info!(task_id = %task.id, priority = %task.priority, "task enqueued");
    Ok(task)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DequeueOutcome {
    Assigned { task: Task },
    /// No eligible task right now. Not an error.
    Empty,
    Rejected { reason: String },
}

/// Why a worker cannot take new work, if it cannot.
fn worker_unavailable(conn: &Connection, worker_id: &str) -> Result<Option<String>, GatehouseError> {
    let worker = truth::require_worker(conn, worker_id)?;
    if let Some(current) = worker.current_task {
        return Ok(Some(format!(
            "worker {} already holds task {}",
            worker_id, current
        )));
    }
    match worker.status {
        WorkerStatus::Idle | WorkerStatus::Active => Ok(None),
        other => Ok(Some(format!("worker {} is {}", worker_id, other))),
    }
}

/// Move `task` to `in_progress` under `worker_id`. Caller has checked eligibility.
pub(crate) fn start_task(
    conn: &Connection,
    task: &Task,
    worker_id: &str,
    ts: i64,
) -> Result<Task, GatehouseError> {
    truth::mark_task_started(conn, task, worker_id, ts)?;
    truth::assign_worker(conn, worker_id, &task.id, ts)?;
    truth::append_event(
        conn,
        NewEvent::new(
            EventType::TaskStarted,
            worker_id,
            format!("Task {} started by {}", task.id, worker_id),
        )
        .task(&task.id)
        .details(serde_json::json!({
            "worker_id": worker_id,
            "wait_ms": ts - task.created_at,
            "attempt": task.retry_count + 1,
        })),
    )?;
    truth::require_task(conn, &task.id)
}

/// Atomically claim the highest-priority eligible task in `category`.
#[instrument(skip(store))]
pub fn dequeue(
    store: &Store,
    worker_id: &str,
    category: WorkerCategory,
) -> Result<DequeueOutcome, GatehouseError> {
    let outcome = store.with_tx(|tx| {
        let worker = truth::require_worker(tx, worker_id)?;
        if worker.category != category {
            return Err(GatehouseError::ValidationError(format!(
                "worker {} is a {} worker, not {}",
                worker_id, worker.category, category
            )));
        }
        if let Some(reason) = worker_unavailable(tx, worker_id)? {
            return Ok(DequeueOutcome::Rejected { reason });
        }
        let candidates = truth::list_tasks(
            tx,
            &TaskFilter {
                status: Some(TaskStatus::Queued),
                worker_category: Some(category),
                ..TaskFilter::default()
            },
        )?;
        for task in candidates {
            if block_reasons(tx, &task)?.is_empty() {
                let started = start_task(tx, &task, worker_id, now_ms())?;
                return Ok(DequeueOutcome::Assigned { task: started });
            }
            debug!(task_id = %task.id, "skipping blocked task");
        }
        Ok(DequeueOutcome::Empty)
    })?;
    if let DequeueOutcome::Assigned { task } = &outcome {
        info!(task_id = %task.id, worker_id, "task dequeued");
    }
    Ok(outcome)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignOutcome {
    Assigned { task: Task },
    Rejected { reason: String },
}

/// Assign a specific task to a specific worker, with the same checks as `dequeue`.
pub fn assign(store: &Store, task_id: &str, worker_id: &str) -> Result<AssignOutcome, GatehouseError> {
    store.with_tx(|tx| {
        let task = truth::require_task(tx, task_id)?;
        let worker = truth::require_worker(tx, worker_id)?;
        if let Some(reason) = worker_unavailable(tx, worker_id)? {
            return Ok(AssignOutcome::Rejected { reason });
        }
        if worker.category != task.worker_category {
            return Ok(AssignOutcome::Rejected {
                reason: format!(
                    "task {} needs a {} worker; {} is {}",
                    task.id, task.worker_category, worker_id, worker.category
                ),
            });
        }
        if task.status != TaskStatus::Queued {
            return Ok(AssignOutcome::Rejected {
                reason: format!("task {} is {}", task.id, task.status),
            });
        }
        let reasons = block_reasons(tx, &task)?;
        if !reasons.is_empty() {
            return Ok(AssignOutcome::Rejected {
                reason: reasons
                    .iter()
                    .map(BlockReason::describe)
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }
        let started = start_task(tx, &task, worker_id, now_ms())?;
        Ok(AssignOutcome::Assigned { task: started })
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompleteOutcome {
    Recorded { task: Task },
    Rejected { reason: String },
}

/// Report the result of an in-progress task.
///
/// `status` must be `complete` (with optional `output`) or `failed` (with `error`).
#[instrument(skip(store, output, error))]
pub fn complete(
    store: &Store,
    task_id: &str,
    worker_id: &str,
    status: TaskStatus,
    output: Option<TaskOutput>,
    error: Option<TaskError>,
) -> Result<CompleteOutcome, GatehouseError> {
    let (output, error) = match status {
        TaskStatus::Complete => (Some(output.unwrap_or_default()), None),
        TaskStatus::Failed => {
            let error = error.ok_or_else(|| {
                GatehouseError::ValidationError("failed completion requires an error".to_string())
            })?;
            (None, Some(error))
        }
        other => {
            return Err(GatehouseError::ValidationError(format!(
                "completion status must be complete or failed, got {}",
                other
            )));
        }
    };

    let outcome = store.with_tx(|tx| {
        let task = truth::require_task(tx, task_id)?;
        if task.status != TaskStatus::InProgress {
            return Ok(CompleteOutcome::Rejected {
                reason: format!("task {} is {}, not in_progress", task_id, task.status),
            });
        }
        if task.assigned_worker.as_deref() != Some(worker_id) {
            return Ok(CompleteOutcome::Rejected {
                reason: format!(
                    "task {} is assigned to {}, not {}",
                    task_id,
                    task.assigned_worker.as_deref().unwrap_or("nobody"),
                    worker_id
                ),
            });
        }

        let ts = now_ms();
        let duration_ms = task.started_at.map(|s| ts - s);
        truth::mark_task_finished(tx, &task, status, output.as_ref(), error.as_ref(), ts)?;
        truth::release_worker(tx, worker_id, status == TaskStatus::Complete, duration_ms, ts)?;

        let event = match (&output, &error) {
            (Some(out), _) => {
                let output_hash = truth::cache_result(tx, task_id, out, ts)?;
                let resolution = out
                    .summary
                    .clone()
                    .unwrap_or_else(|| format!("resolved by attempt {}", task.retry_count + 1));
                let resolved = truth::resolve_error_records(tx, task_id, &resolution, ts)?;
                NewEvent::new(
                    EventType::TaskCompleted,
                    worker_id,
                    format!("Task {} completed by {}", task_id, worker_id),
                )
                .details(serde_json::json!({
                    "duration_ms": duration_ms,
                    "files_created": out.files_created,
                    "files_modified": out.files_modified,
                    "verification": out.verification,
                    "output_hash": output_hash,
                    "errors_resolved": resolved,
                }))
            }
            (None, Some(err)) => {
                truth::insert_error_record(tx, task_id, task.retry_count + 1, err, ts)?;
                NewEvent::new(
                    EventType::TaskFailed,
                    worker_id,
                    format!("Task {} failed: {}", task_id, err.message),
                )
                .details(serde_json::json!({
                    "duration_ms": duration_ms,
                    "code": err.code,
                    "message": err.message,
                    "recoverable": err.recoverable,
                    "retry_count": task.retry_count,
                }))
            }
            (None, None) => {
                return Err(GatehouseError::ValidationError(
                    "completion carries neither output nor error".to_string(),
                ));
            }
        };
        truth::append_event(tx, event.task(task_id))?;
        Ok(CompleteOutcome::Recorded {
            task: truth::require_task(tx, task_id)?,
        })
    })?;
    if let CompleteOutcome::Recorded { task } = &outcome {
        info!(task_id = %task.id, status = %task.status, "task finished");
    }
    Ok(outcome)
}

/// Pluggable similarity test used to enrich retry context with prior fixes.
pub trait ErrorMatcher {
    fn is_similar(&self, current: &ErrorRecord, candidate: &ErrorRecord) -> bool;
}

/// Same error code, or one message contains the other (case-insensitive).
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeOrMessageMatcher;

impl ErrorMatcher for CodeOrMessageMatcher {
    fn is_similar(&self, current: &ErrorRecord, candidate: &ErrorRecord) -> bool {
        if current.code != "UNKNOWN" && current.code == candidate.code {
            return true;
        }
        let a = current.message.trim().to_lowercase();
        let b = candidate.message.trim().to_lowercase();
        !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryContext {
    /// The attempt number the next run will be (1-based).
    pub attempt: i64,
    pub previous_errors: Vec<ErrorRecord>,
    pub similar_resolved_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    Requeued { task: Task, context: RetryContext },
    NotFound { task_id: String },
    NotFailed { status: TaskStatus },
    RetriesExhausted { retry_count: i64 },
}

impl RetryOutcome {
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Requeued { .. } => None,
            Self::NotFound { task_id } => Some(format!("task {} not found", task_id)),
            Self::NotFailed { status } => Some(format!("task is {}, not failed", status)),
            Self::RetriesExhausted { retry_count } => Some(format!(
                "retries exhausted ({} of {})",
                retry_count, MAX_RETRIES
            )),
        }
    }
}

/// Requeue a failed task with the default error matcher.
pub fn retry(store: &Store, task_id: &str, actor: &str) -> Result<RetryOutcome, GatehouseError> {
    retry_with(store, task_id, actor, &CodeOrMessageMatcher)
}

#[instrument(skip(store, matcher))]
pub fn retry_with(
    store: &Store,
    task_id: &str,
    actor: &str,
    matcher: &dyn ErrorMatcher,
) -> Result<RetryOutcome, GatehouseError> {
    store.with_tx(|tx| {
        let Some(task) = truth::get_task(tx, task_id)? else {
            return Ok(RetryOutcome::NotFound {
                task_id: task_id.to_string(),
            });
        };
        if task.status != TaskStatus::Failed {
            return Ok(RetryOutcome::NotFailed {
                status: task.status,
            });
        }
        if task.retry_count >= MAX_RETRIES {
            return Ok(RetryOutcome::RetriesExhausted {
                retry_count: task.retry_count,
            });
        }

        let previous_errors = truth::error_records_for_task(tx, task_id)?;
        let mut similar = Vec::new();
        if let Some(latest) = previous_errors.last() {
            for candidate in truth::resolved_error_records(tx, task_id)? {
                if matcher.is_similar(latest, &candidate) {
                    similar.push(candidate);
                }
            }
        }

        let attempt = truth::requeue_task(tx, &task)?;
        truth::append_event(
            tx,
            NewEvent::new(
                EventType::TaskRetried,
                actor,
                format!("Task {} requeued (retry {} of {})", task_id, attempt, MAX_RETRIES),
            )
            .task(task_id)
            .details(serde_json::json!({
                "retry_count": attempt,
                "previous_errors": previous_errors.len(),
                "similar_resolved_errors": similar.len(),
            })),
        )?;

        Ok(RetryOutcome::Requeued {
            task: truth::require_task(tx, task_id)?,
            context: RetryContext {
                attempt: attempt + 1,
                previous_errors,
                similar_resolved_errors: similar,
            },
        })
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled { task: Task },
    Rejected { reason: String },
}

/// Withdraw a queued task. In-progress and finished tasks cannot be cancelled.
pub fn cancel(store: &Store, task_id: &str, actor: &str) -> Result<CancelOutcome, GatehouseError> {
    store.with_tx(|tx| {
        let task = truth::require_task(tx, task_id)?;
        if task.status != TaskStatus::Queued {
            return Ok(CancelOutcome::Rejected {
                reason: format!("task {} is {}; only queued tasks can be cancelled", task_id, task.status),
            });
        }
        truth::mark_task_cancelled(tx, &task, now_ms())?;
        truth::append_event(
            tx,
            NewEvent::new(EventType::TaskCancelled, actor, format!("Task {} cancelled", task_id))
                .task(task_id),
        )?;
        Ok(CancelOutcome::Cancelled {
            task: truth::require_task(tx, task_id)?,
        })
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: String,
    pub effective_status: TaskStatus,
    pub priority: Priority,
    pub worker_category: WorkerCategory,
    pub reasons: Vec<BlockReason>,
}

/// Queued tasks that cannot be dequeued, with the reasons.
pub fn blocked(store: &Store) -> Result<Vec<BlockedTask>, GatehouseError> {
    store.with_read(|conn| {
        let queued = truth::list_tasks(
            conn,
            &TaskFilter {
                status: Some(TaskStatus::Queued),
                ..TaskFilter::default()
            },
        )?;
        let mut out = Vec::new();
        for task in queued {
            let reasons = block_reasons(conn, &task)?;
            if !reasons.is_empty() {
                out.push(BlockedTask {
                    task_id: task.id,
                    effective_status: TaskStatus::Blocked,
                    priority: task.priority,
                    worker_category: task.worker_category,
                    reasons,
                });
            }
        }
        Ok(out)
    })
}

/// Queued tasks that are eligible right now, in dequeue order.
pub fn ready(store: &Store) -> Result<Vec<Task>, GatehouseError> {
    store.with_read(|conn| {
        let queued = truth::list_tasks(
            conn,
            &TaskFilter {
                status: Some(TaskStatus::Queued),
                ..TaskFilter::default()
            },
        )?;
        let mut out = Vec::new();
        for task in queued {
            if block_reasons(conn, &task)?.is_empty() {
                out.push(task);
            }
        }
        Ok(out)
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub mean_wait_ms: Option<f64>,
    pub mean_execution_ms: Option<f64>,
    /// Fraction of tasks that needed at least one retry.
    pub retry_rate: f64,
    pub total_retries: i64,
    /// Queued tasks held back by each unapproved gate.
    pub blocked_by_gate: BTreeMap<String, usize>,
    pub blocked_by_dependencies: usize,
}

fn mean(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<i64>() as f64 / values.len() as f64)
    }
}

pub fn metrics(store: &Store) -> Result<QueueMetrics, GatehouseError> {
    store.with_read(|conn| {
        let tasks = truth::list_tasks(conn, &TaskFilter::default())?;
        let mut m = QueueMetrics {
            total: tasks.len(),
            ..QueueMetrics::default()
        };
        let mut waits = Vec::new();
        let mut runs = Vec::new();
        let mut retried = 0usize;

        for task in &tasks {
            *m.by_status.entry(task.status.to_string()).or_default() += 1;
            *m.by_category
                .entry(task.worker_category.to_string())
                .or_default() += 1;
            *m.by_priority.entry(task.priority.to_string()).or_default() += 1;
            if let Some(started) = task.started_at {
                waits.push(started - task.created_at);
                if let Some(done) = task.completed_at {
                    runs.push(done - started);
                }
            }
            if task.retry_count > 0 {
                retried += 1;
            }
            m.total_retries += task.retry_count;

            if task.status == TaskStatus::Queued {
                let reasons = block_reasons(conn, task)?;
                let mut dep_blocked = false;
                for reason in &reasons {
                    match reason {
                        BlockReason::GateNotApproved { gate, .. } => {
                            *m.blocked_by_gate.entry(gate.to_string()).or_default() += 1;
                        }
                        _ => dep_blocked = true,
                    }
                }
                if dep_blocked {
                    m.blocked_by_dependencies += 1;
                }
            }
        }

        m.mean_wait_ms = mean(&waits);
        m.mean_execution_ms = mean(&runs);
        m.retry_rate = if tasks.is_empty() {
            0.0
        } else {
            retried as f64 / tasks.len() as f64
        };
        Ok(m)
    })
}
