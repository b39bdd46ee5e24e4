//! Capability router: matches tasks to workers and builds wave plans.

use crate::core::config::RouterConfig;
use crate::core::error::GatehouseError;
use crate::core::model::{Task, TaskType, Worker, WorkerStatus};
use crate::core::store::Store;
use crate::core::truth;
use crate::plugins::conflict::{self, Bottleneck, spec_overlap};
use crate::plugins::queue::{self, AssignOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, instrument};

/// Description keywords and the capability tag each implies.
const KEYWORD_TAGS: &[(&[&str], &str)] = &[
    (&["api", "endpoint", "route"], "api_design"),
    (&["database", "schema", "sql", "migration"], "database"),
    (&["frontend", "ui", "component", "page"], "frontend"),
    (&["backend", "server", "service"], "backend"),
    (&["test", "qa", "coverage"], "testing"),
    (&["security", "auth", "vulnerability"], "security"),
    (&["deploy", "docker", "kubernetes", "infrastructure"], "deployment"),
    (&["docs", "documentation", "readme"], "documentation"),
    (&["design", "wireframe", "mockup"], "design"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequirements {
    pub required: BTreeSet<String>,
    pub preferred: BTreeSet<String>,
}

/// Required tags come from the worker category; preferred tags from the task
/// type and description keywords.
pub fn infer_capabilities(task: &Task) -> CapabilityRequirements {
    let mut req = CapabilityRequirements::default();
    req.required.insert(task.worker_category.to_string());
    if task.task_type == TaskType::Coordination {
        req.preferred.insert("coordination".to_string());
    }
    let lowered = task.description.to_lowercase();
    let mut words: HashSet<&str> = HashSet::new();
    for w in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        words.insert(w);
        words.insert(w.trim_end_matches('s'));
    }
    for (keywords, tag) in KEYWORD_TAGS {
        if keywords.iter().any(|k| words.contains(*k)) {
            req.preferred.insert(tag.to_string());
        }
    }
    req.preferred.retain(|t| !req.required.contains(t));
    req
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerScore {
    pub worker_id: String,
    pub score: f64,
    pub required_matched: Vec<String>,
    pub preferred_matched: Vec<String>,
    pub spec_matches: usize,
}

/// A worker's own category always counts as one of its capabilities.
fn worker_tags(worker: &Worker) -> BTreeSet<String> {
    let mut tags: BTreeSet<String> = worker.capabilities.iter().cloned().collect();
    tags.insert(worker.category.to_string());
    tags
}

/// `None` when the worker is of another category than the task needs or
/// matches no required capability. Capability tags never stand in for the
/// category, since `assign` only accepts same-category workers.
pub fn score_worker(
    task: &Task,
    req: &CapabilityRequirements,
    worker: &Worker,
    weights: &RouterConfig,
) -> Option<WorkerScore> {
    if worker.category != task.worker_category {
        return None;
    }
    let tags = worker_tags(worker);
    let required_matched: Vec<String> = req.required.intersection(&tags).cloned().collect();
    if required_matched.is_empty() {
        return None;
    }
    let preferred_matched: Vec<String> = req.preferred.intersection(&tags).cloned().collect();
    let spec_matches = task
        .spec_refs
        .iter()
        .filter(|r| {
            worker
                .spec_consumption
                .iter()
                .any(|c| spec_overlap(r, c).is_some())
        })
        .count();
    let score = weights.required_weight * required_matched.len() as f64
        + weights.preferred_weight * preferred_matched.len() as f64
        + weights.spec_weight * spec_matches as f64;
    Some(WorkerScore {
        worker_id: worker.id.clone(),
        score,
        required_matched,
        preferred_matched,
        spec_matches,
    })
}

/// All qualifying workers, best first. Ties go to the more reliable worker.
pub fn rank_workers(task: &Task, workers: &[Worker], weights: &RouterConfig) -> Vec<WorkerScore> {
    let req = infer_capabilities(task);
    let mut scored: Vec<(WorkerScore, i64)> = workers
        .iter()
        .filter_map(|w| score_worker(task, &req, w, weights).map(|s| (s, w.error_count)))
        .collect();
    scored.sort_by(|(a, ea), (b, eb)| {
        b.score
            .total_cmp(&a.score)
            .then(ea.cmp(eb))
            .then_with(|| a.worker_id.cmp(&b.worker_id))
    });
    scored.into_iter().map(|(s, _)| s).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    pub task_id: String,
    pub requirements: CapabilityRequirements,
    /// `None` when no worker qualifies; not an error.
    pub recommended: Option<WorkerScore>,
    pub alternatives: Vec<WorkerScore>,
}

pub fn route_among(task: &Task, workers: &[Worker], weights: &RouterConfig) -> RouteResult {
    let mut ranked = rank_workers(task, workers, weights).into_iter();
    let recommended = ranked.next();
    RouteResult {
        task_id: task.id.clone(),
        requirements: infer_capabilities(task),
        recommended,
        alternatives: ranked.take(weights.max_alternatives).collect(),
    }
}

/// Route a stored task to the best idle worker.
pub fn route(store: &Store, task_id: &str) -> Result<RouteResult, GatehouseError> {
    let (task, idle) = store.with_read(|conn| {
        Ok((
            truth::require_task(conn, task_id)?,
            truth::list_workers(conn, Some(WorkerStatus::Idle), None)?,
        ))
    })?;
    Ok(route_among(&task, &idle, &store.config().router))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: String,
    pub worker_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTask {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkAssignReport {
    pub assignments: Vec<Assignment>,
    pub skipped: Vec<SkippedTask>,
    pub idle_workers: usize,
    pub workers_touched: usize,
    /// `workers_touched / idle_workers`, 0 when nobody was idle.
    pub utilization: f64,
}

/// Greedily pair eligible queued tasks with idle workers in priority order.
///
/// Each pairing commits in its own transaction through the same checks as
/// `dequeue`, so a worker that got busy in the meantime is skipped, not
/// double-booked. A rejected pairing falls through to the next ranked worker;
/// a worker leaves the idle pool only once it is actually assigned.
#[instrument(skip(store))]
pub fn bulk_assign(store: &Store, max: Option<usize>) -> Result<BulkAssignReport, GatehouseError> {
    let ready = queue::ready(store)?;
    let mut idle = store.list_workers(Some(WorkerStatus::Idle), None)?;
    let mut report = BulkAssignReport {
        idle_workers: idle.len(),
        ..BulkAssignReport::default()
    };
    let limit = max.unwrap_or(usize::MAX);

    for task in ready {
        if report.assignments.len() >= limit || idle.is_empty() {
            break;
        }
        let ranked = rank_workers(&task, &idle, &store.config().router);
        if ranked.is_empty() {
            report.skipped.push(SkippedTask {
                task_id: task.id.clone(),
                reason: "no idle worker with the required capabilities".to_string(),
            });
            continue;
        }
        let mut last_reason = None;
        for candidate in ranked {
            match queue::assign(store, &task.id, &candidate.worker_id)? {
                AssignOutcome::Assigned { .. } => {
                    idle.retain(|w| w.id != candidate.worker_id);
                    report.assignments.push(Assignment {
                        task_id: task.id.clone(),
                        worker_id: candidate.worker_id,
                        score: candidate.score,
                    });
                    last_reason = None;
                    break;
                }
                AssignOutcome::Rejected { reason } => {
                    debug!(
                        task_id = %task.id,
                        worker_id = %candidate.worker_id,
                        %reason,
                        "candidate rejected"
                    );
                    last_reason = Some(reason);
                }
            }
        }
        if let Some(reason) = last_reason {
            report.skipped.push(SkippedTask {
                task_id: task.id.clone(),
                reason,
            });
        }
    }

    report.workers_touched = report.assignments.len();
    report.utilization = if report.idle_workers == 0 {
        0.0
    } else {
        report.workers_touched as f64 / report.idle_workers as f64
    };
    info!(
        assigned = report.assignments.len(),
        skipped = report.skipped.len(),
        "bulk assignment finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub task_id: String,
    pub priority: crate::core::model::Priority,
    pub recommended_worker: Option<String>,
    pub score: Option<f64>,
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wave {
    pub number: usize,
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub total_tasks: usize,
    pub waves: Vec<Wave>,
    pub has_cycle: bool,
    pub cycle: Option<Vec<String>>,
    pub critical_path: Option<Vec<String>>,
    pub bottlenecks: Vec<Bottleneck>,
    /// Mean tasks per wave.
    pub parallelism: f64,
}

/// Wave plan over tasks and available workers. Within a wave each worker is
/// recommended at most once.
pub fn plan_for(tasks: &[Task], workers: &[Worker], weights: &RouterConfig) -> ExecutionPlan {
    let analysis = conflict::analyze_tasks(tasks);
    let by_id: std::collections::HashMap<&str, &Task> =
        tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut waves = Vec::new();
    for (i, group) in analysis.parallel_groups.iter().enumerate() {
        let mut used: HashSet<String> = HashSet::new();
        let mut planned = Vec::new();
        for id in group {
            let Some(task) = by_id.get(id.as_str()) else {
                continue;
            };
            let ranked = rank_workers(task, workers, weights);
            let pick = ranked.iter().find(|s| !used.contains(&s.worker_id)).cloned();
            if let Some(p) = &pick {
                used.insert(p.worker_id.clone());
            }
            planned.push(PlannedTask {
                task_id: task.id.clone(),
                priority: task.priority,
                recommended_worker: pick.as_ref().map(|p| p.worker_id.clone()),
                score: pick.as_ref().map(|p| p.score),
                alternatives: ranked
                    .iter()
                    .filter(|s| pick.as_ref().is_none_or(|p| p.worker_id != s.worker_id))
                    .take(weights.max_alternatives)
                    .map(|s| s.worker_id.clone())
                    .collect(),
            });
        }
        waves.push(Wave {
            number: i + 1,
            tasks: planned,
        });
    }

    ExecutionPlan {
        total_tasks: tasks.len(),
        parallelism: if waves.is_empty() {
            0.0
        } else {
            tasks.len() as f64 / waves.len() as f64
        },
        waves,
        has_cycle: analysis.graph.has_cycle,
        cycle: analysis.graph.cycle,
        critical_path: analysis.graph.critical_path,
        bottlenecks: analysis.graph.bottlenecks,
    }
}

/// Plan every queued task against every worker that is not offline.
pub fn optimal_execution_plan(store: &Store) -> Result<ExecutionPlan, GatehouseError> {
    let tasks = conflict::pending_tasks(store)?;
    let workers: Vec<Worker> = store
        .list_workers(None, None)?
        .into_iter()
        .filter(|w| w.status != WorkerStatus::Offline)
        .collect();
    Ok(plan_for(&tasks, &workers, &store.config().router))
}
