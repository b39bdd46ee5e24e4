//! Tool-call interface.
//!
//! Callers send one JSON request per logical action and get back one envelope:
//!
//! ```json
//! { "op": "task.dequeue", "params": { "worker_id": "w1", "category": "generation" }, "id": "r1" }
//! { "id": "r1", "op": "task.dequeue", "success": true, "ts": 1700000000000, "result": { ... } }
//! ```
//!
//! Precondition failures are successful calls whose `result` carries an
//! `outcome` tag. `success: false` is reserved for errors (bad input, missing
//! records, store failures), reported as `error.kind` plus a message.

use crate::core::error::GatehouseError;
use crate::core::model::{
    GateId, NewEvent, ProofSubmission, TaskError, TaskOutput, TaskSpec, TaskStatus,
    WorkerCategory, WorkerSpec, WorkerStatus,
};
use crate::core::store::Store;
use crate::core::time::now_ms;
use crate::core::truth::{EventFilter, TaskFilter};
use crate::plugins::{conflict, events, gates, proof, queue, router, workers};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcRequest {
    pub op: String,
    #[serde(default)]
    pub params: JsonValue,
    /// Correlation id echoed in the response.
    #[serde(default = "default_request_id")]
    pub id: String,
}

pub fn default_request_id() -> String {
    ulid::Ulid::new().to_string()
}

impl RpcRequest {
    pub fn new(op: &str, params: JsonValue) -> Self {
        Self {
            op: op.to_string(),
            params,
            id: default_request_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RpcError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RpcResponse {
    pub id: String,
    pub op: String,
    pub success: bool,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: String, op: String, result: JsonValue) -> Self {
        Self {
            id,
            op,
            success: true,
            ts: now_ms(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: String, op: String, error: &GatehouseError) -> Self {
        Self {
            id,
            op,
            success: false,
            ts: now_ms(),
            result: None,
            error: Some(RpcError {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }
}

/// Every operation `dispatch` understands.
pub const OPERATIONS: &[&str] = &[
    "project.status",
    "task.enqueue",
    "task.dequeue",
    "task.complete",
    "task.retry",
    "task.cancel",
    "task.get",
    "task.list",
    "task.metrics",
    "task.blocked",
    "task.result",
    "worker.register",
    "worker.get",
    "worker.list",
    "worker.set_status",
    "conflict.analyze",
    "conflict.graph",
    "router.route",
    "router.bulk_assign",
    "router.plan",
    "gate.definitions",
    "gate.validate",
    "gate.list",
    "gate.review",
    "gate.approve",
    "gate.reject",
    "gate.prerequisites",
    "gate.detect",
    "gate.spawn_agent",
    "gate.complete_agent",
    "gate.check_work",
    "proof.submit",
    "proof.status",
    "proof.verify",
    "proof.verify_gate",
    "proof.report",
    "proof.list",
    "event.append",
    "event.query",
    "event.task_history",
    "event.gate_history",
    "event.stats",
    "event.audit",
];

fn default_actor() -> String {
    "orchestrator".to_string()
}

#[derive(Deserialize)]
struct EnqueueParams {
    #[serde(flatten)]
    spec: TaskSpec,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Debug, Deserialize)]
struct DequeueParams {
    worker_id: String,
    category: WorkerCategory,
}

#[derive(Deserialize)]
struct CompleteParams {
    task_id: String,
    worker_id: String,
    status: TaskStatus,
    #[serde(default)]
    output: Option<TaskOutput>,
    #[serde(default)]
    error: Option<TaskError>,
}

#[derive(Deserialize)]
struct TaskActorParams {
    task_id: String,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct TaskIdParams {
    task_id: String,
}

#[derive(Deserialize)]
struct WorkerIdParams {
    worker_id: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WorkerListParams {
    status: Option<WorkerStatus>,
    category: Option<WorkerCategory>,
}

#[derive(Deserialize)]
struct WorkerStatusParams {
    worker_id: String,
    status: WorkerStatus,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct BulkAssignParams {
    max: Option<usize>,
}

#[derive(Deserialize)]
struct GateParams {
    gate: GateId,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OptionalGateParams {
    gate: Option<GateId>,
}

#[derive(Deserialize)]
struct GateActorParams {
    gate: GateId,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct ValidateParams {
    gate: GateId,
    action: String,
}

#[derive(Deserialize)]
struct RejectParams {
    gate: GateId,
    reason: String,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DetectParams {
    command: Option<String>,
    file: Option<String>,
}

#[derive(Deserialize)]
struct SpawnParams {
    gate: GateId,
    role: String,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct CompleteAgentParams {
    spawn_id: String,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize)]
struct CheckWorkParams {
    kind: gates::WorkKind,
    subject: String,
}

#[derive(Deserialize)]
struct VerifyParams {
    artifact_id: String,
    #[serde(default = "default_actor")]
    actor: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct StatsParams {
    since: Option<i64>,
}

fn parse<T: DeserializeOwned>(params: JsonValue) -> Result<T, GatehouseError> {
    let params = if params.is_null() {
        JsonValue::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|e| GatehouseError::ValidationError(format!("invalid params: {}", e)))
}

fn json<T: Serialize>(value: T) -> Result<JsonValue, GatehouseError> {
    Ok(serde_json::to_value(value)?)
}

fn found<T>(value: Option<T>, what: &str, id: &str) -> Result<T, GatehouseError> {
    value.ok_or_else(|| GatehouseError::NotFound(format!("{} '{}'", what, id)))
}

/// Run one request against `store` and wrap the outcome in an envelope.
pub fn dispatch(store: &Store, request: RpcRequest) -> RpcResponse {
    let RpcRequest { op, params, id } = request;
    debug!(%op, %id, "rpc request");
    match handle(store, &op, params) {
        Ok(result) => RpcResponse::ok(id, op, result),
        Err(e) => {
            warn!(%op, %id, kind = e.kind(), error = %e, "rpc request failed");
            RpcResponse::err(id, op, &e)
        }
    }
}

fn handle(store: &Store, op: &str, params: JsonValue) -> Result<JsonValue, GatehouseError> {
    match op {
        "project.status" => json(store.snapshot()?),

        // Task queue
        "task.enqueue" => {
            let p: EnqueueParams = parse(params)?;
            json(queue::enqueue(store, &p.spec, &p.actor)?)
        }
        "task.dequeue" => {
            let p: DequeueParams = parse(params)?;
            json(queue::dequeue(store, &p.worker_id, p.category)?)
        }
        "task.complete" => {
            let p: CompleteParams = parse(params)?;
            json(queue::complete(
                store,
                &p.task_id,
                &p.worker_id,
                p.status,
                p.output,
                p.error,
            )?)
        }
        "task.retry" => {
            let p: TaskActorParams = parse(params)?;
            json(queue::retry(store, &p.task_id, &p.actor)?)
        }
        "task.cancel" => {
            let p: TaskActorParams = parse(params)?;
            json(queue::cancel(store, &p.task_id, &p.actor)?)
        }
        "task.get" => {
            let p: TaskIdParams = parse(params)?;
            json(found(store.get_task(&p.task_id)?, "task", &p.task_id)?)
        }
        "task.list" => {
            let filter: TaskFilter = parse(params)?;
            json(store.list_tasks(&filter)?)
        }
        "task.metrics" => json(queue::metrics(store)?),
        "task.blocked" => json(queue::blocked(store)?),
        "task.result" => {
            let p: TaskIdParams = parse(params)?;
            json(found(store.cached_result(&p.task_id)?, "result for task", &p.task_id)?)
        }

        // Workers
        "worker.register" => {
            let spec: WorkerSpec = parse(params)?;
            json(workers::register_worker(store, &spec)?)
        }
        "worker.get" => {
            let p: WorkerIdParams = parse(params)?;
            json(found(store.get_worker(&p.worker_id)?, "worker", &p.worker_id)?)
        }
        "worker.list" => {
            let p: WorkerListParams = parse(params)?;
            json(store.list_workers(p.status, p.category)?)
        }
        "worker.set_status" => {
            let p: WorkerStatusParams = parse(params)?;
            json(workers::set_worker_status(store, &p.worker_id, p.status, &p.actor)?)
        }

        // Conflicts and routing
        "conflict.analyze" => json(conflict::analyze(store)?),
        "conflict.graph" => json(conflict::analyze_graph(&conflict::pending_tasks(store)?)),
        "router.route" => {
            let p: TaskIdParams = parse(params)?;
            json(router::route(store, &p.task_id)?)
        }
        "router.bulk_assign" => {
            let p: BulkAssignParams = parse(params)?;
            json(router::bulk_assign(store, p.max)?)
        }
        "router.plan" => json(router::optimal_execution_plan(store)?),

        // Gates
        "gate.definitions" => json(gates::definitions()),
        "gate.validate" => {
            let p: ValidateParams = parse(params)?;
            json(gates::validate(p.gate, &p.action)?)
        }
        "gate.list" => json(store.list_gates()?),
        "gate.review" => {
            let p: GateActorParams = parse(params)?;
            json(gates::open_review(store, p.gate, &p.actor)?)
        }
        "gate.approve" => {
            let p: GateActorParams = parse(params)?;
            json(gates::approve(store, p.gate, &p.actor)?)
        }
        "gate.reject" => {
            let p: RejectParams = parse(params)?;
            json(gates::reject(store, p.gate, &p.actor, &p.reason)?)
        }
        "gate.prerequisites" => {
            let p: GateParams = parse(params)?;
            Ok(serde_json::json!({
                "prerequisites": gates::prerequisites(store, p.gate)?,
                "roles": gates::role_status(store, p.gate)?,
            }))
        }
        "gate.detect" => {
            let p: DetectParams = parse(params)?;
            match (p.command, p.file) {
                (Some(cmd), None) => json(gates::detect_gate_for_command(&cmd)),
                (None, Some(path)) => json(gates::detect_gate_for_file(&path)),
                _ => Err(GatehouseError::ValidationError(
                    "gate.detect takes exactly one of command or file".to_string(),
                )),
            }
        }
        "gate.spawn_agent" => {
            let p: SpawnParams = parse(params)?;
            json(gates::spawn_agent(store, p.gate, &p.role, &p.actor)?)
        }
        "gate.complete_agent" => {
            let p: CompleteAgentParams = parse(params)?;
            json(gates::complete_agent(store, &p.spawn_id, &p.actor)?)
        }
        "gate.check_work" => {
            let p: CheckWorkParams = parse(params)?;
            json(gates::check_work(store, p.kind, &p.subject)?)
        }

        // Proofs
        "proof.submit" => {
            let submission: ProofSubmission = parse(params)?;
            json(proof::submit(store, &submission)?)
        }
        "proof.status" => {
            let p: GateParams = parse(params)?;
            json(proof::gate_proof_status(store, p.gate)?)
        }
        "proof.verify" => {
            let p: VerifyParams = parse(params)?;
            json(proof::verify_integrity(store, &p.artifact_id, &p.actor)?)
        }
        "proof.verify_gate" => {
            let p: GateActorParams = parse(params)?;
            json(proof::verify_gate(store, p.gate, &p.actor)?)
        }
        "proof.report" => {
            let p: OptionalGateParams = parse(params)?;
            json(proof::generate_report(store, p.gate)?)
        }
        "proof.list" => {
            let p: OptionalGateParams = parse(params)?;
            json(store.list_proofs(p.gate)?)
        }

        // Events
        "event.append" => {
            let event: NewEvent = parse(params)?;
            json(events::append(store, event)?)
        }
        "event.query" => {
            let filter: EventFilter = parse(params)?;
            json(events::query(store, &filter)?)
        }
        "event.task_history" => {
            let p: TaskIdParams = parse(params)?;
            json(events::task_history(store, &p.task_id)?)
        }
        "event.gate_history" => {
            let p: GateParams = parse(params)?;
            json(events::gate_history(store, p.gate)?)
        }
        "event.stats" => {
            let p: StatsParams = parse(params)?;
            json(events::statistics(store, p.since)?)
        }
        "event.audit" => json(events::audit_report(store)?),

        other => Err(GatehouseError::ValidationError(format!(
            "unknown op '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: RpcRequest = serde_json::from_str(r#"{"op":"task.metrics"}"#).unwrap();
        assert!(req.params.is_null());
        assert!(!req.id.is_empty());
    }

    #[test]
    fn test_null_params_parse_as_empty_object() {
        let p: BulkAssignParams = parse(JsonValue::Null).unwrap();
        assert!(p.max.is_none());
        let err = parse::<DequeueParams>(serde_json::json!({ "worker_id": "w1" })).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_error_envelope_omits_result() {
        let resp = RpcResponse::err(
            "r1".to_string(),
            "task.get".to_string(),
            &GatehouseError::NotFound("task 'x'".to_string()),
        );
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["kind"], "not_found");
        assert!(v.get("result").is_none());
    }

    #[test]
    fn test_operation_names_are_unique() {
        let mut seen = std::collections::BTreeSet::new();
        for op in OPERATIONS {
            assert!(seen.insert(*op), "duplicate op {}", op);
        }
    }
}
