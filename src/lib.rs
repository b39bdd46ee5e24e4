//! Gatehouse: an orchestration core for agent-built software.
//!
//! Gatehouse schedules discrete tasks across a pool of external workers and
//! holds forward progress behind an ordered series of gates. A gate is only
//! approved when hash-verified proof artifacts say it is ready, never on a
//! worker's word.
//!
//! # Architecture
//!
//! - **Truth store** (`<project>/.gatehouse/truth.db`): one SQLite database per
//!   project. Every mutation is a single `BEGIN IMMEDIATE` transaction that
//!   performs its checks, its writes, and its event append together.
//! - **Task queue**: dependency- and gate-aware dequeue, capped retries, and
//!   error history that enriches retry context.
//! - **Conflict detector**: dependency graph analysis and spec/file overlap
//!   detection that yields safe parallel groups.
//! - **Capability router**: scores workers against inferred task requirements
//!   and builds wave-based execution plans.
//! - **Gate state machine**: allow/block action lists, approval against the
//!   proof ledger, prerequisites, and agent-role tracking.
//! - **Proof ledger**: SHA-256 hashed evidence with integrity re-verification.
//! - **Event log**: append-only audit trail backing every history view.
//!
//! Callers reach all of it through [`core::rpc::dispatch`], either in-process
//! or via the `gatehouse` binary.
//!
//! ```bash
//! gatehouse --project . task enqueue --type generation --category generation \
//!     --description "Implement login form" --spec-ref ui.forms.login
//! gatehouse --project . task dequeue --worker fe-1 --category generation
//! gatehouse --project . proof submit --gate G6 --type test_output \
//!     --file reports/junit.xml --result pass
//! gatehouse --project . gate approve --gate G6 --by lead
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: truth store, entity model, config, logging, RPC envelope
//! - [`plugins`]: queue, workers, conflict, router, gates, proof, events

pub mod core;
pub mod plugins;

mod cli;

use crate::cli::{
    Cli, Command, EventsCommand, GateCommand, PlanCommand, ProofCli, ProofCommand, RpcCli,
    TaskCommand, WorkerCommand,
};
use crate::core::error::GatehouseError;
use crate::core::model::GateId;
use crate::core::rpc::{self, RpcRequest, RpcResponse};
use crate::core::store::Store;
use crate::core::{config, logging, schemas};
use clap::Parser;
use serde_json::{Value as JsonValue, json};
use std::io::{self, BufRead};

fn parse_json_arg(flag: &str, raw: Option<String>) -> Result<JsonValue, GatehouseError> {
    match raw {
        None => Ok(JsonValue::Null),
        Some(s) => serde_json::from_str(&s).map_err(|e| {
            GatehouseError::ValidationError(format!("--{} is not valid JSON: {}", flag, e))
        }),
    }
}

fn task_request(command: TaskCommand) -> Result<RpcRequest, GatehouseError> {
    let (op, params) = match command {
        TaskCommand::Enqueue {
            task_type,
            category,
            priority,
            description,
            id,
            dependencies,
            gate,
            spec_refs,
            story_refs,
            file_refs,
            actor,
        } => (
            "task.enqueue",
            json!({
                "id": id,
                "type": task_type,
                "worker_category": category,
                "priority": priority,
                "description": description,
                "dependencies": dependencies,
                "gate_dependency": gate,
                "spec_refs": spec_refs,
                "story_refs": story_refs,
                "file_refs": file_refs,
                "actor": actor,
            }),
        ),
        TaskCommand::Dequeue { worker, category } => (
            "task.dequeue",
            json!({ "worker_id": worker, "category": category }),
        ),
        TaskCommand::Complete {
            task,
            worker,
            status,
            files_created,
            error_message,
            error_code,
            unrecoverable,
        } => {
            let error = error_message.map(|message| {
                let mut e = json!({ "message": message, "recoverable": !unrecoverable });
                if let Some(code) = error_code {
                    e["code"] = json!(code);
                }
                e
            });
            (
                "task.complete",
                json!({
                    "task_id": task,
                    "worker_id": worker,
                    "status": status,
                    "output": { "files_created": files_created },
                    "error": error,
                }),
            )
        }
        TaskCommand::Retry { task, actor } => {
            ("task.retry", json!({ "task_id": task, "actor": actor }))
        }
        TaskCommand::Cancel { task, actor } => {
            ("task.cancel", json!({ "task_id": task, "actor": actor }))
        }
        TaskCommand::Get { task } => ("task.get", json!({ "task_id": task })),
        TaskCommand::List {
            status,
            category,
            priority,
            gate,
            worker,
            limit,
        } => (
            "task.list",
            json!({
                "status": status,
                "worker_category": category,
                "priority": priority,
                "gate_dependency": gate,
                "assigned_worker": worker,
                "limit": limit,
            }),
        ),
        TaskCommand::Metrics => ("task.metrics", JsonValue::Null),
        TaskCommand::Blocked => ("task.blocked", JsonValue::Null),
        TaskCommand::Result { task } => ("task.result", json!({ "task_id": task })),
    };
    Ok(RpcRequest::new(op, params))
}

fn worker_request(command: WorkerCommand) -> RpcRequest {
    let (op, params) = match command {
        WorkerCommand::Register {
            id,
            category,
            capabilities,
            spec_consumption,
        } => (
            "worker.register",
            json!({
                "id": id,
                "category": category,
                "capabilities": capabilities,
                "spec_consumption": spec_consumption,
            }),
        ),
        WorkerCommand::Get { worker } => ("worker.get", json!({ "worker_id": worker })),
        WorkerCommand::List { status, category } => (
            "worker.list",
            json!({ "status": status, "category": category }),
        ),
        WorkerCommand::SetStatus {
            worker,
            status,
            actor,
        } => (
            "worker.set_status",
            json!({ "worker_id": worker, "status": status, "actor": actor }),
        ),
    };
    RpcRequest::new(op, params)
}

fn gate_request(command: GateCommand) -> RpcRequest {
    let (op, params) = match command {
        GateCommand::Definitions => ("gate.definitions", JsonValue::Null),
        GateCommand::Validate { gate, action } => {
            ("gate.validate", json!({ "gate": gate, "action": action }))
        }
        GateCommand::List => ("gate.list", JsonValue::Null),
        GateCommand::Review { gate, actor } => {
            ("gate.review", json!({ "gate": gate, "actor": actor }))
        }
        GateCommand::Approve { gate, actor } => {
            ("gate.approve", json!({ "gate": gate, "actor": actor }))
        }
        GateCommand::Reject {
            gate,
            reason,
            actor,
        } => (
            "gate.reject",
            json!({ "gate": gate, "reason": reason, "actor": actor }),
        ),
        GateCommand::Prerequisites { gate } => ("gate.prerequisites", json!({ "gate": gate })),
        GateCommand::Detect { command, file } => {
            ("gate.detect", json!({ "command": command, "file": file }))
        }
        GateCommand::SpawnAgent { gate, role, actor } => (
            "gate.spawn_agent",
            json!({ "gate": gate, "role": role, "actor": actor }),
        ),
        GateCommand::CompleteAgent { spawn, actor } => (
            "gate.complete_agent",
            json!({ "spawn_id": spawn, "actor": actor }),
        ),
        GateCommand::CheckWork { command, file } => {
            let params = match (command, file) {
                (Some(c), _) => json!({ "kind": "command", "subject": c }),
                (None, f) => json!({ "kind": "file", "subject": f }),
            };
            ("gate.check_work", params)
        }
    };
    RpcRequest::new(op, params)
}

fn proof_request(command: ProofCommand) -> Result<RpcRequest, GatehouseError> {
    let (op, params) = match command {
        ProofCommand::Submit {
            gate,
            proof_type,
            file,
            result,
            summary,
            created_by,
            metrics,
        } => (
            "proof.submit",
            json!({
                "gate": gate,
                "proof_type": proof_type,
                "file_path": file,
                "pass_fail": result,
                "content_summary": summary,
                "created_by": created_by,
                "metrics": parse_json_arg("metrics", metrics)?,
            }),
        ),
        ProofCommand::Status { gate } => ("proof.status", json!({ "gate": gate })),
        ProofCommand::Verify { artifact, actor } => (
            "proof.verify",
            json!({ "artifact_id": artifact, "actor": actor }),
        ),
        ProofCommand::VerifyGate { gate, actor } => {
            ("proof.verify_gate", json!({ "gate": gate, "actor": actor }))
        }
        ProofCommand::Report { gate, .. } => ("proof.report", json!({ "gate": gate })),
        ProofCommand::List { gate } => ("proof.list", json!({ "gate": gate })),
    };
    Ok(RpcRequest::new(op, params))
}

fn plan_request(command: PlanCommand) -> RpcRequest {
    let (op, params) = match command {
        PlanCommand::Conflicts => ("conflict.analyze", JsonValue::Null),
        PlanCommand::Graph => ("conflict.graph", JsonValue::Null),
        PlanCommand::Route { task } => ("router.route", json!({ "task_id": task })),
        PlanCommand::Assign { max } => ("router.bulk_assign", json!({ "max": max })),
        PlanCommand::Waves => ("router.plan", JsonValue::Null),
    };
    RpcRequest::new(op, params)
}

fn events_request(command: EventsCommand) -> Result<RpcRequest, GatehouseError> {
    let (op, params) = match command {
        EventsCommand::Append {
            event_type,
            actor,
            summary,
            details,
            task,
            gate,
        } => (
            "event.append",
            json!({
                "event_type": event_type,
                "actor": actor,
                "summary": summary,
                "details": parse_json_arg("details", details)?,
                "related_task_id": task,
                "related_gate": gate,
            }),
        ),
        EventsCommand::Query {
            event_type,
            actor,
            task,
            gate,
            since,
            limit,
        } => (
            "event.query",
            json!({
                "event_type": event_type,
                "actor": actor,
                "related_task_id": task,
                "related_gate": gate,
                "since": since,
                "limit": limit,
            }),
        ),
        EventsCommand::TaskHistory { task } => {
            ("event.task_history", json!({ "task_id": task }))
        }
        EventsCommand::GateHistory { gate } => ("event.gate_history", json!({ "gate": gate })),
        EventsCommand::Stats { since } => ("event.stats", json!({ "since": since })),
        EventsCommand::Audit => ("event.audit", JsonValue::Null),
    };
    Ok(RpcRequest::new(op, params))
}

fn request_for(command: Command) -> Result<RpcRequest, GatehouseError> {
    match command {
        Command::Init => Ok(RpcRequest::new("project.status", JsonValue::Null)),
        Command::Task(t) => task_request(t.command),
        Command::Worker(w) => Ok(worker_request(w.command)),
        Command::Gate(g) => Ok(gate_request(g.command)),
        Command::Proof(p) => proof_request(p.command),
        Command::Plan(p) => Ok(plan_request(p.command)),
        Command::Events(e) => events_request(e.command),
        Command::Rpc(_) => Err(GatehouseError::ValidationError(
            "rpc requests are dispatched directly".to_string(),
        )),
    }
}

fn print_response(response: &RpcResponse) -> Result<bool, GatehouseError> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(response.success)
}

fn run_rpc(store: &Store, cli: RpcCli) -> Result<bool, GatehouseError> {
    if !cli.stdin {
        let op = cli.op.ok_or_else(|| {
            GatehouseError::ValidationError("--op is required unless --stdin is set".to_string())
        })?;
        let params = parse_json_arg("params", cli.params)?;
        return print_response(&rpc::dispatch(store, RpcRequest::new(&op, params)));
    }

    let mut all_ok = true;
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => rpc::dispatch(store, request),
            Err(e) => RpcResponse::err(
                rpc::default_request_id(),
                String::new(),
                &GatehouseError::JsonError(e),
            ),
        };
        // One compact envelope per line.
        println!("{}", serde_json::to_string(&response)?);
        all_ok &= response.success;
    }
    Ok(all_ok)
}

/// Entry point for the binary. Returns whether every request succeeded.
pub fn run() -> Result<bool, GatehouseError> {
    let cli = Cli::parse();
    let root = match cli.project {
        Some(p) => p,
        None => std::env::current_dir()?,
    };
    let config = config::load_config(&root.join(schemas::STATE_DIR_NAME))?;
    logging::init(&config.logging);

    let store = match Store::open_with_config(&root, config) {
        Ok(store) => store,
        Err(e) => {
            return print_response(&RpcResponse::err(
                rpc::default_request_id(),
                "project.open".to_string(),
                &e,
            ));
        }
    };

    match cli.command {
        Command::Rpc(rpc_cli) => run_rpc(&store, rpc_cli),
        Command::Proof(ProofCli {
            command: ProofCommand::Report { gate, format },
        }) if format == "text" => {
            let gate: Option<GateId> = gate.map(|g| g.parse()).transpose()?;
            let report = plugins::proof::generate_report(&store, gate)?;
            print!("{}", plugins::proof::render_text(&report));
            Ok(true)
        }
        command => match request_for(command) {
            Ok(request) => print_response(&rpc::dispatch(&store, request)),
            Err(e) => print_response(&RpcResponse::err(
                rpc::default_request_id(),
                "cli".to_string(),
                &e,
            )),
        },
    }
}
