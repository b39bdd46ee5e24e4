//! CLI struct definitions for the gatehouse command-line interface.
//!
//! All clap-derived types live here. Each command maps onto one RPC operation
//! in `lib.rs`, so the CLI and the tool-call API share a single code path.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "gatehouse",
    version = env!("CARGO_PKG_VERSION"),
    about = "Orchestration core that schedules agent work behind proof-gated checkpoints."
)]
pub(crate) struct Cli {
    /// Project directory holding `.gatehouse/` (defaults to the current directory).
    #[clap(long, short = 'p', global = true, env = "GATEHOUSE_PROJECT")]
    pub project: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the project store (idempotent) and print its snapshot.
    Init,
    /// Durable task queue.
    Task(TaskCli),
    /// Worker registry.
    Worker(WorkerCli),
    /// Gate definitions, approvals, and work guards.
    Gate(GateCli),
    /// Proof artifact ledger.
    Proof(ProofCli),
    /// Conflict analysis, routing, and wave planning.
    Plan(PlanCli),
    /// Event log queries and audit views.
    Events(EventsCli),
    /// Raw tool-call requests.
    Rpc(RpcCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct TaskCli {
    #[clap(subcommand)]
    pub command: TaskCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TaskCommand {
    /// Add a task to the queue.
    Enqueue {
        /// planning, generation, validation, or coordination
        #[clap(long = "type")]
        task_type: String,
        /// Worker category that may execute the task.
        #[clap(long)]
        category: String,
        #[clap(long)]
        priority: Option<String>,
        #[clap(long, default_value = "")]
        description: String,
        /// Explicit id; generated when omitted.
        #[clap(long)]
        id: Option<String>,
        #[clap(long = "depends-on")]
        dependencies: Vec<String>,
        /// Gate that must be approved before the task is eligible.
        #[clap(long)]
        gate: Option<String>,
        #[clap(long = "spec-ref")]
        spec_refs: Vec<String>,
        #[clap(long = "story-ref")]
        story_refs: Vec<String>,
        #[clap(long = "file")]
        file_refs: Vec<String>,
        #[clap(long, default_value = "cli")]
        actor: String,
    },
    /// Atomically claim the next eligible task for a worker.
    Dequeue {
        #[clap(long)]
        worker: String,
        #[clap(long)]
        category: String,
    },
    /// Report a finished task.
    Complete {
        #[clap(long)]
        task: String,
        #[clap(long)]
        worker: String,
        /// complete or failed
        #[clap(long)]
        status: String,
        /// Files created by the task.
        #[clap(long = "created")]
        files_created: Vec<String>,
        #[clap(long)]
        error_message: Option<String>,
        #[clap(long)]
        error_code: Option<String>,
        #[clap(long)]
        unrecoverable: bool,
    },
    /// Requeue a failed task.
    Retry {
        #[clap(long)]
        task: String,
        #[clap(long, default_value = "cli")]
        actor: String,
    },
    /// Cancel a queued task.
    Cancel {
        #[clap(long)]
        task: String,
        #[clap(long, default_value = "cli")]
        actor: String,
    },
    Get {
        #[clap(long)]
        task: String,
    },
    List {
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        category: Option<String>,
        #[clap(long)]
        priority: Option<String>,
        #[clap(long)]
        gate: Option<String>,
        #[clap(long)]
        worker: Option<String>,
        #[clap(long)]
        limit: Option<i64>,
    },
    /// Queue throughput and wait statistics.
    Metrics,
    /// Queued tasks that cannot be dequeued yet, with reasons.
    Blocked,
    /// Cached output of a completed task.
    Result {
        #[clap(long)]
        task: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct WorkerCli {
    #[clap(subcommand)]
    pub command: WorkerCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum WorkerCommand {
    /// Register a worker, or update its profile if it exists.
    Register {
        #[clap(long)]
        id: String,
        #[clap(long)]
        category: String,
        #[clap(long = "capability")]
        capabilities: Vec<String>,
        /// Spec refs the worker is familiar with.
        #[clap(long = "spec")]
        spec_consumption: Vec<String>,
    },
    Get {
        #[clap(long)]
        worker: String,
    },
    List {
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        category: Option<String>,
    },
    SetStatus {
        #[clap(long)]
        worker: String,
        #[clap(long)]
        status: String,
        #[clap(long, default_value = "cli")]
        actor: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct GateCli {
    #[clap(subcommand)]
    pub command: GateCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum GateCommand {
    /// Print every gate definition.
    Definitions,
    /// Check whether an action is permitted during a gate.
    Validate {
        #[clap(long)]
        gate: String,
        #[clap(long)]
        action: String,
    },
    List,
    Review {
        #[clap(long)]
        gate: String,
        #[clap(long, default_value = "cli")]
        actor: String,
    },
    Approve {
        #[clap(long)]
        gate: String,
        #[clap(long = "by")]
        actor: String,
    },
    Reject {
        #[clap(long)]
        gate: String,
        #[clap(long)]
        reason: String,
        #[clap(long = "by", default_value = "cli")]
        actor: String,
    },
    Prerequisites {
        #[clap(long)]
        gate: String,
    },
    /// Classify a command or file path to the gate it belongs to.
    Detect {
        #[clap(long, conflicts_with = "file")]
        command: Option<String>,
        #[clap(long)]
        file: Option<String>,
    },
    SpawnAgent {
        #[clap(long)]
        gate: String,
        #[clap(long)]
        role: String,
        #[clap(long, default_value = "cli")]
        actor: String,
    },
    CompleteAgent {
        #[clap(long)]
        spawn: String,
        #[clap(long, default_value = "cli")]
        actor: String,
    },
    /// Decide whether a command or file edit may proceed.
    CheckWork {
        #[clap(long, conflicts_with = "file", required_unless_present = "file")]
        command: Option<String>,
        #[clap(long)]
        file: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ProofCli {
    #[clap(subcommand)]
    pub command: ProofCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ProofCommand {
    /// Hash and record a proof artifact.
    Submit {
        #[clap(long)]
        gate: String,
        #[clap(long = "type")]
        proof_type: String,
        #[clap(long)]
        file: String,
        /// pass, fail, warning, or info
        #[clap(long)]
        result: String,
        #[clap(long, default_value = "")]
        summary: String,
        #[clap(long = "by", default_value = "cli")]
        created_by: String,
        /// JSON object of extracted metrics.
        #[clap(long)]
        metrics: Option<String>,
    },
    Status {
        #[clap(long)]
        gate: String,
    },
    Verify {
        #[clap(long)]
        artifact: String,
        #[clap(long, default_value = "cli")]
        actor: String,
    },
    VerifyGate {
        #[clap(long)]
        gate: String,
        #[clap(long, default_value = "cli")]
        actor: String,
    },
    Report {
        #[clap(long)]
        gate: Option<String>,
        /// 'json' (envelope) or 'text'.
        #[clap(long, default_value = "json")]
        format: String,
    },
    List {
        #[clap(long)]
        gate: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct PlanCli {
    #[clap(subcommand)]
    pub command: PlanCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum PlanCommand {
    /// Pairwise conflicts, graph analysis, and parallel groups for queued tasks.
    Conflicts,
    /// Dependency graph analysis only.
    Graph,
    /// Recommend a worker for one task.
    Route {
        #[clap(long)]
        task: String,
    },
    /// Assign ready tasks to idle workers.
    Assign {
        #[clap(long)]
        max: Option<usize>,
    },
    /// Wave-based execution plan for queued tasks.
    Waves,
}

#[derive(clap::Args, Debug)]
pub(crate) struct EventsCli {
    #[clap(subcommand)]
    pub command: EventsCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum EventsCommand {
    /// Append a decision, risk, blocker, phase, or human-input event.
    Append {
        #[clap(long = "type")]
        event_type: String,
        #[clap(long)]
        actor: String,
        #[clap(long)]
        summary: String,
        /// JSON object of structured details.
        #[clap(long)]
        details: Option<String>,
        #[clap(long)]
        task: Option<String>,
        #[clap(long)]
        gate: Option<String>,
    },
    Query {
        #[clap(long = "type")]
        event_type: Option<String>,
        #[clap(long)]
        actor: Option<String>,
        #[clap(long)]
        task: Option<String>,
        #[clap(long)]
        gate: Option<String>,
        /// Epoch milliseconds.
        #[clap(long)]
        since: Option<i64>,
        #[clap(long)]
        limit: Option<i64>,
    },
    TaskHistory {
        #[clap(long)]
        task: String,
    },
    GateHistory {
        #[clap(long)]
        gate: String,
    },
    Stats {
        #[clap(long)]
        since: Option<i64>,
    },
    Audit,
}

#[derive(clap::Args, Debug)]
pub(crate) struct RpcCli {
    /// Operation to perform
    #[clap(long)]
    pub op: Option<String>,
    /// JSON parameters
    #[clap(long)]
    pub params: Option<String>,
    /// Read newline-delimited requests from stdin instead of the command line
    #[clap(long)]
    pub stdin: bool,
}
