//! Entity types shared by every subsystem.
//!
//! All enum-like fields are closed sum types. They are parsed once at the API
//! boundary (`FromStr`, serde) and stored as their snake_case names.

use crate::core::error::GatehouseError;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Maximum number of explicit retries a failed task may receive.
pub const MAX_RETRIES: i64 = 3;

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = GatehouseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(GatehouseError::ValidationError(format!(
                        "unknown {} '{}'; expected one of: {}",
                        stringify!($name),
                        other,
                        [$($text),+].join(", ")
                    ))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: GatehouseError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

string_enum! {
    TaskType {
        Planning => "planning",
        Generation => "generation",
        Validation => "validation",
        Coordination => "coordination",
    }
}

string_enum! {
    Priority {
        Critical => "critical",
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

impl Priority {
    /// Lower rank dequeues first.
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

string_enum! {
    WorkerCategory {
        Planning => "planning",
        Generation => "generation",
        Validation => "validation",
    }
}

string_enum! {
    TaskStatus {
        Queued => "queued",
        InProgress => "in_progress",
        Blocked => "blocked",
        Complete => "complete",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl TaskStatus {
    /// Legal persisted transitions. `Failed -> Queued` is only reachable through
    /// an explicit retry, which separately checks the retry budget.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::InProgress)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::InProgress, TaskStatus::Complete)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Queued)
        )
    }
}

string_enum! {
    WorkerStatus {
        Idle => "idle",
        Active => "active",
        Blocked => "blocked",
        CoolingDown => "cooling_down",
        Offline => "offline",
    }
}

string_enum! {
    /// Ordered workflow checkpoints. `E2` is the enhancement-project
    /// assessment that stands in for the PRD gate.
    GateId {
        G1 => "G1",
        E2 => "E2",
        G2 => "G2",
        G3 => "G3",
        G4 => "G4",
        G5 => "G5",
        G6 => "G6",
        G7 => "G7",
        G8 => "G8",
        G9 => "G9",
        G10 => "G10",
    }
}

string_enum! {
    GateStatus {
        Pending => "pending",
        InReview => "in_review",
        Approved => "approved",
        Rejected => "rejected",
        Blocked => "blocked",
    }
}

string_enum! {
    ProofType {
        TestOutput => "test_output",
        CoverageReport => "coverage_report",
        LintOutput => "lint_output",
        SecurityScan => "security_scan",
        BuildOutput => "build_output",
        LighthouseReport => "lighthouse_report",
        AccessibilityScan => "accessibility_scan",
        SpecValidation => "spec_validation",
        DeploymentLog => "deployment_log",
        SmokeTest => "smoke_test",
        Screenshot => "screenshot",
        PrdReview => "prd_review",
        ManualVerification => "manual_verification",
        OperationalDocs => "operational_docs",
        DesignApproval => "design_approval",
    }
}

string_enum! {
    /// Canonical workflow actions checked against gate allow/block lists.
    Action {
        DefineScope => "define_scope",
        GatherRequirements => "gather_requirements",
        WritePrd => "write_prd",
        DesignArchitecture => "design_architecture",
        WriteSpecs => "write_specs",
        CreateDesigns => "create_designs",
        GenerateCode => "generate_code",
        WriteTests => "write_tests",
        RunTests => "run_tests",
        FixBugs => "fix_bugs",
        SecurityScan => "security_scan",
        DeployStaging => "deploy_staging",
        DeployProduction => "deploy_production",
        WriteDocs => "write_docs",
        AssessCodebase => "assess_codebase",
        Handoff => "handoff",
        ApproveGate => "approve_gate",
    }
}

string_enum! {
    PassFail {
        Pass => "pass",
        Fail => "fail",
        Warning => "warning",
        Info => "info",
    }
}

string_enum! {
    EventType {
        ProjectInitialized => "project_initialized",
        TaskCreated => "task_created",
        TaskStarted => "task_started",
        TaskCompleted => "task_completed",
        TaskFailed => "task_failed",
        TaskRetried => "task_retried",
        TaskCancelled => "task_cancelled",
        WorkerRegistered => "worker_registered",
        WorkerStatusChanged => "worker_status_changed",
        AgentSpawned => "agent_spawned",
        AgentCompleted => "agent_completed",
        GateReviewStarted => "gate_review_started",
        GateApproved => "gate_approved",
        GateRejected => "gate_rejected",
        GateBlocked => "gate_blocked",
        ProofSubmitted => "proof_submitted",
        ProofVerified => "proof_verified",
        ProofIntegrityFailed => "proof_integrity_failed",
        PhaseStarted => "phase_started",
        PhaseCompleted => "phase_completed",
        SpecCreated => "spec_created",
        SpecUpdated => "spec_updated",
        SpecLocked => "spec_locked",
        ValidationPassed => "validation_passed",
        ValidationFailed => "validation_failed",
        BlockerCreated => "blocker_created",
        BlockerResolved => "blocker_resolved",
        RiskIdentified => "risk_identified",
        DecisionMade => "decision_made",
        HumanInputRequested => "human_input_requested",
        HumanInputReceived => "human_input_received",
        ErrorOccurred => "error_occurred",
        SelfHealingAttempted => "self_healing_attempted",
        SelfHealingSucceeded => "self_healing_succeeded",
    }
}

impl EventType {
    /// Coarse grouping used by statistics and audit reports.
    pub fn category(&self) -> &'static str {
        use EventType::*;
        match self {
            ProjectInitialized => "project",
            TaskCreated | TaskStarted | TaskCompleted | TaskFailed | TaskRetried
            | TaskCancelled => "task",
            WorkerRegistered | WorkerStatusChanged | AgentSpawned | AgentCompleted => "worker",
            GateReviewStarted | GateApproved | GateRejected | GateBlocked => "gate",
            ProofSubmitted | ProofVerified | ProofIntegrityFailed => "proof",
            PhaseStarted | PhaseCompleted => "phase",
            SpecCreated | SpecUpdated | SpecLocked => "spec",
            ValidationPassed | ValidationFailed => "validation",
            BlockerCreated | BlockerResolved => "blocker",
            RiskIdentified => "risk",
            DecisionMade => "decision",
            HumanInputRequested | HumanInputReceived => "human_input",
            ErrorOccurred => "error",
            SelfHealingAttempted | SelfHealingSucceeded => "self_healing",
        }
    }

    /// Event types an external caller may append directly. Lifecycle events for
    /// tasks, workers, gates, and proofs are only written by their owning operation.
    pub fn is_caller_appendable(&self) -> bool {
        !matches!(
            self.category(),
            "task" | "worker" | "gate" | "proof" | "project"
        )
    }
}

/// Caller-supplied shape for `enqueue`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskSpec {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
    pub priority: Option<Priority>,
    pub worker_category: Option<WorkerCategory>,
    pub description: String,
    pub dependencies: Vec<String>,
    pub gate_dependency: Option<GateId>,
    pub spec_refs: Vec<String>,
    pub story_refs: Vec<String>,
    /// Files the task expects to create or modify; used for file-conflict analysis.
    pub file_refs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskOutput {
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub verification: std::collections::BTreeMap<String, bool>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TaskError {
    pub message: String,
    #[serde(default = "default_error_code")]
    pub code: String,
    #[serde(default = "default_true")]
    pub recoverable: bool,
}

fn default_error_code() -> String {
    "UNKNOWN".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: Priority,
    pub worker_category: WorkerCategory,
    pub description: String,
    pub dependencies: Vec<String>,
    pub gate_dependency: Option<GateId>,
    pub spec_refs: Vec<String>,
    pub story_refs: Vec<String>,
    pub file_refs: Vec<String>,
    pub status: TaskStatus,
    pub assigned_worker: Option<String>,
    pub retry_count: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub output: Option<TaskOutput>,
    pub error: Option<TaskError>,
}

impl Task {
    /// Declared files plus any files reported in the output.
    pub fn touched_files(&self) -> Vec<String> {
        let mut files = self.file_refs.clone();
        if let Some(out) = &self.output {
            files.extend(out.files_created.iter().cloned());
            files.extend(out.files_modified.iter().cloned());
        }
        files.sort();
        files.dedup();
        files
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSpec {
    pub id: String,
    pub category: Option<WorkerCategory>,
    pub capabilities: Vec<String>,
    pub spec_consumption: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Worker {
    pub id: String,
    pub category: WorkerCategory,
    pub capabilities: Vec<String>,
    pub spec_consumption: Vec<String>,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub tasks_completed: i64,
    pub error_count: i64,
    pub average_task_duration_ms: f64,
    pub registered_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Gate {
    pub id: GateId,
    pub status: GateStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<i64>,
    pub rejection_reason: Option<String>,
    pub updated_at: i64,
}

/// Caller-supplied shape for proof submission.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProofSubmission {
    pub gate: GateId,
    pub proof_type: ProofType,
    pub file_path: String,
    #[serde(default)]
    pub content_summary: String,
    pub pass_fail: PassFail,
    #[serde(default = "default_creator")]
    pub created_by: String,
    /// Quality figures extracted from the artifact, e.g. `{"coverage_percent": 87.5}`.
    #[serde(default)]
    pub metrics: Option<JsonValue>,
}

fn default_creator() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProofArtifact {
    pub id: String,
    pub gate: GateId,
    pub proof_type: ProofType,
    pub file_path: String,
    pub file_hash: String,
    pub content_summary: String,
    pub pass_fail: PassFail,
    pub verified: bool,
    pub metrics: Option<JsonValue>,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EventLogEntry {
    pub id: i64,
    pub event_type: EventType,
    pub actor: String,
    pub summary: String,
    pub details: JsonValue,
    pub related_task_id: Option<String>,
    pub related_gate: Option<GateId>,
    pub timestamp: i64,
}

/// An event about to be appended; the store assigns id and timestamp.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewEvent {
    pub event_type: EventType,
    pub actor: String,
    pub summary: String,
    #[serde(default)]
    pub details: JsonValue,
    #[serde(default)]
    pub related_task_id: Option<String>,
    #[serde(default)]
    pub related_gate: Option<GateId>,
}

impl NewEvent {
    pub fn new(event_type: EventType, actor: &str, summary: impl Into<String>) -> Self {
        Self {
            event_type,
            actor: actor.to_string(),
            summary: summary.into(),
            details: JsonValue::Null,
            related_task_id: None,
            related_gate: None,
        }
    }

    pub fn details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.related_task_id = Some(task_id.to_string());
        self
    }

    pub fn gate(mut self, gate: GateId) -> Self {
        self.related_gate = Some(gate);
        self
    }
}
