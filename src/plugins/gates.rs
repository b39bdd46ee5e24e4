//! Gate state machine.
//!
//! Each gate declares which actions are allowed or blocked while it is the
//! active checkpoint, who must be involved, what comes next, and the condition
//! a caller must meet before moving on. `open_review`, `approve` and `reject`
//! are the only operations that change a gate's status; approval re-checks the
//! proof ledger inside the same transaction that flips the status.

use crate::core::error::GatehouseError;
use crate::core::model::{Action, EventType, Gate, GateId, GateStatus, NewEvent};
use crate::core::store::Store;
use crate::core::time::{new_id, now_ms};
use crate::core::truth::{self, AgentSpawn};
use crate::plugins::proof::{self, GateProofStatus};
use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{info, instrument, warn};

use Action::*;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GateDefinition {
    pub id: GateId,
    pub name: &'static str,
    pub allowed: &'static [Action],
    pub blocked: &'static [Action],
    pub required_roles: &'static [&'static str],
    pub next: Option<GateId>,
    pub transition_condition: &'static str,
    /// Gates that must be approved before work for this gate may proceed.
    pub prerequisites: &'static [GateId],
}

const DEFINITIONS: &[GateDefinition] = &[
    GateDefinition {
        id: GateId::G1,
        name: "Scope approval",
        allowed: &[DefineScope, GatherRequirements, AssessCodebase, ApproveGate],
        blocked: &[
            WritePrd,
            DesignArchitecture,
            CreateDesigns,
            GenerateCode,
            WriteTests,
            DeployStaging,
            DeployProduction,
        ],
        required_roles: &[],
        next: Some(GateId::G2),
        transition_condition: "user explicitly approves the project scope",
        prerequisites: &[],
    },
    GateDefinition {
        id: GateId::E2,
        name: "Enhancement assessment",
        allowed: &[AssessCodebase, GatherRequirements, RunTests, SecurityScan, ApproveGate],
        blocked: &[GenerateCode, DeployStaging, DeployProduction],
        required_roles: &["Architect"],
        next: Some(GateId::G3),
        transition_condition: "user approves the assessment of the existing codebase",
        prerequisites: &[GateId::G1],
    },
    GateDefinition {
        id: GateId::G2,
        name: "PRD approval",
        allowed: &[GatherRequirements, WritePrd, ApproveGate],
        blocked: &[
            DesignArchitecture,
            CreateDesigns,
            GenerateCode,
            DeployStaging,
            DeployProduction,
        ],
        required_roles: &["Product Manager"],
        next: Some(GateId::G3),
        transition_condition: "user explicitly approves the PRD",
        prerequisites: &[GateId::G1],
    },
    GateDefinition {
        id: GateId::G3,
        name: "Architecture approval",
        allowed: &[DesignArchitecture, WriteSpecs, ApproveGate],
        blocked: &[GenerateCode, DeployStaging, DeployProduction],
        required_roles: &["Architect"],
        next: Some(GateId::G4),
        transition_condition: "user approves the architecture and locked specs",
        prerequisites: &[GateId::G1, GateId::G2],
    },
    GateDefinition {
        id: GateId::G4,
        name: "Design approval",
        allowed: &[CreateDesigns, WriteSpecs, ApproveGate],
        blocked: &[GenerateCode, DeployStaging, DeployProduction],
        required_roles: &["UX/UI Designer"],
        next: Some(GateId::G5),
        transition_condition: "user selects and approves a final design",
        prerequisites: &[GateId::G1, GateId::G2, GateId::G3],
    },
    GateDefinition {
        id: GateId::G5,
        name: "Development complete",
        allowed: &[GenerateCode, WriteTests, RunTests, FixBugs, WriteDocs, ApproveGate],
        blocked: &[DeployStaging, DeployProduction],
        required_roles: &["Frontend Developer", "Backend Developer"],
        next: Some(GateId::G6),
        transition_condition: "automatic once build and lint proofs pass",
        prerequisites: &[GateId::G1, GateId::G2, GateId::G3, GateId::G4],
    },
    GateDefinition {
        id: GateId::G6,
        name: "Testing complete",
        allowed: &[WriteTests, RunTests, FixBugs, ApproveGate],
        blocked: &[DeployStaging, DeployProduction],
        required_roles: &["QA Engineer"],
        next: Some(GateId::G7),
        transition_condition: "automatic once test, coverage and audit proofs pass",
        prerequisites: &[],
    },
    GateDefinition {
        id: GateId::G7,
        name: "Security review",
        allowed: &[SecurityScan, FixBugs, RunTests, ApproveGate],
        blocked: &[DeployStaging, DeployProduction],
        required_roles: &["Security & Privacy Engineer"],
        next: Some(GateId::G8),
        transition_condition: "no critical or high vulnerabilities remain",
        prerequisites: &[],
    },
    GateDefinition {
        id: GateId::G8,
        name: "Staging deployment",
        allowed: &[DeployStaging, RunTests, FixBugs, WriteDocs, ApproveGate],
        blocked: &[DeployProduction],
        required_roles: &["DevOps Engineer"],
        next: Some(GateId::G9),
        transition_condition: "staging deploy and smoke tests succeed",
        prerequisites: &[GateId::G5, GateId::G6],
    },
    GateDefinition {
        id: GateId::G9,
        name: "Production deployment",
        allowed: &[DeployProduction, WriteDocs, ApproveGate],
        blocked: &[GenerateCode, CreateDesigns],
        required_roles: &["DevOps Engineer"],
        next: Some(GateId::G10),
        transition_condition: "user explicitly approves the production release",
        prerequisites: &[GateId::G8],
    },
    GateDefinition {
        id: GateId::G10,
        name: "Project handoff",
        allowed: &[Handoff, WriteDocs, ApproveGate],
        blocked: &[GenerateCode, DeployProduction],
        required_roles: &[],
        next: None,
        transition_condition: "user accepts the handoff",
        prerequisites: &[GateId::G9],
    },
];

pub fn definitions() -> &'static [GateDefinition] {
    DEFINITIONS
}

pub fn definition(gate: GateId) -> &'static GateDefinition {
    // DEFINITIONS has one entry per GateId in declaration order.
    &DEFINITIONS[GateId::ALL.iter().position(|g| *g == gate).unwrap_or(0)]
}

// --- Actions ---

const ACTION_ALIASES: &[(&str, Action)] = &[
    ("scope", DefineScope),
    ("define_project_scope", DefineScope),
    ("requirements", GatherRequirements),
    ("collect_requirements", GatherRequirements),
    ("create_prd", WritePrd),
    ("draft_prd", WritePrd),
    ("architecture", DesignArchitecture),
    ("design_system", DesignArchitecture),
    ("write_spec", WriteSpecs),
    ("create_specs", WriteSpecs),
    ("design", CreateDesigns),
    ("create_design", CreateDesigns),
    ("write_code", GenerateCode),
    ("implement", GenerateCode),
    ("implement_feature", GenerateCode),
    ("code", GenerateCode),
    ("add_tests", WriteTests),
    ("test", RunTests),
    ("run_test_suite", RunTests),
    ("fix_bug", FixBugs),
    ("debug", FixBugs),
    ("security_audit", SecurityScan),
    ("deploy", DeployStaging),
    ("deploy_to_staging", DeployStaging),
    ("release", DeployProduction),
    ("deploy_to_production", DeployProduction),
    ("document", WriteDocs),
    ("docs", WriteDocs),
    ("assess", AssessCodebase),
    ("audit_codebase", AssessCodebase),
    ("hand_off", Handoff),
    ("approve", ApproveGate),
];

/// Lowercase, trim, and fold `-` and spaces into `_`.
pub fn normalize_action(surface: &str) -> String {
    surface
        .trim()
        .to_lowercase()
        .split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Resolve a surface name to its canonical action.
pub fn resolve_action(surface: &str) -> Result<Action, GatehouseError> {
    let norm = normalize_action(surface);
    if let Ok(a) = norm.parse::<Action>() {
        return Ok(a);
    }
    ACTION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == norm)
        .map(|(_, a)| *a)
        .ok_or_else(|| GatehouseError::ValidationError(format!("unknown action '{}'", surface)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedList {
    Allowed,
    Blocked,
    Neither,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionVerdict {
    pub gate: GateId,
    pub action: Action,
    pub allowed: bool,
    pub matched_list: MatchedList,
    pub reason: Option<String>,
    /// Other gates whose allow-list contains the action (rejections only).
    pub permitted_in: Vec<GateId>,
}

/// Diagnostic check of an action against a gate. Never changes state.
pub fn validate(gate: GateId, surface_action: &str) -> Result<ActionVerdict, GatehouseError> {
    let action = resolve_action(surface_action)?;
    let def = definition(gate);
    let (allowed, matched_list, reason) = if def.blocked.contains(&action) {
        (
            false,
            MatchedList::Blocked,
            Some(format!("{} is blocked during {} ({})", action, gate, def.name)),
        )
    } else if def.allowed.contains(&action) {
        (true, MatchedList::Allowed, None)
    } else {
        (
            false,
            MatchedList::Neither,
            Some(format!("{} is not permitted during {} ({})", action, gate, def.name)),
        )
    };
    let permitted_in = if allowed {
        Vec::new()
    } else {
        DEFINITIONS
            .iter()
            .filter(|d| d.id != gate && d.allowed.contains(&action))
            .map(|d| d.id)
            .collect()
    };
    Ok(ActionVerdict {
        gate,
        action,
        allowed,
        matched_list,
        reason,
        permitted_in,
    })
}

// --- Status transitions ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GateTransition {
    Applied { gate: Gate },
    Refused { reason: String },
}

/// Put a gate under review. Allowed from pending, rejected, or blocked.
pub fn open_review(store: &Store, gate: GateId, actor: &str) -> Result<GateTransition, GatehouseError> {
    store.with_tx(|tx| {
        let current = truth::get_gate(tx, gate)?;
        if !matches!(
            current.status,
            GateStatus::Pending | GateStatus::Rejected | GateStatus::Blocked
        ) {
            return Ok(GateTransition::Refused {
                reason: format!("gate {} is {}", gate, current.status),
            });
        }
        truth::set_gate_status(tx, gate, GateStatus::InReview, None, None, now_ms())?;
        truth::append_event(
            tx,
            NewEvent::new(EventType::GateReviewStarted, actor, format!("{} review started", gate))
                .gate(gate)
                .details(serde_json::json!({ "from": current.status })),
        )?;
        Ok(GateTransition::Applied {
            gate: truth::get_gate(tx, gate)?,
        })
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved { gate: Gate, readiness: GateProofStatus },
    /// Readiness failed; the gate is now `blocked`.
    Blocked { reason: String, readiness: GateProofStatus },
    Refused { reason: String },
}

/// Approve a gate if, and only if, the proof ledger says it is ready.
///
/// File validators run before the transaction; proofs and the current status
/// are re-read inside it, so two concurrent approvals cannot both succeed.
#[instrument(skip(store))]
pub fn approve(store: &Store, gate: GateId, actor: &str) -> Result<ApprovalOutcome, GatehouseError> {
    if actor.trim().is_empty() {
        return Err(GatehouseError::ValidationError("approver cannot be empty".to_string()));
    }
    let files = proof::file_validators(&store.project_root, gate);
    let outcome = store.with_tx(|tx| {
        let current = truth::get_gate(tx, gate)?;
        if current.status == GateStatus::Approved {
            return Ok(ApprovalOutcome::Refused {
                reason: format!(
                    "gate {} already approved by {}",
                    gate,
                    current.approved_by.as_deref().unwrap_or("unknown")
                ),
            });
        }
        let readiness = proof::status_in(tx, gate, files.clone())?;
        let ts = now_ms();
        if !readiness.can_approve {
            let reason = readiness.blocking_issues.join("; ");
            truth::set_gate_status(tx, gate, GateStatus::Blocked, None, Some(&reason), ts)?;
            truth::append_event(
                tx,
                NewEvent::new(
                    EventType::GateBlocked,
                    actor,
                    format!("{} approval blocked: {}", gate, reason),
                )
                .gate(gate)
                .details(serde_json::json!({
                    "missing": readiness.missing,
                    "failed_proofs": readiness.failed_proofs,
                    "missing_files": readiness.missing_files,
                })),
            )?;
            return Ok(ApprovalOutcome::Blocked { reason, readiness });
        }
        truth::set_gate_status(tx, gate, GateStatus::Approved, Some(actor), None, ts)?;
        truth::append_event(
            tx,
            NewEvent::new(EventType::GateApproved, actor, format!("{} approved by {}", gate, actor))
                .gate(gate)
                .details(serde_json::json!({
                    "proofs": readiness.submitted,
                    "next": definition(gate).next,
                })),
        )?;
        Ok(ApprovalOutcome::Approved {
            gate: truth::get_gate(tx, gate)?,
            readiness,
        })
    })?;
    match &outcome {
        ApprovalOutcome::Approved { .. } => info!(%gate, actor, "gate approved"),
        ApprovalOutcome::Blocked { reason, .. } => warn!(%gate, reason = %reason, "gate approval blocked"),
        ApprovalOutcome::Refused { .. } => {}
    }
    Ok(outcome)
}

pub fn reject(
    store: &Store,
    gate: GateId,
    actor: &str,
    reason: &str,
) -> Result<GateTransition, GatehouseError> {
    if reason.trim().is_empty() {
        return Err(GatehouseError::ValidationError(
            "a rejection needs a reason".to_string(),
        ));
    }
    store.with_tx(|tx| {
        let current = truth::get_gate(tx, gate)?;
        if matches!(current.status, GateStatus::Approved | GateStatus::Rejected) {
            return Ok(GateTransition::Refused {
                reason: format!("gate {} is already {}", gate, current.status),
            });
        }
        truth::set_gate_status(tx, gate, GateStatus::Rejected, None, Some(reason), now_ms())?;
        truth::append_event(
            tx,
            NewEvent::new(EventType::GateRejected, actor, format!("{} rejected: {}", gate, reason))
                .gate(gate),
        )?;
        Ok(GateTransition::Applied {
            gate: truth::get_gate(tx, gate)?,
        })
    })
}

// --- Prerequisites and roles ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteStatus {
    pub gate: GateId,
    pub prerequisites: Vec<GateId>,
    pub approved: Vec<GateId>,
    pub missing: Vec<GateId>,
    pub satisfied: bool,
}

fn prerequisites_in(conn: &Connection, gate: GateId, required: &[GateId]) -> Result<PrerequisiteStatus, GatehouseError> {
    let mut approved = Vec::new();
    let mut missing = Vec::new();
    for g in required {
        if truth::get_gate(conn, *g)?.status == GateStatus::Approved {
            approved.push(*g);
        } else {
            missing.push(*g);
        }
    }
    Ok(PrerequisiteStatus {
        gate,
        prerequisites: required.to_vec(),
        satisfied: missing.is_empty(),
        approved,
        missing,
    })
}

pub fn prerequisites(store: &Store, gate: GateId) -> Result<PrerequisiteStatus, GatehouseError> {
    store.with_read(|conn| prerequisites_in(conn, gate, definition(gate).prerequisites))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleStatus {
    pub gate: GateId,
    pub required: Vec<String>,
    pub satisfied: Vec<String>,
    pub missing: Vec<String>,
}

/// A role is satisfied once one of its spawns for the gate completed.
fn roles_in(conn: &Connection, gate: GateId) -> Result<RoleStatus, GatehouseError> {
    let spawns = truth::list_spawns(conn, gate)?;
    let mut out = RoleStatus {
        gate,
        required: Vec::new(),
        satisfied: Vec::new(),
        missing: Vec::new(),
    };
    for role in definition(gate).required_roles {
        out.required.push(role.to_string());
        if spawns.iter().any(|s| s.role == *role && s.status == "completed") {
            out.satisfied.push(role.to_string());
        } else {
            out.missing.push(role.to_string());
        }
    }
    Ok(out)
}

pub fn role_status(store: &Store, gate: GateId) -> Result<RoleStatus, GatehouseError> {
    store.with_read(|conn| roles_in(conn, gate))
}

pub fn spawn_agent(store: &Store, gate: GateId, role: &str, actor: &str) -> Result<AgentSpawn, GatehouseError> {
    let role = role.trim();
    let def = definition(gate);
    if !def.required_roles.contains(&role) {
        return Err(GatehouseError::ValidationError(format!(
            "{} does not use role '{}'; expected one of: {}",
            gate,
            role,
            def.required_roles.join(", ")
        )));
    }
    let spawn = AgentSpawn {
        id: new_id("spawn"),
        gate,
        role: role.to_string(),
        status: "running".to_string(),
        spawned_at: now_ms(),
        completed_at: None,
    };
    store.with_tx(|tx| {
        truth::insert_spawn(tx, &spawn)?;
        truth::append_event(
            tx,
            NewEvent::new(EventType::AgentSpawned, actor, format!("{} spawned for {}", spawn.role, gate))
                .gate(gate)
                .details(serde_json::json!({ "spawn_id": spawn.id, "role": spawn.role })),
        )?;
        Ok(())
    })?;
    Ok(spawn)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentCompletion {
    Completed { spawn: AgentSpawn },
    Refused { reason: String },
}

pub fn complete_agent(store: &Store, spawn_id: &str, actor: &str) -> Result<AgentCompletion, GatehouseError> {
    store.with_tx(|tx| {
        let spawn = truth::get_spawn(tx, spawn_id)?
            .ok_or_else(|| GatehouseError::NotFound(format!("agent spawn '{}'", spawn_id)))?;
        if spawn.status == "completed" {
            return Ok(AgentCompletion::Refused {
                reason: format!("spawn {} already completed", spawn_id),
            });
        }
        let ts = now_ms();
        truth::complete_spawn(tx, spawn_id, ts)?;
        truth::append_event(
            tx,
            NewEvent::new(
                EventType::AgentCompleted,
                actor,
                format!("{} finished for {}", spawn.role, spawn.gate),
            )
            .gate(spawn.gate)
            .details(serde_json::json!({
                "spawn_id": spawn_id,
                "role": spawn.role,
                "duration_ms": ts - spawn.spawned_at,
            })),
        )?;
        Ok(AgentCompletion::Completed {
            spawn: truth::get_spawn(tx, spawn_id)?.unwrap_or(spawn),
        })
    })
}

// --- Work detection ---

static COMMAND_PATTERNS: LazyLock<Vec<(Regex, GateId)>> = LazyLock::new(|| {
    [
        (r"\b(npm|yarn|pnpm)\s+audit\b", GateId::G7),
        (r"\b(snyk|bandit|trivy|semgrep|gitleaks)\b", GateId::G7),
        (r"\bcargo\s+(audit|deny)\b", GateId::G7),
        (r"\b(npm|yarn|pnpm)\s+(run\s+)?test\b", GateId::G6),
        (r"\b(pytest|jest|vitest|playwright|cypress)\b", GateId::G6),
        (r"\b(cargo|go)\s+test\b", GateId::G6),
        (r"\blighthouse\b", GateId::G6),
        (r"\bdocker\s+(build|push|compose)\b", GateId::G8),
        (r"\b(kubectl|helm)\b", GateId::G8),
        (r"\bterraform\s+apply\b", GateId::G8),
        (r"\b(vercel|netlify|fly)\s+deploy\b", GateId::G8),
        (r"\b(npm|yarn|pnpm)\s+(install|add|run\s+build|build)\b", GateId::G5),
        (r"\bcargo\s+(build|add)\b", GateId::G5),
        (r"\b(tsc|pip\s+install)\b", GateId::G5),
    ]
    .into_iter()
    .filter_map(|(p, g)| Regex::new(p).ok().map(|r| (r, g)))
    .collect()
});

static FILE_PATTERNS: LazyLock<Vec<(Regex, GateId)>> = LazyLock::new(|| {
    [
        (r"(^|/)PRD\.md$", GateId::G2),
        (r"(^|/)docs/prd/", GateId::G2),
        (r"(^|/)(ARCHITECTURE\.md|openapi\.ya?ml)$", GateId::G3),
        (r"(^|/)specs/", GateId::G3),
        (r"(^|/)designs/", GateId::G4),
        (r"(^|/)(tests?|__tests__|e2e)/", GateId::G6),
        (r"\.(test|spec)\.[jt]sx?$", GateId::G6),
        (r"_test\.(go|py)$", GateId::G6),
        (r"(^|/)(Dockerfile|docker-compose\.ya?ml|compose\.ya?ml)$", GateId::G8),
        (r"(^|/)(k8s|deploy|\.github/workflows)/", GateId::G8),
        (r"(^|/)src/", GateId::G5),
        (r"\.(rs|ts|tsx|js|jsx|py|go|java|kt|swift|rb|cs|vue|svelte)$", GateId::G5),
    ]
    .into_iter()
    .filter_map(|(p, g)| Regex::new(p).ok().map(|r| (r, g)))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDetection {
    pub gate: GateId,
    pub pattern: String,
}

fn detect(patterns: &[(Regex, GateId)], subject: &str) -> Option<GateDetection> {
    patterns
        .iter()
        .find(|(re, _)| re.is_match(subject))
        .map(|(re, gate)| GateDetection {
            gate: *gate,
            pattern: re.as_str().to_string(),
        })
}

pub fn detect_gate_for_command(command: &str) -> Option<GateDetection> {
    detect(&COMMAND_PATTERNS, command.trim())
}

pub fn detect_gate_for_file(path: &str) -> Option<GateDetection> {
    detect(&FILE_PATTERNS, &path.trim().replace('\\', "/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Command,
    File,
}

impl std::str::FromStr for WorkKind {
    type Err = GatehouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "command" => Ok(Self::Command),
            "file" => Ok(Self::File),
            other => Err(GatehouseError::ValidationError(format!(
                "unknown work kind '{}'; expected command or file",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkVerdict {
    pub allowed: bool,
    pub detection: Option<GateDetection>,
    pub reason: String,
    pub missing_prerequisites: Vec<GateId>,
    pub missing_roles: Vec<String>,
}

/// Code changes need scope, PRD and architecture signed off.
const CODE_WORK_GATES: &[GateId] = &[GateId::G1, GateId::G2, GateId::G3];

/// Decide whether a command or file edit may proceed given gate state.
pub fn check_work(store: &Store, kind: WorkKind, subject: &str) -> Result<WorkVerdict, GatehouseError> {
    let detection = match kind {
        WorkKind::Command => detect_gate_for_command(subject),
        WorkKind::File => detect_gate_for_file(subject),
    };
    let Some(found) = detection else {
        return Ok(WorkVerdict {
            allowed: true,
            detection: None,
            reason: "not governed by any gate".to_string(),
            missing_prerequisites: Vec::new(),
            missing_roles: Vec::new(),
        });
    };
    let gate = found.gate;
    let mut required: Vec<GateId> = definition(gate).prerequisites.to_vec();
    if kind == WorkKind::File && gate == GateId::G5 {
        for g in CODE_WORK_GATES {
            if !required.contains(g) {
                required.push(*g);
            }
        }
    }
    let (prereqs, roles) = store.with_read(|conn| {
        Ok((prerequisites_in(conn, gate, &required)?, roles_in(conn, gate)?))
    })?;

    let mut reasons = Vec::new();
    if !prereqs.missing.is_empty() {
        let list: Vec<&str> = prereqs.missing.iter().map(|g| g.as_str()).collect();
        reasons.push(format!("{} work needs {} approved first", gate, list.join(", ")));
    }
    if !roles.missing.is_empty() {
        reasons.push(format!("{} needs completed work from: {}", gate, roles.missing.join(", ")));
    }
    Ok(WorkVerdict {
        allowed: reasons.is_empty(),
        reason: if reasons.is_empty() {
            format!("{} work may proceed", gate)
        } else {
            reasons.join("; ")
        },
        detection: Some(found),
        missing_prerequisites: prereqs.missing,
        missing_roles: roles.missing,
    })
}
