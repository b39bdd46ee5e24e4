//! Proof artifact ledger.
//!
//! Gates are approved on evidence, not on a worker's word. Each artifact is a
//! file on disk whose SHA-256 is captured at submission; readiness for a gate
//! combines the required proof types, project-specific file validators, and
//! numeric metric checks. Hashing runs outside any store transaction and is
//! bounded by `proofs.hash_timeout_secs`.

use crate::core::error::GatehouseError;
use crate::core::model::{
    EventType, GateId, GateStatus, NewEvent, PassFail, ProofArtifact, ProofSubmission, ProofType,
};
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time::{new_id, now_ms};
use crate::core::truth;
use rayon::prelude::*;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{info, instrument, warn};

use ProofType::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProofRequirements {
    pub required: &'static [ProofType],
    pub optional: &'static [ProofType],
}

pub fn requirements(gate: GateId) -> ProofRequirements {
    let (required, optional): (&'static [ProofType], &'static [ProofType]) = match gate {
        GateId::G1 => (&[], &[PrdReview, ManualVerification]),
        GateId::E2 => (
            &[ManualVerification],
            &[TestOutput, CoverageReport, SecurityScan],
        ),
        GateId::G2 => (&[PrdReview], &[ManualVerification]),
        GateId::G3 => (&[SpecValidation], &[DesignApproval]),
        GateId::G4 => (&[DesignApproval], &[Screenshot, AccessibilityScan]),
        GateId::G5 => (&[BuildOutput, LintOutput], &[TestOutput, SpecValidation]),
        GateId::G6 => (
            &[TestOutput, CoverageReport, AccessibilityScan, LighthouseReport],
            &[SmokeTest, Screenshot],
        ),
        GateId::G7 => (&[SecurityScan, LintOutput], &[ManualVerification]),
        GateId::G8 => (&[DeploymentLog, SmokeTest], &[LighthouseReport]),
        GateId::G9 => (
            &[DeploymentLog, SmokeTest, OperationalDocs],
            &[ManualVerification],
        ),
        GateId::G10 => (&[ManualVerification], &[OperationalDocs]),
    };
    ProofRequirements { required, optional }
}

/// Metrics that must be reported as concrete numbers before the gate can pass.
pub fn required_metrics(gate: GateId) -> &'static [&'static str] {
    match gate {
        GateId::G6 => &["test_pass_rate", "coverage_percent"],
        GateId::G7 => &["critical_vulnerabilities", "high_vulnerabilities"],
        GateId::G8 => &["performance_score"],
        _ => &[],
    }
}

/// A finite JSON number, or a string holding one with an optional trailing `%`.
pub fn is_concrete_number(value: &JsonValue) -> bool {
    match value {
        JsonValue::Number(n) => n.as_f64().is_some_and(f64::is_finite),
        JsonValue::String(s) => {
            let t = s.trim();
            let t = t.strip_suffix('%').unwrap_or(t).trim_end();
            !t.is_empty()
                && t.chars()
                    .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
                && t.parse::<f64>().is_ok_and(f64::is_finite)
        }
        _ => false,
    }
}

// --- Hashing ---

pub fn sha256_file(path: &Path) -> Result<String, GatehouseError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash on a helper thread so a slow filesystem cannot stall the caller
/// past `timeout`.
pub fn hash_with_timeout(path: &Path, timeout: Duration) -> Result<String, GatehouseError> {
    let (tx, rx) = mpsc::channel();
    let owned: PathBuf = path.to_path_buf();
    thread::spawn(move || {
        let _ = tx.send(sha256_file(&owned));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(GatehouseError::Timeout(format!(
            "hashing {} exceeded {}s",
            path.display(),
            timeout.as_secs()
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(GatehouseError::Timeout(format!(
            "hashing {} aborted",
            path.display()
        ))),
    }
}

fn hash_timeout(store: &Store) -> Duration {
    Duration::from_secs(store.config().proofs.hash_timeout_secs)
}

// --- File validators ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheck {
    pub path: String,
    pub directory: bool,
    pub reason: String,
    pub present: bool,
}

fn check(root: &Path, rel: &str, directory: bool, reason: &str) -> FileCheck {
    let p = root.join(rel.trim_end_matches('/'));
    FileCheck {
        path: rel.to_string(),
        directory,
        reason: reason.to_string(),
        present: if directory { p.is_dir() } else { p.is_file() },
    }
}

pub fn is_ui_project(root: &Path) -> bool {
    ["src/components", "src/pages", "components", "pages", "app"]
        .iter()
        .any(|d| root.join(d).is_dir())
}

/// `ai_ml` or `hybrid` in `.gatehouse/project_type`.
pub fn is_ai_project(root: &Path) -> bool {
    let marker = root
        .join(schemas::STATE_DIR_NAME)
        .join(schemas::PROJECT_TYPE_MARKER);
    fs::read_to_string(marker)
        .map(|s| matches!(s.trim().to_lowercase().as_str(), "ai_ml" | "hybrid"))
        .unwrap_or(false)
}

pub fn has_compose_file(root: &Path) -> bool {
    [
        "docker-compose.yml",
        "docker-compose.yaml",
        "compose.yml",
        "compose.yaml",
    ]
    .iter()
    .any(|f| root.join(f).is_file())
}

/// Gate-specific files that must exist regardless of submitted proofs.
pub fn file_validators(root: &Path, gate: GateId) -> Vec<FileCheck> {
    let mut checks = Vec::new();
    if gate == GateId::G4 && is_ui_project(root) {
        let why = "UI projects need three design alternatives and a final design";
        for f in ["designs/design-1.html", "designs/design-2.html", "designs/design-3.html"] {
            checks.push(check(root, f, false, why));
        }
        checks.push(check(root, "designs/final/", true, why));
    }
    if is_ai_project(root) {
        let why = "AI/ML project";
        match gate {
            GateId::G5 => checks.push(check(root, "prompts/", true, why)),
            GateId::G6 => {
                checks.push(check(root, "evals/", true, why));
                checks.push(check(root, "docs/EVAL_REPORT.md", false, why));
            }
            GateId::G7 => checks.push(check(root, "docs/AI_SAFETY_REVIEW.md", false, why)),
            GateId::G8 | GateId::G9 => {
                checks.push(check(root, "docs/MODEL_MONITORING.md", false, why))
            }
            _ => {}
        }
    }
    if matches!(gate, GateId::G8 | GateId::G9) && has_compose_file(root) {
        let why = "compose file present";
        checks.push(check(root, "docs/RUNBOOK.md", false, why));
        checks.push(check(root, "docs/DEPLOYMENT_GUIDE.md", false, why));
    }
    checks
}

// --- Readiness ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonNumericMetric {
    pub metric: String,
    pub value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsCompliance {
    pub required: Vec<String>,
    pub compliant: Vec<String>,
    pub missing: Vec<String>,
    pub non_numeric: Vec<NonNumericMetric>,
    pub passed: bool,
}

/// Metrics are read from the latest passing proof of each type.
fn metrics_compliance(
    gate: GateId,
    latest: &BTreeMap<ProofType, ProofArtifact>,
) -> Option<MetricsCompliance> {
    let required = required_metrics(gate);
    if required.is_empty() {
        return None;
    }
    let mut reported: BTreeMap<&str, &JsonValue> = BTreeMap::new();
    for proof in latest.values().filter(|p| p.pass_fail == PassFail::Pass) {
        if let Some(JsonValue::Object(map)) = &proof.metrics {
            for (k, v) in map {
                reported.insert(k.as_str(), v);
            }
        }
    }
    let mut out = MetricsCompliance {
        required: required.iter().map(|s| s.to_string()).collect(),
        compliant: Vec::new(),
        missing: Vec::new(),
        non_numeric: Vec::new(),
        passed: false,
    };
    for name in required {
        match reported.get(name) {
            None => out.missing.push(name.to_string()),
            Some(v) if is_concrete_number(v) => out.compliant.push(name.to_string()),
            Some(v) => out.non_numeric.push(NonNumericMetric {
                metric: name.to_string(),
                value: (*v).clone(),
            }),
        }
    }
    out.passed = out.missing.is_empty() && out.non_numeric.is_empty();
    Some(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateProofStatus {
    pub gate: GateId,
    pub required: Vec<ProofType>,
    pub optional: Vec<ProofType>,
    pub submitted: Vec<ProofType>,
    pub missing: Vec<ProofType>,
    /// Required proofs whose latest submission is not `pass`.
    pub failed_proofs: Vec<ProofType>,
    pub file_checks: Vec<FileCheck>,
    pub missing_files: Vec<String>,
    pub metrics: Option<MetricsCompliance>,
    pub blocking_issues: Vec<String>,
    pub can_approve: bool,
}

/// Combine proofs, file checks, and metrics into one verdict. Every check
/// blocks on its own.
pub fn evaluate(
    gate: GateId,
    latest: &BTreeMap<ProofType, ProofArtifact>,
    file_checks: Vec<FileCheck>,
) -> GateProofStatus {
    let req = requirements(gate);
    let missing: Vec<ProofType> = req
        .required
        .iter()
        .filter(|t| !latest.contains_key(*t))
        .copied()
        .collect();
    let failed_proofs: Vec<ProofType> = req
        .required
        .iter()
        .filter(|t| latest.get(*t).is_some_and(|p| p.pass_fail != PassFail::Pass))
        .copied()
        .collect();
    let missing_files: Vec<String> = file_checks
        .iter()
        .filter(|c| !c.present)
        .map(|c| c.path.clone())
        .collect();
    let metrics = metrics_compliance(gate, latest);

    let mut blocking = Vec::new();
    for t in &missing {
        blocking.push(format!("missing required proof: {}", t));
    }
    for t in &failed_proofs {
        let verdict = latest.get(t).map(|p| p.pass_fail.as_str()).unwrap_or("unknown");
        blocking.push(format!("required proof {} is {}", t, verdict));
    }
    for c in file_checks.iter().filter(|c| !c.present) {
        blocking.push(format!("missing {} ({})", c.path, c.reason));
    }
    if let Some(m) = &metrics {
        for name in &m.missing {
            blocking.push(format!("metric {} not reported", name));
        }
        for nn in &m.non_numeric {
            blocking.push(format!("metric {} is not a number: {}", nn.metric, nn.value));
        }
    }

    GateProofStatus {
        gate,
        required: req.required.to_vec(),
        optional: req.optional.to_vec(),
        submitted: latest.keys().copied().collect(),
        missing,
        failed_proofs,
        file_checks,
        missing_files,
        metrics,
        can_approve: blocking.is_empty(),
        blocking_issues: blocking,
    }
}

/// Readiness inside an open transaction, with file checks computed beforehand.
pub(crate) fn status_in(
    conn: &Connection,
    gate: GateId,
    file_checks: Vec<FileCheck>,
) -> Result<GateProofStatus, GatehouseError> {
    let latest = truth::latest_proofs_by_type(conn, gate)?;
    Ok(evaluate(gate, &latest, file_checks))
}

pub fn gate_proof_status(store: &Store, gate: GateId) -> Result<GateProofStatus, GatehouseError> {
    let files = file_validators(&store.project_root, gate);
    store.with_read(|conn| status_in(conn, gate, files))
}

// --- Submission ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub artifact: ProofArtifact,
    pub status: GateProofStatus,
}

#[instrument(skip(store, submission), fields(gate = %submission.gate, proof_type = %submission.proof_type))]
pub fn submit(store: &Store, submission: &ProofSubmission) -> Result<SubmitReceipt, GatehouseError> {
    if submission.file_path.trim().is_empty() {
        return Err(GatehouseError::ValidationError(
            "proof file_path is required".to_string(),
        ));
    }
    if submission.created_by.trim().is_empty() {
        return Err(GatehouseError::ValidationError(
            "proof created_by cannot be empty".to_string(),
        ));
    }
    if let Some(m) = &submission.metrics {
        if !m.is_object() {
            return Err(GatehouseError::ValidationError(
                "proof metrics must be a JSON object".to_string(),
            ));
        }
    }
    let path = store.resolve(submission.file_path.trim());
    if !path.is_file() {
        return Err(GatehouseError::ValidationError(format!(
            "proof file does not exist: {}",
            path.display()
        )));
    }
    let path = path.canonicalize().unwrap_or(path);

    let file_hash = hash_with_timeout(&path, hash_timeout(store))?;
    let files = file_validators(&store.project_root, submission.gate);

    let artifact = ProofArtifact {
        id: new_id("proof"),
        gate: submission.gate,
        proof_type: submission.proof_type,
        file_path: path.to_string_lossy().to_string(),
        file_hash,
        content_summary: submission.content_summary.clone(),
        pass_fail: submission.pass_fail,
        verified: false,
        metrics: submission.metrics.clone(),
        created_by: submission.created_by.clone(),
        created_at: now_ms(),
    };

    let status = store.with_tx(|tx| {
        truth::insert_proof(tx, &artifact)?;
        truth::append_event(
            tx,
            NewEvent::new(
                EventType::ProofSubmitted,
                &artifact.created_by,
                format!(
                    "{} proof for {} submitted ({})",
                    artifact.proof_type, artifact.gate, artifact.pass_fail
                ),
            )
            .gate(artifact.gate)
            .details(serde_json::json!({
                "artifact_id": artifact.id,
                "proof_type": artifact.proof_type,
                "file_path": artifact.file_path,
                "file_hash": artifact.file_hash,
                "pass_fail": artifact.pass_fail,
            })),
        )?;
        status_in(tx, artifact.gate, files.clone())
    })?;
    info!(artifact_id = %artifact.id, can_approve = status.can_approve, "proof submitted");
    Ok(SubmitReceipt { artifact, status })
}

// --- Integrity ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub artifact_id: String,
    pub gate: GateId,
    pub proof_type: ProofType,
    pub file_path: String,
    pub valid: bool,
    pub stored_hash: String,
    pub current_hash: Option<String>,
    pub reason: Option<String>,
}

fn recompute(artifact: &ProofArtifact, timeout: Duration) -> Result<IntegrityCheck, GatehouseError> {
    let path = Path::new(&artifact.file_path);
    let mut out = IntegrityCheck {
        artifact_id: artifact.id.clone(),
        gate: artifact.gate,
        proof_type: artifact.proof_type,
        file_path: artifact.file_path.clone(),
        valid: false,
        stored_hash: artifact.file_hash.clone(),
        current_hash: None,
        reason: None,
    };
    if !path.is_file() {
        out.reason = Some("file missing".to_string());
        return Ok(out);
    }
    let current = hash_with_timeout(path, timeout)?;
    out.valid = current == artifact.file_hash;
    if !out.valid {
        out.reason = Some("hash mismatch: file changed since submission".to_string());
    }
    out.current_hash = Some(current);
    Ok(out)
}

fn record_verification(store: &Store, check: &IntegrityCheck, actor: &str) -> Result<(), GatehouseError> {
    store.with_tx(|tx| {
        truth::set_proof_verified(tx, &check.artifact_id, check.valid)?;
        let (event_type, summary) = if check.valid {
            (
                EventType::ProofVerified,
                format!("Proof {} verified", check.artifact_id),
            )
        } else {
            (
                EventType::ProofIntegrityFailed,
                format!(
                    "Proof {} failed integrity check: {}",
                    check.artifact_id,
                    check.reason.as_deref().unwrap_or("unknown")
                ),
            )
        };
        truth::append_event(
            tx,
            NewEvent::new(event_type, actor, summary)
                .gate(check.gate)
                .details(serde_json::to_value(check)?),
        )?;
        Ok(())
    })
}

/// Recompute an artifact's hash. Tampering and missing files come back as
/// `valid: false`, not as errors.
pub fn verify_integrity(
    store: &Store,
    artifact_id: &str,
    actor: &str,
) -> Result<IntegrityCheck, GatehouseError> {
    let artifact = store
        .get_proof(artifact_id)?
        .ok_or_else(|| GatehouseError::NotFound(format!("proof artifact '{}'", artifact_id)))?;
    let check = recompute(&artifact, hash_timeout(store))?;
    if !check.valid {
        warn!(artifact_id, reason = ?check.reason, "proof integrity check failed");
    }
    record_verification(store, &check, actor)?;
    Ok(check)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateIntegrityReport {
    pub gate: GateId,
    pub checked: usize,
    pub valid: usize,
    pub invalid: usize,
    pub results: Vec<IntegrityCheck>,
}

/// Re-hash every artifact of a gate in parallel, then record each outcome.
pub fn verify_gate(store: &Store, gate: GateId, actor: &str) -> Result<GateIntegrityReport, GatehouseError> {
    let artifacts = store.list_proofs(Some(gate))?;
    let timeout = hash_timeout(store);
    let results: Vec<IntegrityCheck> = artifacts
        .par_iter()
        .map(|a| recompute(a, timeout))
        .collect::<Result<_, _>>()?;
    for check in &results {
        record_verification(store, check, actor)?;
    }
    let valid = results.iter().filter(|c| c.valid).count();
    Ok(GateIntegrityReport {
        gate,
        checked: results.len(),
        valid,
        invalid: results.len() - valid,
        results,
    })
}

// --- Reports ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReportSection {
    pub gate: GateId,
    pub gate_status: GateStatus,
    pub readiness: GateProofStatus,
    pub proofs: Vec<ProofArtifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_proofs: usize,
    pub passing: usize,
    pub failing: usize,
    pub verified: usize,
    pub gates_ready: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofReport {
    pub generated_at: i64,
    pub project_root: String,
    pub sections: Vec<GateReportSection>,
    pub summary: ReportSummary,
}

pub fn generate_report(store: &Store, gate: Option<GateId>) -> Result<ProofReport, GatehouseError> {
    let gates: Vec<GateId> = match gate {
        Some(g) => vec![g],
        None => GateId::ALL.to_vec(),
    };
    let file_checks: Vec<Vec<FileCheck>> = gates
        .iter()
        .map(|g| file_validators(&store.project_root, *g))
        .collect();

    store.with_read(|conn| {
        let mut sections = Vec::new();
        let mut summary = ReportSummary {
            total_proofs: 0,
            passing: 0,
            failing: 0,
            verified: 0,
            gates_ready: 0,
        };
        for (g, files) in gates.iter().zip(file_checks.iter()) {
            let proofs = truth::list_proofs(conn, Some(*g))?;
            summary.total_proofs += proofs.len();
            summary.passing += proofs.iter().filter(|p| p.pass_fail == PassFail::Pass).count();
            summary.failing += proofs.iter().filter(|p| p.pass_fail == PassFail::Fail).count();
            summary.verified += proofs.iter().filter(|p| p.verified).count();
            let readiness = status_in(conn, *g, files.clone())?;
            if readiness.can_approve {
                summary.gates_ready += 1;
            }
            sections.push(GateReportSection {
                gate: *g,
                gate_status: truth::get_gate(conn, *g)?.status,
                readiness,
                proofs,
            });
        }
        Ok(ProofReport {
            generated_at: now_ms(),
            project_root: store.project_root.to_string_lossy().to_string(),
            sections,
            summary,
        })
    })
}

/// Terminal rendering of a report.
pub fn render_text(report: &ProofReport) -> String {
    use colored::Colorize;
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "{}", "Proof Artifact Report".bold());
    let _ = writeln!(out, "Project: {}", report.project_root);
    let _ = writeln!(
        out,
        "Proofs: {} total, {} pass, {} fail, {} verified; {} gate(s) ready\n",
        report.summary.total_proofs,
        report.summary.passing,
        report.summary.failing,
        report.summary.verified,
        report.summary.gates_ready
    );
    for section in &report.sections {
        let verdict = if section.readiness.can_approve {
            "READY".bright_green()
        } else {
            "BLOCKED".bright_red()
        };
        let _ = writeln!(
            out,
            "{} [{}] {}",
            section.gate.as_str().bold(),
            section.gate_status,
            verdict
        );
        let required: Vec<&str> = section.readiness.required.iter().map(|t| t.as_str()).collect();
        let _ = writeln!(
            out,
            "  required: {}",
            if required.is_empty() { "-".to_string() } else { required.join(", ") }
        );
        for issue in &section.readiness.blocking_issues {
            let _ = writeln!(out, "  {} {}", "✗".bright_red(), issue);
        }
        for p in &section.proofs {
            let mark = match p.pass_fail {
                PassFail::Pass => "pass".bright_green(),
                PassFail::Fail => "fail".bright_red(),
                PassFail::Warning => "warning".bright_yellow(),
                PassFail::Info => "info".normal(),
            };
            let _ = writeln!(
                out,
                "  - {:<20} {:<8} {}{} {}",
                p.proof_type.as_str(),
                mark,
                &p.file_hash[..p.file_hash.len().min(12)],
                if p.verified { " ✓" } else { "" },
                p.file_path
            );
        }
        let _ = writeln!(out);
    }
    out
}
