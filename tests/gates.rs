use gatehouse::core::error::GatehouseError;
use gatehouse::core::model::{EventType, GateId, GateStatus, PassFail, ProofSubmission, ProofType};
use gatehouse::core::store::Store;
use gatehouse::core::truth::EventFilter;
use gatehouse::plugins::gates::{self, AgentCompletion, ApprovalOutcome, GateTransition, WorkKind};
use gatehouse::plugins::proof;
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn open() -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open(tmp.path()).expect("open store");
    (tmp, store)
}

fn write(root: &Path, rel: &str, body: &str) -> String {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(&path, body).expect("write artifact");
    rel.to_string()
}

fn submit(
    store: &Store,
    gate: GateId,
    proof_type: ProofType,
    file: &str,
    pass_fail: PassFail,
    metrics: Option<serde_json::Value>,
) -> proof::SubmitReceipt {
    proof::submit(
        store,
        &ProofSubmission {
            gate,
            proof_type,
            file_path: file.to_string(),
            content_summary: format!("{} for {}", proof_type, gate),
            pass_fail,
            created_by: "qa-agent".to_string(),
            metrics,
        },
    )
    .expect("submit proof")
}

fn approved(store: &Store, gate: GateId) {
    match gates::approve(store, gate, "user").expect("approve") {
        ApprovalOutcome::Approved { .. } => {}
        other => panic!("expected {gate} approved, got {other:?}"),
    }
}

fn count(store: &Store, event_type: EventType, gate: GateId) -> usize {
    store
        .query_events(&EventFilter {
            event_type: Some(event_type),
            related_gate: Some(gate),
            ..Default::default()
        })
        .expect("query events")
        .len()
}

#[test]
fn failing_test_output_blocks_testing_gate_approval() {
    let (tmp, store) = open();
    let file = write(tmp.path(), "reports/junit.xml", "<testsuite failures=\"3\"/>");
    let receipt = submit(&store, GateId::G6, ProofType::TestOutput, &file, PassFail::Fail, None);
    assert!(!receipt.status.can_approve);

    let outcome = gates::approve(&store, GateId::G6, "user").expect("approve");
    let ApprovalOutcome::Blocked { readiness, reason } = outcome else {
        panic!("expected blocked approval, got {outcome:?}");
    };
    assert!(readiness.failed_proofs.contains(&ProofType::TestOutput));
    assert!(!readiness.can_approve);
    assert!(readiness.missing.contains(&ProofType::CoverageReport));
    assert!(reason.contains("test_output"), "{reason}");

    let gate = store.get_gate(GateId::G6).expect("gate");
    assert_eq!(gate.status, GateStatus::Blocked);
    assert_eq!(count(&store, EventType::GateBlocked, GateId::G6), 1);
    assert_eq!(count(&store, EventType::GateApproved, GateId::G6), 0);
}

#[test]
fn gate_without_required_proofs_is_approved_once() {
    let (_tmp, store) = open();
    approved(&store, GateId::G1);
    let gate = store.get_gate(GateId::G1).expect("gate");
    assert_eq!(gate.status, GateStatus::Approved);
    assert_eq!(gate.approved_by.as_deref(), Some("user"));
    assert!(gate.approved_at.is_some());

    let again = gates::approve(&store, GateId::G1, "someone-else").expect("approve again");
    assert!(matches!(again, ApprovalOutcome::Refused { .. }), "{again:?}");
    assert_eq!(count(&store, EventType::GateApproved, GateId::G1), 1);
    assert_eq!(
        store.get_gate(GateId::G1).expect("gate").approved_by.as_deref(),
        Some("user")
    );
}

#[test]
fn latest_submission_supersedes_an_earlier_failure() {
    let (tmp, store) = open();
    let first = write(tmp.path(), "docs/prd-review-1.md", "changes requested");
    submit(&store, GateId::G2, ProofType::PrdReview, &first, PassFail::Fail, None);
    assert!(matches!(
        gates::approve(&store, GateId::G2, "user").expect("approve"),
        ApprovalOutcome::Blocked { .. }
    ));

    let second = write(tmp.path(), "docs/prd-review-2.md", "looks good");
    let receipt = submit(&store, GateId::G2, ProofType::PrdReview, &second, PassFail::Pass, None);
    assert!(receipt.status.can_approve, "{:?}", receipt.status.blocking_issues);
    approved(&store, GateId::G2);

    let history = gatehouse::plugins::events::gate_history(&store, GateId::G2).expect("history");
    assert_eq!(history.blocked_attempts, 1);
    assert_eq!(history.proofs_submitted, 2);
    assert!(history.approved_at.is_some());
}

#[test]
fn required_metrics_must_be_concrete_numbers() {
    let (tmp, store) = open();
    let smoke = write(tmp.path(), "logs/smoke.txt", "ok");
    let deploy = write(tmp.path(), "logs/deploy.txt", "deployed");
    submit(&store, GateId::G8, ProofType::SmokeTest, &smoke, PassFail::Pass, None);
    let receipt = submit(
        &store,
        GateId::G8,
        ProofType::DeploymentLog,
        &deploy,
        PassFail::Pass,
        Some(json!({"performance_score": "good"})),
    );
    let metrics = receipt.status.metrics.expect("metrics evaluated");
    assert_eq!(metrics.non_numeric.len(), 1);
    assert_eq!(metrics.non_numeric[0].metric, "performance_score");
    assert!(!receipt.status.can_approve);

    let receipt = submit(
        &store,
        GateId::G8,
        ProofType::DeploymentLog,
        &deploy,
        PassFail::Pass,
        Some(json!({"performance_score": "92%"})),
    );
    let metrics = receipt.status.metrics.expect("metrics evaluated");
    assert_eq!(metrics.compliant, vec!["performance_score".to_string()]);
    assert!(receipt.status.can_approve, "{:?}", receipt.status.blocking_issues);
}

#[test]
fn proof_hash_detects_tampering() {
    let (tmp, store) = open();
    let file = write(tmp.path(), "reports/build.log", "build ok");
    let receipt = submit(&store, GateId::G5, ProofType::BuildOutput, &file, PassFail::Pass, None);
    assert_eq!(receipt.artifact.file_hash.len(), 64);
    assert_eq!(
        receipt.artifact.file_hash,
        proof::sha256_file(&tmp.path().join(&file)).expect("hash")
    );

    let check = proof::verify_integrity(&store, &receipt.artifact.id, "auditor").expect("verify");
    assert!(check.valid);
    assert!(store.get_proof(&receipt.artifact.id).expect("get").expect("exists").verified);

    fs::write(tmp.path().join(&file), "build ok, edited later").expect("tamper");
    let check = proof::verify_integrity(&store, &receipt.artifact.id, "auditor").expect("verify");
    assert!(!check.valid);
    assert_ne!(check.current_hash.as_deref(), Some(check.stored_hash.as_str()));
    assert!(!store.get_proof(&receipt.artifact.id).expect("get").expect("exists").verified);
    assert_eq!(count(&store, EventType::ProofIntegrityFailed, GateId::G5), 1);

    fs::remove_file(tmp.path().join(&file)).expect("remove");
    let check = proof::verify_integrity(&store, &receipt.artifact.id, "auditor").expect("verify");
    assert!(!check.valid);
    assert_eq!(check.reason.as_deref(), Some("file missing"));
}

#[test]
fn verify_gate_checks_every_artifact() {
    let (tmp, store) = open();
    let build = write(tmp.path(), "reports/build.log", "build ok");
    let lint = write(tmp.path(), "reports/lint.log", "0 warnings");
    submit(&store, GateId::G5, ProofType::BuildOutput, &build, PassFail::Pass, None);
    submit(&store, GateId::G5, ProofType::LintOutput, &lint, PassFail::Pass, None);
    fs::write(tmp.path().join(&lint), "12 warnings").expect("tamper");

    let report = proof::verify_gate(&store, GateId::G5, "auditor").expect("verify gate");
    assert_eq!(report.checked, 2);
    assert_eq!(report.valid, 1);
    assert_eq!(report.invalid, 1);
}

#[test]
fn missing_proof_file_is_rejected_without_side_effects() {
    let (_tmp, store) = open();
    let err = proof::submit(
        &store,
        &ProofSubmission {
            gate: GateId::G5,
            proof_type: ProofType::BuildOutput,
            file_path: "reports/nowhere.log".to_string(),
            content_summary: String::new(),
            pass_fail: PassFail::Pass,
            created_by: "ci".to_string(),
            metrics: None,
        },
    )
    .expect_err("missing file");
    assert!(matches!(err, GatehouseError::ValidationError(_)));
    assert!(store.list_proofs(Some(GateId::G5)).expect("list").is_empty());
    assert_eq!(count(&store, EventType::ProofSubmitted, GateId::G5), 0);
}

#[test]
fn review_and_rejection_transitions() {
    let (_tmp, store) = open();
    let err = gates::reject(&store, GateId::G3, "user", "   ").expect_err("empty reason");
    assert!(matches!(err, GatehouseError::ValidationError(_)));

    let opened = gates::open_review(&store, GateId::G3, "architect").expect("review");
    assert!(matches!(opened, GateTransition::Applied { .. }), "{opened:?}");
    let twice = gates::open_review(&store, GateId::G3, "architect").expect("review");
    assert!(matches!(twice, GateTransition::Refused { .. }), "{twice:?}");

    let rejected = gates::reject(&store, GateId::G3, "user", "missing data model").expect("reject");
    let GateTransition::Applied { gate } = rejected else {
        panic!("expected rejection applied, got {rejected:?}");
    };
    assert_eq!(gate.status, GateStatus::Rejected);
    assert_eq!(gate.rejection_reason.as_deref(), Some("missing data model"));

    let again = gates::reject(&store, GateId::G3, "user", "still missing").expect("reject");
    assert!(matches!(again, GateTransition::Refused { .. }));

    let reopened = gates::open_review(&store, GateId::G3, "architect").expect("review");
    assert!(matches!(reopened, GateTransition::Applied { .. }));
    assert_eq!(count(&store, EventType::GateReviewStarted, GateId::G3), 2);
    assert_eq!(count(&store, EventType::GateRejected, GateId::G3), 1);

    approved(&store, GateId::G1);
    let late = gates::reject(&store, GateId::G1, "user", "changed my mind").expect("reject");
    assert!(matches!(late, GateTransition::Refused { .. }));
}

#[test]
fn prerequisites_track_approved_gates() {
    let (tmp, store) = open();
    let status = gates::prerequisites(&store, GateId::G3).expect("prerequisites");
    assert_eq!(status.missing, vec![GateId::G1, GateId::G2]);
    assert!(!status.satisfied);

    approved(&store, GateId::G1);
    let review = write(tmp.path(), "docs/prd-review.md", "approved");
    submit(&store, GateId::G2, ProofType::PrdReview, &review, PassFail::Pass, None);
    approved(&store, GateId::G2);

    let status = gates::prerequisites(&store, GateId::G3).expect("prerequisites");
    assert!(status.satisfied);
    assert_eq!(status.approved, vec![GateId::G1, GateId::G2]);
}

#[test]
fn code_edits_need_planning_gates_and_developer_roles() {
    let (tmp, store) = open();
    let verdict = gates::check_work(&store, WorkKind::File, "src/lib.rs").expect("check");
    assert!(!verdict.allowed);
    assert_eq!(verdict.detection.as_ref().map(|d| d.gate), Some(GateId::G5));
    assert_eq!(
        verdict.missing_prerequisites,
        vec![GateId::G1, GateId::G2, GateId::G3, GateId::G4]
    );
    assert_eq!(verdict.missing_roles.len(), 2);

    approved(&store, GateId::G1);
    for (gate, proof_type, file) in [
        (GateId::G2, ProofType::PrdReview, "docs/prd-review.md"),
        (GateId::G3, ProofType::SpecValidation, "docs/spec-validation.md"),
        (GateId::G4, ProofType::DesignApproval, "docs/design-approval.md"),
    ] {
        let f = write(tmp.path(), file, "signed off");
        submit(&store, gate, proof_type, &f, PassFail::Pass, None);
        approved(&store, gate);
    }
    let verdict = gates::check_work(&store, WorkKind::File, "src/lib.rs").expect("check");
    assert!(verdict.missing_prerequisites.is_empty());
    assert!(!verdict.allowed, "roles still missing");

    for role in ["Frontend Developer", "Backend Developer"] {
        let spawn = gates::spawn_agent(&store, GateId::G5, role, "orchestrator").expect("spawn");
        assert_eq!(spawn.status, "running");
        let done = gates::complete_agent(&store, &spawn.id, "orchestrator").expect("complete");
        assert!(matches!(done, AgentCompletion::Completed { .. }));
    }
    let verdict = gates::check_work(&store, WorkKind::File, "src/lib.rs").expect("check");
    assert!(verdict.allowed, "{}", verdict.reason);

    let free = gates::check_work(&store, WorkKind::Command, "ls -la").expect("check");
    assert!(free.allowed);
    assert!(free.detection.is_none());
}

#[test]
fn agent_roles_are_validated_and_completed_once() {
    let (_tmp, store) = open();
    let err = gates::spawn_agent(&store, GateId::G7, "Frontend Developer", "orchestrator")
        .expect_err("wrong role");
    assert!(matches!(err, GatehouseError::ValidationError(_)));

    let spawn = gates::spawn_agent(&store, GateId::G7, "Security & Privacy Engineer", "orchestrator")
        .expect("spawn");
    let roles = gates::role_status(&store, GateId::G7).expect("roles");
    assert_eq!(roles.missing, vec!["Security & Privacy Engineer".to_string()]);

    let done = gates::complete_agent(&store, &spawn.id, "orchestrator").expect("complete");
    let AgentCompletion::Completed { spawn: finished } = done else {
        panic!("expected completion, got {done:?}");
    };
    assert_eq!(finished.status, "completed");
    assert!(finished.completed_at.is_some());

    let twice = gates::complete_agent(&store, &spawn.id, "orchestrator").expect("complete");
    assert!(matches!(twice, AgentCompletion::Refused { .. }));

    let missing = gates::complete_agent(&store, "spawn_unknown", "orchestrator")
        .expect_err("unknown spawn");
    assert!(matches!(missing, GatehouseError::NotFound(_)));

    let roles = gates::role_status(&store, GateId::G7).expect("roles");
    assert!(roles.missing.is_empty());
    assert_eq!(count(&store, EventType::AgentSpawned, GateId::G7), 1);
    assert_eq!(count(&store, EventType::AgentCompleted, GateId::G7), 1);
}

#[test]
fn ui_projects_need_design_files_before_design_approval() {
    let (tmp, store) = open();
    fs::create_dir_all(tmp.path().join("src/components")).expect("mkdir");
    let approval = write(tmp.path(), "docs/design-approval.md", "final pick: 2");
    submit(&store, GateId::G4, ProofType::DesignApproval, &approval, PassFail::Pass, None);

    let status = proof::gate_proof_status(&store, GateId::G4).expect("status");
    assert_eq!(status.missing_files.len(), 4);
    assert!(!status.can_approve);

    for n in 1..=3 {
        write(tmp.path(), &format!("designs/design-{n}.html"), "<html></html>");
    }
    fs::create_dir_all(tmp.path().join("designs/final")).expect("mkdir");
    approved(&store, GateId::G4);
}

#[test]
fn report_summarises_every_gate() {
    let (tmp, store) = open();
    let build = write(tmp.path(), "reports/build.log", "build ok");
    submit(&store, GateId::G5, ProofType::BuildOutput, &build, PassFail::Pass, None);

    let report = proof::generate_report(&store, None).expect("report");
    assert_eq!(report.sections.len(), GateId::ALL.len());
    assert_eq!(report.summary.total_proofs, 1);
    assert_eq!(report.summary.passing, 1);
    assert!(report.summary.gates_ready >= 1, "G1 needs no proofs");

    let text = proof::render_text(&report);
    assert!(text.contains("G5"));
    assert!(text.contains("build_output"));
}
