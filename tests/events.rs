use gatehouse::core::error::GatehouseError;
use gatehouse::core::model::{
    EventType, GateId, NewEvent, TaskError, TaskOutput, TaskSpec, TaskStatus, TaskType,
    WorkerCategory, WorkerSpec,
};
use gatehouse::core::store::Store;
use gatehouse::core::truth::EventFilter;
use gatehouse::plugins::gates::{self, ApprovalOutcome};
use gatehouse::plugins::queue::{self, DequeueOutcome, RetryOutcome};
use gatehouse::plugins::{events, workers};
use rusqlite::Connection;
use serde_json::json;
use tempfile::TempDir;

fn open() -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open(tmp.path()).expect("open store");
    (tmp, store)
}

fn enqueue(store: &Store, id: &str) {
    queue::enqueue(
        store,
        &TaskSpec {
            id: Some(id.to_string()),
            task_type: Some(TaskType::Validation),
            worker_category: Some(WorkerCategory::Validation),
            description: "run the suite".to_string(),
            ..TaskSpec::default()
        },
        "planner",
    )
    .expect("enqueue");
}

fn register(store: &Store, id: &str) {
    workers::register_worker(
        store,
        &WorkerSpec {
            id: id.to_string(),
            category: Some(WorkerCategory::Validation),
            ..WorkerSpec::default()
        },
    )
    .expect("register");
}

fn start(store: &Store, worker: &str) {
    let outcome = queue::dequeue(store, worker, WorkerCategory::Validation).expect("dequeue");
    assert!(matches!(outcome, DequeueOutcome::Assigned { .. }), "{outcome:?}");
}

#[test]
fn lifecycle_event_types_cannot_be_appended_directly() {
    let (_tmp, store) = open();
    let err = events::append(
        &store,
        NewEvent::new(EventType::TaskCompleted, "intruder", "pretend it finished"),
    )
    .expect_err("lifecycle append");
    assert!(matches!(err, GatehouseError::ValidationError(_)));

    let err = events::append(
        &store,
        NewEvent::new(EventType::GateApproved, "intruder", "self-approval").gate(GateId::G9),
    )
    .expect_err("gate append");
    assert!(matches!(err, GatehouseError::ValidationError(_)));
    assert_eq!(
        store.get_gate(GateId::G9).expect("gate").approved_by,
        None,
        "no side effect on gate state"
    );
}

#[test]
fn narrative_events_are_appended_with_details() {
    let (_tmp, store) = open();
    let entry = events::append(
        &store,
        NewEvent::new(EventType::DecisionMade, "architect", "Use SQLite for local state")
            .gate(GateId::G3)
            .details(json!({"alternatives": ["postgres", "files"]})),
    )
    .expect("append");
    assert!(entry.id > 0);
    assert_eq!(entry.related_gate, Some(GateId::G3));

    let found = events::query(
        &store,
        &EventFilter {
            event_type: Some(EventType::DecisionMade),
            ..Default::default()
        },
    )
    .expect("query");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].details["alternatives"][0], "postgres");

    let err = events::append(&store, NewEvent::new(EventType::RiskIdentified, "pm", "  "))
        .expect_err("empty summary");
    assert!(matches!(err, GatehouseError::ValidationError(_)));

    let err = events::append(
        &store,
        NewEvent::new(EventType::RiskIdentified, "pm", "scope creep").details(json!([1, 2])),
    )
    .expect_err("array details");
    assert!(matches!(err, GatehouseError::ValidationError(_)));

    let err = events::append(
        &store,
        NewEvent::new(EventType::BlockerCreated, "pm", "waiting on keys").task("ghost"),
    )
    .expect_err("unknown task");
    assert!(matches!(err, GatehouseError::NotFound(_)));
}

#[test]
fn event_log_rejects_update_and_delete() {
    let (_tmp, store) = open();
    events::append(
        &store,
        NewEvent::new(EventType::PhaseStarted, "orchestrator", "discovery"),
    )
    .expect("append");

    let conn = Connection::open(store.db_path()).expect("open db");
    let update = conn.execute("UPDATE events SET actor = 'someone-else'", []);
    assert!(update.is_err(), "update must be refused");
    let delete = conn.execute("DELETE FROM events", []);
    assert!(delete.is_err(), "delete must be refused");

    let all = store.query_events(&EventFilter::default()).expect("query");
    assert!(all.iter().all(|e| e.actor != "someone-else"));
    assert!(all.iter().any(|e| e.event_type == EventType::PhaseStarted));
}

#[test]
fn event_ids_increase_in_append_order() {
    let (_tmp, store) = open();
    for n in 0..5 {
        events::append(
            &store,
            NewEvent::new(EventType::DecisionMade, "pm", format!("decision {n}")),
        )
        .expect("append");
    }
    let all = store.query_events(&EventFilter::default()).expect("query");
    assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let limited = store
        .query_events(&EventFilter {
            actor: Some("pm".to_string()),
            limit: Some(2),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(limited.len(), 2);
}

#[test]
fn task_history_reconstructs_attempts_and_outcome() {
    let (_tmp, store) = open();
    register(&store, "qa-1");
    enqueue(&store, "suite");

    start(&store, "qa-1");
    queue::complete(
        &store,
        "suite",
        "qa-1",
        TaskStatus::Failed,
        None,
        Some(TaskError {
            message: "flaky network".to_string(),
            code: "E_NET".to_string(),
            recoverable: true,
        }),
    )
    .expect("fail");
    let retried = queue::retry(&store, "suite", "orchestrator").expect("retry");
    assert!(matches!(retried, RetryOutcome::Requeued { .. }), "{retried:?}");

    start(&store, "qa-1");
    queue::complete(
        &store,
        "suite",
        "qa-1",
        TaskStatus::Complete,
        Some(TaskOutput::default()),
        None,
    )
    .expect("complete");

    let history = events::task_history(&store, "suite").expect("history");
    let t = &history.timeline;
    assert!(t.created_at.is_some());
    assert_eq!(t.attempts, 2);
    assert_eq!(t.retries, 1);
    assert_eq!(t.final_event, Some(EventType::TaskCompleted));
    assert!(t.duration_ms.is_some_and(|d| d >= 0));
    assert_eq!(
        history.events.first().map(|e| e.event_type),
        Some(EventType::TaskCreated)
    );

    let err = events::task_history(&store, "nope").expect_err("missing task");
    assert!(matches!(err, GatehouseError::NotFound(_)));
}

#[test]
fn statistics_and_audit_summarise_the_log() {
    let (_tmp, store) = open();
    register(&store, "qa-1");
    enqueue(&store, "suite");
    enqueue(&store, "dropped");
    queue::cancel(&store, "dropped", "pm").expect("cancel");

    match gates::approve(&store, GateId::G1, "user").expect("approve") {
        ApprovalOutcome::Approved { .. } => {}
        other => panic!("expected approval, got {other:?}"),
    }
    gates::reject(&store, GateId::G2, "user", "needs personas").expect("reject");

    for (t, summary) in [
        (EventType::PhaseStarted, "planning"),
        (EventType::DecisionMade, "monorepo"),
        (EventType::BlockerCreated, "waiting on API keys"),
        (EventType::BlockerCreated, "waiting on design"),
        (EventType::BlockerResolved, "keys received"),
        (EventType::HumanInputRequested, "pick a design"),
        (EventType::RiskIdentified, "vendor lock-in"),
        (EventType::ErrorOccurred, "ci outage"),
    ] {
        events::append(&store, NewEvent::new(t, "pm", summary)).expect("append");
    }

    let stats = events::statistics(&store, None).expect("stats");
    assert_eq!(stats.by_type.get("task_created"), Some(&2));
    assert_eq!(stats.by_category.get("blocker"), Some(&3));
    assert_eq!(stats.by_actor.get("pm").copied().unwrap_or(0), 9);
    assert!(stats.elapsed_ms.is_some_and(|ms| ms >= 0));

    let future = events::statistics(&store, Some(i64::MAX)).expect("stats");
    assert_eq!(future.total, 0);
    assert!(future.first_event_at.is_none());

    let audit = events::audit_report(&store).expect("audit");
    assert_eq!(audit.tasks.created, 2);
    assert_eq!(audit.tasks.cancelled, 1);
    assert_eq!(audit.gate_approvals.len(), 1);
    assert_eq!(audit.gate_approvals[0].gate, GateId::G1);
    assert_eq!(audit.gate_approvals[0].approved_by, "user");
    assert_eq!(audit.gate_rejections, 1);
    assert_eq!(audit.phases_started, 1);
    assert_eq!(audit.decisions, 1);
    assert_eq!(audit.blockers_open, 1);
    assert_eq!(audit.human_input_requested, 1);
    assert_eq!(audit.risks, 1);
    assert_eq!(audit.errors, 1);
}

#[test]
fn gate_history_lists_only_that_gate() {
    let (_tmp, store) = open();
    gates::open_review(&store, GateId::G2, "pm").expect("review");
    gates::reject(&store, GateId::G2, "user", "too vague").expect("reject");
    gates::open_review(&store, GateId::G3, "architect").expect("review");

    let history = events::gate_history(&store, GateId::G2).expect("history");
    assert_eq!(history.rejections, 1);
    assert!(history.review_started_at.is_some());
    assert!(history.events.iter().all(|e| e.related_gate == Some(GateId::G2)));
    assert_eq!(history.events.len(), 2);
}
