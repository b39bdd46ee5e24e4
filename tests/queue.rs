use gatehouse::core::error::GatehouseError;
use gatehouse::core::model::{
    EventType, GateId, Priority, TaskError, TaskOutput, TaskSpec, TaskStatus, TaskType,
    WorkerCategory, WorkerSpec, WorkerStatus,
};
use gatehouse::core::store::Store;
use gatehouse::core::truth::EventFilter;
use gatehouse::plugins::queue::{
    self, BlockReason, CancelOutcome, CompleteOutcome, DequeueOutcome, RetryOutcome,
};
use gatehouse::plugins::workers;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use tempfile::TempDir;

fn open() -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open(tmp.path()).expect("open store");
    (tmp, store)
}

fn spec(id: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec {
        id: Some(id.to_string()),
        task_type: Some(TaskType::Generation),
        worker_category: Some(WorkerCategory::Generation),
        description: format!("task {}", id),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        ..TaskSpec::default()
    }
}

fn register(store: &Store, id: &str) {
    workers::register_worker(
        store,
        &WorkerSpec {
            id: id.to_string(),
            category: Some(WorkerCategory::Generation),
            capabilities: vec!["backend".to_string()],
            ..WorkerSpec::default()
        },
    )
    .expect("register worker");
}

fn take(store: &Store, worker: &str) -> Option<String> {
    match queue::dequeue(store, worker, WorkerCategory::Generation).expect("dequeue") {
        DequeueOutcome::Assigned { task } => Some(task.id),
        DequeueOutcome::Empty => None,
        DequeueOutcome::Rejected { reason } => panic!("dequeue rejected: {reason}"),
    }
}

fn fail(store: &Store, task: &str, worker: &str, message: &str) {
    let outcome = queue::complete(
        store,
        task,
        worker,
        TaskStatus::Failed,
        None,
        Some(TaskError {
            message: message.to_string(),
            code: "E_BUILD".to_string(),
            recoverable: true,
        }),
    )
    .expect("complete failed");
    assert!(matches!(outcome, CompleteOutcome::Recorded { .. }), "{outcome:?}");
}

fn finish(store: &Store, task: &str, worker: &str) {
    let outcome = queue::complete(
        store,
        task,
        worker,
        TaskStatus::Complete,
        Some(TaskOutput {
            files_created: vec!["src/lib.rs".to_string()],
            summary: Some("pinned the toolchain".to_string()),
            ..TaskOutput::default()
        }),
        None,
    )
    .expect("complete");
    assert!(matches!(outcome, CompleteOutcome::Recorded { .. }), "{outcome:?}");
}

#[test]
fn enqueue_defaults_priority_and_logs_creation() {
    let (_tmp, store) = open();
    let task = queue::enqueue(&store, &spec("A", &[]), "planner").expect("enqueue");
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.priority, Priority::Medium);
    assert_eq!(task.retry_count, 0);

    let events = store
        .query_events(&EventFilter {
            related_task_id: Some("A".to_string()),
            ..Default::default()
        })
        .expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::TaskCreated);
    assert_eq!(events[0].actor, "planner");
}

#[test]
fn enqueue_rejects_malformed_input_without_side_effects() {
    let (_tmp, store) = open();
    let mut missing_category = spec("X", &[]);
    missing_category.worker_category = None;
    let err = queue::enqueue(&store, &missing_category, "planner").expect_err("must fail");
    assert!(matches!(err, GatehouseError::ValidationError(_)), "{err:?}");

    let self_dep = spec("Y", &["Y"]);
    assert!(queue::enqueue(&store, &self_dep, "planner").is_err());

    queue::enqueue(&store, &spec("Z", &[]), "planner").expect("first insert");
    assert!(queue::enqueue(&store, &spec("Z", &[]), "planner").is_err());

    let created = store
        .query_events(&EventFilter {
            event_type: Some(EventType::TaskCreated),
            ..Default::default()
        })
        .expect("events");
    assert_eq!(created.len(), 1, "only the valid enqueue is logged");
}

#[test]
fn dequeue_never_hands_out_tasks_with_incomplete_dependencies() {
    let (_tmp, store) = open();
    register(&store, "w1");
    queue::enqueue(&store, &spec("A", &[]), "planner").expect("A");
    queue::enqueue(&store, &spec("B", &["A"]), "planner").expect("B");

    assert_eq!(take(&store, "w1").as_deref(), Some("A"));
    finish(&store, "A", "w1");

    let b = take(&store, "w1").expect("B becomes eligible");
    assert_eq!(b, "B");
    let a = store.get_task("A").expect("get").expect("A exists");
    assert_eq!(a.status, TaskStatus::Complete);
}

#[test]
fn dequeue_prefers_higher_priority() {
    let (_tmp, store) = open();
    register(&store, "w1");
    let mut low = spec("low", &[]);
    low.priority = Some(Priority::Low);
    let mut critical = spec("crit", &[]);
    critical.priority = Some(Priority::Critical);
    queue::enqueue(&store, &low, "planner").expect("low");
    queue::enqueue(&store, &critical, "planner").expect("critical");

    assert_eq!(take(&store, "w1").as_deref(), Some("crit"));
}

#[test]
fn equal_priority_is_first_in_first_out_even_after_a_retry() {
    let (_tmp, store) = open();
    register(&store, "w1");
    for id in ["A", "B", "C"] {
        queue::enqueue(&store, &spec(id, &[]), "planner").expect("enqueue");
    }

    assert_eq!(take(&store, "w1").as_deref(), Some("A"));
    fail(&store, "A", "w1", "flaky fetch");
    let retried = queue::retry(&store, "A", "planner").expect("retry");
    assert!(matches!(retried, RetryOutcome::Requeued { .. }), "{retried:?}");

    assert_eq!(take(&store, "w1").as_deref(), Some("A"), "retry keeps its place");
    finish(&store, "A", "w1");
    assert_eq!(take(&store, "w1").as_deref(), Some("B"));
    finish(&store, "B", "w1");
    assert_eq!(take(&store, "w1").as_deref(), Some("C"));
}

#[test]
fn busy_worker_is_rejected_and_wrong_category_is_invalid() {
    let (_tmp, store) = open();
    register(&store, "w1");
    queue::enqueue(&store, &spec("A", &[]), "planner").expect("A");
    queue::enqueue(&store, &spec("B", &[]), "planner").expect("B");
    take(&store, "w1").expect("first task");

    let second = queue::dequeue(&store, "w1", WorkerCategory::Generation).expect("dequeue");
    assert!(matches!(second, DequeueOutcome::Rejected { .. }), "{second:?}");

    let err = queue::dequeue(&store, "w1", WorkerCategory::Validation).expect_err("category");
    assert_eq!(err.kind(), "validation_error");
}

#[test]
fn empty_queue_is_not_an_error() {
    let (_tmp, store) = open();
    register(&store, "w1");
    assert!(take(&store, "w1").is_none());
}

#[test]
fn gate_dependency_blocks_until_gate_is_approved() {
    let (_tmp, store) = open();
    register(&store, "w1");
    let mut gated = spec("deploy", &[]);
    gated.gate_dependency = Some(GateId::G8);
    queue::enqueue(&store, &gated, "planner").expect("enqueue");
    queue::enqueue(&store, &spec("orphan", &["ghost"]), "planner").expect("orphan");

    assert!(take(&store, "w1").is_none());

    let blocked = queue::blocked(&store).expect("blocked");
    assert_eq!(blocked.len(), 2);
    let deploy = blocked.iter().find(|b| b.task_id == "deploy").expect("deploy listed");
    assert_eq!(deploy.effective_status, TaskStatus::Blocked);
    assert!(matches!(
        deploy.reasons[0],
        BlockReason::GateNotApproved { gate: GateId::G8, .. }
    ));
    let orphan = blocked.iter().find(|b| b.task_id == "orphan").expect("orphan listed");
    assert!(matches!(orphan.reasons[0], BlockReason::DependencyMissing { .. }));

    let m = queue::metrics(&store).expect("metrics");
    assert_eq!(m.blocked_by_gate.get("G8"), Some(&1));
    assert_eq!(m.blocked_by_dependencies, 1);
    // Blocked is derived, never persisted.
    assert_eq!(m.by_status.get("queued"), Some(&2));
}

#[test]
fn retry_budget_allows_three_requeues_then_reports_exhaustion() {
    let (_tmp, store) = open();
    register(&store, "w1");
    queue::enqueue(&store, &spec("flaky", &[]), "planner").expect("enqueue");

    for expected in 1..=3 {
        assert_eq!(take(&store, "w1").as_deref(), Some("flaky"));
        fail(&store, "flaky", "w1", "linker crashed");
        match queue::retry(&store, "flaky", "planner").expect("retry") {
            RetryOutcome::Requeued { task, context } => {
                assert_eq!(task.status, TaskStatus::Queued);
                assert_eq!(task.retry_count, expected);
                assert_eq!(context.previous_errors.len() as i64, expected);
            }
            other => panic!("expected requeue, got {other:?}"),
        }
    }

    take(&store, "w1").expect("fourth attempt");
    fail(&store, "flaky", "w1", "linker crashed");
    let outcome = queue::retry(&store, "flaky", "planner").expect("retry");
    assert_eq!(outcome, RetryOutcome::RetriesExhausted { retry_count: 3 });
    assert!(outcome.reason().expect("reason").contains("exhausted"));

    let task = store.get_task("flaky").expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Failed);
}

#[test]
fn requeued_task_drops_the_previous_error_but_history_keeps_it() {
    let (_tmp, store) = open();
    register(&store, "w1");
    queue::enqueue(&store, &spec("flaky", &[]), "planner").expect("enqueue");
    take(&store, "w1").expect("first attempt");
    fail(&store, "flaky", "w1", "linker crashed");
    assert!(store.get_task("flaky").expect("get").expect("exists").error.is_some());

    queue::retry(&store, "flaky", "planner").expect("retry");
    let task = store.get_task("flaky").expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.error.is_none());
    assert!(task.output.is_none());

    let history = store.error_history("flaky").expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message, "linker crashed");
}

#[test]
fn metrics_report_mean_wait_execution_and_retry_rate() {
    let (_tmp, store) = open();
    register(&store, "w1");
    for id in ["a", "b", "c"] {
        queue::enqueue(&store, &spec(id, &[]), "planner").expect("enqueue");
    }
    assert_eq!(take(&store, "w1").as_deref(), Some("a"));
    finish(&store, "a", "w1");
    assert_eq!(take(&store, "w1").as_deref(), Some("b"));
    fail(&store, "b", "w1", "timeout");
    queue::retry(&store, "b", "planner").expect("retry");
    assert_eq!(take(&store, "w1").as_deref(), Some("b"));
    finish(&store, "b", "w1");

    let conn = Connection::open(store.db_path()).expect("open db");
    let pinned = [("a", 1_000, 1_500, 2_500), ("b", 2_000, 2_100, 2_400)];
    for (id, created, started, completed) in pinned {
        conn.execute(
            "UPDATE tasks SET created_at = ?1, started_at = ?2, completed_at = ?3 WHERE id = ?4",
            params![created, started, completed, id],
        )
        .expect("pin timestamps");
    }

    let m = queue::metrics(&store).expect("metrics");
    assert_eq!(m.total, 3);
    assert_eq!(m.by_status.get("complete"), Some(&2));
    assert_eq!(m.by_status.get("queued"), Some(&1));
    assert_eq!(m.mean_wait_ms, Some(300.0));
    assert_eq!(m.mean_execution_ms, Some(650.0));
    assert_eq!(m.total_retries, 1);
    assert!((m.retry_rate - 1.0 / 3.0).abs() < 1e-9);
}

#[test]
fn retry_is_refused_for_tasks_that_did_not_fail() {
    let (_tmp, store) = open();
    queue::enqueue(&store, &spec("A", &[]), "planner").expect("A");
    assert_eq!(
        queue::retry(&store, "A", "planner").expect("retry"),
        RetryOutcome::NotFailed {
            status: TaskStatus::Queued
        }
    );
    assert!(matches!(
        queue::retry(&store, "nope", "planner").expect("retry"),
        RetryOutcome::NotFound { .. }
    ));
}

#[test]
fn retry_context_includes_similar_resolved_errors_from_other_tasks() {
    let (_tmp, store) = open();
    register(&store, "w1");
    queue::enqueue(&store, &spec("first", &[]), "planner").expect("first");
    take(&store, "w1").expect("first");
    fail(&store, "first", "w1", "cargo build failed: missing toolchain");
    queue::retry(&store, "first", "planner").expect("retry first");
    take(&store, "w1").expect("first again");
    finish(&store, "first", "w1");

    queue::enqueue(&store, &spec("second", &[]), "planner").expect("second");
    take(&store, "w1").expect("second");
    fail(&store, "second", "w1", "Missing toolchain");
    match queue::retry(&store, "second", "planner").expect("retry") {
        RetryOutcome::Requeued { context, .. } => {
            assert_eq!(context.attempt, 2);
            assert_eq!(context.similar_resolved_errors.len(), 1);
            let prior = &context.similar_resolved_errors[0];
            assert_eq!(prior.task_id, "first");
            assert_eq!(prior.resolution.as_deref(), Some("pinned the toolchain"));
        }
        other => panic!("expected requeue, got {other:?}"),
    }
}

#[test]
fn completion_updates_worker_stats_and_caches_output() {
    let (_tmp, store) = open();
    register(&store, "w1");
    queue::enqueue(&store, &spec("A", &[]), "planner").expect("A");
    take(&store, "w1").expect("A");

    let busy = store.get_worker("w1").expect("get").expect("worker");
    assert_eq!(busy.status, WorkerStatus::Active);
    assert_eq!(busy.current_task.as_deref(), Some("A"));

    let wrong = queue::complete(&store, "A", "w2", TaskStatus::Complete, None, None)
        .expect("complete");
    assert!(matches!(wrong, CompleteOutcome::Rejected { .. }));

    finish(&store, "A", "w1");
    let worker = store.get_worker("w1").expect("get").expect("worker");
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.current_task, None);
    assert_eq!(worker.tasks_completed, 1);

    let cached = store.cached_result("A").expect("cache").expect("cached");
    assert_eq!(cached.output.files_created, vec!["src/lib.rs".to_string()]);
    assert_eq!(cached.output_hash.len(), 64);

    let again = queue::complete(&store, "A", "w1", TaskStatus::Complete, None, None)
        .expect("complete");
    assert!(matches!(again, CompleteOutcome::Rejected { .. }), "terminal tasks stay terminal");
}

#[test]
fn cancel_only_applies_to_queued_tasks() {
    let (_tmp, store) = open();
    register(&store, "w1");
    queue::enqueue(&store, &spec("A", &[]), "planner").expect("A");
    queue::enqueue(&store, &spec("B", &[]), "planner").expect("B");
    take(&store, "w1").expect("A running");

    assert!(matches!(
        queue::cancel(&store, "A", "planner").expect("cancel"),
        CancelOutcome::Rejected { .. }
    ));
    match queue::cancel(&store, "B", "planner").expect("cancel") {
        CancelOutcome::Cancelled { task } => assert_eq!(task.status, TaskStatus::Cancelled),
        other => panic!("expected cancel, got {other:?}"),
    }
    assert!(matches!(
        queue::cancel(&store, "B", "planner").expect("cancel"),
        CancelOutcome::Rejected { .. }
    ));
}

#[test]
fn concurrent_dequeue_never_double_assigns() {
    let (tmp, store) = open();
    const WORKERS: usize = 8;
    const TASKS: usize = 5;
    for i in 0..TASKS {
        queue::enqueue(&store, &spec(&format!("t{i}"), &[]), "planner").expect("enqueue");
    }
    for i in 0..WORKERS {
        register(&store, &format!("w{i}"));
    }

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let root = tmp.path().to_path_buf();
            std::thread::spawn(move || {
                // Separate handles behave like separate worker processes.
                let store = Store::open(&root).expect("open store");
                barrier.wait();
                take(&store, &format!("w{i}"))
            })
        })
        .collect();

    let claimed: Vec<String> = handles
        .into_iter()
        .filter_map(|h| h.join().expect("thread"))
        .collect();
    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(claimed.len(), TASKS, "every task handed out once: {claimed:?}");
    assert_eq!(unique.len(), claimed.len(), "no task handed out twice");

    let started = store
        .query_events(&EventFilter {
            event_type: Some(EventType::TaskStarted),
            ..Default::default()
        })
        .expect("events");
    assert_eq!(started.len(), TASKS);
}
