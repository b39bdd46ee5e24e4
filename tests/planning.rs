use gatehouse::core::model::{
    TaskSpec, TaskStatus, TaskType, WorkerCategory, WorkerSpec, WorkerStatus,
};
use gatehouse::core::store::Store;
use gatehouse::plugins::conflict::{self, ConflictKind};
use gatehouse::plugins::{queue, router, workers};
use rusqlite::{params, Connection};
use tempfile::TempDir;

fn open() -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open(tmp.path()).expect("open store");
    (tmp, store)
}

fn enqueue(store: &Store, id: &str, description: &str, deps: &[&str], specs: &[&str]) {
    queue::enqueue(
        store,
        &TaskSpec {
            id: Some(id.to_string()),
            task_type: Some(TaskType::Generation),
            worker_category: Some(WorkerCategory::Generation),
            description: description.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            spec_refs: specs.iter().map(|s| s.to_string()).collect(),
            ..TaskSpec::default()
        },
        "planner",
    )
    .expect("enqueue");
}

fn register(store: &Store, id: &str, capabilities: &[&str], specs: &[&str]) {
    workers::register_worker(
        store,
        &WorkerSpec {
            id: id.to_string(),
            category: Some(WorkerCategory::Generation),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            spec_consumption: specs.iter().map(|s| s.to_string()).collect(),
        },
    )
    .expect("register");
}

fn group_of(groups: &[Vec<String>], id: &str) -> usize {
    groups
        .iter()
        .position(|g| g.iter().any(|t| t == id))
        .unwrap_or_else(|| panic!("{id} not grouped: {groups:?}"))
}

#[test]
fn parent_child_spec_refs_are_kept_apart_while_independent_tasks_share_a_wave() {
    let (_tmp, store) = open();
    enqueue(&store, "A", "bootstrap repo", &[], &[]);
    enqueue(&store, "B", "wire services", &["A"], &[]);
    enqueue(&store, "C", "user model", &[], &["db.models.User"]);
    enqueue(&store, "D", "email column", &[], &["db.models.User.email"]);

    let analysis = conflict::analyze(&store).expect("analyze");
    assert_eq!(analysis.task_count, 4);

    let cd = analysis
        .conflicts
        .iter()
        .find(|c| {
            (c.task_a == "C" && c.task_b == "D") || (c.task_a == "D" && c.task_b == "C")
        })
        .expect("C/D conflict reported");
    assert_eq!(cd.kind, ConflictKind::ParentChild);
    assert!(analysis.conflicts.iter().any(|c| c.kind == ConflictKind::Dependency));

    let groups = &analysis.parallel_groups;
    assert_ne!(group_of(groups, "C"), group_of(groups, "D"));
    assert_eq!(group_of(groups, "A"), group_of(groups, "C"));
    assert!(group_of(groups, "A") < group_of(groups, "B"));

    let total: usize = groups.iter().map(Vec::len).sum();
    assert_eq!(total, 4, "every task lands in exactly one group");
}

#[test]
fn cyclic_dependencies_are_reported_without_levels_or_critical_path() {
    let (_tmp, store) = open();
    enqueue(&store, "X", "first half", &["Y"], &[]);
    enqueue(&store, "Y", "second half", &["X"], &[]);
    enqueue(&store, "Z", "unrelated", &[], &[]);

    let analysis = conflict::analyze(&store).expect("analyze");
    assert!(analysis.graph.has_cycle);
    let cycle = analysis.graph.cycle.expect("cycle path");
    assert!(cycle.contains(&"X".to_string()) && cycle.contains(&"Y".to_string()));
    assert!(analysis.graph.levels.is_none());
    assert!(analysis.graph.critical_path.is_none());

    let plan = router::optimal_execution_plan(&store).expect("plan");
    assert!(plan.has_cycle);
    assert!(plan.critical_path.is_none());
}

#[test]
fn acyclic_graph_yields_levels_and_critical_path() {
    let (_tmp, store) = open();
    enqueue(&store, "schema", "database schema", &[], &[]);
    enqueue(&store, "api", "api endpoints", &["schema"], &[]);
    enqueue(&store, "ui", "frontend page", &["api"], &[]);
    enqueue(&store, "docs", "write docs", &["schema"], &[]);

    let analysis = conflict::analyze(&store).expect("analyze");
    assert!(!analysis.graph.has_cycle);
    let levels = analysis.graph.levels.expect("levels");
    assert_eq!(levels[0], vec!["schema".to_string()]);
    assert_eq!(
        analysis.graph.critical_path.expect("critical path"),
        vec!["schema".to_string(), "api".to_string(), "ui".to_string()]
    );
    let bottleneck = analysis
        .graph
        .bottlenecks
        .iter()
        .find(|b| b.task_id == "schema")
        .expect("schema is a bottleneck");
    assert_eq!(bottleneck.dependents.len(), 2);
}

#[test]
fn route_prefers_workers_matching_description_and_spec_familiarity() {
    let (_tmp, store) = open();
    register(&store, "fe", &["frontend"], &["ui.forms"]);
    register(&store, "be", &["backend", "database"], &["db.models"]);
    enqueue(&store, "login", "Build login page component", &[], &["ui.forms.login"]);

    let result = router::route(&store, "login").expect("route");
    assert!(result.requirements.required.contains("generation"));
    assert!(result.requirements.preferred.contains("frontend"));
    let best = result.recommended.expect("recommendation");
    assert_eq!(best.worker_id, "fe");
    assert_eq!(best.spec_matches, 1);
    assert_eq!(result.alternatives.len(), 1);
    assert_eq!(result.alternatives[0].worker_id, "be");
}

#[test]
fn route_ignores_workers_that_are_not_idle() {
    let (_tmp, store) = open();
    register(&store, "fe", &["frontend"], &[]);
    workers::set_worker_status(&store, "fe", WorkerStatus::Offline, "ops").expect("offline");
    enqueue(&store, "login", "login page", &[], &[]);

    let result = router::route(&store, "login").expect("route");
    assert!(result.recommended.is_none());
}

#[test]
fn bulk_assign_moves_ready_tasks_to_distinct_idle_workers() {
    let (_tmp, store) = open();
    register(&store, "w1", &["backend"], &[]);
    register(&store, "w2", &["frontend"], &[]);
    enqueue(&store, "api", "backend service", &[], &[]);
    enqueue(&store, "page", "frontend page", &[], &[]);
    enqueue(&store, "later", "after api", &["api"], &[]);

    let report = router::bulk_assign(&store, None).expect("bulk assign");
    assert_eq!(report.idle_workers, 2);
    assert_eq!(report.assignments.len(), 2);
    assert!((report.utilization - 1.0).abs() < f64::EPSILON);

    let api = report.assignments.iter().find(|a| a.task_id == "api").expect("api");
    assert_eq!(api.worker_id, "w1");
    let page = report.assignments.iter().find(|a| a.task_id == "page").expect("page");
    assert_eq!(page.worker_id, "w2");

    let later = store.get_task("later").expect("get").expect("exists");
    assert_eq!(later.status, TaskStatus::Queued, "dependent task stays queued");
}

#[test]
fn worker_of_another_category_is_never_routed_even_with_matching_tags() {
    let (_tmp, store) = open();
    workers::register_worker(
        &store,
        &WorkerSpec {
            id: "val".to_string(),
            category: Some(WorkerCategory::Validation),
            capabilities: vec!["generation".to_string(), "api_design".to_string()],
            ..WorkerSpec::default()
        },
    )
    .expect("register val");
    register(&store, "gen", &[], &[]);
    enqueue(&store, "T", "build api endpoint", &[], &[]);

    let result = router::route(&store, "T").expect("route");
    assert_eq!(result.recommended.expect("recommendation").worker_id, "gen");
    assert!(result.alternatives.iter().all(|a| a.worker_id != "val"));

    let report = router::bulk_assign(&store, None).expect("bulk assign");
    assert!(report.skipped.is_empty(), "{:?}", report.skipped);
    assert_eq!(report.assignments.len(), 1);
    assert_eq!(report.assignments[0].task_id, "T");
    assert_eq!(report.assignments[0].worker_id, "gen");
}

#[test]
fn bulk_assign_falls_through_to_the_next_worker_when_the_best_is_rejected() {
    let (_tmp, store) = open();
    register(&store, "top", &["backend"], &[]);
    register(&store, "spare", &[], &[]);
    enqueue(&store, "api", "backend service", &[], &[]);
    enqueue(&store, "misc", "tidy up", &[], &[]);

    // "top" still reads as idle but already holds work, so assign refuses it.
    let conn = Connection::open(store.db_path()).expect("open db");
    conn.execute(
        "UPDATE workers SET current_task = ?1 WHERE id = ?2",
        params!["elsewhere", "top"],
    )
    .expect("stale worker row");

    let route = router::route(&store, "api").expect("route");
    assert_eq!(route.recommended.expect("recommendation").worker_id, "top");

    let report = router::bulk_assign(&store, None).expect("bulk assign");
    assert_eq!(report.assignments.len(), 1);
    assert_eq!(report.assignments[0].task_id, "api");
    assert_eq!(report.assignments[0].worker_id, "spare");
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].task_id, "misc");
    assert!(report.skipped[0].reason.contains("already holds"));

    let api = store.get_task("api").expect("get").expect("exists");
    assert_eq!(api.status, TaskStatus::InProgress);
    assert_eq!(api.assigned_worker.as_deref(), Some("spare"));
}

#[test]
fn execution_plan_assigns_each_worker_once_per_wave() {
    let (_tmp, store) = open();
    register(&store, "solo", &["backend"], &[]);
    enqueue(&store, "one", "backend service", &[], &[]);
    enqueue(&store, "two", "backend server", &[], &[]);
    enqueue(&store, "three", "integrate", &["one", "two"], &[]);

    let plan = router::optimal_execution_plan(&store).expect("plan");
    assert_eq!(plan.total_tasks, 3);
    assert_eq!(plan.waves.len(), 2);
    let first = &plan.waves[0];
    assert_eq!(first.number, 1);
    assert_eq!(first.tasks.len(), 2);
    let recommended: Vec<_> = first
        .tasks
        .iter()
        .filter_map(|t| t.recommended_worker.as_deref())
        .collect();
    assert_eq!(recommended, vec!["solo"]);
    assert!((plan.parallelism - 1.5).abs() < f64::EPSILON);
}
