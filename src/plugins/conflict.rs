//! Conflict detection and dependency-graph analysis.
//!
//! Decides which pending tasks may run at the same time. Two tasks conflict when
//! one depends on the other, when their spec references overlap, or when they
//! touch the same files. The grouping into waves is a greedy heuristic: it
//! always yields a safe partition but not necessarily the smallest one.

use crate::core::error::GatehouseError;
use crate::core::model::{Task, TaskStatus};
use crate::core::store::Store;
use crate::core::truth::{self, TaskFilter};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Dependency,
    ExactMatch,
    ParentChild,
    SiblingOverlap,
    FileOverlap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub task_a: String,
    pub task_b: String,
    pub kind: ConflictKind,
    pub detail: String,
}

fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^.]*");
    Regex::new(&format!("^{}$", body)).ok()
}

/// Whether two single segments can name the same thing. `*` matches any run
/// within a segment; two patterns are compatible when their literal heads and
/// tails agree.
fn segments_compatible(x: &str, y: &str) -> bool {
    if x == y {
        return true;
    }
    match (x.contains('*'), y.contains('*')) {
        (false, false) => false,
        (true, false) => wildcard_regex(x).is_some_and(|re| re.is_match(y)),
        (false, true) => wildcard_regex(y).is_some_and(|re| re.is_match(x)),
        (true, true) => {
            let head = |p: &str| p.split('*').next().unwrap_or("").to_string();
            let tail = |p: &str| p.rsplit('*').next().unwrap_or("").to_string();
            let (hx, hy, tx, ty) = (head(x), head(y), tail(x), tail(y));
            (hx.starts_with(&hy) || hy.starts_with(&hx))
                && (tx.ends_with(&ty) || ty.ends_with(&tx))
        }
    }
}

/// Classify how two spec references overlap, if they do.
///
/// References are compared segment by segment on `.`. `api.users` and
/// `api.users.get` are parent/child, as are `api.*` and `api.users.get`;
/// `api.*.get` against `api.orders.get` or `api.users.*` is a sibling overlap.
pub fn spec_overlap(a: &str, b: &str) -> Option<ConflictKind> {
    if a == b {
        return Some(ConflictKind::ExactMatch);
    }
    let sa: Vec<&str> = a.split('.').collect();
    let sb: Vec<&str> = b.split('.').collect();
    let (short, long) = if sa.len() <= sb.len() { (&sa, &sb) } else { (&sb, &sa) };
    let shared = short
        .iter()
        .zip(long.iter())
        .all(|(x, y)| segments_compatible(x, y));
    if !shared {
        None
    } else if short.len() == long.len() {
        Some(ConflictKind::SiblingOverlap)
    } else {
        Some(ConflictKind::ParentChild)
    }
}

/// Every reason `a` and `b` cannot share a wave.
pub fn detect_conflicts(a: &Task, b: &Task) -> Vec<Conflict> {
    let mut out = Vec::new();
    let conflict = |kind, detail: String| Conflict {
        task_a: a.id.clone(),
        task_b: b.id.clone(),
        kind,
        detail,
    };

    if a.dependencies.contains(&b.id) {
        out.push(conflict(
            ConflictKind::Dependency,
            format!("{} depends on {}", a.id, b.id),
        ));
    }
    if b.dependencies.contains(&a.id) {
        out.push(conflict(
            ConflictKind::Dependency,
            format!("{} depends on {}", b.id, a.id),
        ));
    }
    for ra in &a.spec_refs {
        for rb in &b.spec_refs {
            if let Some(kind) = spec_overlap(ra, rb) {
                out.push(conflict(kind, format!("{} overlaps {}", ra, rb)));
            }
        }
    }
    let files_b: FxHashSet<String> = b.touched_files().into_iter().collect();
    for file in a.touched_files() {
        if files_b.contains(&file) {
            out.push(conflict(ConflictKind::FileOverlap, format!("both touch {}", file)));
        }
    }
    out
}

pub fn pairwise_conflicts(tasks: &[Task]) -> Vec<Conflict> {
    let mut out = Vec::new();
    for (i, a) in tasks.iter().enumerate() {
        for b in &tasks[i + 1..] {
            out.extend(detect_conflicts(a, b));
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub task_id: String,
    pub dependents: Vec<String>,
}

/// Dependency graph over a fixed set of tasks. Edges to tasks outside the
/// set are ignored; those dependencies are either already satisfied or
/// reported by the queue as blocking.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    order: Vec<String>,
    deps: FxHashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let ids: FxHashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut deps = FxHashMap::default();
        for task in tasks {
            let inner: Vec<String> = task
                .dependencies
                .iter()
                .filter(|d| ids.contains(d.as_str()))
                .cloned()
                .collect();
            deps.insert(task.id.clone(), inner);
        }
        Self {
            order: tasks.iter().map(|t| t.id.clone()).collect(),
            deps,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn deps_of(&self, id: &str) -> &[String] {
        self.deps.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First cycle found by depth-first search, as a closed path
    /// (`[a, b, a]`).
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: FxHashSet<&str> = FxHashSet::default();

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            visited: &mut FxHashSet<&'a str>,
            stack: &mut Vec<&'a str>,
            on_stack: &mut FxHashSet<&'a str>,
        ) -> Option<Vec<String>> {
            visited.insert(node);
            stack.push(node);
            on_stack.insert(node);
            for dep in graph.deps_of(node) {
                if on_stack.contains(dep.as_str()) {
                    let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                if !visited.contains(dep.as_str()) {
                    if let Some(c) = visit(graph, dep, visited, stack, on_stack) {
                        return Some(c);
                    }
                }
            }
            stack.pop();
            on_stack.remove(node);
            None
        }

        for id in &self.order {
            if !visited.contains(id.as_str()) {
                if let Some(c) = visit(self, id, &mut visited, &mut stack, &mut on_stack) {
                    return Some(c);
                }
            }
        }
        None
    }

    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Topological levels; `None` when the graph has a cycle.
    pub fn levels(&self) -> Option<Vec<Vec<String>>> {
        let mut leveled: FxHashSet<&str> = FxHashSet::default();
        let mut levels = Vec::new();
        while leveled.len() < self.order.len() {
            let next: Vec<&str> = self
                .order
                .iter()
                .map(String::as_str)
                .filter(|id| !leveled.contains(id))
                .filter(|id| self.deps_of(id).iter().all(|d| leveled.contains(d.as_str())))
                .collect();
            if next.is_empty() {
                return None;
            }
            leveled.extend(next.iter().copied());
            levels.push(next.into_iter().map(str::to_string).collect());
        }
        Some(levels)
    }

    /// Longest dependency chain, root first; `None` when cyclic.
    pub fn critical_path(&self) -> Option<Vec<String>> {
        let levels = self.levels()?;
        let mut dist: FxHashMap<&str, usize> = FxHashMap::default();
        let mut pred: FxHashMap<&str, &str> = FxHashMap::default();
        for level in &levels {
            for id in level {
                let mut best = 0usize;
                for dep in self.deps_of(id) {
                    let d = dist.get(dep.as_str()).copied().unwrap_or(0) + 1;
                    if d > best {
                        best = d;
                        pred.insert(id.as_str(), dep.as_str());
                    }
                }
                dist.insert(id.as_str(), best);
            }
        }
        let mut end: Option<(&str, usize)> = None;
        for id in &self.order {
            let d = dist.get(id.as_str()).copied().unwrap_or(0);
            if end.is_none_or(|(_, best)| d > best) {
                end = Some((id.as_str(), d));
            }
        }
        let mut path = Vec::new();
        let mut cursor = end.map(|(id, _)| id);
        while let Some(id) = cursor {
            path.push(id.to_string());
            cursor = pred.get(id).copied();
        }
        path.reverse();
        Some(path)
    }

    /// Tasks that two or more other tasks depend on.
    pub fn bottlenecks(&self) -> Vec<Bottleneck> {
        let mut dependents: FxHashMap<&str, Vec<String>> = FxHashMap::default();
        for id in &self.order {
            for dep in self.deps_of(id) {
                dependents.entry(dep.as_str()).or_default().push(id.clone());
            }
        }
        self.order
            .iter()
            .filter_map(|id| {
                let ds = dependents.get(id.as_str())?;
                (ds.len() >= 2).then(|| Bottleneck {
                    task_id: id.clone(),
                    dependents: ds.clone(),
                })
            })
            .collect()
    }

    /// Every in-graph task `id` transitively depends on.
    fn ancestors(&self, id: &str) -> FxHashSet<String> {
        let mut seen = FxHashSet::default();
        let mut todo: Vec<&str> = vec![id];
        while let Some(cur) = todo.pop() {
            for dep in self.deps_of(cur) {
                if seen.insert(dep.clone()) {
                    todo.push(dep);
                }
            }
        }
        seen
    }
}

/// Partition tasks into waves that are safe to run concurrently.
///
/// Greedy: open a group with the first unassigned task and absorb every later
/// task that conflicts with no member. When the graph is acyclic, tasks are
/// visited in level order and a task only joins a group once all of its
/// ancestors sit in earlier groups, so the waves can be executed in sequence.
pub fn parallel_groups(tasks: &[Task]) -> Vec<Vec<String>> {
    let graph = DependencyGraph::from_tasks(tasks);
    let by_id: FxHashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let ordered: Vec<&Task> = match graph.levels() {
        Some(levels) => levels
            .iter()
            .flatten()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .collect(),
        None => tasks.iter().collect(),
    };
    let acyclic = !graph.has_cycle();
    let ancestors: FxHashMap<&str, FxHashSet<String>> = if acyclic {
        tasks
            .iter()
            .map(|t| (t.id.as_str(), graph.ancestors(&t.id)))
            .collect()
    } else {
        FxHashMap::default()
    };

    let mut placed: FxHashSet<String> = FxHashSet::default();
    let mut groups: Vec<Vec<String>> = Vec::new();
    while placed.len() < ordered.len() {
        let earlier = placed.clone();
        let mut group: Vec<&Task> = Vec::new();
        for &task in &ordered {
            if placed.contains(&task.id) {
                continue;
            }
            let ready = ancestors
                .get(task.id.as_str())
                .is_none_or(|a| a.iter().all(|id| earlier.contains(id)));
            if !ready && !group.is_empty() {
                continue;
            }
            let clashes = group.iter().any(|member| {
                !detect_conflicts(member, task).is_empty()
                    || ancestors
                        .get(task.id.as_str())
                        .is_some_and(|a| a.contains(&member.id))
            });
            if !clashes {
                group.push(task);
                placed.insert(task.id.clone());
            }
        }
        groups.push(group.iter().map(|t| t.id.clone()).collect());
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphAnalysis {
    pub has_cycle: bool,
    pub cycle: Option<Vec<String>>,
    pub levels: Option<Vec<Vec<String>>>,
    pub critical_path: Option<Vec<String>>,
    pub bottlenecks: Vec<Bottleneck>,
}

pub fn analyze_graph(tasks: &[Task]) -> GraphAnalysis {
    let graph = DependencyGraph::from_tasks(tasks);
    let cycle = graph.find_cycle();
    let (levels, critical_path) = if cycle.is_some() {
        (None, None)
    } else {
        (graph.levels(), graph.critical_path())
    };
    GraphAnalysis {
        has_cycle: cycle.is_some(),
        cycle,
        levels,
        critical_path,
        bottlenecks: graph.bottlenecks(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    pub task_count: usize,
    pub conflicts: Vec<Conflict>,
    pub graph: GraphAnalysis,
    pub parallel_groups: Vec<Vec<String>>,
}

pub fn analyze_tasks(tasks: &[Task]) -> ConflictAnalysis {
    let analysis = ConflictAnalysis {
        task_count: tasks.len(),
        conflicts: pairwise_conflicts(tasks),
        graph: analyze_graph(tasks),
        parallel_groups: parallel_groups(tasks),
    };
    debug!(
        tasks = analysis.task_count,
        conflicts = analysis.conflicts.len(),
        groups = analysis.parallel_groups.len(),
        "conflict analysis"
    );
    analysis
}

/// Queued tasks in dequeue order.
pub(crate) fn pending_tasks(store: &Store) -> Result<Vec<Task>, GatehouseError> {
    store.with_read(|conn| {
        truth::list_tasks(
            conn,
            &TaskFilter {
                status: Some(TaskStatus::Queued),
                ..TaskFilter::default()
            },
        )
    })
}

/// Analyze every queued task in the project.
pub fn analyze(store: &Store) -> Result<ConflictAnalysis, GatehouseError> {
    Ok(analyze_tasks(&pending_tasks(store)?))
}
