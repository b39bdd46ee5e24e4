//! Event log queries and audit views.
//!
//! The log is append-only; lifecycle entries are written by the operation that
//! performs the mutation. Callers may append the narrative types (decisions,
//! risks, blockers, human input, phases, and so on) through [`append`]. Every
//! history, statistic, and audit view here is derived by reading the log.

use crate::core::error::GatehouseError;
use crate::core::model::{EventLogEntry, EventType, GateId, GateStatus, NewEvent};
use crate::core::store::Store;
use crate::core::time::{is_valid_id, now_ms};
use crate::core::truth::{self, EventFilter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Append a caller-authored event.
pub fn append(store: &Store, event: NewEvent) -> Result<EventLogEntry, GatehouseError> {
    if !event.event_type.is_caller_appendable() {
        return Err(GatehouseError::ValidationError(format!(
            "{} events are recorded by their owning operation and cannot be appended directly",
            event.event_type
        )));
    }
    if event.summary.trim().is_empty() {
        return Err(GatehouseError::ValidationError(
            "event summary cannot be empty".to_string(),
        ));
    }
    if !(event.details.is_null() || event.details.is_object()) {
        return Err(GatehouseError::ValidationError(
            "event details must be a JSON object".to_string(),
        ));
    }
    if let Some(task_id) = &event.related_task_id {
        if !is_valid_id(task_id) {
            return Err(GatehouseError::ValidationError(format!(
                "invalid task id '{}'",
                task_id
            )));
        }
    }
    store.with_tx(|tx| {
        if let Some(task_id) = &event.related_task_id {
            truth::require_task(tx, task_id)?;
        }
        truth::append_event(tx, event.clone())
    })
}

pub fn query(store: &Store, filter: &EventFilter) -> Result<Vec<EventLogEntry>, GatehouseError> {
    store.query_events(filter)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimeline {
    pub created_at: Option<i64>,
    /// Start of the most recent attempt.
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub attempts: usize,
    pub retries: usize,
    pub final_event: Option<EventType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub task_id: String,
    pub events: Vec<EventLogEntry>,
    pub timeline: TaskTimeline,
}

fn timeline(events: &[EventLogEntry]) -> TaskTimeline {
    let mut t = TaskTimeline::default();
    for e in events {
        match e.event_type {
            EventType::TaskCreated => t.created_at = t.created_at.or(Some(e.timestamp)),
            EventType::TaskStarted => {
                t.attempts += 1;
                t.started_at = Some(e.timestamp);
                t.finished_at = None;
                t.duration_ms = None;
                t.final_event = None;
            }
            EventType::TaskCompleted | EventType::TaskFailed | EventType::TaskCancelled => {
                t.finished_at = Some(e.timestamp);
                t.duration_ms = t.started_at.map(|s| e.timestamp - s);
                t.final_event = Some(e.event_type);
            }
            EventType::TaskRetried => t.retries += 1,
            _ => {}
        }
    }
    t
}

pub fn task_history(store: &Store, task_id: &str) -> Result<TaskHistory, GatehouseError> {
    let events = store.with_read(|conn| {
        truth::require_task(conn, task_id)?;
        truth::query_events(
            conn,
            &EventFilter {
                related_task_id: Some(task_id.to_string()),
                ..Default::default()
            },
        )
    })?;
    Ok(TaskHistory {
        task_id: task_id.to_string(),
        timeline: timeline(&events),
        events,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateHistory {
    pub gate: GateId,
    pub status: GateStatus,
    pub events: Vec<EventLogEntry>,
    pub review_started_at: Option<i64>,
    pub approved_at: Option<i64>,
    pub rejections: usize,
    pub blocked_attempts: usize,
    pub proofs_submitted: usize,
}

pub fn gate_history(store: &Store, gate: GateId) -> Result<GateHistory, GatehouseError> {
    let (current, events) = store.with_read(|conn| {
        let current = truth::get_gate(conn, gate)?;
        let events = truth::query_events(
            conn,
            &EventFilter {
                related_gate: Some(gate),
                ..Default::default()
            },
        )?;
        Ok((current, events))
    })?;
    let mut h = GateHistory {
        gate,
        status: current.status,
        events: Vec::new(),
        review_started_at: None,
        approved_at: current.approved_at,
        rejections: 0,
        blocked_attempts: 0,
        proofs_submitted: 0,
    };
    for e in &events {
        match e.event_type {
            EventType::GateReviewStarted => h.review_started_at = Some(e.timestamp),
            EventType::GateRejected => h.rejections += 1,
            EventType::GateBlocked => h.blocked_attempts += 1,
            EventType::ProofSubmitted => h.proofs_submitted += 1,
            _ => {}
        }
    }
    h.events = events;
    Ok(h)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatistics {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_actor: BTreeMap<String, usize>,
    pub first_event_at: Option<i64>,
    pub last_event_at: Option<i64>,
    pub elapsed_ms: Option<i64>,
}

pub fn statistics_of(events: &[EventLogEntry]) -> EventStatistics {
    let mut s = EventStatistics {
        total: events.len(),
        ..Default::default()
    };
    for e in events {
        *s.by_type.entry(e.event_type.to_string()).or_default() += 1;
        *s.by_category
            .entry(e.event_type.category().to_string())
            .or_default() += 1;
        *s.by_actor.entry(e.actor.clone()).or_default() += 1;
    }
    s.first_event_at = events.iter().map(|e| e.timestamp).min();
    s.last_event_at = events.iter().map(|e| e.timestamp).max();
    s.elapsed_ms = s.first_event_at.zip(s.last_event_at).map(|(a, b)| b - a);
    s
}

pub fn statistics(store: &Store, since: Option<i64>) -> Result<EventStatistics, GatehouseError> {
    let events = store.query_events(&EventFilter {
        since,
        ..Default::default()
    })?;
    Ok(statistics_of(&events))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateApprovalEntry {
    pub gate: GateId,
    pub approved_by: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcomeCounts {
    pub created: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub generated_at: i64,
    pub statistics: EventStatistics,
    pub phases_started: usize,
    pub phases_completed: usize,
    pub tasks: TaskOutcomeCounts,
    pub gate_approvals: Vec<GateApprovalEntry>,
    pub gate_rejections: usize,
    pub human_input_requested: usize,
    pub human_input_received: usize,
    pub decisions: usize,
    pub errors: usize,
    pub blockers_open: i64,
    pub risks: usize,
}

pub fn audit_report_of(events: &[EventLogEntry]) -> AuditReport {
    let mut r = AuditReport {
        generated_at: now_ms(),
        statistics: statistics_of(events),
        phases_started: 0,
        phases_completed: 0,
        tasks: TaskOutcomeCounts::default(),
        gate_approvals: Vec::new(),
        gate_rejections: 0,
        human_input_requested: 0,
        human_input_received: 0,
        decisions: 0,
        errors: 0,
        blockers_open: 0,
        risks: 0,
    };
    for e in events {
        match e.event_type {
            EventType::PhaseStarted => r.phases_started += 1,
            EventType::PhaseCompleted => r.phases_completed += 1,
            EventType::TaskCreated => r.tasks.created += 1,
            EventType::TaskCompleted => r.tasks.completed += 1,
            EventType::TaskFailed => r.tasks.failed += 1,
            EventType::TaskRetried => r.tasks.retried += 1,
            EventType::TaskCancelled => r.tasks.cancelled += 1,
            EventType::GateApproved => {
                if let Some(gate) = e.related_gate {
                    r.gate_approvals.push(GateApprovalEntry {
                        gate,
                        approved_by: e.actor.clone(),
                        timestamp: e.timestamp,
                    });
                }
            }
            EventType::GateRejected => r.gate_rejections += 1,
            EventType::HumanInputRequested => r.human_input_requested += 1,
            EventType::HumanInputReceived => r.human_input_received += 1,
            EventType::DecisionMade => r.decisions += 1,
            EventType::ErrorOccurred => r.errors += 1,
            EventType::BlockerCreated => r.blockers_open += 1,
            EventType::BlockerResolved => r.blockers_open -= 1,
            EventType::RiskIdentified => r.risks += 1,
            _ => {}
        }
    }
    r.blockers_open = r.blockers_open.max(0);
    r
}

pub fn audit_report(store: &Store) -> Result<AuditReport, GatehouseError> {
    let events = store.query_events(&EventFilter::default())?;
    Ok(audit_report_of(&events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;

    fn entry(id: i64, event_type: EventType, actor: &str, ts: i64) -> EventLogEntry {
        EventLogEntry {
            id,
            event_type,
            actor: actor.to_string(),
            summary: String::new(),
            details: JsonValue::Null,
            related_task_id: None,
            related_gate: None,
            timestamp: ts,
        }
    }

    #[test]
    fn test_timeline_tracks_latest_attempt() {
        let events = vec![
            entry(1, EventType::TaskCreated, "o", 100),
            entry(2, EventType::TaskStarted, "w", 200),
            entry(3, EventType::TaskFailed, "w", 260),
            entry(4, EventType::TaskRetried, "o", 300),
            entry(5, EventType::TaskStarted, "w", 400),
            entry(6, EventType::TaskCompleted, "w", 450),
        ];
        let t = timeline(&events);
        assert_eq!(t.created_at, Some(100));
        assert_eq!(t.started_at, Some(400));
        assert_eq!(t.duration_ms, Some(50));
        assert_eq!(t.attempts, 2);
        assert_eq!(t.retries, 1);
        assert_eq!(t.final_event, Some(EventType::TaskCompleted));
    }

    #[test]
    fn test_statistics_and_audit_counts() {
        let mut approved = entry(4, EventType::GateApproved, "lead", 40);
        approved.related_gate = Some(GateId::G1);
        let events = vec![
            entry(1, EventType::DecisionMade, "lead", 10),
            entry(2, EventType::BlockerCreated, "lead", 20),
            entry(3, EventType::BlockerResolved, "qa", 30),
            approved,
            entry(5, EventType::HumanInputRequested, "agent", 50),
        ];
        let s = statistics_of(&events);
        assert_eq!(s.total, 5);
        assert_eq!(s.by_actor["lead"], 3);
        assert_eq!(s.by_category["blocker"], 2);
        assert_eq!(s.elapsed_ms, Some(40));

        let r = audit_report_of(&events);
        assert_eq!(r.decisions, 1);
        assert_eq!(r.blockers_open, 0);
        assert_eq!(r.human_input_requested, 1);
        assert_eq!(r.gate_approvals.len(), 1);
        assert_eq!(r.gate_approvals[0].gate, GateId::G1);
    }

    #[test]
    fn test_empty_log_has_no_bounds() {
        let s = statistics_of(&[]);
        assert_eq!(s.total, 0);
        assert!(s.first_event_at.is_none());
        assert!(s.elapsed_ms.is_none());
    }
}
