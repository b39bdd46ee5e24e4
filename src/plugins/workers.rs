//! Worker registry.
//!
//! Workers declare a category, capability tags, and the spec prefixes they
//! consume. Registration is idempotent on the worker id: re-registering keeps
//! counters and any in-flight assignment and replaces the declared profile.

use crate::core::error::GatehouseError;
use crate::core::model::{EventType, NewEvent, Worker, WorkerSpec, WorkerStatus};
use crate::core::store::Store;
use crate::core::time::{is_valid_id, now_ms};
use crate::core::truth;
use tracing::info;

fn clean_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn register_worker(store: &Store, spec: &WorkerSpec) -> Result<Worker, GatehouseError> {
    if !is_valid_id(&spec.id) {
        return Err(GatehouseError::ValidationError(format!(
            "invalid worker id '{}'",
            spec.id
        )));
    }
    let category = spec
        .category
        .ok_or_else(|| GatehouseError::ValidationError("worker category is required".to_string()))?;
    let capabilities = clean_tags(&spec.capabilities);
    let spec_consumption: Vec<String> = spec
        .spec_consumption
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let worker = store.with_tx(|tx| {
        let ts = now_ms();
        let existing = truth::get_worker(tx, &spec.id)?;
        let reregistered = existing.is_some();
        match existing {
            Some(_) => {
                truth::update_worker_profile(tx, &spec.id, category, &capabilities, &spec_consumption, ts)?
            }
            None => truth::insert_worker(
                tx,
                &Worker {
                    id: spec.id.clone(),
                    category,
                    capabilities: capabilities.clone(),
                    spec_consumption: spec_consumption.clone(),
                    status: WorkerStatus::Idle,
                    current_task: None,
                    tasks_completed: 0,
                    error_count: 0,
                    average_task_duration_ms: 0.0,
                    registered_at: ts,
                    updated_at: ts,
                },
            )?,
        }
        truth::append_event(
            tx,
            NewEvent::new(
                EventType::WorkerRegistered,
                &spec.id,
                format!("Worker {} registered ({})", spec.id, category),
            )
            .details(serde_json::json!({
                "category": category,
                "capabilities": capabilities,
                "spec_consumption": spec_consumption,
                "reregistered": reregistered,
            })),
        )?;
        truth::require_worker(tx, &spec.id)
    })?;
    info!(worker_id = %worker.id, category = %worker.category, "worker registered");
    Ok(worker)
}

/// Operator-driven status change. `active` is only set by assignment.
pub fn set_worker_status(
    store: &Store,
    worker_id: &str,
    status: WorkerStatus,
    actor: &str,
) -> Result<Worker, GatehouseError> {
    if status == WorkerStatus::Active {
        return Err(GatehouseError::ValidationError(
            "workers become active by taking a task, not by status change".to_string(),
        ));
    }
    store.with_tx(|tx| {
        let before = truth::require_worker(tx, worker_id)?;
        truth::set_worker_status(tx, worker_id, status, now_ms())?;
        truth::append_event(
            tx,
            NewEvent::new(
                EventType::WorkerStatusChanged,
                actor,
                format!("Worker {} {} -> {}", worker_id, before.status, status),
            )
            .details(serde_json::json!({
                "worker_id": worker_id,
                "from": before.status,
                "to": status,
            })),
        )?;
        truth::require_worker(tx, worker_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_tags_normalizes() {
        let tags = vec![" API_Design ".to_string(), "".into(), "api_design".into(), "db".into()];
        assert_eq!(clean_tags(&tags), vec!["api_design".to_string(), "db".to_string()]);
    }
}
