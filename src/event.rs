//! Domain events emitted on routing and execution outcomes.
//!
//! Events are the engine's voice. The delivery pipeline fans them out to
//! configured targets and subscriptions; upstream collaborators (the API
//! layer) emit their own events through the same pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::failure::FailureCategory;
use crate::model::{WorkItem, Worker};

/// Event names this core emits.
pub mod names {
    pub const WORK_CREATED: &str = "work.created";
    pub const WORK_ROUTED: &str = "work.routed";
    pub const WORK_ASSIGNED: &str = "work.assigned";
    pub const WORK_COMPLETED: &str = "work.completed";
    pub const WORK_FAILED: &str = "work.failed";
    pub const WORK_OVERDUE: &str = "work.overdue";
}

/// A normalized event envelope. Channel adapters consume this; they own
/// all channel-specific formatting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub name: String,
    /// Routing scope the event belongs to. Scoped delivery targets only
    /// see events for their scope; global targets see everything.
    pub scope_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(name: impl Into<String>, scope_id: Option<Uuid>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            scope_id,
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn assigned(item: &WorkItem, worker: &Worker, reason: &str) -> Self {
        Self::new(
            names::WORK_ASSIGNED,
            item.scope_id,
            json!({
                "work_id": item.id.0,
                "title": item.title,
                "priority": item.priority,
                "tags": item.tags,
                "worker_id": worker.id.0,
                "worker_name": worker.name,
                "reason": reason,
            }),
        )
    }

    pub fn routed(item: &WorkItem, rule_id: Option<Uuid>, reason: &str) -> Self {
        Self::new(
            names::WORK_ROUTED,
            item.scope_id,
            json!({
                "work_id": item.id.0,
                "title": item.title,
                "rule_id": rule_id,
                "reason": reason,
            }),
        )
    }

    pub fn completed(item: &WorkItem, worker: &Worker, duration_ms: u64) -> Self {
        Self::new(
            names::WORK_COMPLETED,
            item.scope_id,
            json!({
                "work_id": item.id.0,
                "title": item.title,
                "tags": item.tags,
                "worker_id": worker.id.0,
                "worker_name": worker.name,
                "duration_ms": duration_ms,
            }),
        )
    }

    pub fn failed(item: &WorkItem, worker: &Worker, category: FailureCategory, error: &str) -> Self {
        Self::new(
            names::WORK_FAILED,
            item.scope_id,
            json!({
                "work_id": item.id.0,
                "title": item.title,
                "tags": item.tags,
                "worker_id": worker.id.0,
                "category": category.to_string(),
                "retryable": category.is_retryable(),
                "error": error,
            }),
        )
    }

    pub fn overdue(item: &WorkItem) -> Self {
        Self::new(
            names::WORK_OVERDUE,
            item.scope_id,
            json!({
                "work_id": item.id.0,
                "title": item.title,
                "priority": item.priority,
                "tags": item.tags,
                "due_at": item.due_at,
                "worker_id": item.worker_id.map(|w| w.0),
            }),
        )
    }
}
