//! Work items: identity, routing trace, lifecycle state, and the typed
//! context side-channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::worker::WorkerId;
use crate::failure::FailureCategory;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
///
/// Created externally by the API layer; this core only mutates status,
/// assignment, the routing trace, and the context side-channel. Never
/// deleted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier.
    pub id: WorkId,

    /// Human-readable title.
    pub title: String,

    /// Current lifecycle status.
    pub status: WorkStatus,

    /// Priority. Lower = more urgent.
    pub priority: i32,

    /// Owning routing scope (e.g. a project). Items without a scope are
    /// never auto-routed.
    pub scope_id: Option<Uuid>,

    /// Assigned worker, once routed.
    pub worker_id: Option<WorkerId>,

    /// Caller-preferred worker. Tried first, bypassing rules entirely.
    pub preferred_worker_id: Option<WorkerId>,

    /// Due timestamp for the overdue sweep.
    pub due_at: Option<DateTime<Utc>>,

    /// Tags matched by routing rule conditions.
    pub tags: Vec<String>,

    /// Free-form context blob. Transient engine bookkeeping lives under
    /// the documented keys in [`context`]; everything else is opaque.
    pub context: serde_json::Value,

    /// Which rule matched, if any.
    pub routed_rule_id: Option<Uuid>,

    /// Human-readable routing reason for operator diagnostics.
    pub routed_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Created, waiting for routing or manual assignment.
    Pending,
    /// A worker has been assigned; execution has not started.
    Assigned,
    /// A worker is actively executing.
    InProgress,
    /// Done successfully. Terminal.
    Completed,
    /// Cancelled upstream. Terminal.
    Cancelled,
}

impl WorkStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkStatus) -> bool {
        use WorkStatus::*;
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Pending)     // unassignment
                | (Assigned, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Assigned)  // failed execution, back for retry
                | (InProgress, Cancelled)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Cancelled)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Assigned => "assigned",
            WorkStatus::InProgress => "in_progress",
            WorkStatus::Completed => "completed",
            WorkStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "assigned" => Ok(WorkStatus::Assigned),
            "in_progress" => Ok(WorkStatus::InProgress),
            "completed" => Ok(WorkStatus::Completed),
            "cancelled" => Ok(WorkStatus::Cancelled),
            other => Err(crate::error::Error::Other(format!(
                "unknown work status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Context side-channel
// ---------------------------------------------------------------------------

/// Documented keys in the work item context blob. The context is a typed
/// side-channel, not a free-form scratchpad; engine bookkeeping lives
/// under these keys only.
pub mod context {
    /// Serialized [`super::LastFailure`] from the most recent failed run.
    pub const LAST_FAILURE: &str = "last_failure";
    /// Set once when routing found no match, so the warning is not
    /// repeated every cycle.
    pub const NO_ROUTE_WARNED: &str = "no_route_warned";
    /// RFC 3339 timestamp of the last overdue notification; gates the
    /// rolling 24-hour per-item window.
    pub const OVERDUE_NOTIFIED_AT: &str = "overdue_notified_at";
}

/// Failure detail recorded into the context after a failed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastFailure {
    pub category: FailureCategory,
    pub message: String,
    pub at: DateTime<Utc>,
    pub worker_id: Option<WorkerId>,
    pub retryable: bool,
}

impl WorkItem {
    /// A fresh pending item with default priority and no scope. Callers
    /// set scope, tags, and due date before persisting.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkId::new(),
            title: title.into(),
            status: WorkStatus::Pending,
            priority: 0,
            scope_id: None,
            worker_id: None,
            preferred_worker_id: None,
            due_at: None,
            tags: Vec::new(),
            context: serde_json::json!({}),
            routed_rule_id: None,
            routed_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parse the last recorded failure out of the context, if any.
    pub fn last_failure(&self) -> Option<LastFailure> {
        self.context
            .get(context::LAST_FAILURE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn no_route_warned(&self) -> bool {
        self.context
            .get(context::NO_ROUTE_WARNED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn overdue_notified_at(&self) -> Option<DateTime<Utc>> {
        self.context
            .get(context::OVERDUE_NOTIFIED_AT)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}
