//! Workers: execution endpoints with capacity accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An execution endpoint work items are assigned to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub status: WorkerStatus,
    pub mode: ExecutionMode,

    /// Capabilities this worker covers. Rules targeting a capability only
    /// consider workers that carry it.
    pub capabilities: Vec<String>,

    /// Concurrent work limit. None = unbounded until the reconciler
    /// backfills the documented default.
    pub capacity: Option<i32>,

    /// Count of work items currently in_progress on this worker. The
    /// reconciler's invariant; never negative.
    pub active_count: i32,

    /// Opaque encrypted credentials blob, consumed by the Executor only.
    /// The scheduler only cares whether it is present.
    #[serde(skip_serializing)]
    pub credentials: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Newtype for worker IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Paused,
    Disabled,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Paused => "paused",
            WorkerStatus::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "paused" => Ok(WorkerStatus::Paused),
            "disabled" => Ok(WorkerStatus::Disabled),
            other => Err(crate::error::Error::Other(format!(
                "unknown worker status: {other}"
            ))),
        }
    }
}

/// How the scheduler treats this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Picked up by the background loop.
    Auto,
    /// Only executed via the manual trigger.
    Manual,
    /// A person; never executed by this engine.
    Human,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionMode::Auto => "auto",
            ExecutionMode::Manual => "manual",
            ExecutionMode::Human => "human",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ExecutionMode::Auto),
            "manual" => Ok(ExecutionMode::Manual),
            "human" => Ok(ExecutionMode::Human),
            other => Err(crate::error::Error::Other(format!(
                "unknown execution mode: {other}"
            ))),
        }
    }
}

impl Worker {
    /// Active and under capacity. A worker with no capacity limit is
    /// treated as available (the reconciler backfills a default anyway).
    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Active
            && self.capacity.is_none_or(|cap| self.active_count < cap)
    }

    /// Does this worker cover all of the required capabilities?
    pub fn covers(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|cap| self.capabilities.iter().any(|c| c == cap))
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.as_deref().is_some_and(|c| !c.is_empty())
    }
}
