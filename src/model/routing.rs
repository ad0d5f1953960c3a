//! Routing configuration as data: ordered rules with a closed condition
//! grammar, parsed from JSONB into exhaustive enums.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::work::WorkItem;
use super::worker::WorkerId;

/// Rules without an explicit priority sort last.
pub const RULE_PRIORITY_SENTINEL: i32 = i32::MAX;

/// A scope's routing configuration: ordered rules plus an optional
/// default worker consulted when no rule assigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub scope_id: Uuid,
    pub rules: Vec<RoutingRule>,
    pub default_worker_id: Option<WorkerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: Uuid,
    pub name: String,
    /// Ascending = evaluated first. None sorts last.
    pub priority: Option<i32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Empty = catch-all; matches every item.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub target: RuleTarget,
    pub fallback_worker_id: Option<WorkerId>,
}

fn default_enabled() -> bool {
    true
}

impl RoutingRule {
    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(RULE_PRIORITY_SENTINEL)
    }
}

/// Closed condition grammar. Evaluation is exhaustive; there is no
/// free-form interpretation path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Item tags intersect these tags.
    TagsAny { tags: Vec<String> },
    /// Item tags are a superset of these tags.
    TagsAll { tags: Vec<String> },
    /// Inclusive lower bound on priority.
    PriorityGte { value: i32 },
    /// Inclusive upper bound on priority.
    PriorityLte { value: i32 },
    PriorityEq { value: i32 },
    /// Exact match on a context key.
    ContextEq { key: String, value: serde_json::Value },
}

impl Condition {
    /// Evaluate against a work item.
    pub fn matches(&self, item: &WorkItem) -> bool {
        match self {
            Condition::TagsAny { tags } => tags.iter().any(|t| item.tags.contains(t)),
            Condition::TagsAll { tags } => tags.iter().all(|t| item.tags.contains(t)),
            Condition::PriorityGte { value } => item.priority >= *value,
            Condition::PriorityLte { value } => item.priority <= *value,
            Condition::PriorityEq { value } => item.priority == *value,
            Condition::ContextEq { key, value } => item.context.get(key) == Some(value),
        }
    }

    /// Evaluate against a raw event payload (delivery target filters use
    /// the same grammar as routing rules). Tags come from a `tags` array,
    /// priority from a `priority` number, context from top-level keys.
    pub fn matches_payload(&self, payload: &serde_json::Value) -> bool {
        match self {
            Condition::TagsAny { tags } => payload_tags(payload)
                .iter()
                .any(|t| tags.iter().any(|c| c == t)),
            Condition::TagsAll { tags } => {
                let have = payload_tags(payload);
                tags.iter().all(|c| have.iter().any(|t| t == c))
            }
            Condition::PriorityGte { value } => payload_priority(payload).is_some_and(|p| p >= *value),
            Condition::PriorityLte { value } => payload_priority(payload).is_some_and(|p| p <= *value),
            Condition::PriorityEq { value } => payload_priority(payload) == Some(*value),
            Condition::ContextEq { key, value } => payload.get(key) == Some(value),
        }
    }
}

fn payload_tags(payload: &serde_json::Value) -> Vec<String> {
    payload
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn payload_priority(payload: &serde_json::Value) -> Option<i32> {
    payload
        .get("priority")
        .and_then(|v| v.as_i64())
        .map(|p| p as i32)
}

/// What a matched rule assigns to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleTarget {
    /// A specific worker.
    Worker { worker_id: WorkerId },
    /// Any active, available worker covering the capability, selected by
    /// strategy.
    Capability {
        capability: String,
        #[serde(default)]
        strategy: SelectionStrategy,
    },
}

/// Worker selection among capability-matched candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest active count; ties broken by ascending id.
    #[default]
    LeastBusy,
    /// Lowest id.
    FirstAvailable,
    /// Uniform random.
    Random,
    /// No cross-cycle rotation state is kept, so this degrades to a
    /// load-based approximation identical to LeastBusy. An accepted
    /// limitation, not a bug.
    RoundRobin,
}

/// Outcome of evaluating a routing configuration against a work item.
/// "No match" is an expected steady-state result, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    Assigned {
        worker_id: WorkerId,
        /// None when the preferred worker or the default worker assigned,
        /// bypassing rules.
        rule_id: Option<Uuid>,
        reason: String,
    },
    NoMatch {
        reason: String,
    },
}

impl RouteDecision {
    pub fn matched(&self) -> bool {
        matches!(self, RouteDecision::Assigned { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            RouteDecision::Assigned { reason, .. } => reason,
            RouteDecision::NoMatch { reason } => reason,
        }
    }
}
