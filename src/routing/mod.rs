//! Rule evaluation: maps (routing configuration, work item) to an
//! assignment decision.
//!
//! The core is a pure function over already-loaded data; [`Router`]
//! wraps it with store access. "No match" is a structured decision for
//! operator diagnostics, never an error — the caller persists whatever
//! comes back.

use rand::seq::IndexedRandom;
use tracing::debug;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::model::routing::*;
use crate::model::work::WorkItem;
use crate::model::worker::{Worker, WorkerId};

/// Loads the scope configuration and candidate workers, then runs the
/// pure evaluator. No side effects; the scheduler persists the decision.
pub struct Router {
    db: Db,
}

impl Router {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn evaluate(&self, scope_id: Uuid, item: &WorkItem) -> Result<RouteDecision> {
        let Some(config) = self.db.routing_config(scope_id).await? else {
            return Ok(RouteDecision::NoMatch {
                reason: format!("routing scope {scope_id} not found"),
            });
        };
        let workers = self.db.list_active_workers().await?;
        Ok(evaluate_rules(&config, &workers, item))
    }
}

/// Evaluate a routing configuration against a work item.
///
/// Deterministic: the same (configuration, workers, item) triple always
/// yields the same decision, except for rules with the `random` strategy.
/// Equal-priority rules fall back to insertion order.
pub fn evaluate_rules(
    config: &RoutingConfig,
    workers: &[Worker],
    item: &WorkItem,
) -> RouteDecision {
    // Preferred worker bypasses rules entirely.
    if let Some(preferred) = item.preferred_worker_id {
        if let Some(worker) = find_available(workers, preferred) {
            return RouteDecision::Assigned {
                worker_id: worker.id,
                rule_id: None,
                reason: format!("preferred worker {}", worker.name),
            };
        }
        debug!(work_id = %item.id, worker_id = %preferred, "preferred worker unavailable, falling through to rules");
    }

    // Ascending priority; rules without one sort last. A stable sort
    // keeps insertion order as the tie break between equal priorities.
    let mut rules: Vec<&RoutingRule> = config.rules.iter().filter(|r| r.enabled).collect();
    rules.sort_by_key(|r| r.effective_priority());

    for rule in rules {
        // Empty condition set is a catch-all.
        if !rule.conditions.iter().all(|c| c.matches(item)) {
            continue;
        }

        match &rule.target {
            RuleTarget::Worker { worker_id } => {
                if let Some(worker) = find_available(workers, *worker_id) {
                    return RouteDecision::Assigned {
                        worker_id: worker.id,
                        rule_id: Some(rule.id),
                        reason: format!("rule '{}' assigned {}", rule.name, worker.name),
                    };
                }
                if let Some(fallback_id) = rule.fallback_worker_id {
                    if let Some(worker) = find_available(workers, fallback_id) {
                        return RouteDecision::Assigned {
                            worker_id: worker.id,
                            rule_id: Some(rule.id),
                            reason: format!(
                                "rule '{}' primary worker unavailable, fallback {}",
                                rule.name, worker.name
                            ),
                        };
                    }
                }
                // Matched but unassignable — lower-priority rules still
                // get their turn.
                debug!(rule = %rule.name, "rule matched but no eligible worker, continuing");
            }
            RuleTarget::Capability {
                capability,
                strategy,
            } => {
                if let Some(worker) = select_by_capability(workers, capability, *strategy) {
                    return RouteDecision::Assigned {
                        worker_id: worker.id,
                        rule_id: Some(rule.id),
                        reason: format!(
                            "rule '{}' selected {} for capability '{}' ({})",
                            rule.name,
                            worker.name,
                            capability,
                            strategy_name(*strategy)
                        ),
                    };
                }
                debug!(rule = %rule.name, capability, "no available worker covers capability, continuing");
            }
        }
    }

    // No rule assigned — the configuration's default worker is last.
    if let Some(default_id) = config.default_worker_id {
        if let Some(worker) = find_available(workers, default_id) {
            return RouteDecision::Assigned {
                worker_id: worker.id,
                rule_id: None,
                reason: format!("no rule assigned, default worker {}", worker.name),
            };
        }
        return RouteDecision::NoMatch {
            reason: "no rule assigned and the default worker is unavailable or at capacity"
                .to_string(),
        };
    }

    RouteDecision::NoMatch {
        reason: "no enabled rule matched and no default worker is configured".to_string(),
    }
}

/// Availability check applied before a direct-worker rule is considered
/// "matched": active and under the capacity limit. Capability coverage
/// is checked where the data model expresses a requirement, i.e. on
/// capability-target rules.
fn find_available(workers: &[Worker], id: WorkerId) -> Option<&Worker> {
    workers
        .iter()
        .find(|w| w.id == id)
        .filter(|w| w.is_available())
}

fn select_by_capability<'a>(
    workers: &'a [Worker],
    capability: &str,
    strategy: SelectionStrategy,
) -> Option<&'a Worker> {
    let required = [capability.to_string()];
    let mut candidates: Vec<&Worker> = workers
        .iter()
        .filter(|w| w.is_available() && w.covers(&required))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    // Deterministic base order: ascending id.
    candidates.sort_by_key(|w| w.id);

    match strategy {
        // round_robin keeps no cross-cycle state, so it degrades to the
        // load-based pick. Documented, not silently fixed.
        SelectionStrategy::LeastBusy | SelectionStrategy::RoundRobin => candidates
            .into_iter()
            .min_by_key(|w| (w.active_count, w.id)),
        SelectionStrategy::FirstAvailable => candidates.into_iter().next(),
        SelectionStrategy::Random => candidates.choose(&mut rand::rng()).copied(),
    }
}

fn strategy_name(strategy: SelectionStrategy) -> &'static str {
    match strategy {
        SelectionStrategy::LeastBusy => "least_busy",
        SelectionStrategy::FirstAvailable => "first_available",
        SelectionStrategy::Random => "random",
        SelectionStrategy::RoundRobin => "round_robin",
    }
}
