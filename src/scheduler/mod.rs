//! The dispatch scheduler: the single background loop that routes
//! pending work, flags overdue items, and executes assigned work.
//!
//! One cycle ("tick") runs its phases strictly in order and executes
//! items one at a time. Ticks never overlap: if a cycle is still running
//! when the next interval fires, the new tick is skipped, not queued.

pub mod reconcile;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::db::Db;
use crate::delivery::DeliveryPipeline;
use crate::error::{Error, Result};
use crate::event::DomainEvent;
use crate::executor::Executor;
use crate::model::work::{LastFailure, WorkId, WorkItem, WorkStatus, context};
use crate::routing::Router;
use crate::telemetry::{metrics, work as work_telemetry};

/// Rolling window for repeat overdue notifications, per item.
const OVERDUE_RENOTIFY_HOURS: i64 = 24;
/// How many recent execution outcomes `status()` reports.
const RECENT_WINDOW: usize = 20;

/// Outcome of a single execution, as kept in the recent window and
/// returned by [`Scheduler::execute_now`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub work_id: WorkId,
    pub worker: String,
    pub success: bool,
    /// Category name on failure.
    pub failure: Option<String>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub poll_interval_secs: u64,
    pub batch_size: i64,
    pub eligible: i64,
    pub unrouted: i64,
    pub recent: Vec<ExecutionOutcome>,
}

pub struct Scheduler {
    db: Db,
    router: Router,
    executor: Arc<dyn Executor>,
    pipeline: DeliveryPipeline,
    clock: Arc<dyn Clock>,
    config: Config,
    shutdown: Notify,
    running: AtomicBool,
    tick_active: AtomicBool,
    recent: std::sync::Mutex<VecDeque<ExecutionOutcome>>,
}

/// Clears the in-tick flag even when a phase returns early.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(
        db: Db,
        executor: Arc<dyn Executor>,
        pipeline: DeliveryPipeline,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            router: Router::new(db.clone()),
            db,
            executor,
            pipeline,
            clock,
            config,
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
            tick_active: AtomicBool::new(false),
            recent: std::sync::Mutex::new(VecDeque::with_capacity(RECENT_WINDOW)),
        }
    }

    /// Run the scheduler loop until [`shutdown`](Self::shutdown) is called.
    ///
    /// Resumes interrupted deliveries first, then ticks on the configured
    /// interval. The first tick fires immediately.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        match self.pipeline.recover().await {
            Ok(recovered) if recovered > 0 => {
                info!(count = recovered, "resumed interrupted deliveries");
            }
            Ok(_) => {}
            // A failed recovery pass must not keep the loop from starting;
            // the attempts stay recoverable for the next restart.
            Err(e) => warn!("delivery recovery failed: {e}"),
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("scheduler cycle failed: {e}");
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the run loop to stop after the current cycle.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// One scheduler cycle. Skipped (not queued) when the previous cycle
    /// is still running.
    pub async fn tick(&self) -> Result<()> {
        if self.tick_active.swap(true, Ordering::SeqCst) {
            debug!("previous cycle still running, skipping tick");
            return Ok(());
        }
        let _guard = TickGuard(&self.tick_active);
        let started = Instant::now();

        // Best effort: a failed reconcile pass means stale counters, not
        // a skipped cycle.
        if let Err(e) = reconcile::reconcile(&self.db, self.config.default_worker_capacity).await {
            warn!("reconciliation pass failed: {e}");
        }
        self.route_pending().await?;
        self.sweep_overdue().await?;
        self.execute_batch().await?;

        metrics::cycle_duration_ms().record(started.elapsed().as_millis() as f64, &[]);
        Ok(())
    }

    /// Phase 1: evaluate routing for pending, unassigned work.
    async fn route_pending(&self) -> Result<()> {
        let items = self.db.list_unrouted(self.config.batch_size).await?;
        for item in items {
            let Some(scope_id) = item.scope_id else {
                continue;
            };
            match self.router.evaluate(scope_id, &item).await? {
                crate::model::routing::RouteDecision::Assigned {
                    worker_id,
                    rule_id,
                    reason,
                } => {
                    let won = self
                        .db
                        .assign_if_unassigned(item.id, worker_id, rule_id, &reason)
                        .await?;
                    if !won {
                        // Concurrent (manual) assignment got there first.
                        debug!(work_id = %item.id, "assignment lost race, leaving as-is");
                        continue;
                    }
                    self.db.increment_active(worker_id).await?;
                    let worker = self.db.get_worker(worker_id).await?;
                    let item = self.db.get_work_item(item.id).await?;
                    info!(
                        work_id = %item.id,
                        worker = %worker.name,
                        reason = %reason,
                        "routed work item"
                    );
                    self.emit(DomainEvent::routed(&item, rule_id, &reason)).await;
                    self.emit(DomainEvent::assigned(&item, &worker, &reason)).await;
                }
                crate::model::routing::RouteDecision::NoMatch { reason } => {
                    if item.no_route_warned() {
                        continue;
                    }
                    warn!(work_id = %item.id, reason = %reason, "no routing match");
                    metrics::work_unrouted()
                        .add(1, &[KeyValue::new("scope", scope_id.to_string())]);
                    self.db
                        .merge_work_context(
                            item.id,
                            serde_json::json!({ context::NO_ROUTE_WARNED: true }),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Phase 2: notify on overdue items, at most once per item per
    /// 24-hour window.
    async fn sweep_overdue(&self) -> Result<()> {
        let now = self.clock.now();
        let items = self.db.list_overdue(now, self.config.batch_size).await?;
        for item in items {
            if let Some(notified_at) = item.overdue_notified_at()
                && now - notified_at < Duration::hours(OVERDUE_RENOTIFY_HOURS)
            {
                continue;
            }
            warn!(work_id = %item.id, due_at = ?item.due_at, "work item overdue");
            self.emit(DomainEvent::overdue(&item)).await;
            self.db
                .merge_work_context(
                    item.id,
                    serde_json::json!({ context::OVERDUE_NOTIFIED_AT: now.to_rfc3339() }),
                )
                .await?;
        }
        Ok(())
    }

    /// Phase 3: execute eligible assigned work, strictly one at a time.
    async fn execute_batch(&self) -> Result<()> {
        let items = self.db.list_eligible(self.config.batch_size).await?;
        let now = self.clock.now();
        for item in items {
            if let Some(wait) = cooldown_remaining(&item, now) {
                debug!(
                    work_id = %item.id,
                    remaining_secs = wait.num_seconds(),
                    "worker cooling down, deferring"
                );
                continue;
            }
            if let Err(e) = self.run_one(&item).await {
                // One bad item must not starve the rest of the batch.
                error!(work_id = %item.id, "execution pass failed: {e}");
            }
        }
        Ok(())
    }

    /// Operator-initiated synchronous execution of one assigned item.
    /// Bypasses eligibility filters and cooldowns, but not capacity: a
    /// saturated or inactive worker refuses the trigger.
    pub async fn execute_now(&self, id: WorkId) -> Result<ExecutionOutcome> {
        let item = self.db.get_work_item(id).await?;
        let Some(worker_id) = item.worker_id else {
            return Err(Error::InvalidTransition {
                from: item.status.to_string(),
                to: WorkStatus::InProgress.to_string(),
            });
        };
        if item.status != WorkStatus::Assigned {
            return Err(Error::InvalidTransition {
                from: item.status.to_string(),
                to: WorkStatus::InProgress.to_string(),
            });
        }
        let worker = self.db.get_worker(worker_id).await?;
        if !worker.is_available() {
            return Err(Error::WorkerUnavailable(worker.name));
        }
        self.run_one(&item).await
    }

    /// Execute one item end to end. The active counter is incremented for
    /// the duration of the run and decremented on every exit path; a
    /// failed run resets the item to assigned before anything else, so a
    /// crash mid-bookkeeping leaves at worst a drifted counter for the
    /// reconciler, never a stuck item.
    async fn run_one(&self, item: &WorkItem) -> Result<ExecutionOutcome> {
        let worker_id = item
            .worker_id
            .ok_or_else(|| Error::Other(format!("work item {} has no worker", item.id)))?;
        let worker = self.db.get_worker(worker_id).await?;

        let item = match self
            .db
            .transition_status(item.id, WorkStatus::Assigned, WorkStatus::InProgress)
            .await
        {
            Ok(item) => item,
            Err(Error::InvalidTransition { .. }) => {
                // Someone else picked it up between listing and now.
                debug!(work_id = %item.id, "item no longer assigned, skipping");
                return Err(Error::InvalidTransition {
                    from: WorkStatus::Assigned.to_string(),
                    to: WorkStatus::InProgress.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        self.db.increment_active(worker_id).await?;

        let span = work_telemetry::start_work_span(&worker.name, item.id);
        work_telemetry::record_status_transition(&span, "assigned", "in_progress");

        let started = Instant::now();
        let result = self.executor.execute(&worker, &item).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // Best effort: the status handling below must run even when the
        // counter update fails, and the reconciler recounts from the work
        // table on the next cycle anyway.
        if let Err(e) = self.db.decrement_active(worker_id).await {
            warn!(worker = %worker.name, "failed to decrement active count: {e}");
        }

        let outcome = match result {
            Ok(report) => {
                let item = self
                    .db
                    .transition_status(item.id, WorkStatus::InProgress, WorkStatus::Completed)
                    .await?;
                work_telemetry::record_status_transition(&span, "in_progress", "completed");
                info!(
                    work_id = %item.id,
                    worker = %worker.name,
                    duration_ms,
                    deliverable = ?report.deliverable_id,
                    "work item completed"
                );
                metrics::executions().add(1, &[KeyValue::new("result", "ok")]);
                self.emit(DomainEvent::completed(&item, &worker, duration_ms)).await;
                ExecutionOutcome {
                    work_id: item.id,
                    worker: worker.name.clone(),
                    success: true,
                    failure: None,
                    duration_ms,
                    at: self.clock.now(),
                }
            }
            Err(exec_err) => {
                let category = exec_err.resolve_category();
                // Reset first. If anything after this fails, the item is
                // already safe to retry.
                let item = self
                    .db
                    .transition_status(item.id, WorkStatus::InProgress, WorkStatus::Assigned)
                    .await?;
                work_telemetry::record_status_transition(&span, "in_progress", "assigned");
                warn!(
                    work_id = %item.id,
                    worker = %worker.name,
                    category = %category,
                    "work item failed: {}",
                    exec_err.message
                );
                metrics::executions().add(
                    1,
                    &[
                        KeyValue::new("result", "error"),
                        KeyValue::new("category", category.to_string()),
                    ],
                );

                let failure = LastFailure {
                    category,
                    message: exec_err.message.clone(),
                    at: self.clock.now(),
                    worker_id: Some(worker_id),
                    retryable: category.is_retryable(),
                };
                // Best effort: a lost failure note only costs an earlier
                // retry.
                match serde_json::to_value(&failure) {
                    Ok(value) => {
                        if let Err(e) = self
                            .db
                            .merge_work_context(
                                item.id,
                                serde_json::json!({ context::LAST_FAILURE: value }),
                            )
                            .await
                        {
                            warn!(work_id = %item.id, "failed to record failure context: {e}");
                        }
                    }
                    Err(e) => warn!(work_id = %item.id, "failed to encode failure context: {e}"),
                }

                self.emit(DomainEvent::failed(&item, &worker, category, &exec_err.message))
                    .await;
                ExecutionOutcome {
                    work_id: item.id,
                    worker: worker.name.clone(),
                    success: false,
                    failure: Some(category.to_string()),
                    duration_ms,
                    at: self.clock.now(),
                }
            }
        };

        self.record_recent(outcome.clone());
        Ok(outcome)
    }

    /// Aggregate view for the operator surface.
    pub async fn status(&self) -> Result<SchedulerStatus> {
        let eligible = self.db.count_eligible().await?;
        let unrouted = self.db.count_unrouted().await?;
        let recent = match self.recent.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        };
        Ok(SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            poll_interval_secs: self.config.poll_interval.as_secs(),
            batch_size: self.config.batch_size,
            eligible,
            unrouted,
            recent,
        })
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.pipeline.emit(&event).await {
            warn!(event = %event.name, "event fan-out failed: {e}");
        }
    }

    fn record_recent(&self, outcome: ExecutionOutcome) {
        let mut recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if recent.len() == RECENT_WINDOW {
            recent.pop_front();
        }
        recent.push_back(outcome);
    }
}

/// Remaining cooldown for an item whose last run failed, if any. The
/// window scales with the failure category; a clean item has none.
fn cooldown_remaining(item: &WorkItem, now: DateTime<Utc>) -> Option<Duration> {
    let failure = item.last_failure()?;
    let until = failure.at + failure.category.cooldown();
    if now < until { Some(until - now) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureCategory;

    fn item_with_failure(category: FailureCategory, at: DateTime<Utc>) -> WorkItem {
        let mut item = WorkItem::new("flaky");
        let failure = LastFailure {
            category,
            message: "boom".into(),
            at,
            worker_id: None,
            retryable: category.is_retryable(),
        };
        item.context = serde_json::json!({
            context::LAST_FAILURE: serde_json::to_value(&failure).unwrap()
        });
        item
    }

    #[test]
    fn cooldown_blocks_within_window() {
        let now = Utc::now();
        let item = item_with_failure(FailureCategory::RateLimited, now - Duration::minutes(5));
        let remaining = cooldown_remaining(&item, now);
        assert!(remaining.is_some());
        // 60 minute window, 5 elapsed.
        assert!(remaining.unwrap() > Duration::minutes(54));
    }

    #[test]
    fn cooldown_clears_after_window() {
        let now = Utc::now();
        let item = item_with_failure(FailureCategory::Timeout, now - Duration::minutes(11));
        assert!(cooldown_remaining(&item, now).is_none());
    }

    #[test]
    fn clean_item_has_no_cooldown() {
        assert!(cooldown_remaining(&WorkItem::new("fresh"), Utc::now()).is_none());
    }
}
