//! Metric instrument factories for taskmill.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskmill"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for taskmill instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("taskmill")
}

/// Counter: work items routed to a worker.
/// Labels: `rule` ("direct" | rule name | "default" | "preferred").
pub fn work_routed() -> Counter<u64> {
    meter()
        .u64_counter("taskmill.work.routed")
        .with_description("Number of work items routed to a worker")
        .build()
}

/// Counter: work item status transitions.
/// Labels: `from`, `to`.
pub fn work_status_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskmill.work.status_transitions")
        .with_description("Number of work item status transitions")
        .build()
}

/// Counter: work items that matched no routing rule.
/// Labels: `scope`.
pub fn work_unrouted() -> Counter<u64> {
    meter()
        .u64_counter("taskmill.work.unrouted")
        .with_description("Work items with no matching routing rule")
        .build()
}

/// Counter: execution outcomes.
/// Labels: `result` ("ok" | "error"), `category` on errors.
pub fn executions() -> Counter<u64> {
    meter()
        .u64_counter("taskmill.executions")
        .with_description("Number of work item executions")
        .build()
}

/// Counter: delivery attempts by outcome.
/// Labels: `result` ("delivered" | "retry" | "failed" | "blocked" | "flooded").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("taskmill.deliveries")
        .with_description("Number of event delivery attempts")
        .build()
}

/// Counter: worker active counts corrected by the reconciler.
/// Labels: none.
pub fn counter_corrections() -> Counter<u64> {
    meter()
        .u64_counter("taskmill.workers.counter_corrections")
        .with_description("Worker active counts corrected by reconciliation")
        .build()
}

/// Histogram: scheduler cycle duration in milliseconds.
/// Labels: none.
pub fn cycle_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskmill.cycle.duration_ms")
        .with_description("Scheduler cycle duration in milliseconds")
        .with_unit("ms")
        .build()
}
