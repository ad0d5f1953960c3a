//! Work execution span helpers.
//!
//! Provides span creation and status-transition recording for work items
//! flowing through the scheduler.

use tracing::Span;

use crate::model::work::WorkId;

/// Start a span for work item execution.
///
/// The `work.status` field is declared empty and can be updated via
/// [`record_status_transition`].
pub fn start_work_span(worker: &str, work_id: WorkId) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.worker" = worker,
        "work.id" = %work_id,
        "work.status" = tracing::field::Empty,
    )
}

/// Record a status transition event on the current span.
///
/// Emits a tracing `info` event scoped to the given span.
pub fn record_status_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "status_transition");
    });
}
