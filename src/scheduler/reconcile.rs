//! Startup and per-cycle repair of worker bookkeeping.
//!
//! Two passes, both idempotent: give workers without a capacity the
//! configured default, and recount each worker's in-flight items from
//! the work table, overwriting any drifted counter. Drift happens when
//! a crash lands between an assignment and its counter update; the
//! recount is the source of truth.

use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::db::Db;
use crate::error::Result;
use crate::telemetry::metrics;

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Workers that received the default capacity this pass.
    pub backfilled: usize,
    /// Workers whose active count was corrected this pass.
    pub corrected: usize,
}

pub async fn reconcile(db: &Db, default_capacity: i32) -> Result<ReconcileReport> {
    let backfilled = db.backfill_default_capacity(default_capacity).await?;
    for id in &backfilled {
        info!(worker = %id, capacity = default_capacity, "backfilled default capacity");
    }

    let corrected = db.reconcile_active_counts().await?;
    for (id, count) in &corrected {
        info!(worker = %id, active_count = count, "corrected drifted active count");
    }
    if !corrected.is_empty() {
        metrics::counter_corrections().add(
            corrected.len() as u64,
            &[KeyValue::new("pass", "cycle")],
        );
    } else {
        debug!("active counts consistent");
    }

    Ok(ReconcileReport {
        backfilled: backfilled.len(),
        corrected: corrected.len(),
    })
}
