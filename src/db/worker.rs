//! Worker operations: the capacity tracker and reconciliation queries.
//!
//! Increment and decrement are single-row atomic UPDATEs — the
//! concurrency primitive everything else relies on. No transaction ever
//! spans multiple workers.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::worker::*;

const WORKER_COLUMNS: &str = "id, name, status, mode, capabilities, capacity, \
     active_count, credentials, created_at, updated_at";

impl super::Db {
    pub async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, name, status, mode, capabilities, capacity, \
             active_count, credentials, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)",
        )
        .bind(worker.id.0)
        .bind(&worker.name)
        .bind(worker.status.to_string())
        .bind(worker.mode.to_string())
        .bind(&worker.capabilities)
        .bind(worker.capacity)
        .bind(worker.active_count)
        .bind(&worker.credentials)
        .bind(worker.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_worker(&self, id: WorkerId) -> Result<Worker> {
        let row: Option<WorkerRow> = sqlx::query_as(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("worker {id}")))?
            .try_into_worker()
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers ORDER BY created_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(|r| r.try_into_worker()).collect()
    }

    /// All active workers — the rule evaluator's candidate pool.
    pub async fn list_active_workers(&self) -> Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE status = 'active' ORDER BY id ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(|r| r.try_into_worker()).collect()
    }

    /// Increment-on-start. Single atomic update against one row.
    pub async fn increment_active(&self, id: WorkerId) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET active_count = active_count + 1, updated_at = now()
             WHERE id = $1",
        )
        .bind(id.0)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Decrement-on-finish. Floors at zero, so the counter can never go
    /// negative regardless of decrement ordering.
    pub async fn decrement_active(&self, id: WorkerId) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET active_count = GREATEST(active_count - 1, 0), updated_at = now()
             WHERE id = $1",
        )
        .bind(id.0)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Assign the documented default capacity to any worker without one,
    /// so "unbounded" is never accidental. Returns the repaired workers.
    pub async fn backfill_default_capacity(&self, default: i32) -> Result<Vec<WorkerId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE workers SET capacity = $1, updated_at = now()
             WHERE capacity IS NULL
             RETURNING id",
        )
        .bind(default)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| WorkerId(id)).collect())
    }

    /// Recompute the true count of in_progress items per worker and
    /// overwrite any drifted counter. Returns (worker, corrected value)
    /// for each fix. Heals drift from crashes between increment and
    /// decrement, which are not transactionally tied to execution.
    pub async fn reconcile_active_counts(&self) -> Result<Vec<(WorkerId, i32)>> {
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(
            "UPDATE workers w
             SET active_count = sub.actual, updated_at = now()
             FROM (
                 SELECT w2.id, COUNT(t.id)::int AS actual
                 FROM workers w2
                 LEFT JOIN work_items t
                   ON t.worker_id = w2.id AND t.status = 'in_progress'
                 GROUP BY w2.id
             ) sub
             WHERE w.id = sub.id AND w.active_count <> sub.actual
             RETURNING w.id, w.active_count",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, count)| (WorkerId(id), count))
            .collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: Uuid,
    name: String,
    status: String,
    mode: String,
    capabilities: Vec<String>,
    capacity: Option<i32>,
    active_count: i32,
    credentials: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkerRow {
    fn try_into_worker(self) -> Result<Worker> {
        Ok(Worker {
            id: WorkerId(self.id),
            name: self.name,
            status: self.status.parse()?,
            mode: self.mode.parse()?,
            capabilities: self.capabilities,
            capacity: self.capacity,
            active_count: self.active_count,
            credentials: self.credentials,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
