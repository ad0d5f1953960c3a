//! Work item operations: guarded status transitions, conditional
//! assignment, and context side-channel updates.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::work::*;
use crate::model::worker::WorkerId;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Validate a status transition, returning an error if disallowed.
fn validate_transition(from: WorkStatus, to: WorkStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

const WORK_ITEM_COLUMNS: &str = "id, title, status, priority, scope_id, worker_id, \
     preferred_worker_id, due_at, tags, context, routed_rule_id, routed_reason, \
     created_at, updated_at";

impl super::Db {
    /// Insert a new work item. Normally the API layer's job; the CLI uses
    /// this for operator submissions.
    pub async fn insert_work_item(&self, item: &WorkItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO work_items (id, title, status, priority, scope_id, worker_id, \
             preferred_worker_id, due_at, tags, context, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)",
        )
        .bind(item.id.0)
        .bind(&item.title)
        .bind(item.status.to_string())
        .bind(item.priority)
        .bind(item.scope_id)
        .bind(item.worker_id.map(|w| w.0))
        .bind(item.preferred_worker_id.map(|w| w.0))
        .bind(item.due_at)
        .bind(&item.tags)
        .bind(&item.context)
        .bind(item.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Get a work item by ID.
    pub async fn get_work_item(&self, id: WorkId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("work item {id}")))?
            .try_into_work_item()
    }

    /// List work items, newest first, optionally filtered by status.
    pub async fn list_work_items(
        &self,
        status: Option<WorkStatus>,
        limit: i64,
    ) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(status.map(|s| s.to_string()))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(|r| r.try_into_work_item()).collect()
    }

    /// Pending, unassigned items with a routing scope — the routing
    /// candidates. Most urgent first, then oldest.
    pub async fn list_unrouted(&self, limit: i64) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items
             WHERE status = 'pending' AND worker_id IS NULL AND scope_id IS NOT NULL
             ORDER BY priority ASC, created_at ASC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(|r| r.try_into_work_item()).collect()
    }

    pub async fn count_unrouted(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM work_items
             WHERE status = 'pending' AND worker_id IS NULL AND scope_id IS NOT NULL",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(count.0)
    }

    /// Conditionally assign a worker. Only succeeds if the item is still
    /// pending and unassigned, which closes the race against a concurrent
    /// manual assignment. Returns whether this caller won.
    pub async fn assign_if_unassigned(
        &self,
        id: WorkId,
        worker_id: WorkerId,
        rule_id: Option<Uuid>,
        reason: &str,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET status = 'assigned', worker_id = $1, routed_rule_id = $2,
                 routed_reason = $3, updated_at = now()
             WHERE id = $4 AND status = 'pending' AND worker_id IS NULL",
        )
        .bind(worker_id.0)
        .bind(rule_id)
        .bind(reason)
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            metrics::work_routed().add(1, &[KeyValue::new("outcome", "assigned")]);
        }
        Ok(rows_affected > 0)
    }

    /// Transition a work item's status with optimistic concurrency.
    pub async fn transition_status(
        &self,
        id: WorkId,
        from: WorkStatus,
        to: WorkStatus,
    ) -> Result<WorkItem> {
        validate_transition(from, to)?;

        let rows_affected = sqlx::query(
            "UPDATE work_items SET status = $1, updated_at = now()
             WHERE id = $2 AND status = $3",
        )
        .bind(to.to_string())
        .bind(id.0)
        .bind(from.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        metrics::work_status_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );

        self.get_work_item(id).await
    }

    /// Merge a JSON patch into the context side-channel.
    pub async fn merge_work_context(&self, id: WorkId, patch: serde_json::Value) -> Result<()> {
        sqlx::query(
            "UPDATE work_items SET context = context || $1, updated_at = now() WHERE id = $2",
        )
        .bind(patch)
        .bind(id.0)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Items in {pending, assigned} whose worker is active, auto-mode,
    /// credentialed, and under capacity. Priority then creation order.
    pub async fn list_eligible(&self, limit: i64) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT w.id, w.title, w.status, w.priority, w.scope_id, w.worker_id, \
                    w.preferred_worker_id, w.due_at, w.tags, w.context, w.routed_rule_id, \
                    w.routed_reason, w.created_at, w.updated_at
             FROM work_items w
             JOIN workers a ON a.id = w.worker_id
             WHERE w.status IN ('pending', 'assigned')
               AND a.status = 'active'
               AND a.mode = 'auto'
               AND a.credentials IS NOT NULL AND a.credentials <> ''
               AND (a.capacity IS NULL OR a.active_count < a.capacity)
             ORDER BY w.priority ASC, w.created_at ASC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(|r| r.try_into_work_item()).collect()
    }

    pub async fn count_eligible(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM work_items w
             JOIN workers a ON a.id = w.worker_id
             WHERE w.status IN ('pending', 'assigned')
               AND a.status = 'active'
               AND a.mode = 'auto'
               AND a.credentials IS NOT NULL AND a.credentials <> ''
               AND (a.capacity IS NULL OR a.active_count < a.capacity)",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(count.0)
    }

    /// Non-terminal items past their due timestamp.
    pub async fn list_overdue(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items
             WHERE due_at IS NOT NULL AND due_at < $1
               AND status NOT IN ('completed', 'cancelled')
             ORDER BY due_at ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(|r| r.try_into_work_item()).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    title: String,
    status: String,
    priority: i32,
    scope_id: Option<Uuid>,
    worker_id: Option<Uuid>,
    preferred_worker_id: Option<Uuid>,
    due_at: Option<DateTime<Utc>>,
    tags: Vec<String>,
    context: serde_json::Value,
    routed_rule_id: Option<Uuid>,
    routed_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkId(self.id),
            title: self.title,
            status: self.status.parse()?,
            priority: self.priority,
            scope_id: self.scope_id,
            worker_id: self.worker_id.map(WorkerId),
            preferred_worker_id: self.preferred_worker_id.map(WorkerId),
            due_at: self.due_at,
            tags: self.tags,
            context: self.context,
            routed_rule_id: self.routed_rule_id,
            routed_reason: self.routed_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
