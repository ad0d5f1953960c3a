//! Delivery target, subscription, and attempt storage.
//!
//! Attempt rows are created before each first send and updated in place
//! across retries, so every delivery leaves an at-least-once audit trail.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::delivery::*;
use crate::model::routing::Condition;

const TARGET_COLUMNS: &str = "id, scope_id, event, filter, kind, url, secret, allow_private, \
     max_retries, backoff, initial_delay_secs, enabled, last_fired_at, success_count, failure_count";

const ATTEMPT_COLUMNS: &str = "id, target_id, subscription_id, event, payload, attempts, \
     status, response, error, next_attempt_at, created_at, updated_at";

impl super::Db {
    pub async fn insert_delivery_target(&self, target: &DeliveryTarget) -> Result<()> {
        sqlx::query(
            "INSERT INTO delivery_targets (id, scope_id, event, filter, kind, url, secret, \
             allow_private, max_retries, backoff, initial_delay_secs, enabled)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(target.id)
        .bind(target.scope_id)
        .bind(&target.event)
        .bind(serde_json::to_value(&target.filter)?)
        .bind(&target.kind)
        .bind(&target.url)
        .bind(&target.secret)
        .bind(target.allow_private)
        .bind(target.retry.max_retries as i32)
        .bind(target.retry.backoff.to_string())
        .bind(target.retry.initial_delay_secs as i32)
        .bind(target.enabled)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_delivery_target(&self, id: Uuid) -> Result<DeliveryTarget> {
        let row: Option<TargetRow> = sqlx::query_as(&format!(
            "SELECT {TARGET_COLUMNS} FROM delivery_targets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("delivery target {id}")))?
            .try_into_target()
    }

    /// Enabled targets bound to this event name (exact or wildcard) and
    /// visible from this scope. The payload filter is evaluated by the
    /// caller.
    pub async fn targets_for_event(
        &self,
        event: &str,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<DeliveryTarget>> {
        let rows: Vec<TargetRow> = sqlx::query_as(&format!(
            "SELECT {TARGET_COLUMNS} FROM delivery_targets
             WHERE enabled AND (event = $1 OR event = '*')
               AND (scope_id IS NULL OR scope_id = $2)"
        ))
        .bind(event)
        .bind(scope_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(|r| r.try_into_target()).collect()
    }

    pub async fn insert_subscription(&self, sub: &Subscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriptions (id, url, events, secret, allow_private, active)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(sub.id)
        .bind(&sub.url)
        .bind(&sub.events)
        .bind(&sub.secret)
        .bind(sub.allow_private)
        .bind(sub.active)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Active subscriptions listening to this event name, wildcard
    /// included.
    pub async fn get_subscription(&self, id: Uuid) -> Result<Subscription> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT id, url, events, secret, allow_private, active
             FROM subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|r| r.into_subscription())
            .ok_or_else(|| Error::NotFound(format!("subscription {id}")))
    }

    pub async fn subscriptions_for_event(&self, event: &str) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            "SELECT id, url, events, secret, allow_private, active FROM subscriptions
             WHERE active AND ($1 = ANY(events) OR '*' = ANY(events))",
        )
        .bind(event)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|r| r.into_subscription()).collect())
    }

    /// Record a new attempt row in status pending, before any send.
    pub async fn insert_delivery_attempt(
        &self,
        target_id: Option<Uuid>,
        subscription_id: Option<Uuid>,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<DeliveryAttempt> {
        let id = Uuid::new_v4();
        let row: AttemptRow = sqlx::query_as(&format!(
            "INSERT INTO delivery_attempts (id, target_id, subscription_id, event, payload)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {ATTEMPT_COLUMNS}"
        ))
        .bind(id)
        .bind(target_id)
        .bind(subscription_id)
        .bind(event)
        .bind(payload)
        .fetch_one(self.pool())
        .await?;
        row.try_into_attempt()
    }

    pub async fn get_delivery_attempt(&self, id: Uuid) -> Result<DeliveryAttempt> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("delivery attempt {id}")))?
            .try_into_attempt()
    }

    pub async fn list_delivery_attempts(&self, limit: i64) -> Result<Vec<DeliveryAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
             ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(|r| r.try_into_attempt()).collect()
    }

    /// Mark an attempt in-flight and bump the attempt counter. The
    /// counter only ever increases.
    pub async fn begin_delivery_send(&self, id: Uuid) -> Result<i32> {
        let row: (i32,) = sqlx::query_as(
            "UPDATE delivery_attempts
             SET status = 'retrying', attempts = attempts + 1, updated_at = now()
             WHERE id = $1
             RETURNING attempts",
        )
        .bind(id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    pub async fn mark_delivery_delivered(&self, id: Uuid, response: &str) -> Result<()> {
        sqlx::query(
            "UPDATE delivery_attempts
             SET status = 'delivered', response = $1, error = NULL,
                 next_attempt_at = NULL, updated_at = now()
             WHERE id = $2",
        )
        .bind(response)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Back to pending with a scheduled next attempt.
    pub async fn schedule_delivery_retry(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE delivery_attempts
             SET status = 'pending', error = $1, next_attempt_at = $2, updated_at = now()
             WHERE id = $3",
        )
        .bind(error)
        .bind(next_attempt_at)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_delivery_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE delivery_attempts
             SET status = 'failed', error = $1, next_attempt_at = NULL, updated_at = now()
             WHERE id = $2",
        )
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Attempts still awaiting a send: the restart-recovery set. A crash
    /// mid-send leaves status retrying, so those are picked up too.
    pub async fn recoverable_delivery_attempts(&self) -> Result<Vec<DeliveryAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
             WHERE status IN ('pending', 'retrying')
             ORDER BY created_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(|r| r.try_into_attempt()).collect()
    }

    /// Manual retry: re-open a terminally failed attempt with a replay
    /// payload. Guarded so only failed attempts re-open.
    pub async fn reopen_delivery_attempt(
        &self,
        id: Uuid,
        payload: &serde_json::Value,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE delivery_attempts
             SET status = 'pending', payload = $1, error = NULL,
                 next_attempt_at = NULL, updated_at = now()
             WHERE id = $2 AND status = 'failed'",
        )
        .bind(payload)
        .bind(id)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Denormalized target counters, touched fire-and-forget after each
    /// terminal outcome.
    pub async fn bump_target_counters(&self, target_id: Uuid, success: bool) -> Result<()> {
        let column = if success {
            "success_count"
        } else {
            "failure_count"
        };
        sqlx::query(&format!(
            "UPDATE delivery_targets
             SET {column} = {column} + 1, last_fired_at = now()
             WHERE id = $1"
        ))
        .bind(target_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    id: Uuid,
    scope_id: Option<Uuid>,
    event: String,
    filter: serde_json::Value,
    kind: String,
    url: String,
    secret: Option<String>,
    allow_private: bool,
    max_retries: i32,
    backoff: String,
    initial_delay_secs: i32,
    enabled: bool,
    last_fired_at: Option<DateTime<Utc>>,
    success_count: i64,
    failure_count: i64,
}

impl TargetRow {
    fn try_into_target(self) -> Result<DeliveryTarget> {
        let filter: Vec<Condition> = serde_json::from_value(self.filter)?;
        Ok(DeliveryTarget {
            id: self.id,
            scope_id: self.scope_id,
            event: self.event,
            filter,
            kind: self.kind,
            url: self.url,
            secret: self.secret,
            allow_private: self.allow_private,
            retry: RetryPolicy {
                max_retries: self.max_retries.max(0) as u32,
                backoff: self.backoff.parse()?,
                initial_delay_secs: self.initial_delay_secs.max(0) as u32,
            },
            enabled: self.enabled,
            last_fired_at: self.last_fired_at,
            success_count: self.success_count,
            failure_count: self.failure_count,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    url: String,
    events: Vec<String>,
    secret: Option<String>,
    allow_private: bool,
    active: bool,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Subscription {
        Subscription {
            id: self.id,
            url: self.url,
            events: self.events,
            secret: self.secret,
            allow_private: self.allow_private,
            active: self.active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    target_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    event: String,
    payload: serde_json::Value,
    attempts: i32,
    status: String,
    response: Option<String>,
    error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AttemptRow {
    fn try_into_attempt(self) -> Result<DeliveryAttempt> {
        Ok(DeliveryAttempt {
            id: self.id,
            target_id: self.target_id,
            subscription_id: self.subscription_id,
            event: self.event,
            payload: self.payload,
            attempts: self.attempts,
            status: self.status.parse()?,
            response: self.response,
            error: self.error,
            next_attempt_at: self.next_attempt_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
