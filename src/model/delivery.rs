//! Delivery targets, direct subscriptions, and delivery attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::routing::Condition;

/// Matches any event name on a target or subscription.
pub const EVENT_WILDCARD: &str = "*";

/// A configured delivery destination ("route"). Rule-matched and richly
/// configured; the channel-specific formatting of `kind`/`config` is the
/// adapter's concern, not this core's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub id: Uuid,
    /// None = global; Some = bound to one routing scope.
    pub scope_id: Option<Uuid>,
    /// Trigger event name, exact or `*`.
    pub event: String,
    /// Optional filter over the event payload, same grammar as routing
    /// rule conditions. Empty = always fires.
    pub filter: Vec<Condition>,
    /// Destination channel type (webhook, email, chat, object-storage...).
    /// Opaque here.
    pub kind: String,
    pub url: String,
    /// Shared secret for the HMAC signature header.
    pub secret: Option<String>,
    /// Skips the SSRF screen entirely. For test receivers on loopback
    /// only; never set this for user-supplied destinations.
    pub allow_private: bool,
    pub retry: RetryPolicy,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub success_count: i64,
    pub failure_count: i64,
}

/// A simpler direct subscription: one fixed URL, wildcard or explicit
/// event-name matching, no filter conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub allow_private: bool,
    pub active: bool,
}

impl Subscription {
    pub fn listens_to(&self, event: &str) -> bool {
        self.events
            .iter()
            .any(|e| e == EVENT_WILDCARD || e == event)
    }
}

/// Retry shape for a delivery target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure. 0 = fail terminally
    /// on first error.
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub initial_delay_secs: u32,
}

impl RetryPolicy {
    /// Delay before the retry following attempt number `attempts`
    /// (1-based). Exponential doubles per attempt; both kinds are
    /// capped at [`MAX_RETRY_DELAY_SECS`].
    pub fn delay_secs(&self, attempts: u32) -> u64 {
        let base = u64::from(self.initial_delay_secs.max(1));
        let delay = match self.backoff {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => base.saturating_mul(1u64 << attempts.saturating_sub(1).min(32)),
        };
        delay.min(MAX_RETRY_DELAY_SECS)
    }
}

/// Upper bound on any single retry delay, in seconds.
pub const MAX_RETRY_DELAY_SECS: u64 = 300;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffKind::Exponential,
            initial_delay_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl std::fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BackoffKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(crate::error::Error::Other(format!(
                "unknown backoff kind: {other}"
            ))),
        }
    }
}

/// One delivery, updated in place across retries. Never mutated after a
/// terminal status except by manual retry, which re-opens it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    /// Exactly one of target_id / subscription_id is set.
    pub target_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub event: String,
    pub payload: serde_json::Value,
    /// Send attempts so far. Only ever increases.
    pub attempts: i32,
    pub status: DeliveryStatus,
    /// Truncated response body on success.
    pub response: Option<String>,
    pub error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "retrying" => Ok(DeliveryStatus::Retrying),
            other => Err(crate::error::Error::Other(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}
