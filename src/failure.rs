//! Failure classification and cooldown policy.
//!
//! Raw executor error text is mapped onto a closed taxonomy with
//! differentiated cool-down windows. The scheduler consults the window
//! before re-selecting a previously-failed item; it never auto-retries
//! early.

use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    AuthError,
    QuotaExceeded,
    RateLimited,
    Timeout,
    Overloaded,
    ConfigError,
    /// Never produced by `classify`; reachable only via an
    /// executor-supplied category.
    BadRequest,
    Unknown,
}

impl FailureCategory {
    /// Map raw error text onto the taxonomy. Case-insensitive substring
    /// matches against known provider failure signatures, in priority
    /// order.
    pub fn classify(error: &str) -> Self {
        let e = error.to_lowercase();
        if e.contains("authentication") || e.contains("unauthorized") || e.contains("401") {
            FailureCategory::AuthError
        } else if e.contains("quota") || e.contains("billing") || e.contains("credit balance") {
            FailureCategory::QuotaExceeded
        } else if e.contains("rate limit") || e.contains("rate_limit") || e.contains("429") {
            FailureCategory::RateLimited
        } else if e.contains("timeout") || e.contains("timed out") || e.contains("aborted") {
            FailureCategory::Timeout
        } else if e.contains("overloaded") || e.contains("503") || e.contains("529") {
            FailureCategory::Overloaded
        } else if e.contains("decrypt") || e.contains("config") || e.contains("encryption key") {
            FailureCategory::ConfigError
        } else {
            FailureCategory::Unknown
        }
    }

    /// Only known-transient categories (plus config errors an operator
    /// can fix quickly) are auto-retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureCategory::RateLimited
                | FailureCategory::Overloaded
                | FailureCategory::Timeout
                | FailureCategory::ConfigError
        )
    }

    /// Minimum wait before a failed item becomes retry-eligible again.
    /// Anything not explicitly known-transient gets the conservative
    /// 6-hour default.
    pub fn cooldown(self) -> Duration {
        match self {
            FailureCategory::ConfigError | FailureCategory::AuthError => Duration::minutes(5),
            FailureCategory::Overloaded | FailureCategory::Timeout => Duration::minutes(10),
            FailureCategory::RateLimited => Duration::minutes(60),
            FailureCategory::QuotaExceeded
            | FailureCategory::BadRequest
            | FailureCategory::Unknown => Duration::hours(6),
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCategory::AuthError => "auth_error",
            FailureCategory::QuotaExceeded => "quota_exceeded",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Overloaded => "overloaded",
            FailureCategory::ConfigError => "config_error",
            FailureCategory::BadRequest => "bad_request",
            FailureCategory::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for FailureCategory {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth_error" => Ok(FailureCategory::AuthError),
            "quota_exceeded" => Ok(FailureCategory::QuotaExceeded),
            "rate_limited" => Ok(FailureCategory::RateLimited),
            "timeout" => Ok(FailureCategory::Timeout),
            "overloaded" => Ok(FailureCategory::Overloaded),
            "config_error" => Ok(FailureCategory::ConfigError),
            "bad_request" => Ok(FailureCategory::BadRequest),
            "unknown" => Ok(FailureCategory::Unknown),
            other => Err(crate::error::Error::Other(format!(
                "unknown failure category: {other}"
            ))),
        }
    }
}
