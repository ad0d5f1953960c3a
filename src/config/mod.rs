//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::time::Duration;

/// Default seconds between dispatch cycles.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
/// Default maximum work items routed or executed per cycle.
pub const DEFAULT_BATCH_SIZE: i64 = 10;
/// Default capacity assigned to workers created without a limit, so
/// "unbounded" is never accidental.
pub const DEFAULT_WORKER_CAPACITY: i32 = 3;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub default_worker_capacity: i32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            poll_interval: Duration::from_secs(optional_int(
                "TASKMILL_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            batch_size: optional_int("TASKMILL_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            default_worker_capacity: optional_int(
                "TASKMILL_DEFAULT_CAPACITY",
                DEFAULT_WORKER_CAPACITY,
            )?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_int<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be an integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}
