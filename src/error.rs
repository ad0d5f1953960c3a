//! Error types for taskmill.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("worker {0} is unavailable or at capacity")]
    WorkerUnavailable(String),

    #[error("delivery blocked: {0}")]
    DeliveryBlocked(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Other(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("serialization error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
