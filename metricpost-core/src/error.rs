//! Error types for metricpost-core

use thiserror::Error;

/// Main error type for the metricpost-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Delivery to the ingestion endpoint failed (status, transport error, timeout)
    #[error("delivery error: {0}")]
    Delivery(String),

    /// No async runtime was available to drive timers and retries
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for metricpost-core
pub type Result<T> = std::result::Result<T, Error>;
