//! Error types for the Harbor host

use harbor_common::HarborError;
use thiserror::Error;

/// Result type alias for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Main error type for the Harbor host
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event error: {0}")]
    Event(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Harbor(#[from] HarborError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new event error
    pub fn event(msg: impl Into<String>) -> Self {
        Self::Event(msg.into())
    }
}
