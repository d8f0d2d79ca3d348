use crate::models::ValidationError;

/// Error returned by broker-facing operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// AMQP protocol or connection error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Message body could not be encoded or decoded
    #[error("Serde JSON error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Message failed validation before publish
    #[error("Invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// Operation needs a live session and there is none
    #[error("Not connected: {0}")]
    NotConnected(&'static str),

    /// Broker refused or dropped the operation
    #[error("Broker error: {0}")]
    Broker(String),
}

impl BusError {
    /// Create a broker error
    #[must_use]
    pub fn broker(err: impl std::fmt::Display) -> Self {
        Self::Broker(err.to_string())
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, BusError>;
