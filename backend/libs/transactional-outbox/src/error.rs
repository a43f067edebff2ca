//! Error types for the transactional outbox library.

use thiserror::Error;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failed to publish a record to the message broker; the lease will
    /// expire and the row becomes eligible again
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// The record cannot ever be published (unknown event type, broken
    /// payload); retrying will not help, quarantine instead
    #[error("Malformed outbox record: {0}")]
    Malformed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

impl OutboxError {
    /// Whether the row should be quarantined rather than retried.
    pub fn is_malformed(&self) -> bool {
        matches!(self, OutboxError::Malformed(_))
    }
}
