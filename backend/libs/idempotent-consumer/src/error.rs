//! Error types for the idempotency ledger

use thiserror::Error;

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur while claiming or recording events
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Ledger key validation failed (empty or oversized component)
    #[error("Invalid ledger key: {0}")]
    InvalidKey(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    /// Check if the error is a unique-constraint violation.
    ///
    /// Claims use INSERT ... ON CONFLICT so this never fires there, but
    /// callers inserting aggregates keyed by saga id hit the same Postgres
    /// code (23505) on a duplicate and can downgrade it to a no-op.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            LedgerError::Database(sqlx_err) => {
                if let Some(db_err) = sqlx_err.as_database_error() {
                    db_err.code().as_deref() == Some("23505")
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Check if the error is transient (should retry)
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Database(sqlx_err) => {
                matches!(
                    sqlx_err,
                    sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
                )
            }
            _ => false,
        }
    }
}
