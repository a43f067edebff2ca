use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Outbox error: {0}")]
    Outbox(#[from] transactional_outbox::OutboxError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] idempotent_consumer::LedgerError),

    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Payment provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("Corrupt status column: {0}")]
    Status(#[from] saga_core::StatusFromDbError),
}

impl From<PaymentError> for bus_consumer::ConsumerError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Status(e) => bus_consumer::ConsumerError::Fatal(e.to_string()),
            other => bus_consumer::ConsumerError::Transient(other.into()),
        }
    }
}
