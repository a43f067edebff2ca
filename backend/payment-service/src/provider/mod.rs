//! Payment provider abstraction.
//!
//! The saga only needs three capabilities: authorize funds, capture an
//! authorization, void one. The fake provider implements them with
//! deterministic decisions for testing and local development; real
//! acquirer integrations implement the same trait out of tree.

use async_trait::async_trait;
use uuid::Uuid;

pub mod fake;

pub use fake::FakeProvider;

#[derive(Debug, Clone)]
pub struct AuthorizeRequest<'a> {
    pub tenant_id: &'a str,
    pub saga_id: Uuid,
    pub order_id: i64,
    pub amount_minor: i64,
    pub currency_code: &'a str,
}

/// Outcome of an authorize or capture call. A decline is a business
/// answer, not an error; transport failures surface as `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderDecision {
    Approved { provider_ref: String },
    Declined { reason: String },
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn authorize(&self, request: &AuthorizeRequest<'_>)
        -> anyhow::Result<ProviderDecision>;

    async fn capture(
        &self,
        provider_ref: &str,
        amount_minor: i64,
    ) -> anyhow::Result<ProviderDecision>;

    async fn void(&self, provider_ref: &str) -> anyhow::Result<()>;
}
