//! Deterministic in-process payment provider.
//!
//! Decisions depend only on the request, so replays after a crash reach
//! the same answer: amounts above the limit decline, and one saga in
//! `risk_modulo` declines at authorization (a second residue declines at
//! capture, exercising the void path). Latency is sampled from the
//! configured window to keep timing behavior honest.

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{AuthorizeRequest, PaymentProvider, ProviderDecision};

#[derive(Debug, Clone, Deserialize)]
pub struct FakeProviderConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_min_latency_ms")]
    pub min_latency_ms: u64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Largest amount the provider will authorize
    #[serde(default = "default_max_amount_minor")]
    pub max_amount_minor: i64,
    /// 1-in-N sagas decline; 0 disables risk declines
    #[serde(default = "default_risk_modulo")]
    pub risk_modulo: u64,
}

impl Default for FakeProviderConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_latency_ms: default_min_latency_ms(),
            max_latency_ms: default_max_latency_ms(),
            max_amount_minor: default_max_amount_minor(),
            risk_modulo: default_risk_modulo(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_min_latency_ms() -> u64 {
    5
}

fn default_max_latency_ms() -> u64 {
    25
}

fn default_max_amount_minor() -> i64 {
    1_000_000
}

fn default_risk_modulo() -> u64 {
    97
}

pub struct FakeProvider {
    config: FakeProviderConfig,
}

impl FakeProvider {
    pub fn new(config: FakeProviderConfig) -> Self {
        Self { config }
    }

    async fn simulate_latency(&self) {
        let (min, max) = (self.config.min_latency_ms, self.config.max_latency_ms);
        if max == 0 {
            return;
        }
        let millis = rand::thread_rng().gen_range(min..=max.max(min));
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    fn risk_residue(&self, key: &str) -> Option<u64> {
        if self.config.risk_modulo == 0 {
            return None;
        }
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in key.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Some(hash % self.config.risk_modulo)
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn authorize(
        &self,
        request: &AuthorizeRequest<'_>,
    ) -> anyhow::Result<ProviderDecision> {
        self.simulate_latency().await;

        if request.amount_minor > self.config.max_amount_minor {
            return Ok(ProviderDecision::Declined {
                reason: "AMOUNT_LIMIT_EXCEEDED".to_string(),
            });
        }

        let saga_key = request.saga_id.to_string();
        if self.risk_residue(&saga_key) == Some(0) {
            return Ok(ProviderDecision::Declined {
                reason: "RISK_DECLINED".to_string(),
            });
        }

        let provider_ref = format!("fake-{saga_key}");
        debug!(provider_ref = %provider_ref, "Authorization approved");
        Ok(ProviderDecision::Approved { provider_ref })
    }

    async fn capture(
        &self,
        provider_ref: &str,
        _amount_minor: i64,
    ) -> anyhow::Result<ProviderDecision> {
        self.simulate_latency().await;

        if self.risk_residue(provider_ref) == Some(1) {
            return Ok(ProviderDecision::Declined {
                reason: "CAPTURE_DECLINED".to_string(),
            });
        }

        Ok(ProviderDecision::Approved {
            provider_ref: provider_ref.to_string(),
        })
    }

    async fn void(&self, provider_ref: &str) -> anyhow::Result<()> {
        self.simulate_latency().await;
        debug!(provider_ref = %provider_ref, "Authorization voided");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn provider(risk_modulo: u64, max_amount: i64) -> FakeProvider {
        FakeProvider::new(FakeProviderConfig {
            enabled: true,
            min_latency_ms: 0,
            max_latency_ms: 0,
            max_amount_minor: max_amount,
            risk_modulo,
        })
    }

    fn request(saga_id: Uuid, amount_minor: i64) -> AuthorizeRequest<'static> {
        AuthorizeRequest {
            tenant_id: "acme",
            saga_id,
            order_id: 1,
            amount_minor,
            currency_code: "EUR",
        }
    }

    #[tokio::test]
    async fn amounts_over_the_limit_decline() {
        let provider = provider(0, 1_000);
        let decision = provider
            .authorize(&request(Uuid::now_v7(), 1_001))
            .await
            .unwrap();
        assert_eq!(
            decision,
            ProviderDecision::Declined {
                reason: "AMOUNT_LIMIT_EXCEEDED".to_string()
            }
        );
    }

    #[tokio::test]
    async fn decisions_are_deterministic_per_saga() {
        let provider = provider(97, 1_000_000);
        let saga_id = Uuid::now_v7();

        let first = provider.authorize(&request(saga_id, 500)).await.unwrap();
        let second = provider.authorize(&request(saga_id, 500)).await.unwrap();
        assert_eq!(first, second, "a replay must reach the same decision");
    }

    #[tokio::test]
    async fn risk_modulo_zero_disables_declines() {
        let provider = provider(0, 1_000_000);
        for _ in 0..32 {
            let decision = provider
                .authorize(&request(Uuid::now_v7(), 100))
                .await
                .unwrap();
            assert!(matches!(decision, ProviderDecision::Approved { .. }));
        }
    }

    #[tokio::test]
    async fn risk_modulo_one_declines_every_authorization() {
        let provider = provider(1, 1_000_000);
        let decision = provider
            .authorize(&request(Uuid::now_v7(), 100))
            .await
            .unwrap();
        assert_eq!(
            decision,
            ProviderDecision::Declined {
                reason: "RISK_DECLINED".to_string()
            }
        );
    }
}
