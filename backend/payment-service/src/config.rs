/// Configuration management
use serde::Deserialize;

use crate::provider::fake::FakeProviderConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_ledger_retention_secs")]
    pub ledger_retention_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}

/// Provider selection. Only the fake provider ships in this tree; real
/// integrations plug in behind the same trait.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub fake: FakeProviderConfig,
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        Ok(ProviderConfig {
            fake: envy::prefixed("PROVIDER_FAKE_").from_env()?,
        })
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_max_connections() -> u32 {
    10
}

fn default_consumer_group() -> String {
    "payment-service".to_string()
}

fn default_ledger_retention_secs() -> u64 {
    7 * 86_400
}
