/// Configuration management
use serde::Deserialize;

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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8083
}

fn default_max_connections() -> u32 {
    10
}

fn default_consumer_group() -> String {
    "inventory-service".to_string()
}

fn default_ledger_retention_secs() -> u64 {
    7 * 86_400
}
