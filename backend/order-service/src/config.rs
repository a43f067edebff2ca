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
    /// Ledger retention; must outlast the broker redelivery horizon
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
    8081
}

fn default_max_connections() -> u32 {
    10
}

fn default_consumer_group() -> String {
    "order-service".to_string()
}

fn default_ledger_retention_secs() -> u64 {
    7 * 86_400
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_everything_but_the_database_url() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "database_url": "postgresql://localhost/orders"
        }))
        .unwrap();

        assert_eq!(config.server_port, 8081);
        assert_eq!(config.consumer_group, "order-service");
        assert_eq!(config.ledger_retention_secs, 7 * 86_400);
    }
}
