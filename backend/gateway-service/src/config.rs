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
    /// Failed logins per username per minute before 429
    #[serde(default = "default_login_failure_limit")]
    pub login_failure_limit: i64,
    /// Client idempotency window for POST /orders
    #[serde(default = "default_create_key_window_secs")]
    pub create_key_window_secs: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
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
    8080
}

fn default_max_connections() -> u32 {
    20
}

fn default_consumer_group() -> String {
    "gateway-saga-registry".to_string()
}

fn default_ledger_retention_secs() -> u64 {
    7 * 86_400
}

fn default_login_failure_limit() -> i64 {
    5
}

fn default_create_key_window_secs() -> u64 {
    60
}

fn default_watchdog_interval_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_everything_but_the_database_url() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "database_url": "postgresql://localhost/gateway"
        }))
        .unwrap();

        assert_eq!(config.server_port, 8080);
        assert_eq!(config.login_failure_limit, 5);
        assert_eq!(config.create_key_window_secs, 60);
    }
}
