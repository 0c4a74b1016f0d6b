//! Layered application configuration: defaults, overridden by an optional
//! config file, overridden by `COORDKEEPER__*` environment variables.

use serde::Deserialize;
use thiserror::Error;

/// Errors building or validating [`AppConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Ensemble discovery settings (spec.md §4.1).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Discovery endpoint hosts to poll. Empty means "no ensemble
    /// discovery configured" — the coordination client falls back to a
    /// local single-node store.
    pub hosts: Vec<String>,
    /// Port each discovery host is polled on.
    pub port: u16,
    /// HTTP path appended to each host when polling.
    pub uri_path: String,
    /// Minimum seconds between re-polls of the discovery endpoint.
    pub poll_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            hosts: Vec::new(),
            port: 8181,
            uri_path: "/exhibitor/v1/cluster/list".to_string(),
            poll_interval_secs: 30,
        }
    }
}

/// Disk-imbalance rebalancing settings (spec.md §4.5).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiskImbalanceConfig {
    /// Free-space gap, in kilobytes, above which a swap is queued.
    pub threshold_kb: u64,
    /// How often to re-check disk balance.
    pub interval_secs: u64,
}

impl Default for DiskImbalanceConfig {
    fn default() -> Self {
        DiskImbalanceConfig {
            threshold_kb: 1_048_576,
            interval_secs: 300,
        }
    }
}

/// Structured logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info"` or
    /// `"coordkeeperd=debug,coordkeeper_core=info"`.
    pub filter: String,
    /// Emit newline-delimited JSON instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// This node's broker id, as registered in the coordination store.
    pub broker_id: String,
    /// Path to the broker's properties file on disk.
    pub broker_properties_path: String,
    pub discovery: DiscoveryConfig,
    pub disk_imbalance: DiskImbalanceConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            broker_id: String::new(),
            broker_properties_path: "/etc/kafka/server.properties".to_string(),
            discovery: DiscoveryConfig::default(),
            disk_imbalance: DiskImbalanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration layered as: built-in defaults, then `path` (if it
    /// exists), then `COORDKEEPER__*` environment variables (`__` as the
    /// nesting separator, e.g. `COORDKEEPER__DISCOVERY__HOSTS`).
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("COORDKEEPER").separator("__"));
        let cfg: AppConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would leave the supervisor unable to
    /// identify itself or locate its broker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_id.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_id must not be empty".to_string()));
        }
        if self.broker_properties_path.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_properties_path must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fail_validation_without_a_broker_id() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn configured_broker_id_passes_validation() {
        let mut cfg = AppConfig::default();
        cfg.broker_id = "1".to_string();
        assert!(cfg.validate().is_ok());
    }
}
