//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{PolicyRules, DEFAULT_SWEEP_INTERVAL};

/// Prefix for environment variable overrides, e.g. `GATEKEEPER__SERVER__HTTP_ADDR`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML file of policy overrides
    pub rules_path: Option<String>,

    /// Seconds between sweeps of expired windows; 0 disables sweeping
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

impl RateLimitingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Load the configured policy rules, or the built-in defaults.
    pub fn load_rules(&self) -> Result<PolicyRules> {
        match &self.rules_path {
            Some(path) => PolicyRules::from_file(path),
            None => Ok(PolicyRules::new()),
        }
    }
}

impl GatekeeperConfig {
    /// Load configuration from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(
                config::File::with_name(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatekeeperConfig::default();
        assert_eq!(config.server.http_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(300));
        assert!(config.rate_limiting.rules_path.is_none());
    }

    #[test]
    fn test_from_yaml_fills_defaults() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.rate_limiting.sweep_interval_secs, 300);
    }

    #[test]
    fn test_from_yaml_rate_limiting() {
        let yaml = r#"
rate_limiting:
  rules_path: /etc/gatekeeper/rules.yaml
  sweep_interval_secs: 0
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.rate_limiting.rules_path.as_deref(),
            Some("/etc/gatekeeper/rules.yaml")
        );
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::ZERO);
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        assert!(matches!(
            GatekeeperConfig::from_yaml("server: [1, 2"),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = GatekeeperConfig::load(None).unwrap();
        assert_eq!(config.rate_limiting.sweep_interval_secs, 300);
    }

    #[test]
    fn test_load_reads_yaml_file() {
        let path = std::env::temp_dir().join(format!("gatekeeper-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "server:\n  http_addr: \"0.0.0.0:9100\"\nrate_limiting:\n  sweep_interval_secs: 30\n",
        )
        .unwrap();

        let config = GatekeeperConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.server.http_addr, "0.0.0.0:9100".parse().unwrap());
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_rules_defaults_without_path() {
        let rules = RateLimitingConfig::default().load_rules().unwrap();
        assert!(rules.policies.is_empty());
    }
}
