//! Service configuration loaded from YAML.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolbridge_core::{BridgeConfig, ServerDefinition, StaticBudget};
use tracing::Level;

use crate::observability::{logging::LoggingConfig, metrics::PrometheusConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub servers: Vec<ServerDefinition>,

    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Remaining spend per tenant; tenants not listed are unlimited
    #[serde(default)]
    pub budgets: HashMap<String, f64>,

    #[serde(default)]
    pub logging: LogSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    /// Directory for daily-rolled log files
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_host")]
    pub host: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    29000
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl LogSettings {
    pub fn parse_level(&self) -> ConfigResult<Level> {
        self.level
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                value: self.level.clone(),
                reason: "expected one of trace, debug, info, warn, error".to_string(),
            })
    }

    pub fn to_logging_config(&self) -> ConfigResult<LoggingConfig> {
        Ok(LoggingConfig {
            level: self.parse_level()?,
            json_format: self.json,
            log_dir: self.dir.clone(),
            ..Default::default()
        })
    }
}

impl MetricsSettings {
    pub fn to_prometheus_config(&self) -> PrometheusConfig {
        PrometheusConfig {
            port: self.port,
            host: self.host.clone(),
            duration_buckets: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate.
    pub fn from_yaml(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.bridge
            .validate()
            .map_err(|e| ConfigError::ValidationFailed {
                reason: e.to_string(),
            })?;

        let mut seen = HashSet::with_capacity(self.servers.len());
        for server in &self.servers {
            server
                .validate()
                .map_err(|e| ConfigError::ValidationFailed {
                    reason: format!("server '{}': {}", server.id, e),
                })?;
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("duplicate server id '{}'", server.id),
                });
            }
        }

        for (tenant, amount) in &self.budgets {
            if !amount.is_finite() {
                return Err(ConfigError::InvalidValue {
                    field: format!("budgets.{}", tenant),
                    value: amount.to_string(),
                    reason: "budget must be a finite number".to_string(),
                });
            }
        }

        self.logging.parse_level()?;
        Ok(())
    }

    /// Budget ledger seeded from `budgets`.
    pub fn budget(&self) -> StaticBudget {
        StaticBudget::from_entries(
            self.budgets
                .iter()
                .map(|(tenant, amount)| (tenant.clone(), *amount)),
        )
    }
}

#[cfg(test)]
mod tests {
    use toolbridge_core::TransportKind;

    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ServiceConfig::from_yaml("{}").unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.metrics.port, 29000);
        assert_eq!(config.bridge.health.failure_threshold, 3);
    }

    #[test]
    fn test_server_transports() {
        let yaml = r#"
servers:
  - id: files
    tenant_id: acme
    name: File tools
    transport: stdio
    command: /usr/bin/files-server
    args: ["--root", "/tmp"]
  - id: search
    name: Search
    transport: http_sse
    url: https://search.example.com/mcp
    headers:
      Authorization: Bearer abc
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].transport.kind(), TransportKind::Stdio);
        assert_eq!(config.servers[0].tenant_id.as_str(), "acme");
        assert_eq!(config.servers[1].transport.kind(), TransportKind::HttpSse);
    }

    #[test]
    fn test_duplicate_server_ids_rejected() {
        let yaml = r#"
servers:
  - { id: a, name: A, transport: stdio, command: one }
  - { id: a, name: B, transport: stdio, command: two }
"#;
        let err = ServiceConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate server id 'a'"));
    }

    #[test]
    fn test_invalid_log_level() {
        let err = ServiceConfig::from_yaml("logging: { level: loud }").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "logging.level"));
    }

    #[test]
    fn test_run_timeout_out_of_range() {
        let yaml = "bridge: { invocation: { run_timeout_secs: 5 } }";
        assert!(matches!(
            ServiceConfig::from_yaml(yaml),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }
}
