use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::error::CoreError;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:6161";
pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_true() -> bool {
    true
}

fn default_probe_url() -> String {
    DEFAULT_PROBE_URL.to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_probe_concurrency() -> usize {
    8
}

fn default_settle_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_capacity() -> usize {
    1_000
}

fn default_level_settle_ms() -> u64 {
    300
}

fn default_reachability_interval_ms() -> u64 {
    10_000
}

fn default_backoff() -> BackoffConfig {
    BackoffConfig {
        base_ms: 1_000,
        max_ms: 30_000,
        max_attempts: 5,
    }
}

/// Control-plane address of the proxy engine.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct ServerConfig {
    /// Stable identity used to key persisted ordering; defaults to `host:port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: None,
            host: host.into(),
            port,
            tls: false,
            secret: None,
        }
    }

    pub fn identity(&self) -> String {
        match &self.id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::InvalidConfiguration(e.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_url")]
    pub url: String,
    /// Engine-enforced timeout passed as the `timeout` query parameter.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,
    /// Wait after engine-side actions before re-reading state.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: default_probe_url(),
            timeout_ms: default_probe_timeout_ms(),
            concurrency: default_probe_concurrency(),
            settle_ms: default_settle_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffConfig,
    #[serde(default = "default_level_settle_ms")]
    pub level_settle_ms: u64,
    #[serde(default = "default_reachability_interval_ms")]
    pub reachability_interval_ms: u64,
    #[serde(default = "default_true")]
    pub autostart: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            capacity: default_log_capacity(),
            backoff: default_backoff(),
            level_settle_ms: default_level_settle_ms(),
            reachability_interval_ms: default_reachability_interval_ms(),
            autostart: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub server: ServerConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub logs: LogConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_db: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            server: ServerConfig::new("127.0.0.1", 9090),
            probe: ProbeConfig::default(),
            logs: LogConfig::default(),
            order_db: None,
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, CoreError> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| CoreError::InvalidConfiguration(format!("config.yaml: {}", e)))?;
        config.server.check()?;
        Ok(config)
    }

    /// Reads the config file; a missing file yields defaults and `true` so the
    /// caller can warn that setup is required.
    pub async fn load(path: &Path) -> Result<(Self, bool), CoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok((Self::from_yaml(&text)?, false)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((Self::default(), true)),
            Err(e) => Err(CoreError::InvalidConfiguration(format!(
                "read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn order_db_path(&self) -> PathBuf {
        if let Some(p) = &self.order_db {
            return p.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clash-board")
            .join("order.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_fills_defaults() {
        let cfg = Config::from_yaml("server:\n  host: 192.168.1.1\n  port: 9090\n  secret: abc\n")
            .unwrap();
        assert_eq!(cfg.listen, DEFAULT_LISTEN);
        assert_eq!(cfg.probe.timeout_ms, 5_000);
        assert_eq!(cfg.logs.capacity, 1_000);
        assert_eq!(cfg.logs.backoff, default_backoff());
        assert_eq!(cfg.server.identity(), "192.168.1.1:9090");
    }

    #[test]
    fn test_invalid_server_rejected() {
        let err = Config::from_yaml("server:\n  host: ''\n  port: 9090\n").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfiguration(_)));
        let err = Config::from_yaml("server:\n  host: router\n  port: 0\n").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_explicit_identity() {
        let mut server = ServerConfig::new("10.0.0.1", 9090);
        server.id = Some("home".to_string());
        assert_eq!(server.identity(), "home");
    }
}
