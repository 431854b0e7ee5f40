//! Configuration management
//!
//! Configuration is layered:
//! - YAML file (`kestrel.yaml`), missing file means defaults
//! - `KESTREL_*` environment variables and command-line flags, applied by
//!   [`ServeArgs::apply`](crate::cli::ServeArgs::apply)
//!
//! ## Example Configuration File (kestrel.yaml)
//!
//! ```yaml
//! state_provider: redis
//! notifier_provider: redis
//! historical_writer_provider: local
//! accessor_http_address: "0.0.0.0:9091"
//! updates_allowed: true
//! dead_grace_period: 10m
//! leader_elect: true
//!
//! redis:
//!   url: "redis://localhost:6379"
//!
//! historical:
//!   path: /var/lib/kestrel/historical
//!
//! features_file: features.yaml
//! ```

use kestrel_core::window::duration_str;
use kestrel_core::{FeatureDescriptor, WindowPolicy};
use kestrel_historian::{HistorianClientConfig, HistorianConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// State factory name (`memory`, `redis`)
    pub state_provider: String,
    /// Notifier factory name, used for both notification kinds
    pub notifier_provider: String,
    /// Historical writer factory name (`memory`, `local`)
    pub historical_writer_provider: String,

    pub accessor_http_address: String,
    pub accessor_http_prefix: String,
    /// The gRPC transport lives outside this binary; the address is only logged
    pub accessor_grpc_address: Option<String>,

    /// Rebinding an existing FQN replaces it instead of failing
    pub updates_allowed: bool,
    pub default_namespace: Option<String>,

    pub collect_workers: usize,
    pub write_workers: usize,
    pub collect_notif_workers: usize,
    pub write_notif_workers: usize,

    #[serde(with = "duration_str")]
    pub dead_grace_period: Duration,
    /// Per-request budget for HTTP calls, zero means unbounded
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    /// Run the historian only on the replica holding the Redis lease
    pub leader_elect: bool,
    pub lease: LeaseSection,

    pub redis: RedisSection,
    pub historical: HistoricalSection,

    /// YAML list of feature descriptors bound at startup
    pub features_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_provider: "memory".to_string(),
            notifier_provider: "memory".to_string(),
            historical_writer_provider: "local".to_string(),
            accessor_http_address: "0.0.0.0:9091".to_string(),
            accessor_http_prefix: "/api".to_string(),
            accessor_grpc_address: None,
            updates_allowed: false,
            default_namespace: None,
            collect_workers: 5,
            write_workers: 1,
            collect_notif_workers: 5,
            write_notif_workers: 5,
            dead_grace_period: WindowPolicy::default().dead_grace_period,
            request_timeout: Duration::ZERO,
            leader_elect: false,
            lease: LeaseSection::default(),
            redis: RedisSection::default(),
            historical: HistoricalSection::default(),
            features_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub url: String,
    /// Upgrades a `redis://` url to `rediss://`
    pub tls: bool,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            tls: false,
        }
    }
}

impl RedisSection {
    pub fn effective_url(&self) -> String {
        match self.url.strip_prefix("redis://") {
            Some(rest) if self.tls => format!("rediss://{}", rest),
            _ => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSection {
    pub key: String,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            key: "kestrel:leader".to_string(),
            ttl: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricalSection {
    pub path: PathBuf,
}

impl Default for HistoricalSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".kestrel/historical"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.write_workers != 1 {
            anyhow::bail!("write_workers must be 1, got {}", self.write_workers);
        }
        if self.collect_workers == 0 || self.collect_notif_workers == 0 || self.write_notif_workers == 0 {
            anyhow::bail!("worker counts must be at least 1");
        }
        if self.dead_grace_period.is_zero() {
            anyhow::bail!("dead_grace_period must be positive");
        }
        if !self.accessor_http_prefix.is_empty() && !self.accessor_http_prefix.starts_with('/') {
            anyhow::bail!("accessor_http_prefix must start with '/'");
        }
        Ok(())
    }

    pub fn window(&self) -> WindowPolicy {
        WindowPolicy::new(self.dead_grace_period)
    }

    pub fn historian(&self) -> HistorianConfig {
        HistorianConfig {
            collect_workers: self.collect_workers,
            write_workers: self.write_workers,
            window: self.window(),
        }
    }

    pub fn historian_client(&self) -> HistorianClientConfig {
        HistorianClientConfig {
            collect_notif_workers: self.collect_notif_workers,
            write_notif_workers: self.write_notif_workers,
        }
    }

    /// Settings handed to the Redis-backed providers
    pub fn redis_settings(&self) -> serde_json::Value {
        serde_json::json!({ "url": self.redis.effective_url() })
    }

    /// Settings handed to the historical writer
    pub fn historical_settings(&self) -> serde_json::Value {
        serde_json::json!({ "path": self.historical.path })
    }
}

/// Load configuration from a YAML file, falling back to defaults if it is missing
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!("Configuration file '{}' not found, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&contents)?;

    tracing::info!("Loaded configuration from {}", path.display());

    Ok(config)
}

/// Reads a YAML list of feature descriptors
pub fn load_features(path: impl AsRef<Path>) -> anyhow::Result<Vec<FeatureDescriptor>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read features file '{}': {}", path.display(), e))?;
    let features: Vec<FeatureDescriptor> = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse features file '{}': {}", path.display(), e))?;
    for fd in &features {
        fd.validate()?;
    }
    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{AggrFn, Primitive};
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.state_provider, "memory");
        assert_eq!(config.accessor_http_address, "0.0.0.0:9091");
        assert_eq!(config.accessor_http_prefix, "/api");
        assert_eq!(config.write_workers, 1);
        assert_eq!(config.dead_grace_period, Duration::from_secs(600));
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_config_from_yaml() {
        let yaml = r#"
state_provider: redis
notifier_provider: redis
accessor_http_address: "127.0.0.1:9000"
updates_allowed: true
default_namespace: shop
collect_workers: 8
dead_grace_period: 8m
redis:
  url: "redis://cache:6379"
  tls: true
historical:
  path: /tmp/hist
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.state_provider, "redis");
        assert_eq!(config.accessor_http_address, "127.0.0.1:9000");
        assert!(config.updates_allowed);
        assert_eq!(config.default_namespace.as_deref(), Some("shop"));
        assert_eq!(config.collect_workers, 8);
        assert_eq!(config.write_workers, 1);
        assert_eq!(config.dead_grace_period, Duration::from_secs(480));
        assert_eq!(config.redis.effective_url(), "rediss://cache:6379");
        assert_eq!(config.historical_settings()["path"], "/tmp/hist");
        assert_eq!(config.historian().window.dead_grace_period, Duration::from_secs(480));
    }

    #[test]
    fn test_validate_pins_single_writer() {
        let config = Config {
            write_workers: 2,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("write_workers"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let config = load("nonexistent_file.yaml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_features_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
- fqn: shop.clicks
  primitive: float
  aggr: [sum, count]
  freshness: 1m
  staleness: 1h
- fqn: shop.tier
  primitive: string
  staleness: 24h
"#
        )
        .unwrap();

        let features = load_features(file.path()).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].primitive, Primitive::Float);
        assert_eq!(features[0].aggr, vec![AggrFn::Sum, AggrFn::Count]);
        assert!(features[0].is_windowed());
        assert_eq!(features[1].builder, "streaming");
    }
}
