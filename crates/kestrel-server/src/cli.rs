//! Command-line interface
//!
//! Every `serve` flag can also come from a `KESTREL_*` environment variable.
//! Precedence is flag, then environment, then the YAML file.

use crate::config::Config;
use clap::{Args, Parser, Subcommand};
use kestrel_core::window::parse_duration;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(about = "Kestrel - online feature store engine", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the accessor and the historian
    Serve(ServeArgs),

    /// Check a feature descriptor file without starting anything
    Validate {
        /// YAML list of feature descriptors
        file: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Path to configuration file
    #[arg(short, long, env = "KESTREL_CONFIG", default_value = "kestrel.yaml")]
    pub config: PathBuf,

    #[arg(long, env = "KESTREL_STATE_PROVIDER")]
    pub state_provider: Option<String>,

    #[arg(long, env = "KESTREL_NOTIFIER_PROVIDER")]
    pub notifier_provider: Option<String>,

    #[arg(long, env = "KESTREL_HISTORICAL_WRITER_PROVIDER")]
    pub historical_writer_provider: Option<String>,

    #[arg(long, env = "KESTREL_ACCESSOR_HTTP_ADDRESS")]
    pub accessor_http_address: Option<String>,

    #[arg(long, env = "KESTREL_ACCESSOR_HTTP_PREFIX")]
    pub accessor_http_prefix: Option<String>,

    #[arg(long, env = "KESTREL_ACCESSOR_GRPC_ADDRESS")]
    pub accessor_grpc_address: Option<String>,

    #[arg(long, env = "KESTREL_UPDATES_ALLOWED")]
    pub updates_allowed: Option<bool>,

    #[arg(long, env = "KESTREL_DEFAULT_NAMESPACE")]
    pub default_namespace: Option<String>,

    #[arg(long, env = "KESTREL_COLLECT_WORKERS")]
    pub collect_workers: Option<usize>,

    #[arg(long, env = "KESTREL_WRITE_WORKERS")]
    pub write_workers: Option<usize>,

    #[arg(long, env = "KESTREL_COLLECT_NOTIF_WORKERS")]
    pub collect_notif_workers: Option<usize>,

    #[arg(long, env = "KESTREL_WRITE_NOTIF_WORKERS")]
    pub write_notif_workers: Option<usize>,

    /// Extra bucket TTL beyond staleness, e.g. `10m`
    #[arg(long, env = "KESTREL_DEAD_GRACE_PERIOD", value_parser = parse_duration)]
    pub dead_grace_period: Option<Duration>,

    #[arg(long, env = "KESTREL_LEADER_ELECT")]
    pub leader_elect: Option<bool>,

    #[arg(long, env = "KESTREL_REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "KESTREL_HISTORICAL_PATH")]
    pub historical_path: Option<PathBuf>,

    #[arg(long, env = "KESTREL_FEATURES_FILE")]
    pub features_file: Option<PathBuf>,
}

impl ServeArgs {
    /// Overlays the flags that were given on top of `config`
    pub fn apply(&self, config: &mut Config) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }

        set(&mut config.state_provider, &self.state_provider);
        set(&mut config.notifier_provider, &self.notifier_provider);
        set(&mut config.historical_writer_provider, &self.historical_writer_provider);
        set(&mut config.accessor_http_address, &self.accessor_http_address);
        set(&mut config.accessor_http_prefix, &self.accessor_http_prefix);
        set(&mut config.updates_allowed, &self.updates_allowed);
        set(&mut config.collect_workers, &self.collect_workers);
        set(&mut config.write_workers, &self.write_workers);
        set(&mut config.collect_notif_workers, &self.collect_notif_workers);
        set(&mut config.write_notif_workers, &self.write_notif_workers);
        set(&mut config.dead_grace_period, &self.dead_grace_period);
        set(&mut config.leader_elect, &self.leader_elect);
        set(&mut config.redis.url, &self.redis_url);
        set(&mut config.historical.path, &self.historical_path);
        if self.accessor_grpc_address.is_some() {
            config.accessor_grpc_address = self.accessor_grpc_address.clone();
        }
        if self.default_namespace.is_some() {
            config.default_namespace = self.default_namespace.clone();
        }
        if self.features_file.is_some() {
            config.features_file = self.features_file.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_flags_override_config() {
        let cli = Cli::try_parse_from([
            "kestrel",
            "serve",
            "--config",
            "custom.yaml",
            "--state-provider",
            "redis",
            "--dead-grace-period",
            "8m",
            "--updates-allowed",
            "true",
        ])
        .unwrap();

        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.config, PathBuf::from("custom.yaml"));

        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.state_provider, "redis");
        assert_eq!(config.notifier_provider, "memory");
        assert_eq!(config.dead_grace_period, Duration::from_secs(480));
        assert!(config.updates_allowed);
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let result = Cli::try_parse_from(["kestrel", "serve", "--dead-grace-period", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_command() {
        let cli = Cli::try_parse_from(["kestrel", "validate", "features.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Validate { file } if file == PathBuf::from("features.yaml")));
    }
}
