use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, DurationSeconds};
use tracing::level_filters::LevelFilter;

use crate::types::Network;

mod peers;
pub use peers::BootstrapPeers;

/// Default number of concurrent dial workers.
pub const DEFAULT_WORKERS: usize = 20;
/// Default upper bound for a single dial.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(20);
/// Default number of dials per assignment before a failure is reported.
pub const DEFAULT_DIAL_ATTEMPTS: u32 = 1;
/// Default minimum time between the start of two passes over the peer queue.
pub const DEFAULT_MIN_ITERATION_INTERVAL: Duration = Duration::from_secs(5);
/// Default time without confirmed activity after which a failing peer is dropped.
pub const DEFAULT_DEPRECATION_TIME: Duration = Duration::from_secs(1024 * 60);
/// Default time since last activity after which a dropped peer is considered gone.
pub const DEFAULT_LEFT_NETWORK_TIME: Duration = Duration::from_secs(60 * 24 * 60 * 60);
/// Default time an established probe connection is kept open.
pub const DEFAULT_CONNECTION_HOLD: Duration = Duration::from_secs(30);
/// Default interval between two metrics reports.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Current version of the crate.
pub(crate) const PCK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Which event restarts a peer's deprecation window.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DeprecationReset {
    /// Any successful dial.
    #[default]
    Connect,
    /// Only a successful identification.
    Identify,
}

#[derive(clap::Parser, Debug, Clone, Default)]
#[command(name = "peerwatch", version = PCK_VERSION, about = "Keeps track of peer liveness")]
pub struct ConfigArgs {
    /// Path to a TOML configuration file. Command line and environment take precedence.
    #[arg(long, env = "PEERWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Network assigned to peers first seen through an inbound connection.
    #[arg(long, value_enum, env = "PEERWATCH_NETWORK")]
    pub network: Option<Network>,

    /// Number of concurrent dial workers.
    #[arg(long, env = "PEERWATCH_WORKERS")]
    pub workers: Option<usize>,

    #[arg(long, env = "PEERWATCH_DIAL_TIMEOUT_SECS")]
    pub dial_timeout_secs: Option<u64>,

    #[arg(long, env = "PEERWATCH_DIAL_ATTEMPTS")]
    pub dial_attempts: Option<u32>,

    #[arg(long, env = "PEERWATCH_MIN_ITERATION_INTERVAL_SECS")]
    pub min_iteration_interval_secs: Option<u64>,

    /// Time without confirmed activity after which a failing peer is deprecated.
    #[arg(long, env = "PEERWATCH_DEPRECATION_TIME_SECS")]
    pub deprecation_time_secs: Option<u64>,

    #[arg(long, env = "PEERWATCH_LEFT_NETWORK_TIME_SECS")]
    pub left_network_time_secs: Option<u64>,

    #[arg(long, value_enum, env = "PEERWATCH_RESET_DEPRECATION_ON")]
    pub reset_deprecation_on: Option<DeprecationReset>,

    /// How long a successful probe connection is kept open.
    #[arg(long, env = "PEERWATCH_CONNECTION_HOLD_SECS")]
    pub connection_hold_secs: Option<u64>,

    #[arg(long, env = "PEERWATCH_METRICS_INTERVAL_SECS")]
    pub metrics_interval_secs: Option<u64>,

    /// TOML file with the peers to start from.
    #[arg(long, env = "PEERWATCH_PEERS_FILE")]
    pub peers_file: Option<PathBuf>,

    /// Append every attempt and connection record to this JSON-lines file.
    #[arg(long, env = "PEERWATCH_RECORD_LOG")]
    pub record_log: Option<PathBuf>,

    #[arg(long, env = "PEERWATCH_LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,
}

impl ConfigArgs {
    fn read_config(path: &Path) -> anyhow::Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing configuration file {}", path.display()))
    }

    /// Merges command line, environment and the optional config file into a
    /// validated configuration.
    pub fn build(self) -> anyhow::Result<Config> {
        let file = match self.config.as_deref() {
            Some(path) => Self::read_config(path)?,
            None => Config::default(),
        };
        let secs = |arg: Option<u64>, fallback: Duration| {
            arg.map(Duration::from_secs).unwrap_or(fallback)
        };

        let config = Config {
            network: self.network.unwrap_or(file.network),
            workers: self.workers.unwrap_or(file.workers),
            dial_timeout: secs(self.dial_timeout_secs, file.dial_timeout),
            dial_attempts: self.dial_attempts.unwrap_or(file.dial_attempts),
            min_iteration_interval: secs(
                self.min_iteration_interval_secs,
                file.min_iteration_interval,
            ),
            deprecation_time: secs(self.deprecation_time_secs, file.deprecation_time),
            left_network_time: secs(self.left_network_time_secs, file.left_network_time),
            reset_deprecation_on: self
                .reset_deprecation_on
                .unwrap_or(file.reset_deprecation_on),
            connection_hold: secs(self.connection_hold_secs, file.connection_hold),
            metrics_interval: secs(self.metrics_interval_secs, file.metrics_interval),
            peers_file: self.peers_file.or(file.peers_file),
            record_log: self.record_log.or(file.record_log),
            log_level: self.log_level.unwrap_or(file.log_level),
        };
        config.validate()?;
        Ok(config)
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub network: Network,
    pub workers: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dial_timeout: Duration,
    pub dial_attempts: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub min_iteration_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub deprecation_time: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub left_network_time: Duration,
    pub reset_deprecation_on: DeprecationReset,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connection_hold: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub metrics_interval: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peers_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_log: Option<PathBuf>,
    #[serde_as(as = "DisplayFromStr")]
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::default(),
            workers: DEFAULT_WORKERS,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            dial_attempts: DEFAULT_DIAL_ATTEMPTS,
            min_iteration_interval: DEFAULT_MIN_ITERATION_INTERVAL,
            deprecation_time: DEFAULT_DEPRECATION_TIME,
            left_network_time: DEFAULT_LEFT_NETWORK_TIME,
            reset_deprecation_on: DeprecationReset::default(),
            connection_hold: DEFAULT_CONNECTION_HOLD,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            peers_file: None,
            record_log: None,
            log_level: LevelFilter::INFO,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.workers >= 1, "at least one dial worker is required");
        anyhow::ensure!(!self.dial_timeout.is_zero(), "dial timeout must be positive");
        anyhow::ensure!(self.dial_attempts >= 1, "at least one dial attempt is required");
        anyhow::ensure!(
            !self.min_iteration_interval.is_zero(),
            "minimum iteration interval must be positive"
        );
        anyhow::ensure!(
            !self.metrics_interval.is_zero(),
            "metrics interval must be positive"
        );
        anyhow::ensure!(
            self.left_network_time > self.deprecation_time,
            "left-network time ({:?}) must exceed deprecation time ({:?})",
            self.left_network_time,
            self.deprecation_time
        );
        Ok(())
    }
}

pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(error) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {error}");
        }
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = level;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConfigArgs::default().build().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.deprecation_time, Duration::from_secs(1024 * 60));
    }

    #[test]
    fn test_serde_config() {
        let config = Config {
            record_log: Some(PathBuf::from("/var/lib/peerwatch/records.jsonl")),
            reset_deprecation_on: DeprecationReset::Identify,
            ..Default::default()
        };
        let serialized = toml::to_string(&config).unwrap();
        assert!(serialized.contains("dial-timeout = 20"));
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_cli_overrides_file() -> testresult::TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
workers = 4
dial-timeout = 7
reset-deprecation-on = "identify"
log-level = "debug"
"#
        )?;
        let path = file.path().to_string_lossy().into_owned();
        let args = ConfigArgs::try_parse_from([
            "peerwatch",
            "--config",
            path.as_str(),
            "--workers",
            "8",
        ])?;

        let config = args.build()?;
        assert_eq!(config.workers, 8);
        assert_eq!(config.dial_timeout, Duration::from_secs(7));
        assert_eq!(config.reset_deprecation_on, DeprecationReset::Identify);
        assert_eq!(config.log_level, LevelFilter::DEBUG);
        // untouched by either source
        assert_eq!(config.min_iteration_interval, DEFAULT_MIN_ITERATION_INTERVAL);
        Ok(())
    }

    #[test]
    fn test_log_level_resolved_before_logger_install() -> testresult::TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "log-level = \"trace\"")?;
        let path = file.path().to_string_lossy().into_owned();

        let from_file = ConfigArgs::try_parse_from(["peerwatch", "--config", path.as_str()])?;
        assert_eq!(from_file.build()?.log_level, LevelFilter::TRACE);

        let from_cli = ConfigArgs::try_parse_from([
            "peerwatch",
            "--config",
            path.as_str(),
            "--log-level",
            "warn",
        ])?;
        assert_eq!(from_cli.build()?.log_level, LevelFilter::WARN);
        Ok(())
    }

    #[test]
    fn test_rejects_inconsistent_thresholds() {
        let args = ConfigArgs {
            deprecation_time_secs: Some(3600),
            left_network_time_secs: Some(60),
            ..Default::default()
        };
        assert!(args.build().is_err());

        let args = ConfigArgs {
            workers: Some(0),
            ..Default::default()
        };
        assert!(args.build().is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = ConfigArgs {
            config: Some(PathBuf::from("/nonexistent/peerwatch.toml")),
            ..Default::default()
        };
        let error = args.build().unwrap_err();
        assert!(error.to_string().contains("reading configuration file"));
    }
}
