//! Configuration for the reconnect harness.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::harness::{DriverConfig, RoundParams};
use crate::net::memory::MemoryOptions;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "reconnect-harness")]
#[command(version = "0.1.0")]
#[command(about = "Repeatedly connects, loads and tears down a peer mesh", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of peers in the mesh
    #[arg(short = 'p', long)]
    pub peers: Option<usize>,

    /// Streams opened per peer each round
    #[arg(short = 's', long)]
    pub streams_per_peer: Option<usize>,

    /// Echo messages per stream
    #[arg(short = 'm', long)]
    pub messages: Option<usize>,

    /// Number of rounds
    #[arg(short = 'r', long)]
    pub rounds: Option<usize>,

    /// Upper bound for teardown convergence in milliseconds
    #[arg(long)]
    pub settle_ms: Option<u64>,

    /// Timeout for every handshake step in milliseconds
    #[arg(long)]
    pub step_timeout_ms: Option<u64>,

    /// Delay before a closed connection is reclaimed on the remote side
    #[arg(long)]
    pub reclaim_ms: Option<u64>,

    /// Size of each stream driver's random buffer in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Seed for payload generation (random if unset)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Quick profile: 5 streams per peer, 4 messages, half the rounds
    #[arg(long)]
    pub short: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Peer set and round count
#[derive(Debug, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_peers")]
    pub peers: usize,
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    pub workers: Option<usize>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            peers: default_peers(),
            rounds: default_rounds(),
            workers: None,
        }
    }
}

/// Stream traffic
#[derive(Debug, Deserialize)]
pub struct TrafficConfig {
    #[serde(default = "default_streams_per_peer")]
    pub streams_per_peer: usize,
    #[serde(default = "default_messages")]
    pub messages: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Per-direction stream buffer of the in-memory network
    #[serde(default = "default_stream_window")]
    pub stream_window: usize,
    pub seed: Option<u64>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            streams_per_peer: default_streams_per_peer(),
            messages: default_messages(),
            buffer_size: default_buffer_size(),
            stream_window: default_stream_window(),
            seed: None,
        }
    }
}

/// Timeouts and teardown timing, all in milliseconds
#[derive(Debug, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_reclaim_ms")]
    pub reclaim_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            poll_ms: default_poll_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            reclaim_ms: default_reclaim_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_peers() -> usize {
    5
}

fn default_rounds() -> usize {
    4
}

fn default_streams_per_peer() -> usize {
    3
}

fn default_messages() -> usize {
    10
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_stream_window() -> usize {
    256 * 1024
}

fn default_settle_ms() -> u64 {
    20
}

fn default_poll_ms() -> u64 {
    1
}

fn default_step_timeout_ms() -> u64 {
    5000
}

fn default_reclaim_ms() -> u64 {
    10 // matches the usual stream-muxer GC interval
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub peers: usize,
    pub streams_per_peer: usize,
    pub messages: usize,
    pub rounds: usize,
    pub settle: Duration,
    pub poll: Duration,
    pub step_timeout: Duration,
    pub reclaim: Duration,
    pub buffer_size: usize,
    pub stream_window: usize,
    pub seed: Option<u64>,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut config = Config {
            peers: cli.peers.unwrap_or(toml_config.mesh.peers),
            streams_per_peer: cli
                .streams_per_peer
                .unwrap_or(toml_config.traffic.streams_per_peer),
            messages: cli.messages.unwrap_or(toml_config.traffic.messages),
            rounds: cli.rounds.unwrap_or(toml_config.mesh.rounds),
            settle: Duration::from_millis(cli.settle_ms.unwrap_or(toml_config.timing.settle_ms)),
            poll: Duration::from_millis(toml_config.timing.poll_ms),
            step_timeout: Duration::from_millis(
                cli.step_timeout_ms
                    .unwrap_or(toml_config.timing.step_timeout_ms),
            ),
            reclaim: Duration::from_millis(
                cli.reclaim_ms.unwrap_or(toml_config.timing.reclaim_ms),
            ),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.traffic.buffer_size),
            stream_window: toml_config.traffic.stream_window,
            seed: cli.seed.or(toml_config.traffic.seed),
            workers: cli.workers.or(toml_config.mesh.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        if cli.short {
            config.streams_per_peer = 5;
            config.messages = 4;
            config.rounds = (config.rounds / 2).max(1);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.peers < 2 {
            return Err(ConfigError::Invalid(format!(
                "peers must be at least 2, got {}",
                self.peers
            )));
        }
        if self.rounds == 0 {
            return Err(ConfigError::Invalid("rounds must be at least 1".into()));
        }
        if self.buffer_size < 2 {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must be at least 2, got {}",
                self.buffer_size
            )));
        }
        if self.stream_window < self.buffer_size {
            return Err(ConfigError::Invalid(format!(
                "stream_window ({}) must not be smaller than buffer_size ({})",
                self.stream_window, self.buffer_size
            )));
        }
        if self.step_timeout.is_zero() {
            return Err(ConfigError::Invalid("step timeout must be non-zero".into()));
        }
        if self.poll.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Total streams per round.
    pub fn streams(&self) -> usize {
        self.streams_per_peer * self.peers
    }

    pub fn round_params(&self) -> RoundParams {
        RoundParams {
            streams: self.streams(),
            messages: self.messages,
            driver: DriverConfig {
                buffer_size: self.buffer_size,
                seed: self.seed,
                step_timeout: self.step_timeout,
            },
            settle_window: self.settle,
            poll_interval: self.poll,
        }
    }

    pub fn memory_options(&self) -> MemoryOptions {
        MemoryOptions {
            reclaim_delay: self.reclaim,
            stream_window: self.stream_window,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["reconnect-harness"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.mesh.peers, 5);
        assert_eq!(config.traffic.buffer_size, 65536);
        assert_eq!(config.timing.settle_ms, 20);
        assert_eq!(config.timing.reclaim_ms, 10);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [mesh]
            peers = 2
            rounds = 8
            workers = 4

            [traffic]
            streams_per_peer = 5
            messages = 4
            seed = 99

            [timing]
            settle_ms = 50
            step_timeout_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mesh.peers, 2);
        assert_eq!(config.mesh.rounds, 8);
        assert_eq!(config.mesh.workers, Some(4));
        assert_eq!(config.traffic.streams_per_peer, 5);
        assert_eq!(config.traffic.seed, Some(99));
        assert_eq!(config.traffic.buffer_size, 65536);
        assert_eq!(config.timing.settle_ms, 50);
        assert_eq!(config.timing.poll_ms, 1);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [mesh]
            peers = 3
            rounds = 6
            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let config = Config::merge(args(&["--peers", "4", "--log-level", "debug"]), toml_config)
            .unwrap();
        assert_eq!(config.peers, 4);
        assert_eq!(config.rounds, 6);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.streams(), 12);
    }

    #[test]
    fn test_short_profile() {
        let config = Config::merge(args(&["--short", "--rounds", "4"]), TomlConfig::default())
            .unwrap();
        assert_eq!(config.streams_per_peer, 5);
        assert_eq!(config.messages, 4);
        assert_eq!(config.rounds, 2);

        let config = Config::merge(args(&["--short", "--rounds", "1"]), TomlConfig::default())
            .unwrap();
        assert_eq!(config.rounds, 1);
    }

    #[test]
    fn test_validation() {
        let err = Config::merge(args(&["--peers", "1"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::merge(args(&["--buffer-size", "1"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::merge(args(&["--buffer-size", "1048576"]), TomlConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("stream_window"));

        let err = Config::merge(args(&["--step-timeout-ms", "0"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_round_params() {
        let config = Config::merge(
            args(&["--peers", "2", "--streams-per-peer", "3", "--seed", "5"]),
            TomlConfig::default(),
        )
        .unwrap();
        let params = config.round_params();
        assert_eq!(params.streams, 6);
        assert_eq!(params.driver.seed, Some(5));
        assert_eq!(params.settle_window, Duration::from_millis(20));
        assert_eq!(config.memory_options().reclaim_delay, Duration::from_millis(10));
    }
}
