//! Configuration Module
//!
//! Provides TOML-based configuration for RelayMQ with support for:
//! - Broker limits and protocol defaults
//! - Retransmission policy
//! - QoS 2 dedup retention and session expiry
//! - Simulation parameters for the bundled binary
//! - Environment variable overrides (RELAYMQ__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::protocol::{ProtocolVersion, QoS};
use crate::retry::{Backoff, RetryPolicy};

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub broker: BrokerSection,
    pub retry: RetryConfig,
    pub dedup: DedupConfig,
    pub session: SessionConfig,
    pub simulation: SimulationSection,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Broker limits and protocol defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// Maximum QoS delivered to subscribers (0, 1 or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Capacity of each connection worker's inbox
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Protocol level used on links: 4 (v3.1.1) or 5 (v5.0)
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
}

fn default_max_qos() -> u8 {
    2
}
fn default_inbox_capacity() -> usize {
    1024
}
fn default_protocol_version() -> u8 {
    4
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            inbox_capacity: default_inbox_capacity(),
            protocol_version: default_protocol_version(),
        }
    }
}

/// Retransmission policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retransmission (e.g., "5s", "250ms")
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// "fixed" or "exponential"
    pub backoff: Backoff,
    /// Upper bound for exponential backoff
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,
    /// Retransmissions before an exchange is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_max_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_max_retries() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: default_retry_interval(),
            backoff: Backoff::Fixed,
            max_interval: default_max_interval(),
            max_retries: default_max_retries(),
        }
    }
}

/// QoS 2 duplicate suppression
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a released identifier is remembered
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
}

fn default_retention() -> Duration {
    Duration::from_secs(10)
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

/// Persistent session parking
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a parked session
    #[serde(default = "default_session_expiry", with = "humantime_serde")]
    pub expiry: Duration,
    #[serde(default = "default_expiry_check_interval", with = "humantime_serde")]
    pub expiry_check_interval: Duration,
}

fn default_session_expiry() -> Duration {
    Duration::from_secs(3600)
}
fn default_expiry_check_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry: default_session_expiry(),
            expiry_check_interval: default_expiry_check_interval(),
        }
    }
}

/// Parameters of the bundled delivery simulation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    /// Messages sent by the publisher
    pub messages: usize,
    /// QoS the publisher sends at
    pub qos: u8,
    /// Number of subscriber clients
    pub subscribers: usize,
    /// QoS granted to each subscription
    pub subscriber_qos: u8,
    /// Every n-th packet on each link is lost (0 = lossless)
    pub drop_every: usize,
    pub topic: String,
    /// Give up waiting for completion after this long
    #[serde(default = "default_simulation_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_simulation_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            messages: 100,
            qos: 2,
            subscribers: 2,
            subscriber_qos: 2,
            drop_every: 0,
            topic: "plant/line1/temperature".to_string(),
            timeout: default_simulation_timeout(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "warn")?
            .set_default("broker.max_qos", 2)?
            .set_default("broker.inbox_capacity", 1024)?
            .set_default("broker.protocol_version", 4)?
            .set_default("retry.interval", "5s")?
            .set_default("retry.backoff", "fixed")?
            .set_default("retry.max_interval", "60s")?
            .set_default("retry.max_retries", 5)?
            .set_default("dedup.retention", "10s")?
            .set_default("session.expiry", "1h")?
            .set_default("session.expiry_check_interval", "60s")?
            .set_default("simulation.messages", 100)?
            .set_default("simulation.qos", 2)?
            .set_default("simulation.subscribers", 2)?
            .set_default("simulation.subscriber_qos", 2)?
            .set_default("simulation.drop_every", 0)?
            .set_default("simulation.topic", "plant/line1/temperature")?
            .set_default("simulation.timeout", "120s")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (RELAYMQ__RETRY__MAX_RETRIES, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, qos) in [
            ("broker.max_qos", self.broker.max_qos),
            ("simulation.qos", self.simulation.qos),
            ("simulation.subscriber_qos", self.simulation.subscriber_qos),
        ] {
            if qos > 2 {
                return Err(ConfigError::Validation(format!(
                    "{} must be 0, 1, or 2",
                    name
                )));
            }
        }

        if ProtocolVersion::from_u8(self.broker.protocol_version).is_none() {
            return Err(ConfigError::Validation(
                "broker.protocol_version must be 4 or 5".to_string(),
            ));
        }

        if self.broker.inbox_capacity == 0 {
            return Err(ConfigError::Validation(
                "broker.inbox_capacity must be greater than 0".to_string(),
            ));
        }

        if self.retry.interval.is_zero() {
            return Err(ConfigError::Validation(
                "retry.interval must be greater than 0".to_string(),
            ));
        }

        if self.retry.backoff == Backoff::Exponential
            && self.retry.max_interval < self.retry.interval
        {
            return Err(ConfigError::Validation(
                "retry.max_interval must not be shorter than retry.interval".to_string(),
            ));
        }

        // Every retransmission restarts the dedup window, so it has to cover
        // the longest gap between two of them with one of them lost
        let longest_gap = self.retry_policy().delay(self.retry.max_retries);
        if self.dedup.retention < longest_gap.saturating_mul(2) {
            return Err(ConfigError::Validation(format!(
                "dedup.retention must be at least twice the longest retry interval ({:?})",
                longest_gap
            )));
        }

        if self.session.expiry_check_interval.is_zero() {
            return Err(ConfigError::Validation(
                "session.expiry_check_interval must be greater than 0".to_string(),
            ));
        }

        if self.simulation.topic.is_empty() {
            return Err(ConfigError::Validation(
                "simulation.topic must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry.backoff {
            Backoff::Fixed => RetryPolicy::fixed(self.retry.interval, self.retry.max_retries),
            Backoff::Exponential => RetryPolicy::exponential(
                self.retry.interval,
                self.retry.max_interval,
                self.retry.max_retries,
            ),
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_u8(self.broker.protocol_version).unwrap_or_default()
    }

    /// Broker settings derived from the `[broker]`, `[retry]`, `[dedup]` and
    /// `[session]` sections
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_qos: QoS::from_u8(self.broker.max_qos).unwrap_or(QoS::ExactlyOnce),
            inbox_capacity: self.broker.inbox_capacity,
            protocol_version: self.protocol_version(),
            retry: self.retry_policy(),
            dedup_retention: self.dedup.retention,
            session_expiry: self.session.expiry,
            session_expiry_check_interval: self.session.expiry_check_interval,
        }
    }
}
