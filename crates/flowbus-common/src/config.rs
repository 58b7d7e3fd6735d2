//! Configuration structures for the flowbus service.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for production deployment.
//! Durations use humantime notation (`"150ms"`, `"10s"`).

use crate::types::{Address, PortName};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Transport driver used for every port.
    pub driver: DriverKind,

    /// Scheduler loop timing.
    pub scheduler: SchedulerConfig,

    /// Transport response timeouts.
    pub transport: TransportConfig,

    /// Retry policy of the resilient transport wrapper.
    pub retry: RetryConfig,

    /// Connection health thresholds.
    pub health: HealthConfig,

    /// Write command verification.
    pub commands: CommandConfig,

    /// Diagnostics and status reporting.
    pub metrics: MetricsConfig,

    /// Serial ports and the instruments on them.
    pub ports: Vec<PortConfig>,
}

/// Supported transport drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-memory simulated bus.
    #[default]
    Simulated,
    /// Physical serial port through an external protocol library.
    Serial,
}

/// Scheduler loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep when no address is registered.
    #[serde(with = "humantime_serde")]
    pub idle_sleep: Duration,

    /// Upper bound on one wait for a future due time, so queued commands are not starved.
    #[serde(with = "humantime_serde")]
    pub wait_quantum: Duration,

    /// Two polls due within this window are treated as simultaneous.
    #[serde(with = "humantime_serde")]
    pub fairness_window: Duration,

    /// Offset added per registration to spread initial due times.
    #[serde(with = "humantime_serde")]
    pub stagger_step: Duration,

    /// Poll period for instruments that do not set one.
    #[serde(with = "humantime_serde")]
    pub default_period: Duration,

    /// Capacity of each port's command queue.
    pub command_queue_capacity: usize,

    /// Capacity of each event subscriber channel.
    pub event_capacity: usize,

    /// Maximum time to wait for a port worker to exit.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_millis(100),
            wait_quantum: Duration::from_millis(5),
            fairness_window: Duration::from_millis(5),
            stagger_step: Duration::from_millis(20),
            default_period: Duration::from_millis(200),
            command_queue_capacity: 64,
            event_capacity: 1024,
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// Transport response timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Response timeout applied to polling traffic.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// The transport library's own conservative default.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Timeout for opening the master connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(150),
            default_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per transport operation, including the first.
    pub max_attempts: u32,

    /// Backoff before the second attempt.
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Backoff increase per further attempt.
    #[serde(with = "humantime_serde")]
    pub backoff_step: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_step: Duration::from_millis(20),
        }
    }
}

/// Connection health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive errors that disable an address.
    pub disable_threshold: u32,

    /// How long a disabled address is skipped.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            disable_threshold: 10,
            cooldown: Duration::from_secs(10),
        }
    }
}

/// Write command verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Readback attempts after an ambiguous write.
    pub verify_attempts: u32,

    /// Delay between readback attempts.
    #[serde(with = "humantime_serde")]
    pub verify_interval: Duration,

    /// Response timeout for the fluid index write itself.
    #[serde(with = "humantime_serde")]
    pub fluid_write_timeout: Duration,

    /// Interval between fluid switch readbacks.
    #[serde(with = "humantime_serde")]
    pub fluid_poll_interval: Duration,

    /// Give up on a fluid switch after this long.
    #[serde(with = "humantime_serde")]
    pub fluid_deadline: Duration,

    /// Characters the instrument stores for a user tag.
    pub usertag_max_len: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            verify_attempts: 3,
            verify_interval: Duration::from_millis(50),
            fluid_write_timeout: Duration::from_secs(3),
            fluid_poll_interval: Duration::from_millis(150),
            fluid_deadline: Duration::from_secs(5),
            usertag_max_len: 16,
        }
    }
}

/// Diagnostics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Size of the per-address interval ring buffer.
    pub histogram_size: usize,

    /// Interval between status log lines.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,

    /// Write Prometheus text exposition here on every status tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub textfile: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_size: 256,
            status_interval: Duration::from_secs(30),
            textfile: None,
        }
    }
}

/// One physical serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Device name, e.g. `/dev/ttyUSB0`.
    pub name: PortName,

    /// Line speed.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Instruments polled on this port.
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

fn default_baud_rate() -> u32 {
    38_400
}

impl PortConfig {
    /// Create a port with no instruments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: PortName::new(name),
            baud_rate: default_baud_rate(),
            instruments: Vec::new(),
        }
    }
}

/// One instrument polled on a port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Bus address.
    pub address: Address,

    /// Poll period; the scheduler default applies when absent.
    #[serde(
        default,
        with = "humantime_serde_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub period: Option<Duration>,
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Poll period for an instrument, falling back to the scheduler default.
    #[must_use]
    pub fn period_for(&self, instrument: &InstrumentConfig) -> Duration {
        instrument.period.unwrap_or(self.scheduler.default_period)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        for (name, value) in [
            ("scheduler.idle_sleep", s.idle_sleep),
            ("scheduler.wait_quantum", s.wait_quantum),
            ("scheduler.default_period", s.default_period),
            ("transport.poll_timeout", self.transport.poll_timeout),
            ("commands.fluid_poll_interval", self.commands.fluid_poll_interval),
            ("commands.fluid_deadline", self.commands.fluid_deadline),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if s.command_queue_capacity == 0 || s.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be non-zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.health.disable_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.disable_threshold must be at least 1".into(),
            ));
        }

        let mut port_names = HashSet::new();
        for port in &self.ports {
            if port.name.as_str().is_empty() {
                return Err(ConfigError::Invalid("port name must not be empty".into()));
            }
            if !port_names.insert(port.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate port {}",
                    port.name
                )));
            }
            let mut addresses = HashSet::new();
            for instrument in &port.instruments {
                if !addresses.insert(instrument.address) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate address {} on port {}",
                        instrument.address, port.name
                    )));
                }
                if instrument.period.is_some_and(|p| p.is_zero()) {
                    return Err(ConfigError::Invalid(format!(
                        "zero poll period for address {} on port {}",
                        instrument.address, port.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Same as [`humantime_serde`] for optional durations.
mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
