//! # Configuration Management
//!
//! Centralized configuration for the interception core.
//!
//! The configuration has three parts: the build-specific opcode map, the
//! latency mitigation tunables, and logging. Opcode values change with every
//! game build and are always supplied externally, never hard-coded.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Live Updates
//! A [`ConfigProvider`] hands out immutable snapshots; handlers take one per
//! dispatch so an update never tears a message's processing in half.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::Level;

/// Max allowed bundle size on the wire (16 MB)
pub const MAX_BUNDLE_SIZE: usize = 16 * 1024 * 1024;

/// Default extra delay added to every server-confirmed animation lock.
///
/// Server responses usually take between 50ms and 100ms at sub-millisecond
/// latency, so 75ms is the average. Do not lower it.
pub const DEFAULT_EXTRA_DELAY: Duration = Duration::from_millis(75);

/// Minimum lock remaining after a server-originated action (auto-attack).
pub const DEFAULT_AUTO_ATTACK_DELAY: Duration = Duration::from_millis(100);

/// Upper bound of the auto-adjusted extra delay on unstable connections.
pub const DEFAULT_MAXIMUM_EXTRA_DELAY: Duration = Duration::from_millis(150);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct Config {
    /// Build-specific opcode map
    #[serde(default)]
    pub opcodes: OpcodeConfig,

    /// Latency mitigation tunables
    #[serde(default)]
    pub mitigation: MitigationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("LATENCY_MITIGATOR_ENABLED") {
            if let Ok(val) = value.parse::<bool>() {
                config.mitigation.enabled = val;
            }
        }

        if let Ok(value) = std::env::var("LATENCY_MITIGATOR_EXTRA_DELAY_MS") {
            if let Ok(val) = value.parse::<u64>() {
                config.mitigation.extra_delay = Duration::from_millis(val);
            }
        }

        if let Ok(value) = std::env::var("LATENCY_MITIGATOR_MODE") {
            if let Ok(mode) = value.parse::<MitigationMode>() {
                config.mitigation.mode = mode;
            }
        }

        if let Ok(value) = std::env::var("LATENCY_MITIGATOR_BASE_LATENCY_PENALTY_MS") {
            if let Ok(val) = value.parse::<u64>() {
                config.mitigation.base_latency_penalty = Duration::from_millis(val);
            }
        }

        if let Ok(value) = std::env::var("LATENCY_MITIGATOR_LOG_LEVEL") {
            if let Ok(level) = value.parse::<Level>() {
                config.logging.log_level = level;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.opcodes.validate());
        errors.extend(self.mitigation.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Opcode map for one game build.
///
/// A subtype of `0` (or an empty list) means the opcode is unknown for the
/// current build; messages using it are simply not recognised.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OpcodeConfig {
    /// Payload category carrying the game's own opcode-routed messages
    pub ipc_type_interested: u16,

    /// Payload category reserved for timing hints injected by the server side
    pub ipc_type_custom: u16,

    /// Custom subtype of the original-wait-time hint
    pub custom_original_wait_time: u16,

    /// Client-to-server action request subtypes
    pub c2s_action_request: Vec<u16>,

    /// Server-to-client action effect subtypes (one per target-count variant)
    pub s2c_action_effects: Vec<u16>,

    pub s2c_actor_control: u16,
    pub s2c_actor_control_self: u16,
    pub s2c_actor_cast: u16,

    /// Actor control category for a cancelled cast
    pub actor_control_cancel_cast: u16,

    /// Actor control self category for a cooldown notice
    pub actor_control_self_cooldown: u16,

    /// Actor control self category for a rejected action
    pub actor_control_self_action_rejected: u16,
}

impl Default for OpcodeConfig {
    fn default() -> Self {
        Self {
            ipc_type_interested: 0x0014,
            ipc_type_custom: 0xe852,
            custom_original_wait_time: 0x0000,
            c2s_action_request: Vec::new(),
            s2c_action_effects: Vec::new(),
            s2c_actor_control: 0,
            s2c_actor_control_self: 0,
            s2c_actor_cast: 0,
            actor_control_cancel_cast: 0x000f,
            actor_control_self_cooldown: 0x0011,
            actor_control_self_action_rejected: 0x02bc,
        }
    }
}

impl OpcodeConfig {
    /// Validate opcode configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ipc_type_interested == self.ipc_type_custom {
            errors.push(format!(
                "Interested and custom IPC types must differ (both {:#06x})",
                self.ipc_type_interested
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for &subtype in self
            .s2c_action_effects
            .iter()
            .chain([
                &self.s2c_actor_control,
                &self.s2c_actor_control_self,
                &self.s2c_actor_cast,
            ])
            .filter(|subtype| **subtype != 0)
        {
            if !seen.insert(subtype) {
                errors.push(format!(
                    "Server opcode {subtype:#06x} is mapped more than once"
                ));
            }
        }

        if self.c2s_action_request.iter().any(|subtype| *subtype == 0) {
            errors.push("Action request opcode cannot be 0".to_string());
        }

        errors
    }

    /// Whether the opcodes the mitigator depends on are all known.
    pub fn is_complete(&self) -> bool {
        !self.c2s_action_request.is_empty()
            && !self.s2c_action_effects.is_empty()
            && self.s2c_actor_control != 0
            && self.s2c_actor_control_self != 0
            && self.s2c_actor_cast != 0
    }
}

/// Latency mitigation tunables.
///
/// The delays are empirically tuned rather than derived from the protocol.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MitigationConfig {
    /// Whether the mitigator is attached to new connections
    pub enabled: bool,

    /// Constant extra delay used when no latency-based mode applies
    #[serde(with = "duration_serde")]
    pub extra_delay: Duration,

    /// How the next lock end is derived
    pub mode: MitigationMode,

    /// Constant added to the observed round trip before the latency is subtracted
    #[serde(with = "duration_serde")]
    pub base_latency_penalty: Duration,

    /// Minimum lock remaining after a server-originated action
    #[serde(with = "duration_serde")]
    pub auto_attack_delay: Duration,

    /// Upper bound of the auto-adjusted extra delay
    #[serde(with = "duration_serde")]
    pub maximum_extra_delay: Duration,

    /// Push the lock forward when the client requests before the lock ended
    pub use_early_penalty: bool,

    /// Compute and log corrections without rewriting any message
    pub preview_mode: bool,

    /// Log every request and correction
    pub verbose_logging: bool,

    /// Samples kept by the per-connection round-trip tracker
    pub rtt_track_count: usize,

    /// Samples kept by the per-connection server-response-delay tracker
    pub latency_track_count: usize,

    /// Keep-alive requests older than this are discarded when matching responses
    #[serde(with = "duration_serde")]
    pub keepalive_max_wait: Duration,
}

/// Strategy for the lock end written into a confirmed action effect.
///
/// Every mode falls back to [`MitigationMode::SimulateRtt`] while no latency
/// sample exists for the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationMode {
    /// Chain onto the previous lock with the constant extra delay
    #[default]
    SimulateRtt,
    /// Derive the extra delay from round-trip and latency statistics
    SimulateNormalizedRttAndLatency,
    /// Start the lock on arrival and take the measured latency off it
    SubtractLatency,
}

impl MitigationMode {
    pub fn name(self) -> &'static str {
        match self {
            MitigationMode::SimulateRtt => "simulate_rtt",
            MitigationMode::SimulateNormalizedRttAndLatency => "simulate_normalized_rtt_and_latency",
            MitigationMode::SubtractLatency => "subtract_latency",
        }
    }
}

impl FromStr for MitigationMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simulate_rtt" => Ok(MitigationMode::SimulateRtt),
            "simulate_normalized_rtt_and_latency" => Ok(MitigationMode::SimulateNormalizedRttAndLatency),
            "subtract_latency" => Ok(MitigationMode::SubtractLatency),
            other => Err(ProtocolError::ConfigError(format!(
                "Unknown mitigation mode: {other}"
            ))),
        }
    }
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_delay: DEFAULT_EXTRA_DELAY,
            mode: MitigationMode::default(),
            base_latency_penalty: Duration::ZERO,
            auto_attack_delay: DEFAULT_AUTO_ATTACK_DELAY,
            maximum_extra_delay: DEFAULT_MAXIMUM_EXTRA_DELAY,
            use_early_penalty: false,
            preview_mode: false,
            verbose_logging: false,
            rtt_track_count: 10,
            latency_track_count: 10,
            keepalive_max_wait: Duration::from_secs(5),
        }
    }
}

impl MitigationConfig {
    /// Validate mitigation configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.extra_delay > Duration::from_secs(1) {
            errors.push("Extra delay too long (maximum: 1s)".to_string());
        }

        if self.maximum_extra_delay < self.extra_delay
            && self.mode == MitigationMode::SimulateNormalizedRttAndLatency
        {
            errors.push(
                "Maximum extra delay cannot be shorter than the base extra delay".to_string(),
            );
        }

        if self.base_latency_penalty > Duration::from_secs(1) {
            errors.push("Base latency penalty too long (maximum: 1s)".to_string());
        }

        if self.auto_attack_delay > Duration::from_secs(1) {
            errors.push("Auto-attack delay too long (maximum: 1s)".to_string());
        }

        if self.rtt_track_count == 0 {
            errors.push("Round-trip track count must be greater than 0".to_string());
        } else if self.rtt_track_count > 10_000 {
            errors.push(format!(
                "Round-trip track count too large: {} (maximum: 10,000)",
                self.rtt_track_count
            ));
        }

        if self.latency_track_count == 0 {
            errors.push("Latency track count must be greater than 0".to_string());
        } else if self.latency_track_count > 10_000 {
            errors.push(format!(
                "Latency track count too large: {} (maximum: 10,000)",
                self.latency_track_count
            ));
        }

        if self.keepalive_max_wait.as_millis() < 100 {
            errors.push("Keep-alive wait too short (minimum: 100ms)".to_string());
        }

        errors
    }

    pub fn extra_delay_us(&self) -> i64 {
        duration_us(self.extra_delay)
    }

    pub fn base_latency_penalty_us(&self) -> i64 {
        duration_us(self.base_latency_penalty)
    }

    pub fn auto_attack_delay_us(&self) -> i64 {
        duration_us(self.auto_attack_delay)
    }

    pub fn maximum_extra_delay_us(&self) -> i64 {
        duration_us(self.maximum_extra_delay)
    }

    pub fn keepalive_max_wait_us(&self) -> i64 {
        duration_us(self.keepalive_max_wait)
    }
}

fn duration_us(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("latency-mitigator"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Live, thread-safe configuration handle.
///
/// Readers get an `Arc` snapshot; writers replace the whole configuration.
#[derive(Debug)]
pub struct ConfigProvider {
    current: RwLock<Arc<Config>>,
}

impl ConfigProvider {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Snapshot of the current configuration.
    pub fn current(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the configuration with a modified copy.
    pub fn update<F>(&self, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self
            .current
            .write()
            .map_err(|_| ProtocolError::LockPoisoned)?;
        let mut next = Config::clone(&guard);
        mutator(&mut next);
        *guard = Arc::new(next);
        Ok(())
    }
}

impl Default for ConfigProvider {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
