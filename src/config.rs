//! Configuration system using Figment
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `RUSTPSU_` (nested keys split on `__`)
//! 2. TOML configuration file (default: `config/rust_psu.toml`, optional)
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```no_run
//! use rust_psu::config::PsuConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PsuConfig::load()?;
//!     println!("Port: {:?} @ {} baud", config.serial.port, config.serial.baud_rate);
//!     println!("Poll interval: {} ms", config.polling.interval_ms);
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! ```text
//! RUSTPSU_SERIAL__PORT=/dev/ttyACM0
//! RUSTPSU_POLLING__INTERVAL_MS=500
//! RUSTPSU_LOGGING__LEVEL=debug
//! ```

use crate::engine::EngineSettings;
use crate::session::SessionSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/rust_psu.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(e))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PsuConfig {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port to open (e.g., "/dev/ttyACM0", "COM3"); none means ask on the command line
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Background polling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
}

/// Command engine timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_ms: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Extra wait for a query reply that has not started by the end of its settle time; 0 disables
    #[serde(default = "default_reply_grace")]
    pub reply_grace_ms: u64,
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_poll_interval() -> u64 {
    200
}

fn default_gate_timeout() -> u64 {
    2000
}

fn default_write_timeout() -> u64 {
    500
}

fn default_shutdown_timeout() -> u64 {
    3000
}

fn default_reply_grace() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gate_timeout_ms: default_gate_timeout(),
            write_timeout_ms: default_write_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            reply_grace_ms: default_reply_grace(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl PsuConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` (if it exists) and the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: PsuConfig = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(PsuConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RUSTPSU_").split("__"))
    }

    /// Reject values that would stall or spin the driver.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "serial.baud_rate must be greater than zero".to_string(),
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "polling.interval_ms must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("engine.gate_timeout_ms", self.engine.gate_timeout_ms),
            ("engine.write_timeout_ms", self.engine.write_timeout_ms),
            ("engine.shutdown_timeout_ms", self.engine.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            poll_interval: Duration::from_millis(self.polling.interval_ms),
            shutdown_timeout: Duration::from_millis(self.engine.shutdown_timeout_ms),
            engine: EngineSettings {
                gate_timeout: Duration::from_millis(self.engine.gate_timeout_ms),
                write_timeout: Duration::from_millis(self.engine.write_timeout_ms),
                reply_grace: Duration::from_millis(self.engine.reply_grace_ms),
            },
        }
    }
}
