//! Configuration module for the Marstek-MQTT bridge
//!
//! Loads configuration from a TOML file with three tables:
//! - [default] - General settings (log_level)
//! - [marstek] - Device address, poll cadence and mode settings
//! - [mqtt] - MQTT broker settings

use chrono::NaiveTime;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::marstek::{ManualSchedule, PassiveSettings, DEFAULT_PORT};

/// Log level for the application
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing LevelFilter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
    pub marstek: MarstekConfig,
    pub mqtt: MqttConfig,
}

/// General application settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DefaultConfig {
    /// Log level: TRACE, DEBUG, INFO, WARN, ERROR
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Marstek device configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MarstekConfig {
    /// Device IP address (required)
    pub host: IpAddr,

    /// Device UDP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Fixed local UDP port; random when unset
    #[serde(default)]
    pub local_port: Option<u16>,

    /// Poll interval (e.g., "30s", "1m")
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Reply timeout per query
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Reply timeout per mode command attempt
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Consecutive failed polls before the device is reported unavailable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Mode command retries on timeout
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,

    /// Query ES.GetStatus for energy counters and PV power
    #[serde(default = "default_true")]
    pub query_energy_status: bool,

    /// Schedule sent when switching to Manual mode
    #[serde(default)]
    pub manual: ManualSchedule,

    /// Setpoint sent when switching to Passive mode
    #[serde(default)]
    pub passive: PassiveSettings,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_command_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

/// MQTT broker configuration
#[derive(Deserialize, Clone)]
pub struct MqttConfig {
    /// MQTT root topic (e.g., "marstek")
    #[serde(default = "default_mqtt_root")]
    pub root: String,

    /// MQTT broker hostname
    pub host: String,

    /// MQTT broker port (default 1883)
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// MQTT username (empty for anonymous)
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

fn default_mqtt_root() -> String {
    "marstek".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .field("root", &self.root)
            .finish()
    }
}

fn validate_time(field: &str, value: &str) -> Result<(), ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map(|_| ())
        .map_err(|_| {
            ConfigError::ValidationError(format!(
                "{} must be HH:MM, got {:?}",
                field, value
            ))
        })
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Arguments
    /// * `path` - Path to the config.toml file
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(
                path.to_string_lossy().to_string(),
            ));
        }

        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        contents.parse()
    }

    /// Validate configuration logic (semantic validation beyond type checks)
    pub fn validate(&self) -> Result<(), ConfigError> {
        let marstek = &self.marstek;

        if marstek.port == 0 {
            return Err(ConfigError::ValidationError(
                "marstek.port must not be 0".to_string(),
            ));
        }

        // A poll must be able to time out before the next tick is due
        if marstek.interval <= marstek.timeout {
            return Err(ConfigError::ValidationError(format!(
                "marstek.interval ({:?}) must be longer than marstek.timeout ({:?})",
                marstek.interval, marstek.timeout
            )));
        }

        if marstek.timeout.is_zero() || marstek.command_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "marstek timeouts must not be zero".to_string(),
            ));
        }

        if marstek.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "marstek.failure_threshold must be at least 1".to_string(),
            ));
        }

        validate_time("marstek.manual.start_time", &marstek.manual.start_time)?;
        validate_time("marstek.manual.end_time", &marstek.manual.end_time)?;

        if self.mqtt.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "mqtt.host must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [marstek]
        host = "192.168.1.50"

        [mqtt]
        host = "localhost"
    "#;

    #[test]
    fn test_default_values() {
        let default = DefaultConfig::default();
        assert_eq!(default.log_level, LogLevel::Info);

        let config: Config = MINIMAL.parse().unwrap();
        assert_eq!(config.marstek.port, 30000);
        assert_eq!(config.marstek.local_port, None);
        assert_eq!(config.marstek.interval, Duration::from_secs(30));
        assert_eq!(config.marstek.timeout, Duration::from_secs(3));
        assert_eq!(config.marstek.command_timeout, Duration::from_secs(3));
        assert_eq!(config.marstek.failure_threshold, 3);
        assert_eq!(config.marstek.command_retries, 2);
        assert!(config.marstek.query_energy_status);
        assert_eq!(config.marstek.manual, ManualSchedule::default());
        assert_eq!(config.marstek.passive.cd_time, 300);
        assert_eq!(config.mqtt.root, "marstek");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.username, "");
    }

    #[test]
    fn test_full_config() {
        let toml_str = r#"
            [default]
            log_level = "DEBUG"

            [marstek]
            host = "fd00::12"
            port = 30001
            local_port = 30000
            interval = "1m"
            timeout = "2s 500ms"
            failure_threshold = 5
            query_energy_status = false

            [marstek.manual]
            start_time = "22:00"
            end_time = "06:00"
            power = 800

            [marstek.passive]
            power = -1200
            cd_time = 600

            [mqtt]
            root = "home/battery"
            host = "broker"
            username = "bridge"
            password = "secret"
        "#;

        let config: Config = toml_str.parse().unwrap();
        assert_eq!(config.default.log_level, LogLevel::Debug);
        assert!(config.marstek.host.is_ipv6());
        assert_eq!(config.marstek.local_port, Some(30000));
        assert_eq!(config.marstek.interval, Duration::from_secs(60));
        assert_eq!(config.marstek.timeout, Duration::from_millis(2500));
        assert_eq!(config.marstek.failure_threshold, 5);
        assert!(!config.marstek.query_energy_status);
        assert_eq!(config.marstek.manual.start_time, "22:00");
        assert_eq!(config.marstek.manual.power, 800);
        assert_eq!(config.marstek.manual.week_set, 127);
        assert_eq!(config.marstek.passive.power, -1200);
        assert_eq!(config.mqtt.root, "home/battery");
    }

    #[test]
    fn test_invalid_host_is_parse_error() {
        let result: Result<Config, _> = r#"
            [marstek]
            host = "venus.local"
            [mqtt]
            host = "localhost"
        "#
        .parse();
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            ("interval = \"3s\"", "interval"),
            ("timeout = \"40s\"", "interval"),
            ("failure_threshold = 0", "failure_threshold"),
            ("port = 0", "port"),
            ("manual = { start_time = \"25:00\" }", "start_time"),
            ("manual = { end_time = \"8.30\" }", "end_time"),
        ];

        for (line, needle) in cases {
            let toml_str = format!(
                "[marstek]\nhost = \"10.0.0.2\"\n{}\n[mqtt]\nhost = \"localhost\"\n",
                line
            );
            match toml_str.parse::<Config>() {
                Err(ConfigError::ValidationError(msg)) => {
                    assert!(msg.contains(needle), "{}: {}", line, msg)
                }
                other => panic!("{}: expected validation error, got {:?}", line, other),
            }
        }
    }

    #[test]
    fn test_empty_mqtt_host() {
        let result: Result<Config, _> = r#"
            [marstek]
            host = "10.0.0.2"
            [mqtt]
            host = ""
        "#
        .parse();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.marstek.host.to_string(), "192.168.1.50");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
