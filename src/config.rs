//! # Host Configuration
//!
//! One TOML file describes the printers the host may drive and the protocol
//! tuning shared by all of them.
//!
//! ```toml
//! [[printer]]
//! name = "ender"
//! connection = "marlin"
//! port = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [protocol]
//! buffer_depth = 4
//! drain_timeout_ms = 6000
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Every key except `[[printer]].name` has a default.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default, rename = "printer")]
    pub printers: Vec<PrinterConfig>,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Marlin,
    Mock,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    pub name: String,
    #[serde(default)]
    pub connection: ConnectionType,
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl PrinterConfig {
    pub fn mock(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: ConnectionType::Mock,
            port: String::new(),
            baud: default_baud(),
        }
    }
}

/// Protocol tuning for one engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Maximum number of streamed lines awaiting acknowledgment.
    #[serde(default = "default_buffer_depth")]
    pub buffer_depth: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Upper bound on the post-print wait for outstanding acknowledgments.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_ack_prefix")]
    pub ack_prefix: String,
    #[serde(default = "default_handshake_command")]
    pub handshake_command: String,
    #[serde(default = "default_sd_abort_command")]
    pub sd_abort_command: String,
    /// Release the serial link once a streamed print ends.
    #[serde(default = "default_true")]
    pub close_after_print: bool,
    #[serde(default = "default_true")]
    pub report_progress: bool,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            buffer_depth: default_buffer_depth(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            history_capacity: default_history_capacity(),
            ack_prefix: default_ack_prefix(),
            handshake_command: default_handshake_command(),
            sd_abort_command: default_sd_abort_command(),
            close_after_print: default_true(),
            report_progress: default_true(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_depth == 0 {
            return Err("protocol.buffer_depth must be > 0".to_string());
        }
        if self.history_capacity == 0 {
            return Err("protocol.history_capacity must be > 0".to_string());
        }
        if self.ack_prefix.trim().is_empty() {
            return Err("protocol.ack_prefix cannot be empty".to_string());
        }
        if self.handshake_command.trim().is_empty() {
            return Err("protocol.handshake_command cannot be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol.validate().map_err(ConfigError::Invalid)?;
        let mut seen = HashSet::new();
        for printer in &self.printers {
            if printer.name.trim().is_empty() {
                return Err(ConfigError::Invalid("Printer name cannot be empty".to_string()));
            }
            if !seen.insert(printer.name.as_str()) {
                return Err(ConfigError::Invalid(format!("Duplicate printer name '{}'", printer.name)));
            }
            if printer.connection == ConnectionType::Marlin && printer.port.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Printer '{}' uses a serial connection but has no port",
                    printer.name
                )));
            }
        }
        Ok(())
    }

    pub fn printer(&self, name: &str) -> Option<&PrinterConfig> {
        self.printers.iter().find(|p| p.name == name)
    }
}

fn default_baud() -> u32 { 250000 }
fn default_buffer_depth() -> usize { 4 }
fn default_handshake_timeout_ms() -> u64 { 50_000 }
fn default_drain_timeout_ms() -> u64 { 6_000 }
fn default_history_capacity() -> usize { 50 }
fn default_ack_prefix() -> String { "ok".to_string() }
fn default_handshake_command() -> String { "M105".to_string() }
fn default_sd_abort_command() -> String { "M999".to_string() }
fn default_true() -> bool { true }
fn default_event_buffer() -> usize { 256 }
fn default_log_level() -> String { "info".to_string() }

pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match parse_config(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to load config '{}': {}", path, e);
                Err(e)
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert!(config.printers.is_empty());
        assert_eq!(config.protocol.buffer_depth, 4);
        assert_eq!(config.protocol.handshake_timeout(), Duration::from_secs(50));
        assert_eq!(config.protocol.drain_timeout(), Duration::from_secs(6));
        assert_eq!(config.protocol.history_capacity, 50);
        assert_eq!(config.protocol.sd_abort_command, "M999");
        assert!(config.protocol.close_after_print);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_printer_tables() {
        let config = parse_config(
            r#"
            [[printer]]
            name = "ender"
            port = "/dev/ttyUSB0"
            baud = 115200

            [[printer]]
            name = "bench"
            connection = "mock"

            [protocol]
            buffer_depth = 8
            close_after_print = false
            "#,
        )
        .unwrap();
        assert_eq!(config.printers.len(), 2);
        let ender = config.printer("ender").unwrap();
        assert_eq!(ender.connection, ConnectionType::Marlin);
        assert_eq!(ender.baud, 115200);
        assert_eq!(config.printer("bench").unwrap().connection, ConnectionType::Mock);
        assert_eq!(config.protocol.buffer_depth, 8);
        assert!(!config.protocol.close_after_print);
    }

    #[test]
    fn test_rejects_zero_depth() {
        let err = parse_config("[protocol]\nbuffer_depth = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let err = parse_config(
            "[[printer]]\nname = \"a\"\nconnection = \"mock\"\n[[printer]]\nname = \"a\"\nconnection = \"mock\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_marlin_requires_port() {
        let err = parse_config("[[printer]]\nname = \"a\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(parse_config("[protocol"), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(load_config("/nonexistent/printer.toml"), Err(ConfigError::Io(_))));
    }
}
