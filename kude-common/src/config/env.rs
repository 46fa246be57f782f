//! Environment variable overrides.
//!
//! Every getter takes the value already in effect (default or file) and
//! returns it unchanged when the variable is unset. Malformed values are
//! collected instead of failing fast so all of them can be reported at once.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::logging::LogFormat;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Parser for `KUDE_*` variables.
    pub fn new() -> Self {
        Self::with_prefix("KUDE_")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn lookup(&self, name: &str) -> (String, Option<String>) {
        let var_name = self.var_name(name);
        let value = env::var(&var_name).ok();
        (var_name, value)
    }

    pub fn get_string(&mut self, name: &str, current: &str) -> String {
        match self.lookup(name) {
            (_, Some(value)) if !value.trim().is_empty() => value,
            _ => current.to_string(),
        }
    }

    pub fn get_path(&mut self, name: &str, current: PathBuf) -> PathBuf {
        match self.lookup(name) {
            (_, Some(value)) if !value.trim().is_empty() => PathBuf::from(value),
            _ => current,
        }
    }

    /// An empty value clears the option.
    pub fn get_optional_path(&mut self, name: &str, current: Option<PathBuf>) -> Option<PathBuf> {
        match self.lookup(name) {
            (_, Some(value)) if value.is_empty() => None,
            (_, Some(value)) => Some(PathBuf::from(value)),
            (_, None) => current,
        }
    }

    pub fn get_u32_range(&mut self, name: &str, current: u32, min: u32, max: u32) -> u32 {
        let (var_name, Some(value)) = self.lookup(name) else {
            return current;
        };
        match value.trim().parse::<u32>() {
            Ok(n) if (min..=max).contains(&n) => n,
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var: var_name,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                current
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "unsigned 32-bit integer".to_string(),
                    value,
                });
                current
            }
        }
    }

    /// Durations use humantime syntax (`30s`, `5m`, `1h30m`).
    pub fn get_duration(&mut self, name: &str, current: &str) -> String {
        let (var_name, Some(value)) = self.lookup(name) else {
            return current.to_string();
        };
        match humantime::parse_duration(value.trim()) {
            Ok(d) if d > Duration::ZERO => value.trim().to_string(),
            _ => {
                self.errors.push(EnvError::InvalidDuration {
                    var: var_name,
                    value,
                });
                current.to_string()
            }
        }
    }

    pub fn get_log_level(&mut self, name: &str, current: &str) -> String {
        let (var_name, Some(value)) = self.lookup(name) else {
            return current.to_string();
        };
        let lower = value.to_lowercase();
        match lower.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => lower,
            _ => {
                self.errors.push(EnvError::InvalidLogLevel {
                    var: var_name,
                    value,
                });
                current.to_string()
            }
        }
    }

    pub fn get_log_format(&mut self, name: &str, current: LogFormat) -> LogFormat {
        let (var_name, Some(value)) = self.lookup(name) else {
            return current;
        };
        match value.parse::<LogFormat>() {
            Ok(format) => format,
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "log format (text/json)".to_string(),
                    value,
                });
                current
            }
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
