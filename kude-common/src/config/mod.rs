//! Operator configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `KUDE_*` environment variables. Command-line flags are applied last by the
//! binary.

pub mod env;

pub use env::{EnvError, EnvParser};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::logging::LogFormat;

pub const DEFAULT_MIRROR_ROOT: &str = "/data";
pub const DEFAULT_APPLY_COMMAND: &str = "kubectl";
pub const DEFAULT_GIT_BINARY: &str = "git";
pub const DEFAULT_GIT_TIMEOUT: &str = "5m";
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u32 = 4;
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment configuration: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Process-wide settings for the operator daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Directory holding one mirror per TrackedRepository uid.
    pub mirror_root: PathBuf,
    /// Program invoked as `<apply_command> apply ... -f <files>`.
    pub apply_command: String,
    pub git_binary: String,
    /// Upper bound for a single git invocation.
    pub git_timeout: String,
    pub max_concurrent_reconciles: u32,
    /// Bind address of the object API.
    pub listen: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_dir: Option<PathBuf>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            mirror_root: PathBuf::from(DEFAULT_MIRROR_ROOT),
            apply_command: DEFAULT_APPLY_COMMAND.to_string(),
            git_binary: DEFAULT_GIT_BINARY.to_string(),
            git_timeout: DEFAULT_GIT_TIMEOUT.to_string(),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            listen: DEFAULT_LISTEN.to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            log_dir: None,
        }
    }
}

impl OperatorConfig {
    /// Loads defaults, the optional file and environment overrides, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        self.mirror_root = parser.get_path("MIRROR_ROOT", self.mirror_root.clone());
        self.apply_command = parser.get_string("APPLY_COMMAND", &self.apply_command);
        self.git_binary = parser.get_string("GIT_BINARY", &self.git_binary);
        self.git_timeout = parser.get_duration("GIT_TIMEOUT", &self.git_timeout);
        self.max_concurrent_reconciles = parser.get_u32_range(
            "MAX_CONCURRENT_RECONCILES",
            self.max_concurrent_reconciles,
            1,
            256,
        );
        self.listen = parser.get_string("LISTEN", &self.listen);
        self.log_level = parser.get_log_level("LOG_LEVEL", &self.log_level);
        self.log_format = parser.get_log_format("LOG_FORMAT", self.log_format);
        self.log_dir = parser.get_optional_path("LOG_DIR", self.log_dir.take());
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.apply_command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "apply_command",
                reason: "must not be empty".to_string(),
            });
        }
        if self.git_binary.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "git_binary",
                reason: "must not be empty".to_string(),
            });
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_reconciles",
                reason: "must be at least 1".to_string(),
            });
        }
        self.git_timeout()?;
        self.listen_addr()?;
        Ok(())
    }

    pub fn git_timeout(&self) -> Result<Duration, ConfigError> {
        match humantime::parse_duration(self.git_timeout.trim()) {
            Ok(d) if !d.is_zero() => Ok(d),
            Ok(_) => Err(ConfigError::Invalid {
                field: "git_timeout",
                reason: "must be greater than zero".to_string(),
            }),
            Err(e) => Err(ConfigError::Invalid {
                field: "git_timeout",
                reason: e.to_string(),
            }),
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            field: "listen",
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
