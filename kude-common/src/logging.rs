//! Structured logging bootstrap.
//!
//! Console output goes to stderr as text or JSON. When a log directory is
//! configured a daily-rolling JSON file is written as well; the returned
//! [`LoggingGuards`] must be held for the life of the process so buffered
//! lines are flushed on exit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tfmt, prelude::*};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unknown log format '{0}' (expected text or json)")]
    UnknownFormat(String),

    #[error("invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("failed to prepare log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("global subscriber already installed: {0}")]
    Init(#[from] TryInitError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl LogConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::Text,
            log_dir: None,
            file_prefix: "kuded.log".to_string(),
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }

    /// Resolves the effective filter string.
    pub fn filter_directive(&self) -> String {
        match std::env::var("RUST_LOG") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => self.level.clone(),
        }
    }
}

/// Keeps non-blocking writers alive.
#[derive(Default)]
pub struct LoggingGuards {
    _workers: Vec<WorkerGuard>,
}

impl LoggingGuards {
    pub fn file_outputs(&self) -> usize {
        self._workers.len()
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let directive = config.filter_directive();
    let filter = EnvFilter::try_new(&directive).map_err(|e| LoggingError::Filter {
        filter: directive.clone(),
        reason: e.to_string(),
    })?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut workers = Vec::new();

    match config.format {
        LogFormat::Text => layers.push(
            tfmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed(),
        ),
        LogFormat::Json => layers.push(
            tfmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .boxed(),
        ),
    }

    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir).map_err(|source| LoggingError::LogDir {
            path: dir.clone(),
            source,
        })?;
        let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        workers.push(guard);
        layers.push(
            tfmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    Ok(LoggingGuards { _workers: workers })
}
