//! Logging infrastructure for tuber
//!
//! Provides unified logging setup using the tracing ecosystem.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{paths, Result, TuberError};

/// Environment variable overriding the log filter
pub const LOG_ENV: &str = "TUBER_LOG";

/// Log output destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Terminal only
    Stderr,
    /// `tuber.log` under the log dir
    File,
    /// Terminal and log file
    Both,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub output: LogOutput,
    /// `EnvFilter` directives, e.g. "info" or "tuber_server=debug,tokio=warn"
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: "info".into(),
        }
    }
}

impl LogConfig {
    /// Stderr only, quiet unless `TUBER_LOG` says otherwise
    pub fn client() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: std::env::var(LOG_ENV).unwrap_or_else(|_| "warn".into()),
        }
    }

    /// Stderr plus the log file
    pub fn server() -> Self {
        Self {
            output: LogOutput::Both,
            filter: std::env::var(LOG_ENV).unwrap_or_else(|_| "info".into()),
        }
    }

    /// Replace the filter unless `TUBER_LOG` is set
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        if std::env::var(LOG_ENV).is_err() {
            self.filter = filter.into();
        }
        self
    }

    fn to_stderr(&self) -> bool {
        matches!(self.output, LogOutput::Stderr | LogOutput::Both)
    }

    fn to_file(&self) -> bool {
        matches!(self.output, LogOutput::File | LogOutput::Both)
    }
}

/// Initialize logging with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(LogConfig::default())
}

/// Install the global subscriber; fails if one is already set
pub fn init_logging_with_config(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| TuberError::config(format!("Invalid log filter: {}", e)))?;

    let stderr_layer = config
        .to_stderr()
        .then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));
    let file_layer = if config.to_file() {
        let file = open_log_file()?;
        Some(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TuberError::internal(format!("Failed to init logging: {}", e)))?;

    tracing::debug!(filter = %config.filter, output = ?config.output, "Logging initialized");
    Ok(())
}

fn log_file_path() -> PathBuf {
    paths::log_dir().join("tuber.log")
}

fn open_log_file() -> Result<File> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir).map_err(|e| TuberError::FileWrite {
        path: log_dir.clone(),
        source: e,
    })?;

    let log_path = log_file_path();
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| TuberError::FileWrite {
            path: log_path,
            source: e,
        })
}
