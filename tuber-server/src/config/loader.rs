//! Configuration loader

use std::path::Path;

use tuber_utils::{config_file, Result, TuberError};

use super::ServerConfig;

/// Largest frame payload a config may allow
const MAX_FRAME_CEILING: usize = 64 * 1024 * 1024;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<ServerConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(ServerConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<ServerConfig> {
        if !path.exists() {
            return Err(TuberError::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| TuberError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<ServerConfig> {
        toml::from_str(content).map_err(|e| TuberError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &ServerConfig) -> Result<()> {
        let net = &config.net;

        if net.max_frame_size == 0 || net.max_frame_size > MAX_FRAME_CEILING {
            return Err(TuberError::config(format!(
                "max_frame_size must be between 1 and {}",
                MAX_FRAME_CEILING
            )));
        }

        if net.event_queue_capacity == 0 {
            return Err(TuberError::config("event_queue_capacity must be at least 1"));
        }

        if net.send_queue_capacity == 0 {
            return Err(TuberError::config("send_queue_capacity must be at least 1"));
        }

        for listener in &config.listeners {
            listener.network()?;
            if listener.addr.trim().is_empty() {
                return Err(TuberError::config(format!(
                    "{} listener has an empty address",
                    listener.network
                )));
            }
        }

        Ok(())
    }

    /// Load from `path` (or the default location) and validate
    pub fn load_and_validate(path: Option<&Path>) -> Result<ServerConfig> {
        let config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::load()?,
        };
        Self::validate(&config)?;
        Ok(config)
    }
}
