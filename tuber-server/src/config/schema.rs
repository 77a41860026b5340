//! Configuration schema structs

use serde::{Deserialize, Serialize};

use tuber_utils::{Result, TuberError};

use crate::listener::Network;
use crate::manager::ManagerConfig;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub net: ManagerConfig,
    pub listeners: Vec<ListenerConfig>,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            net: ManagerConfig::default(),
            listeners: vec![ListenerConfig {
                network: "tcp".into(),
                addr: "0.0.0.0:10086".into(),
            }],
            logging: LoggingConfig::default(),
        }
    }
}

/// One address to accept on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// "tcp" or "unix"
    pub network: String,
    /// host:port for tcp, a filesystem path for unix
    pub addr: String,
}

impl ListenerConfig {
    /// Parse `tcp://host:port` or `unix:///path/to/socket`
    pub fn parse(spec: &str) -> Result<Self> {
        let (network, addr) = spec.split_once("://").ok_or_else(|| {
            TuberError::config(format!(
                "listener '{}' must look like <network>://<addr>",
                spec
            ))
        })?;
        if addr.is_empty() {
            return Err(TuberError::config(format!(
                "listener '{}' has an empty address",
                spec
            )));
        }
        Ok(Self {
            network: network.to_string(),
            addr: addr.to_string(),
        })
    }

    /// Resolve the network name
    pub fn network(&self) -> Result<Network> {
        self.network
            .parse()
            .map_err(|e: crate::listener::ListenerError| TuberError::config(e.to_string()))
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, used when TUBER_LOG is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}
