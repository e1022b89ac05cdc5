//! Relay configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading failures
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// File that was being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Relay settings, usually read from a TOML file and overridden on the
/// command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// How often every connection is pinged, in milliseconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// A connection that sent nothing (not even a pong) for this long is
    /// closed, in milliseconds
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,

    /// Refuse connections on `/`; every client must name a namespace
    #[serde(default)]
    pub require_namespace: bool,

    /// SQLite file for the durable offline queue; in-process queue if unset
    #[serde(default)]
    pub queue_path: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7475
}

fn default_ping_interval() -> u64 {
    5_000
}

fn default_liveness_timeout() -> u64 {
    15_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ping_interval_ms: default_ping_interval(),
            liveness_timeout_ms: default_liveness_timeout(),
            require_namespace: false,
            queue_path: None,
        }
    }
}

impl RelayConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid("ping_interval_ms must be positive".into()));
        }
        if self.liveness_timeout_ms < self.ping_interval_ms {
            return Err(ConfigError::Invalid(
                "liveness_timeout_ms must be at least ping_interval_ms".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ping period
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Liveness window
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}
