//! Runtime configuration for servers and clients.
//!
//! There is no configuration file; binaries map their command line arguments onto
//! these structs and the library takes them by value.
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::ValueEnum;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8163;
pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Frame encoding spoken on a connection. Both peers must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Framing {
    /// One newline terminated text line per request.
    #[default]
    Line,
    /// Length prefixed frames with fixed width binary fields.
    Binary,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pool size must be at least 1")]
    EmptyPool,
    #[error("poll interval must be non-zero")]
    ZeroPollInterval,
    #[error("maximum frame length must be non-zero")]
    ZeroMaxFrameLen,
    #[error("idle timeout must be non-zero")]
    ZeroIdleTimeout,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    /// Number of connections served concurrently; further connections wait.
    pub pool_size: usize,
    /// Disconnect clients that send nothing for this long.
    pub idle_timeout: Option<Duration>,
    /// How often blocked accept and read calls wake up to check for shutdown.
    pub poll_interval: Duration,
    pub framing: Framing,
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            pool_size: DEFAULT_POOL_SIZE,
            idle_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            framing: Framing::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::ZeroMaxFrameLen);
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: String,
    /// Bound on how long `receive` waits; `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    pub framing: Framing,
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("{}:{DEFAULT_PORT}", Ipv4Addr::LOCALHOST),
            read_timeout: None,
            framing: Framing::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address.port(), 8163);
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.framing, Framing::Line);
        assert!(config.validate().is_ok());

        assert_eq!(ClientConfig::default().address, "127.0.0.1:8163");
    }

    #[test]
    fn rejects_invalid_server_config() {
        let configs = vec![
            (
                ServerConfig {
                    pool_size: 0,
                    ..Default::default()
                },
                ConfigError::EmptyPool,
            ),
            (
                ServerConfig {
                    poll_interval: Duration::ZERO,
                    ..Default::default()
                },
                ConfigError::ZeroPollInterval,
            ),
            (
                ServerConfig {
                    max_frame_len: 0,
                    ..Default::default()
                },
                ConfigError::ZeroMaxFrameLen,
            ),
            (
                ServerConfig {
                    idle_timeout: Some(Duration::ZERO),
                    ..Default::default()
                },
                ConfigError::ZeroIdleTimeout,
            ),
        ];

        for (config, expected) in configs {
            assert_eq!(config.validate(), Err(expected), "{config:?}");
        }
    }
}
