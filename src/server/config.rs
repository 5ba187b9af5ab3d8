//! Driver configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DataStreamConfig, TCP_MINIMUM_PORT};

/// Transport leg the driver installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Tcp,
    Hap,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Tcp => write!(f, "tcp"),
            TransportMode::Hap => write!(f, "hap"),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the Data Stream listener binds to
    pub listen_addr: String,
    /// Listener port, 0 for an ephemeral one
    pub listen_port: u16,
    pub transport: TransportMode,
    pub data_stream: DataStreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            listen_port: 0,
            transport: TransportMode::Tcp,
            data_stream: DataStreamConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr cannot be empty".into());
        }
        if self.listen_port != 0 && self.listen_port < TCP_MINIMUM_PORT {
            return Err(format!(
                "listen_port must be 0 or at least {} (got {})",
                TCP_MINIMUM_PORT, self.listen_port
            ));
        }
        self.data_stream.validate().map_err(|e| e.to_string())
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Listen address
    pub listen_addr: String,
    /// Listen port (0 = ephemeral)
    pub listen_port: u16,
    /// "tcp" or "hap"
    pub transport: TransportMode,
    /// Number of stream slots
    pub max_streams: usize,
    /// Setup request lifetime (seconds)
    pub setup_timeout_secs: u64,
    /// Unmatched TCP connection lifetime (seconds)
    pub tcp_stream_timeout_secs: u64,
    /// Largest controller write over the HAP leg
    pub max_controller_transport_mtu: u32,
}

impl ServerConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig, String> {
        let config = ServerConfig {
            listen_addr: self.listen_addr.clone(),
            listen_port: self.listen_port,
            transport: self.transport,
            data_stream: DataStreamConfig {
                max_streams: self.max_streams,
                setup_timeout: Duration::from_secs(self.setup_timeout_secs),
                tcp_stream_timeout: Duration::from_secs(self.tcp_stream_timeout_secs),
                max_controller_transport_mtu: self.max_controller_transport_mtu,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            listen_port: config.listen_port,
            transport: config.transport,
            max_streams: config.data_stream.max_streams,
            setup_timeout_secs: config.data_stream.setup_timeout.as_secs(),
            tcp_stream_timeout_secs: config.data_stream.tcp_stream_timeout.as_secs(),
            max_controller_transport_mtu: config.data_stream.max_controller_transport_mtu,
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("Invalid config file: {}", e))
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))
    }
}
