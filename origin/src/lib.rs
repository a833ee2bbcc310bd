//! Origin telescope protocol client
//!
//! Drives a network-controlled mount and camera over its JSON WebSocket control endpoint.
//!
//! ## Features
//!
//! - One persistent link carrying commands, correlated responses and notifications
//! - Correlation ids that stay unique across reconnections
//! - Heartbeat supervision with a degraded state and automatic reconnection
//! - Exponential backoff with jitter for reconnection
//! - Typed mount and camera wrappers
//! - Image retrieval over HTTP with bounded retries
//! - Background health probes and a rolling error log

mod client;
mod error;
pub mod camera;
pub mod monitor;
pub mod mount;
pub mod protocol;
pub mod stats;
pub mod transfer;
pub mod transport;

pub use camera::{BitDepth, CaptureParameters, ImageReady, OriginCamera};
pub use client::*;
pub use error::{OriginError, OriginResult};
pub use monitor::{ErrorReporter, HealthHandle, HealthMonitor, HealthReport, MonitorConfig, Probe, SubsystemHealth};
pub use mount::{AltAzTarget, MountStatus, OriginMount};
pub use protocol::{targets, verbs, Command, Notification, Payload, Response};
pub use stats::{ConnectionState, ConnectionStats, ErrorRecord, SharedStats};
pub use transfer::{ImageTransfer, RetryConfig};
pub use transport::{Connector, DeviceAcceptor, DeviceEnd, Link, MemoryConnector, WebSocketConnector};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default host name the telescope advertises on the local network
pub const DEFAULT_HOST: &str = "origin.local";

/// Default port of the device's image HTTP server
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Timeout configuration for Origin operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginTimeoutConfig {
    /// Connection timeout for opening the link (default: 10 seconds)
    pub connection_timeout_secs: u64,
    /// Default timeout for commands sent without an explicit one (default: 10 seconds)
    pub command_timeout_secs: u64,
    /// Timeout for a single image download request (default: 60 seconds)
    pub download_timeout_secs: u64,
}

impl Default for OriginTimeoutConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 10,
            command_timeout_secs: 10,
            download_timeout_secs: 60,
        }
    }
}

impl OriginTimeoutConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Everything needed to talk to one telescope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    pub host: String,
    pub http_port: u16,
    /// Ask the device for its version before reporting a connection as established
    pub verify_on_connect: bool,
    pub timeouts: OriginTimeoutConfig,
    pub reconnection: ReconnectionConfig,
    pub heartbeat: HeartbeatConfig,
    pub retry: RetryConfig,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            verify_on_connect: true,
            timeouts: OriginTimeoutConfig::default(),
            reconnection: ReconnectionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl OriginConfig {
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_config_defaults() {
        let config = OriginTimeoutConfig::default();
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.download_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: OriginConfig =
            serde_json::from_str(r#"{"host":"10.0.0.5","heartbeat":{"interval_secs":2}}"#).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(2));
        assert_eq!(config.heartbeat.missed_before_degraded, 3);
        assert!(config.verify_on_connect);
    }
}
