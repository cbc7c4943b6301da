//! Configuration types for the tunnel engine
//!
//! The embedding daemon owns file loading and CLI wiring; this module only
//! defines the serde types, their defaults, and validation.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunnel engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Idle TTL in seconds for pooled connection handlers
    #[serde(default = "default_conn_ttl_secs")]
    pub conn_ttl_secs: u64,

    /// Dial timeout in seconds for peer-side sockets
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Interval in seconds between idle-reaper sweeps
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Per-handler inbound queue capacity (messages)
    #[serde(default = "default_handler_queue")]
    pub handler_queue: usize,

    /// Capture device write queue capacity (packets)
    #[serde(default = "default_device_queue")]
    pub device_queue: usize,

    /// TTL in seconds for incomplete IPv4 fragment chains
    #[serde(default = "default_fragment_ttl_secs")]
    pub fragment_ttl_secs: u64,

    /// Shutdown drain timeout in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Capture device MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// UDP ports answered with port-unreachable before any handler exists
    #[serde(default = "default_blocked_udp_ports")]
    pub blocked_udp_ports: Vec<u16>,

    /// DNS interception, when a local resolver should take over
    #[serde(default)]
    pub dns: Option<DnsConfig>,
}

/// DNS interception configuration
///
/// UDP packets addressed to `remote_ip:remote_port` are relayed to the
/// resolver at `local_addr` instead of crossing the tunnel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Resolver IP as seen on the capture device
    pub remote_ip: IpAddr,

    /// Resolver port as seen on the capture device
    #[serde(default = "default_dns_port")]
    pub remote_port: u16,

    /// Address of the local resolver that answers intercepted queries
    pub local_addr: SocketAddr,
}

fn default_conn_ttl_secs() -> u64 {
    300
}
fn default_dial_timeout_secs() -> u64 {
    30
}
fn default_reap_interval_secs() -> u64 {
    30
}
fn default_handler_queue() -> usize {
    10
}
fn default_device_queue() -> usize {
    100
}
fn default_fragment_ttl_secs() -> u64 {
    30
}
fn default_drain_timeout_secs() -> u64 {
    2
}
fn default_mtu() -> usize {
    1500
}
fn default_blocked_udp_ports() -> Vec<u16> {
    // NETBIOS name/datagram/session services
    vec![137, 138, 139]
}
fn default_dns_port() -> u16 {
    53
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            conn_ttl_secs: default_conn_ttl_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            handler_queue: default_handler_queue(),
            device_queue: default_device_queue(),
            fragment_ttl_secs: default_fragment_ttl_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            mtu: default_mtu(),
            blocked_udp_ports: default_blocked_udp_ports(),
            dns: None,
        }
    }
}

impl TunnelConfig {
    /// Idle TTL for pooled handlers
    #[must_use]
    pub const fn conn_ttl(&self) -> Duration {
        Duration::from_secs(self.conn_ttl_secs)
    }

    /// Dial timeout for peer-side sockets
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Interval between idle-reaper sweeps
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// TTL for incomplete fragment chains
    #[must_use]
    pub const fn fragment_ttl(&self) -> Duration {
        Duration::from_secs(self.fragment_ttl_secs)
    }

    /// Shutdown drain timeout
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if any field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < 576 {
            return Err(ConfigError::Validation(format!(
                "mtu {} below the IPv4 minimum of 576",
                self.mtu
            )));
        }
        if self.handler_queue == 0 {
            return Err(ConfigError::Validation(
                "handler_queue must be at least 1".into(),
            ));
        }
        if self.device_queue == 0 {
            return Err(ConfigError::Validation(
                "device_queue must be at least 1".into(),
            ));
        }
        if self.conn_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "conn_ttl_secs must be at least 1".into(),
            ));
        }
        if self.reap_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "reap_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
