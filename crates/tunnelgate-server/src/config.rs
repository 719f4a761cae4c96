//! Relay server configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tunnelgate_proto::http_parser::{DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES};
use tunnelgate_proto::{duration_secs, DEFAULT_PUBLIC_PORT, DEFAULT_RELAY_PORT};
use tunnelgate_router::sweeper::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use tunnelgate_router::SweeperConfig;

/// Configuration shared by the relay listener, the public gateway and the sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address for public HTTP traffic
    pub public_addr: SocketAddr,

    /// Address tunnel agents register on
    pub relay_addr: SocketAddr,

    /// Time an agent has to send its registration line
    #[serde(with = "duration_secs")]
    pub registration_grace: Duration,

    /// Time a public client has to send a complete request
    #[serde(with = "duration_secs")]
    pub request_read_timeout: Duration,

    /// Time a tunnel has to answer a forwarded request
    #[serde(with = "duration_secs")]
    pub relay_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Inactivity after which a tunnel is evicted
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Largest accepted request line plus headers
    pub max_header_bytes: usize,

    /// Largest accepted request body, by declared Content-Length
    pub max_body_bytes: usize,
}

impl GatewayConfig {
    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.sweep_interval,
            idle_timeout: self.idle_timeout,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            public_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PUBLIC_PORT)),
            relay_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)),
            registration_grace: Duration::from_secs(10),
            request_read_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(30),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}
