//! Relay connection lifecycle
//!
//! The agent is either disconnected (waiting out the reconnect delay) or
//! connected, in which case it serves requests from the relay one at a time
//! until the connection fails.

use crate::forwarder::LocalForwarder;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use tunnelgate_proto::{HttpRequestParser, ParseError, TunnelId};

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to connect to relay {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to relay {address}")]
    ConnectTimeout { address: String },

    #[error("Relay closed the connection")]
    RelayClosed,

    #[error("Malformed request from relay: {0}")]
    Protocol(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connected,
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identifier registered with the relay
    pub tunnel_id: TunnelId,

    /// Relay port of the gateway (host:port)
    pub relay_addr: String,

    /// Private service requests are forwarded to (host:port)
    pub local_addr: String,

    /// Delay between losing the relay connection and reconnecting
    pub reconnect_delay: Duration,

    /// Longest wait on an idle relay connection before the agent wakes up
    pub heartbeat_interval: Duration,

    pub connect_timeout: Duration,

    /// Time the local service has to produce a full response
    pub local_timeout: Duration,
}

impl AgentConfig {
    pub fn new(
        tunnel_id: TunnelId,
        relay_addr: impl Into<String>,
        local_addr: impl Into<String>,
    ) -> Self {
        Self {
            tunnel_id,
            relay_addr: relay_addr.into(),
            local_addr: local_addr.into(),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            local_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_local_timeout(mut self, timeout: Duration) -> Self {
        self.local_timeout = timeout;
        self
    }

    /// URL the tunnel should be reachable at, assuming the gateway serves on port 80
    pub fn public_url(&self) -> String {
        let host = self
            .relay_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.relay_addr);
        format!("http://{}{}", host, self.tunnel_id.public_path())
    }
}

/// Client side of a tunnel
pub struct TunnelAgent {
    config: AgentConfig,
    forwarder: LocalForwarder,
    state: watch::Sender<AgentState>,
}

impl TunnelAgent {
    pub fn new(config: AgentConfig) -> Self {
        let forwarder = LocalForwarder::new(
            config.local_addr.clone(),
            config.connect_timeout,
            config.local_timeout,
        );
        let (state, _) = watch::channel(AgentState::Disconnected);

        Self {
            config,
            forwarder,
            state,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Observe connection state changes
    pub fn state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AgentState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Keep the tunnel up until `shutdown` becomes true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tunnel_id = %self.config.tunnel_id,
            relay = %self.config.relay_addr,
            local_addr = %self.config.local_addr,
            "Starting tunnel agent"
        );

        loop {
            let result = tokio::select! {
                result = self.session() => result,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };

            self.set_state(AgentState::Disconnected);
            if let Err(e) = result {
                warn!(tunnel_id = %self.config.tunnel_id, "Relay connection lost: {}", e);
            }

            info!(
                "Reconnecting in {} seconds...",
                self.config.reconnect_delay.as_secs_f64()
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        self.set_state(AgentState::Disconnected);
        info!(tunnel_id = %self.config.tunnel_id, "Tunnel agent stopped");
    }

    /// One connected period: register, then serve until the relay connection fails
    async fn session(&self) -> Result<(), AgentError> {
        let relay = self.connect().await?;
        self.set_state(AgentState::Connected);
        info!(
            tunnel_id = %self.config.tunnel_id,
            public_url = %self.config.public_url(),
            "Tunnel connected"
        );
        self.serve(relay).await
    }

    /// Open the relay connection and send the registration line
    pub async fn connect(&self) -> Result<TcpStream, AgentError> {
        let address = &self.config.relay_addr;
        let mut relay =
            tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
                .await
                .map_err(|_| AgentError::ConnectTimeout {
                    address: address.clone(),
                })?
                .map_err(|e| AgentError::ConnectionFailed {
                    address: address.clone(),
                    source: e,
                })?;

        relay
            .write_all(self.config.tunnel_id.registration_line().as_bytes())
            .await?;
        debug!(tunnel_id = %self.config.tunnel_id, relay = %address, "Sent registration");
        Ok(relay)
    }

    /// Serve forwarded requests until the relay connection fails
    pub async fn serve(&self, mut relay: TcpStream) -> Result<(), AgentError> {
        let mut parser = HttpRequestParser::new();
        let mut buffer = vec![0u8; 16384];

        loop {
            let n = match tokio::time::timeout(
                self.config.heartbeat_interval,
                relay.read(&mut buffer),
            )
            .await
            {
                Ok(read) => read?,
                Err(_) => {
                    trace!(tunnel_id = %self.config.tunnel_id, "Relay idle");
                    continue;
                }
            };

            if n == 0 {
                return Err(AgentError::RelayClosed);
            }

            let mut data = &buffer[..n];
            while !data.is_empty() {
                let used = parser.feed(data)?;
                data = &data[used..];

                let Some((request, bytes)) = parser.take_request() else {
                    break;
                };

                debug!(
                    tunnel_id = %self.config.tunnel_id,
                    method = %request.method,
                    path = %request.path,
                    "Forwarding request to local service"
                );
                let response = self.forwarder.forward(&request.method, &bytes).await;
                relay.write_all(&response).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig::new(
            TunnelId::parse("myapp").unwrap(),
            "relay.example.com:9000",
            "127.0.0.1:3000",
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = config();
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builders() {
        let config = config()
            .with_reconnect_delay(Duration::from_millis(100))
            .with_heartbeat_interval(Duration::from_secs(1))
            .with_local_timeout(Duration::from_secs(2));
        assert_eq!(config.reconnect_delay, Duration::from_millis(100));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.local_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_public_url() {
        assert_eq!(config().public_url(), "http://relay.example.com/myapp/");
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let agent = TunnelAgent::new(config());
        assert_eq!(*agent.state().borrow(), AgentState::Disconnected);
    }
}
