//! Relay builder
//!
//! Wires the registry, relay listener, public gateway and liveness sweeper into
//! one relay that shares a single shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tunnelgate_router::{LivenessSweeper, TunnelRegistry};
use tunnelgate_server::{
    GatewayConfig, GatewayError, PublicGateway, RelayListener, RelayListenerError,
};

/// Relay builder errors
#[derive(Error, Debug)]
pub enum RelayBuilderError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Relay listener error: {0}")]
    RelayListener(#[from] RelayListenerError),

    #[error("Server task failed: {0}")]
    ServerError(String),
}

/// Builder for a relay
#[derive(Debug, Clone, Default)]
pub struct RelayBuilder {
    config: GatewayConfig,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn with_config(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Address for public HTTP traffic (e.g., "0.0.0.0:80")
    pub fn public_addr(mut self, addr: &str) -> Result<Self, RelayBuilderError> {
        self.config.public_addr = parse_addr(addr)?;
        Ok(self)
    }

    /// Address tunnel agents register on (e.g., "0.0.0.0:9000")
    pub fn relay_addr(mut self, addr: &str) -> Result<Self, RelayBuilderError> {
        self.config.relay_addr = parse_addr(addr)?;
        Ok(self)
    }

    pub fn registration_grace(mut self, grace: Duration) -> Self {
        self.config.registration_grace = grace;
        self
    }

    pub fn request_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_read_timeout = timeout;
        self
    }

    pub fn relay_timeout(mut self, timeout: Duration) -> Self {
        self.config.relay_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn max_header_bytes(mut self, limit: usize) -> Self {
        self.config.max_header_bytes = limit;
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.config.max_body_bytes = limit;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn validate(&self) -> Result<(), RelayBuilderError> {
        let config = &self.config;
        if config.public_addr == config.relay_addr && config.public_addr.port() != 0 {
            return Err(RelayBuilderError::ConfigError(format!(
                "public and relay ports must differ (both are {})",
                config.public_addr
            )));
        }

        let timeouts = [
            ("registration_grace", config.registration_grace),
            ("request_read_timeout", config.request_read_timeout),
            ("relay_timeout", config.relay_timeout),
            ("sweep_interval", config.sweep_interval),
            ("idle_timeout", config.idle_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(RelayBuilderError::ConfigError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if config.max_header_bytes == 0 {
            return Err(RelayBuilderError::ConfigError(
                "max_header_bytes must be greater than zero".to_string(),
            ));
        }
        if config.max_body_bytes == 0 {
            return Err(RelayBuilderError::ConfigError(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate the configuration and bind both ports
    pub async fn bind(self) -> Result<Relay, RelayBuilderError> {
        self.validate()?;

        let registry = Arc::new(TunnelRegistry::new());
        let listener = RelayListener::bind(&self.config, registry.clone()).await?;
        let gateway = PublicGateway::bind(&self.config, registry.clone()).await?;
        let sweeper = LivenessSweeper::new(registry.clone(), self.config.sweeper());

        Ok(Relay {
            public_addr: gateway.local_addr()?,
            relay_addr: listener.local_addr()?,
            registry,
            listener,
            gateway,
            sweeper,
        })
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, RelayBuilderError> {
    addr.parse()
        .map_err(|e| RelayBuilderError::ParseError(format!("invalid address '{}': {}", addr, e)))
}

/// A bound relay, ready to run
pub struct Relay {
    registry: Arc<TunnelRegistry>,
    listener: RelayListener,
    gateway: PublicGateway,
    sweeper: LivenessSweeper,
    public_addr: SocketAddr,
    relay_addr: SocketAddr,
}

impl Relay {
    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Serve until `shutdown` becomes true
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), RelayBuilderError> {
        info!(
            public_addr = %self.public_addr,
            relay_addr = %self.relay_addr,
            "Relay running"
        );

        let mut join_set = tokio::task::JoinSet::new();
        let listener_shutdown = shutdown.clone();
        let gateway_shutdown = shutdown.clone();
        let listener = self.listener;
        let gateway = self.gateway;

        join_set.spawn(async move {
            listener
                .run(listener_shutdown)
                .await
                .map_err(RelayBuilderError::from)
        });
        join_set.spawn(async move {
            gateway
                .run(gateway_shutdown)
                .await
                .map_err(RelayBuilderError::from)
        });
        join_set.spawn(async move {
            self.sweeper.run(shutdown).await;
            Ok(())
        });

        let mut result = Ok(());
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined
                .map_err(|e| RelayBuilderError::ServerError(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = outcome {
                error!("Relay task failed: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        info!("Relay stopped");
        result
    }

    /// Run on a background task, returning a handle that can stop it
    pub fn spawn(self) -> RelayHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let public_addr = self.public_addr;
        let relay_addr = self.relay_addr;
        let task = tokio::spawn(self.run(shutdown_rx));

        RelayHandle {
            shutdown,
            task,
            registry,
            public_addr,
            relay_addr,
        }
    }
}

/// Handle to a relay running on a background task
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), RelayBuilderError>>,
    registry: Arc<TunnelRegistry>,
    public_addr: SocketAddr,
    relay_addr: SocketAddr,
}

impl RelayHandle {
    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Signal shutdown and wait for every relay task to finish
    pub async fn shutdown(self) -> Result<(), RelayBuilderError> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| RelayBuilderError::ServerError(e.to_string()))?
    }
}
