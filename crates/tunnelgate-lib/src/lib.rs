//! Tunnelgate - expose a private HTTP service through a public relay
//!
//! This library re-exports the tunnel crates so applications can embed either
//! side of a tunnel: the relay (public gateway plus relay port) or the agent
//! that runs next to the private service.
//!
//! # Running a relay
//!
//! ```ignore
//! use tunnelgate_lib::RelayBuilder;
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = RelayBuilder::new()
//!     .public_addr("0.0.0.0:8080")?
//!     .relay_addr("0.0.0.0:9000")?
//!     .bind()
//!     .await?;
//!
//! let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//! relay.run(shutdown_rx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Running an agent
//!
//! ```ignore
//! use tunnelgate_lib::{AgentConfig, TunnelAgent, TunnelId};
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::new(TunnelId::parse("myapp")?, "relay.example.com:9000", "127.0.0.1:3000");
//! let agent = TunnelAgent::new(config);
//!
//! let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//! agent.run(shutdown_rx).await;
//! # Ok(())
//! # }
//! ```

pub mod relay;

pub use relay::{Relay, RelayBuilder, RelayBuilderError, RelayHandle};

// Protocol
pub use tunnelgate_proto::{
    HttpRequestParser, HttpResponseParser, ParseError, TunnelId, TunnelIdError,
    DEFAULT_PUBLIC_PORT, DEFAULT_RELAY_PORT,
};

// Registry
pub use tunnelgate_router::{
    LivenessSweeper, RegistryError, SweeperConfig, TunnelEndpoint, TunnelInfo, TunnelRegistry,
};

// Relay server
pub use tunnelgate_server::{
    GatewayConfig, GatewayError, PublicGateway, RelayListener, RelayListenerError,
};

// Agent
pub use tunnelgate_agent::{
    AgentConfig, AgentError, AgentState, ForwarderError, LocalForwarder, TunnelAgent,
};
