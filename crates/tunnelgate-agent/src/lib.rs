//! Tunnel agent
//!
//! Keeps a relay connection open to the gateway and answers every request that
//! arrives on it by replaying the request against a local service.

pub mod agent;
pub mod forwarder;

pub use agent::{AgentConfig, AgentError, AgentState, TunnelAgent};
pub use forwarder::{ForwarderError, LocalForwarder};
