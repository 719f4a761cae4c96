//! Tunnel registry and liveness sweeping
//!
//! The registry is the only state shared between the relay listener, the public
//! gateway and the sweeper. It maps tunnel identifiers to the relay connection
//! an agent registered, and each endpoint carries its own lock so exchanges on
//! one tunnel are serialized without holding the map.

pub mod registry;
pub mod sweeper;

pub use registry::{
    EvictReason, RegistryError, RelayGuard, TunnelEndpoint, TunnelInfo, TunnelRegistry,
};
pub use sweeper::{LivenessSweeper, SweeperConfig};
