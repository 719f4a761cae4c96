//! Relay server: the relay port agents register on and the public HTTP gateway

pub mod config;
pub mod gateway;
pub mod relay_listener;

pub use config::GatewayConfig;
pub use gateway::{GatewayError, PublicGateway};
pub use relay_listener::{RegistrationError, RelayListener, RelayListenerError};
