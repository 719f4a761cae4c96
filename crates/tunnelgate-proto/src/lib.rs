//! Tunnel protocol definitions
//!
//! This crate defines the pieces shared by the relay and the agent: the tunnel
//! identifier, HTTP/1.x message framing, public-path rewriting and the canned
//! responses the relay and agent synthesize on failure.

pub mod duration_secs;
pub mod http_parser;
pub mod responses;
pub mod rewrite;
pub mod tunnel_id;

pub use http_parser::{
    HttpRequestParser, HttpResponseParser, ParseError, ParsedRequest, ParsedResponse,
};
pub use rewrite::{rewrite_request_target, split_tunnel_path, TunnelPath};
pub use tunnel_id::{TunnelId, TunnelIdError};

/// Default port for public HTTP traffic
pub const DEFAULT_PUBLIC_PORT: u16 = 80;

/// Default port tunnel agents register on
pub const DEFAULT_RELAY_PORT: u16 = 9000;

/// Maximum length of the registration line (identifier plus newline)
pub const MAX_REGISTRATION_LINE: usize = 256;
