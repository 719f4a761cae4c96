//! Public HTTP gateway
//!
//! Each public connection carries exactly one request. The first path segment
//! names the tunnel; the rest of the target is forwarded over that tunnel's
//! relay connection and the response is copied back unmodified.

use crate::config::GatewayConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tunnelgate_proto::{
    responses, rewrite_request_target, split_tunnel_path, HttpRequestParser, HttpResponseParser,
    ParseError, ParsedRequest, TunnelId,
};
use tunnelgate_router::{TunnelEndpoint, TunnelRegistry};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Public gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Why a public request could not be framed
#[derive(Debug, Error)]
enum FramingError {
    #[error("client closed the connection before sending a request")]
    Empty,

    #[error("client closed the connection mid-request")]
    Incomplete,

    #[error("request not received within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    fn response(&self) -> Option<Vec<u8>> {
        match self {
            FramingError::Empty | FramingError::Io(_) => None,
            FramingError::Incomplete => Some(responses::bad_request("incomplete request")),
            FramingError::Timeout(_) => Some(responses::request_timeout()),
            FramingError::Parse(ParseError::HeadersTooLarge { .. }) => {
                Some(responses::headers_too_large())
            }
            FramingError::Parse(ParseError::ChunkedRequestUnsupported) => {
                Some(responses::length_required())
            }
            FramingError::Parse(ParseError::BodyTooLarge { limit }) => {
                Some(responses::payload_too_large(*limit))
            }
            FramingError::Parse(e) => Some(responses::bad_request(&e.to_string())),
        }
    }
}

/// Failure of the relay connection during an exchange
#[derive(Debug, Error)]
enum RelayError {
    #[error("tunnel closed while waiting for the relay connection")]
    EndpointClosed,

    #[error("relay connection closed mid-response")]
    ClosedByPeer,

    #[error("invalid response from tunnel: {0}")]
    Protocol(#[from] ParseError),

    #[error("relay IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a relayed response ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseEnd {
    /// Framed by length or chunking; the relay connection can carry another exchange
    Framed,
    /// Close-delimited; the relay connection is spent
    RelayClosed,
}

/// What has been written to the public client so far
#[derive(Debug, Default)]
struct ClientProgress {
    bytes_sent: usize,
    /// Cleared once a write to the client fails; the response is still drained
    client_open: bool,
    status: Option<u16>,
}

/// Internet-facing HTTP entry point
pub struct PublicGateway {
    listener: TcpListener,
    registry: Arc<TunnelRegistry>,
    config: Arc<GatewayConfig>,
}

impl PublicGateway {
    /// Bind the public port
    pub async fn bind(
        config: &GatewayConfig,
        registry: Arc<TunnelRegistry>,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(config.public_addr).await.map_err(|e| {
            GatewayError::BindError {
                address: config.public_addr.ip().to_string(),
                port: config.public_addr.port(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            listener,
            registry,
            config: Arc::new(config.clone()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve public connections until `shutdown` becomes true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), GatewayError> {
        info!("Public gateway listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!(peer = %peer_addr, "Accepted public connection");
                        let registry = self.registry.clone();
                        let config = self.config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, registry, config).await {
                                debug!(peer = %peer_addr, "Public connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept public connection: {}", e);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Public gateway stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut client: TcpStream,
    registry: Arc<TunnelRegistry>,
    config: Arc<GatewayConfig>,
) -> Result<(), GatewayError> {
    let result = serve_request(&mut client, &registry, &config).await;
    let _ = client.shutdown().await;
    result
}

async fn serve_request(
    client: &mut TcpStream,
    registry: &TunnelRegistry,
    config: &GatewayConfig,
) -> Result<(), GatewayError> {
    let (request, bytes) = match read_request(client, config).await {
        Ok(framed) => framed,
        Err(e) => {
            debug!("Public request not framed: {}", e);
            if let Some(response) = e.response() {
                client.write_all(&response).await?;
            }
            return Ok(());
        }
    };

    let Some(target) = split_tunnel_path(&request.path) else {
        debug!(path = %request.path, "No tunnel in request path, serving help page");
        client.write_all(&responses::help_page()).await?;
        return Ok(());
    };

    let endpoint = TunnelId::parse(target.tunnel_id)
        .ok()
        .and_then(|id| registry.lookup(id.as_str()).ok())
        .filter(|endpoint| !endpoint.is_closed());

    let Some(endpoint) = endpoint else {
        warn!(tunnel_id = %target.tunnel_id, "Tunnel not connected");
        client
            .write_all(&responses::tunnel_not_connected(target.tunnel_id))
            .await?;
        return Ok(());
    };

    let Some(forwarded) = rewrite_request_target(&bytes, &target.forwarded) else {
        client
            .write_all(&responses::bad_request("invalid request line"))
            .await?;
        return Ok(());
    };

    debug!(
        tunnel_id = %endpoint.id(),
        method = %request.method,
        path = %target.forwarded,
        "Forwarding request through tunnel"
    );

    relay_exchange(
        client,
        registry,
        &endpoint,
        &request,
        &forwarded,
        config.relay_timeout,
    )
    .await
}

/// Read one complete request, bounded by the request read window
async fn read_request(
    client: &mut TcpStream,
    config: &GatewayConfig,
) -> Result<(ParsedRequest, Vec<u8>), FramingError> {
    let window = config.request_read_timeout;
    let mut parser = HttpRequestParser::with_max_header_bytes(config.max_header_bytes)
        .with_max_body_bytes(config.max_body_bytes);

    tokio::time::timeout(window, frame_request(client, &mut parser))
        .await
        .map_err(|_| FramingError::Timeout(window))?
}

async fn frame_request(
    client: &mut TcpStream,
    parser: &mut HttpRequestParser,
) -> Result<(ParsedRequest, Vec<u8>), FramingError> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Err(if parser.buffered().is_empty() {
                FramingError::Empty
            } else {
                FramingError::Incomplete
            });
        }

        parser.feed(&buf[..n])?;
        if let Some(framed) = parser.take_request() {
            return Ok(framed);
        }
    }
}

/// Run one exchange on the tunnel's relay connection and report failures
async fn relay_exchange(
    client: &mut TcpStream,
    registry: &TunnelRegistry,
    endpoint: &Arc<TunnelEndpoint>,
    request: &ParsedRequest,
    forwarded: &[u8],
    relay_timeout: Duration,
) -> Result<(), GatewayError> {
    let tunnel_id = endpoint.id().clone();
    let mut progress = ClientProgress {
        client_open: true,
        ..Default::default()
    };

    let mut guard = endpoint.lock().await;
    let outcome = match guard.stream() {
        None => Some(Err(RelayError::EndpointClosed)),
        Some(relay) => {
            endpoint.touch();
            tokio::time::timeout(
                relay_timeout,
                forward(relay, client, forwarded, &request.method, &mut progress),
            )
            .await
            .ok()
        }
    };

    match outcome {
        Some(Ok(ResponseEnd::Framed)) => {
            endpoint.touch();
            debug!(
                tunnel_id = %tunnel_id,
                status = ?progress.status,
                bytes = progress.bytes_sent,
                "Exchange complete"
            );
        }
        Some(Ok(ResponseEnd::RelayClosed)) => {
            info!(
                tunnel_id = %tunnel_id,
                status = ?progress.status,
                bytes = progress.bytes_sent,
                "Tunnel ended its response by closing the relay connection"
            );
            registry.evict_endpoint(endpoint);
            drop(guard);
        }
        Some(Err(RelayError::EndpointClosed)) => {
            drop(guard);
            debug!(tunnel_id = %tunnel_id, "Tunnel replaced or closed before forwarding");
            if progress.client_open {
                client
                    .write_all(&responses::tunnel_not_connected(tunnel_id.as_str()))
                    .await?;
            }
        }
        Some(Err(e)) => {
            warn!(tunnel_id = %tunnel_id, "Relay failure, evicting tunnel: {}", e);
            registry.evict_endpoint(endpoint);
            drop(guard);
            if progress.bytes_sent == 0 && progress.client_open {
                client
                    .write_all(&responses::tunnel_failed(tunnel_id.as_str()))
                    .await?;
            }
        }
        None => {
            warn!(
                tunnel_id = %tunnel_id,
                timeout_secs = relay_timeout.as_secs_f64(),
                "Tunnel did not respond in time, evicting"
            );
            registry.evict_endpoint(endpoint);
            drop(guard);
            if progress.bytes_sent == 0 && progress.client_open {
                client
                    .write_all(&responses::tunnel_timeout(tunnel_id.as_str()))
                    .await?;
            }
        }
    }

    Ok(())
}

/// Write the request to the relay and copy the response to the client
async fn forward(
    relay: &mut TcpStream,
    client: &mut TcpStream,
    request: &[u8],
    method: &str,
    progress: &mut ClientProgress,
) -> Result<ResponseEnd, RelayError> {
    relay.write_all(request).await?;
    relay.flush().await?;

    let mut parser = HttpResponseParser::for_method(method);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    while !parser.is_complete() {
        let n = relay.read(&mut buf).await?;
        if n == 0 {
            if parser.has_unknown_length() {
                return Ok(ResponseEnd::RelayClosed);
            }
            return Err(RelayError::ClosedByPeer);
        }

        let used = parser.feed(&buf[..n])?;
        if used < n {
            warn!(extra = n - used, "Discarding bytes past the end of the tunnel response");
        }
        if progress.status.is_none() {
            progress.status = parser.parsed().map(|p| p.status);
        }

        if progress.client_open && used > 0 {
            match client.write_all(&buf[..used]).await {
                Ok(()) => progress.bytes_sent += used,
                Err(e) => {
                    debug!("Public client went away, draining response: {}", e);
                    progress.client_open = false;
                }
            }
        }
    }

    Ok(ResponseEnd::Framed)
}
