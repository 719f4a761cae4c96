//! Relay port: accepts agent connections and registers them

use crate::config::GatewayConfig;
use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tunnelgate_proto::{TunnelId, TunnelIdError, MAX_REGISTRATION_LINE};
use tunnelgate_router::TunnelRegistry;

/// Relay listener errors
#[derive(Debug, Error)]
pub enum RelayListenerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind relay port {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Why an agent connection was dropped without registering
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("no registration line within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before registration line was complete")]
    Closed,

    #[error("registration line longer than {max} bytes")]
    LineTooLong { max: usize },

    #[error("invalid tunnel ID: {0}")]
    InvalidId(#[from] TunnelIdError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts tunnel agents on the relay port
pub struct RelayListener {
    listener: TcpListener,
    registry: Arc<TunnelRegistry>,
    registration_grace: Duration,
}

impl RelayListener {
    /// Bind the relay port
    pub async fn bind(
        config: &GatewayConfig,
        registry: Arc<TunnelRegistry>,
    ) -> Result<Self, RelayListenerError> {
        let listener = TcpListener::bind(config.relay_addr).await.map_err(|e| {
            RelayListenerError::BindError {
                address: config.relay_addr.ip().to_string(),
                port: config.relay_addr.port(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            listener,
            registry,
            registration_grace: config.registration_grace,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayListenerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept agents until `shutdown` becomes true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayListenerError> {
        info!("Relay listener accepting tunnels on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!(peer = %peer_addr, "Accepted relay connection");
                        let registry = self.registry.clone();
                        let grace = self.registration_grace;
                        tokio::spawn(async move {
                            if let Err(e) = handle_agent(socket, registry, grace).await {
                                match e {
                                    RegistrationError::Io(_) | RegistrationError::Closed => {
                                        debug!(peer = %peer_addr, "Relay connection dropped: {}", e)
                                    }
                                    _ => warn!(peer = %peer_addr, "Rejected tunnel registration: {}", e),
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept relay connection: {}", e);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Relay listener stopped");
        Ok(())
    }
}

async fn handle_agent(
    mut socket: TcpStream,
    registry: Arc<TunnelRegistry>,
    grace: Duration,
) -> Result<(), RegistrationError> {
    if let Err(e) = SockRef::from(&socket).set_keepalive(true) {
        debug!("Failed to enable keep-alive on relay connection: {}", e);
    }

    let line = tokio::time::timeout(grace, read_registration_line(&mut socket))
        .await
        .map_err(|_| RegistrationError::Timeout(grace))??;
    let tunnel_id = TunnelId::from_registration_line(&line)?;

    registry.register(tunnel_id, socket);
    Ok(())
}

/// Read up to and including the first `\n`, never past it.
///
/// Reads one byte at a time so nothing that follows the line is consumed.
async fn read_registration_line(socket: &mut TcpStream) -> Result<Vec<u8>, RegistrationError> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        if socket.read(&mut byte).await? == 0 {
            return Err(RegistrationError::Closed);
        }
        line.push(byte[0]);

        if byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() >= MAX_REGISTRATION_LINE {
            return Err(RegistrationError::LineTooLong {
                max: MAX_REGISTRATION_LINE,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_reads_exactly_one_line() {
        let (mut server, mut client) = pair().await;
        client.write_all(b"myapp\nGET / HTTP/1.1\r\n").await.unwrap();

        let line = read_registration_line(&mut server).await.unwrap();
        assert_eq!(line, b"myapp\n");

        let mut rest = [0u8; 3];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"GET");
    }

    #[tokio::test]
    async fn test_rejects_long_line() {
        let (mut server, mut client) = pair().await;
        client
            .write_all(&vec![b'a'; MAX_REGISTRATION_LINE + 10])
            .await
            .unwrap();

        let result = read_registration_line(&mut server).await;
        assert!(matches!(result, Err(RegistrationError::LineTooLong { .. })));
    }

    #[tokio::test]
    async fn test_closed_before_newline() {
        let (mut server, mut client) = pair().await;
        client.write_all(b"partial").await.unwrap();
        drop(client);

        let result = read_registration_line(&mut server).await;
        assert!(matches!(result, Err(RegistrationError::Closed)));
    }

    #[tokio::test]
    async fn test_handle_agent_registers() {
        let registry = Arc::new(TunnelRegistry::new());
        let (server, mut client) = pair().await;
        client.write_all(b"demo\r\n").await.unwrap();

        handle_agent(server, registry.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(registry.contains("demo"));
    }

    #[tokio::test]
    async fn test_handle_agent_times_out() {
        let registry = Arc::new(TunnelRegistry::new());
        let (server, _client) = pair().await;

        let result = handle_agent(server, registry.clone(), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(RegistrationError::Timeout(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_handle_agent_rejects_invalid_id() {
        let registry = Arc::new(TunnelRegistry::new());
        let (server, mut client) = pair().await;
        client.write_all(b"bad id\n").await.unwrap();

        let result = handle_agent(server, registry.clone(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RegistrationError::InvalidId(_))));
        assert_eq!(registry.count(), 0);
    }
}
