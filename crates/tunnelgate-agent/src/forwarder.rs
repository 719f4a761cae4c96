use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tunnelgate_proto::{responses, HttpResponseParser, ParseError};

/// Errors that can occur while talking to the local service
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to local service {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to local service {address}")]
    ConnectTimeout { address: String },

    #[error("Local service did not finish its response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("Local service closed the connection mid-response")]
    IncompleteResponse,

    #[error("Invalid response from local service: {0}")]
    InvalidResponse(#[from] ParseError),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

/// Replays relayed requests against the local service, one connection per request
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    local_addr: String,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl LocalForwarder {
    pub fn new(
        local_addr: impl Into<String>,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            connect_timeout,
            response_timeout,
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Forward one request and return the bytes to send back over the relay.
    ///
    /// Never fails: any problem with the local service yields a `502` response.
    pub async fn forward(&self, method: &str, request: &[u8]) -> Vec<u8> {
        match self.exchange(method, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    local_addr = %self.local_addr,
                    error = %e,
                    "Local service failed, answering 502"
                );
                responses::local_service_unreachable(&self.local_addr)
            }
        }
    }

    /// Send `request` verbatim to the local service and read one full response
    ///
    /// Interim `1xx` responses are kept ahead of the final one. A close-delimited
    /// response is returned with a `Content-Length`, since the relay connection
    /// it travels over stays open.
    pub async fn exchange(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ForwarderError> {
        let mut local = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.local_addr),
        )
        .await
        .map_err(|_| ForwarderError::ConnectTimeout {
            address: self.local_addr.clone(),
        })?
        .map_err(|e| ForwarderError::ConnectionFailed {
            address: self.local_addr.clone(),
            source: e,
        })?;

        tracing::debug!(
            local_addr = %self.local_addr,
            bytes = request.len(),
            "Connected to local service"
        );

        local.write_all(request).await?;

        let mut parser = HttpResponseParser::for_method(method);
        tokio::time::timeout(self.response_timeout, read_response(&mut local, &mut parser))
            .await
            .map_err(|_| ForwarderError::ResponseTimeout(self.response_timeout))??;

        let response = parser.into_framed_bytes();
        tracing::debug!(
            local_addr = %self.local_addr,
            bytes = response.len(),
            "Local service responded"
        );
        Ok(response)
    }
}

async fn read_response(
    local: &mut TcpStream,
    parser: &mut HttpResponseParser,
) -> Result<(), ForwarderError> {
    let mut buffer = vec![0u8; 16384];

    while !parser.is_complete() {
        match local.read(&mut buffer).await? {
            0 if parser.has_unknown_length() => {
                parser.mark_complete();
            }
            0 => return Err(ForwarderError::IncompleteResponse),
            n => {
                parser.feed(&buffer[..n])?;
            }
        }
    }

    Ok(())
}
