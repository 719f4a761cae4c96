//! Tunnel registry for managing relay connections
//!
//! Re-registration policy: a new registration for an identifier replaces the
//! existing endpoint and closes it. The old socket is released immediately when
//! idle, or as soon as the exchange currently using it finishes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use socket2::SockRef;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use tunnelgate_proto::TunnelId;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tunnel not found: {0}")]
    NotFound(String),
}

/// Why an endpoint was removed by a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The agent closed the connection, or a forward already reported it dead
    Closed,
    /// No exchange within the idle timeout
    Idle,
}

/// Point-in-time view of a registered tunnel
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub id: TunnelId,
    pub peer_addr: Option<SocketAddr>,
    pub registered_at: DateTime<Utc>,
    pub idle_for: Duration,
    /// An exchange currently holds the relay connection
    pub in_use: bool,
}

/// One registered relay connection
pub struct TunnelEndpoint {
    id: TunnelId,
    peer_addr: Option<SocketAddr>,
    registered_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    /// Exclusive access to the relay socket; `None` once released
    connection: tokio::sync::Mutex<Option<TcpStream>>,
}

impl TunnelEndpoint {
    fn new(id: TunnelId, connection: TcpStream) -> Self {
        Self {
            id,
            peer_addr: connection.peer_addr().ok(),
            registered_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            connection: tokio::sync::Mutex::new(Some(connection)),
        }
    }

    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn last_activity(&self) -> Instant {
        match self.last_activity.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Time since the last successful forward, as seen at `now`
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Record activity on this endpoint
    pub fn touch(&self) {
        match self.last_activity.lock() {
            Ok(mut last) => *last = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }

    /// Whether the connection has been reported dead or the endpoint was evicted
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the endpoint closed and release the socket if nobody is using it.
    ///
    /// If an exchange holds the connection, the socket is released when its
    /// [`RelayGuard`] drops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut connection) = self.connection.try_lock() {
            if connection.take().is_some() {
                debug!(tunnel_id = %self.id, "Released relay connection");
            }
        }
    }

    /// Wait for exclusive use of the relay connection
    pub async fn lock(&self) -> RelayGuard<'_> {
        RelayGuard {
            endpoint: self,
            connection: self.connection.lock().await,
        }
    }

    fn is_in_use(&self) -> bool {
        self.connection.try_lock().is_err()
    }

    /// Decide whether a sweep should evict this endpoint, closing it if so.
    ///
    /// Endpoints held by an exchange are never closed here unless a forward has
    /// already marked them closed.
    fn sweep_check(&self, now: Instant, idle_timeout: Duration) -> Option<EvictReason> {
        if self.is_closed() {
            self.close();
            return Some(EvictReason::Closed);
        }

        let Ok(mut connection) = self.connection.try_lock() else {
            trace!(tunnel_id = %self.id, "Skipping sweep check, exchange in progress");
            return None;
        };

        let reason = match connection.as_ref() {
            None => EvictReason::Closed,
            Some(stream) if peer_has_closed(stream) => EvictReason::Closed,
            Some(_) if self.idle_for(now) > idle_timeout => EvictReason::Idle,
            Some(_) => return None,
        };

        self.closed.store(true, Ordering::Release);
        connection.take();
        Some(reason)
    }

    fn info(&self, now: Instant) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            peer_addr: self.peer_addr,
            registered_at: self.registered_at,
            idle_for: self.idle_for(now),
            in_use: self.is_in_use(),
        }
    }
}

impl std::fmt::Debug for TunnelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEndpoint")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("registered_at", &self.registered_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-blocking check for a peer that has shut down its side of the connection
fn peer_has_closed(stream: &TcpStream) -> bool {
    let mut buf = [MaybeUninit::<u8>::uninit(); 1];
    match SockRef::from(stream).peek(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            false
        }
        Err(_) => true,
    }
}

/// Exclusive handle on an endpoint's relay connection
///
/// Held for the whole write-request/read-response sequence of one exchange.
pub struct RelayGuard<'a> {
    endpoint: &'a TunnelEndpoint,
    connection: MutexGuard<'a, Option<TcpStream>>,
}

impl RelayGuard<'_> {
    /// The relay socket, or `None` if the endpoint was closed while waiting
    pub fn stream(&mut self) -> Option<&mut TcpStream> {
        if self.endpoint.is_closed() {
            return None;
        }
        self.connection.as_mut()
    }
}

impl Drop for RelayGuard<'_> {
    fn drop(&mut self) {
        if self.endpoint.is_closed() && self.connection.take().is_some() {
            debug!(tunnel_id = %self.endpoint.id, "Released relay connection after exchange");
        }
    }
}

/// Registry of live tunnels
///
/// The map is only touched for short, non-blocking operations; socket I/O
/// happens under each endpoint's own lock.
pub struct TunnelRegistry {
    entries: DashMap<TunnelId, Arc<TunnelEndpoint>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a relay connection, replacing and closing any previous one
    pub fn register(&self, id: TunnelId, connection: TcpStream) -> Arc<TunnelEndpoint> {
        let endpoint = Arc::new(TunnelEndpoint::new(id.clone(), connection));

        match self.entries.insert(id.clone(), endpoint.clone()) {
            Some(previous) => {
                info!(
                    tunnel_id = %id,
                    peer = ?endpoint.peer_addr(),
                    previous_peer = ?previous.peer_addr(),
                    "Tunnel re-registered, closing previous connection"
                );
                previous.close();
            }
            None => {
                info!(
                    tunnel_id = %id,
                    peer = ?endpoint.peer_addr(),
                    public_path = %id.public_path(),
                    "Tunnel registered"
                );
            }
        }

        endpoint
    }

    /// Lookup the current endpoint for an identifier
    ///
    /// Liveness is not checked; callers find out when they use the connection.
    pub fn lookup(&self, id: &str) -> Result<Arc<TunnelEndpoint>, RegistryError> {
        trace!("Looking up tunnel: {}", id);
        self.entries
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Update the activity timestamp of an identifier's endpoint
    pub fn touch(&self, id: &str) -> bool {
        match self.entries.get(id) {
            Some(entry) => {
                entry.value().touch();
                true
            }
            None => false,
        }
    }

    /// Remove an identifier and close its connection. Idempotent.
    pub fn evict(&self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some((_, endpoint)) => {
                endpoint.close();
                info!(tunnel_id = %id, "Tunnel evicted");
                true
            }
            None => false,
        }
    }

    /// Close `endpoint` and remove it, unless the identifier has since been
    /// re-registered to a different connection.
    pub fn evict_endpoint(&self, endpoint: &Arc<TunnelEndpoint>) -> bool {
        endpoint.close();
        let removed = self
            .entries
            .remove_if(endpoint.id().as_str(), |_, current| {
                Arc::ptr_eq(current, endpoint)
            })
            .is_some();

        if removed {
            info!(tunnel_id = %endpoint.id(), "Tunnel evicted after relay failure");
        }
        removed
    }

    /// Remove every endpoint whose connection is closed or idle past `idle_timeout`
    pub fn sweep(&self, now: Instant, idle_timeout: Duration) -> Vec<TunnelId> {
        // Snapshot first so no shard lock is held while probing sockets
        let candidates: Vec<Arc<TunnelEndpoint>> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut evicted = Vec::new();
        for endpoint in candidates {
            let Some(reason) = endpoint.sweep_check(now, idle_timeout) else {
                continue;
            };

            let removed = self
                .entries
                .remove_if(endpoint.id().as_str(), |_, current| {
                    Arc::ptr_eq(current, &endpoint)
                })
                .is_some();

            if removed {
                info!(
                    tunnel_id = %endpoint.id(),
                    reason = ?reason,
                    idle_secs = endpoint.idle_for(now).as_secs(),
                    "Removing dead tunnel"
                );
                evicted.push(endpoint.id().clone());
            }
        }

        evicted
    }

    /// Check if an identifier is registered
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Get number of registered tunnels
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Describe every registered tunnel
    pub fn snapshot(&self) -> Vec<TunnelInfo> {
        let now = Instant::now();
        let mut infos: Vec<TunnelInfo> = self
            .entries
            .iter()
            .map(|entry| entry.value().info(now))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Remove and close every tunnel
    pub fn clear(&self) {
        let ids: Vec<TunnelId> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.evict(id.as_str());
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
