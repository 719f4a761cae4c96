//! Periodic eviction of dead and idle tunnels

use crate::registry::TunnelRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use tunnelgate_proto::TunnelId;

/// Default period between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default inactivity after which a tunnel is evicted
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Background task that keeps the registry free of dead tunnels
pub struct LivenessSweeper {
    registry: Arc<TunnelRegistry>,
    config: SweeperConfig,
}

impl LivenessSweeper {
    pub fn new(registry: Arc<TunnelRegistry>, config: SweeperConfig) -> Self {
        Self { registry, config }
    }

    /// Run a single sweep now
    pub fn sweep_once(&self) -> Vec<TunnelId> {
        let evicted = self
            .registry
            .sweep(Instant::now(), self.config.idle_timeout);

        if evicted.is_empty() {
            debug!(active = self.registry.count(), "Liveness sweep found nothing to evict");
        } else {
            info!(
                evicted = evicted.len(),
                active = self.registry.count(),
                "Liveness sweep evicted tunnels"
            );
            for tunnel in self.registry.snapshot() {
                debug!(
                    tunnel_id = %tunnel.id,
                    peer = ?tunnel.peer_addr,
                    registered_at = %tunnel.registered_at,
                    idle_secs = tunnel.idle_for.as_secs(),
                    "Active tunnel"
                );
            }
        }

        evicted
    }

    /// Sweep on every tick until `shutdown` becomes true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.interval,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Liveness sweeper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Liveness sweeper stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
