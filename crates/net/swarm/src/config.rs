//! Swarm configuration.

use std::time::Duration;

/// Tunables for a [`Swarm`](crate::Swarm) and its companion services.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Agent string advertised through the identify exchange.
    pub agent_version: String,
    /// Protocol suite string advertised through the identify exchange.
    pub protocol_version: String,
    /// Ceiling for a single transport connect, and for each inbound
    /// handshake stage.
    pub connect_timeout: Duration,
    /// Live-connection floor maintained by the auto-dialer; zero
    /// disables it.
    pub min_connections: usize,
    /// First retry delay for an unreachable peer.
    pub initial_backoff: Duration,
    /// Retry delay ceiling; a peer whose next delay would exceed it is
    /// deregistered for good.
    pub max_backoff: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            agent_version: concat!("lattice/", env!("CARGO_PKG_VERSION")).to_string(),
            protocol_version: "lattice/1.0.0".to_string(),
            connect_timeout: Duration::from_secs(30),
            min_connections: 16,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(64 * 60),
        }
    }
}
