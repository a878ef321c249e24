use std::sync::Arc;

use lattice_net_framing::FramingError;
use lattice_net_mplex::MplexError;
use lattice_net_multistream::NegotiationError;
use lattice_net_primitives::{AddrError, Multiaddr, PeerError, PeerId};
use lattice_net_transport::TransportError;

/// Errors raised by the swarm and its connections.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    // configuration
    #[error("swarm is not running")]
    NotRunning,
    #[error("peer {0} has no dialable addresses")]
    NoAddresses(PeerId),
    #[error("no transport registered for {0:?}")]
    UnknownTransport(String),

    // policy
    #[error("address {0} is denied by policy")]
    AddressDenied(Multiaddr),
    #[error("peer {0} is denied by policy")]
    PeerDenied(PeerId),
    #[error("refusing to register or dial the local peer")]
    SelfDial,
    #[error("already listening on {0}")]
    DuplicateListener(Multiaddr),

    // protocol
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Mplex(#[from] MplexError),
    #[error("every encryption protocol failed: {0:?}")]
    SecurityFailed(Vec<String>),
    #[error("invalid identity record: {0}")]
    InvalidIdentity(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Addr(#[from] AddrError),

    // transport
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("dial to {0} timed out")]
    DialTimeout(PeerId),
    #[error("inbound handshake timed out")]
    HandshakeTimeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    // lifecycle
    #[error("connection is disposed")]
    Disposed,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Shared(#[from] Arc<SwarmError>),
}

impl SwarmError {
    /// True when the failure is a cooperative cancellation rather than a
    /// fault.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Transport(e) => e.is_cancelled(),
            Self::Shared(e) => e.is_cancelled(),
            _ => false,
        }
    }
}
