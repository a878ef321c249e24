use multiaddr::Multiaddr;

/// Errors raised by [`Peer`](crate::Peer) state transitions.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("public key hashes to {actual}, peer id is {expected}")]
    KeyMismatch {
        expected: libp2p_identity::PeerId,
        actual: libp2p_identity::PeerId,
    },
}

/// Errors raised by multiaddress inspection.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("address {0} does not end in a p2p peer id")]
    MissingPeerId(Multiaddr),
    #[error("address {0} names no known dial transport")]
    UnknownTransport(Multiaddr),
    #[error("address {0} is not dialable: third protocol must be p2p or ipfs")]
    NotDialable(Multiaddr),
}
