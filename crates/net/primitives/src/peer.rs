//! Canonical peer identity type.
//!
//! A [`Peer`] is shared between the registry, the connection manager and
//! protocol handlers, so every field apart from the id sits behind a
//! short-lived `parking_lot` lock. Equality is by peer id.

use std::fmt;
use std::time::Duration;

use libp2p_identity::{PeerId, PublicKey};
use multiaddr::Multiaddr;
use parking_lot::RwLock;

use crate::addr;
use crate::error::{AddrError, PeerError};

/// A network participant identified by the multihash of its public key.
///
/// Construct via [`new`](Self::new) when only the id is known,
/// [`from_public_key`](Self::from_public_key) for a fully identified peer,
/// or [`from_address`](Self::from_address) when discovering through a
/// `/p2p`-terminated multiaddress.
pub struct Peer {
    id: PeerId,
    public_key: RwLock<Option<PublicKey>>,
    addresses: RwLock<Vec<Multiaddr>>,
    agent_version: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    connected_address: RwLock<Option<Multiaddr>>,
    latency: RwLock<Option<Duration>>,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            public_key: RwLock::new(None),
            addresses: RwLock::new(Vec::new()),
            agent_version: RwLock::new(None),
            protocol_version: RwLock::new(None),
            connected_address: RwLock::new(None),
            latency: RwLock::new(None),
        }
    }

    /// Create a peer whose id is derived from `key`.
    pub fn from_public_key(key: PublicKey) -> Self {
        let peer = Self::new(key.to_peer_id());
        *peer.public_key.write() = Some(key);
        peer
    }

    /// Create a peer from a `/p2p`-terminated multiaddress.
    pub fn from_address(address: Multiaddr) -> Result<Self, AddrError> {
        let id = addr::require_peer_id(&address)?;
        let peer = Self::new(id);
        peer.add_address(address);
        Ok(peer)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.public_key.read().clone()
    }

    /// Record the peer's public key, enforcing `id == hash(key)`.
    pub fn set_public_key(&self, key: PublicKey) -> Result<(), PeerError> {
        let actual = key.to_peer_id();
        if actual != self.id {
            return Err(PeerError::KeyMismatch {
                expected: self.id,
                actual,
            });
        }
        *self.public_key.write() = Some(key);
        Ok(())
    }

    pub fn addresses(&self) -> Vec<Multiaddr> {
        self.addresses.read().clone()
    }

    /// Add an address, keeping the list duplicate-free.
    pub fn add_address(&self, address: Multiaddr) {
        let mut addrs = self.addresses.write();
        if !addrs.contains(&address) {
            addrs.push(address);
        }
    }

    pub fn add_addresses<I: IntoIterator<Item = Multiaddr>>(&self, addresses: I) {
        let mut addrs = self.addresses.write();
        for address in addresses {
            if !addrs.contains(&address) {
                addrs.push(address);
            }
        }
    }

    /// Drop every address for which `keep` returns false.
    pub fn retain_addresses<F: FnMut(&Multiaddr) -> bool>(&self, keep: F) {
        self.addresses.write().retain(keep);
    }

    pub fn agent_version(&self) -> Option<String> {
        self.agent_version.read().clone()
    }

    pub fn set_agent_version(&self, version: impl Into<String>) {
        *self.agent_version.write() = Some(version.into());
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().clone()
    }

    pub fn set_protocol_version(&self, version: impl Into<String>) {
        *self.protocol_version.write() = Some(version.into());
    }

    pub fn connected_address(&self) -> Option<Multiaddr> {
        self.connected_address.read().clone()
    }

    pub fn set_connected_address(&self, address: Option<Multiaddr>) {
        *self.connected_address.write() = address;
    }

    pub fn is_connected(&self) -> bool {
        self.connected_address.read().is_some()
    }

    pub fn latency(&self) -> Option<Duration> {
        *self.latency.read()
    }

    pub fn set_latency(&self, rtt: Duration) {
        *self.latency.write() = Some(rtt);
    }

    /// Merge discovery data from `other` into this peer.
    ///
    /// Non-null agent/protocol/key/latency win over absent local values;
    /// address lists are unioned. The caller guarantees matching ids.
    pub fn merge_from(&self, other: &Peer) -> Result<(), PeerError> {
        if let Some(key) = other.public_key() {
            self.set_public_key(key)?;
        }
        if let Some(agent) = other.agent_version() {
            self.set_agent_version(agent);
        }
        if let Some(protocol) = other.protocol_version() {
            self.set_protocol_version(protocol);
        }
        if let Some(rtt) = other.latency() {
            self.set_latency(rtt);
        }
        self.add_addresses(other.addresses());
        Ok(())
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addresses", &*self.addresses.read())
            .field("connected_address", &*self.connected_address.read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p_identity::Keypair;

    fn test_keypair() -> Keypair {
        Keypair::generate_ed25519()
    }

    #[test]
    fn id_derives_from_public_key() {
        let key = test_keypair();
        let peer = Peer::from_public_key(key.public());
        assert_eq!(peer.id(), key.public().to_peer_id());
    }

    #[test]
    fn set_public_key_rejects_mismatch() {
        let peer = Peer::from_public_key(test_keypair().public());
        let other = test_keypair().public();
        assert!(matches!(
            peer.set_public_key(other),
            Err(PeerError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn from_address_requires_peer_id() {
        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(Peer::from_address(bare).is_err());

        let id = test_keypair().public().to_peer_id();
        let full: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{id}").parse().unwrap();
        let peer = Peer::from_address(full.clone()).unwrap();
        assert_eq!(peer.id(), id);
        assert_eq!(peer.addresses(), vec![full]);
    }

    #[test]
    fn add_address_is_idempotent() {
        let peer = Peer::new(test_keypair().public().to_peer_id());
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        peer.add_address(addr.clone());
        peer.add_address(addr);
        assert_eq!(peer.addresses().len(), 1);
    }

    #[test]
    fn merge_unions_addresses_and_fills_gaps() {
        let key = test_keypair();
        let id = key.public().to_peer_id();

        let existing = Peer::new(id);
        existing.add_address("/ip4/10.0.0.1/tcp/4001".parse().unwrap());

        let incoming = Peer::from_public_key(key.public());
        incoming.add_address("/ip4/10.0.0.2/tcp/4001".parse().unwrap());
        incoming.set_agent_version("lattice/0.1.0");

        existing.merge_from(&incoming).unwrap();
        assert_eq!(existing.addresses().len(), 2);
        assert_eq!(existing.agent_version().as_deref(), Some("lattice/0.1.0"));
        assert!(existing.public_key().is_some());
    }
}
