//! Allow/deny policy over multiaddresses and peers.
//!
//! Patterns match by component-level prefix equality: `/ip4/10.0.0.1`
//! covers every port and transport under that host, and a
//! `/p2p/<id>`-only pattern covers a peer wherever it lives.

use lattice_net_primitives::{addr, Multiaddr, Peer, Protocol};
use parking_lot::RwLock;

/// Blacklist: everything is allowed unless a pattern prefix-matches.
#[derive(Debug, Default)]
pub struct DenyList {
    patterns: RwLock<Vec<Multiaddr>>,
}

impl DenyList {
    pub fn add(&self, pattern: Multiaddr) {
        let mut patterns = self.patterns.write();
        if !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
    }

    pub fn remove(&self, pattern: &Multiaddr) {
        self.patterns.write().retain(|p| p != pattern);
    }

    pub fn contains(&self, pattern: &Multiaddr) -> bool {
        self.patterns.read().contains(pattern)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }

    pub fn clear(&self) {
        self.patterns.write().clear();
    }

    pub fn is_allowed(&self, target: &Multiaddr) -> bool {
        !self
            .patterns
            .read()
            .iter()
            .any(|p| addr::prefix_matches(p, target))
    }
}

/// Whitelist: allows everything while empty, otherwise requires a
/// prefix-matching pattern.
#[derive(Debug, Default)]
pub struct AllowList {
    patterns: RwLock<Vec<Multiaddr>>,
}

impl AllowList {
    pub fn add(&self, pattern: Multiaddr) {
        let mut patterns = self.patterns.write();
        if !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
    }

    pub fn remove(&self, pattern: &Multiaddr) {
        self.patterns.write().retain(|p| p != pattern);
    }

    pub fn contains(&self, pattern: &Multiaddr) -> bool {
        self.patterns.read().contains(pattern)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }

    pub fn clear(&self) {
        self.patterns.write().clear();
    }

    pub fn is_allowed(&self, target: &Multiaddr) -> bool {
        let patterns = self.patterns.read();
        patterns.is_empty() || patterns.iter().any(|p| addr::prefix_matches(p, target))
    }
}

/// The swarm's composite gate: a target must clear both lists, and a
/// peer must clear them with every known address.
#[derive(Debug, Default)]
pub struct AddressPolicy {
    pub deny: DenyList,
    pub allow: AllowList,
}

impl AddressPolicy {
    pub fn is_address_allowed(&self, target: &Multiaddr) -> bool {
        self.deny.is_allowed(target) && self.allow.is_allowed(target)
    }

    pub fn is_peer_allowed(&self, peer: &Peer) -> bool {
        // A bare `/p2p/<id>` deny entry bans the peer itself, wherever
        // its transport addresses point.
        let identity = Multiaddr::empty().with(Protocol::P2p(peer.id()));
        self.deny.is_allowed(&identity)
            && peer.addresses().iter().all(|a| self.is_address_allowed(a))
    }

    pub fn reset(&self) {
        self.deny.clear();
        self.allow.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_net_primitives::Keypair;

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn deny_list_prefix_semantics() {
        let deny = DenyList::default();
        assert!(deny.is_allowed(&ma("/ip4/10.0.0.1/tcp/4001")));

        deny.add(ma("/ip4/10.0.0.1"));
        assert!(!deny.is_allowed(&ma("/ip4/10.0.0.1/tcp/4001")));
        assert!(!deny.is_allowed(&ma("/ip4/10.0.0.1/tcp/4002")));
        assert!(deny.is_allowed(&ma("/ip4/10.0.0.2/tcp/4001")));

        deny.remove(&ma("/ip4/10.0.0.1"));
        assert!(deny.is_allowed(&ma("/ip4/10.0.0.1/tcp/4001")));
    }

    #[test]
    fn allow_list_empty_allows_everything() {
        let allow = AllowList::default();
        assert!(allow.is_allowed(&ma("/ip4/10.0.0.1/tcp/4001")));

        allow.add(ma("/ip4/10.0.0.1"));
        assert!(allow.is_allowed(&ma("/ip4/10.0.0.1/tcp/4001")));
        assert!(!allow.is_allowed(&ma("/ip4/10.0.0.2/tcp/4001")));
    }

    #[test]
    fn peer_needs_every_address_allowed() {
        let policy = AddressPolicy::default();
        let peer = Peer::from_public_key(Keypair::generate_ed25519().public());
        peer.add_address(ma("/ip4/10.0.0.1/tcp/4001"));
        peer.add_address(ma("/ip4/10.0.0.2/tcp/4001"));
        assert!(policy.is_peer_allowed(&peer));

        policy.deny.add(ma("/ip4/10.0.0.2"));
        assert!(!policy.is_peer_allowed(&peer));
    }

    #[test]
    fn peer_id_pattern_denies_by_identity() {
        let policy = AddressPolicy::default();
        let id = Keypair::generate_ed25519().public().to_peer_id();
        let peer = Peer::new(id);
        peer.add_address(ma(&format!("/ip4/10.0.0.1/tcp/4001/p2p/{id}")));

        assert!(policy.is_peer_allowed(&peer));
        policy.deny.add(ma(&format!("/p2p/{id}")));
        assert!(!policy.is_peer_allowed(&peer));
        // Other peers' transport addresses are untouched.
        assert!(policy.is_address_allowed(&ma("/ip4/10.0.0.1/tcp/4001")));
    }
}
