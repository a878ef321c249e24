//! Protocol-level multiaddress helpers.
//!
//! Addresses are compared component-wise: two addresses match when one's
//! `(protocol, value)` sequence is a prefix of the other's. The peer id
//! (`/p2p/...`) is treated as a detachable suffix so listener dedup can
//! compare bare transport tails.

use std::net::{Ipv4Addr, Ipv6Addr};

use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};

use crate::error::AddrError;

/// The peer id carried by a `/p2p`- or `/ipfs`-terminated address.
pub fn peer_id(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(id)) => Some(id),
        _ => None,
    }
}

pub fn require_peer_id(addr: &Multiaddr) -> Result<PeerId, AddrError> {
    peer_id(addr).ok_or_else(|| AddrError::MissingPeerId(addr.clone()))
}

/// The address with any trailing `/p2p` component removed.
pub fn transport_tail(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .take_while(|p| !matches!(p, Protocol::P2p(_)))
        .fold(Multiaddr::empty(), |acc, p| acc.with(p))
}

/// The transport tail re-terminated with `/p2p/<id>`.
pub fn with_peer_id(addr: &Multiaddr, id: PeerId) -> Multiaddr {
    transport_tail(addr).with(Protocol::P2p(id))
}

/// Component-wise prefix match: true when either address is a prefix of
/// the other.
pub fn prefix_matches(a: &Multiaddr, b: &Multiaddr) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

/// The transport registry key for a dialable address.
///
/// A dialable address reads `/<net>/<host>/<transport>/<port>/p2p/<id>`:
/// the third protocol must be the peer id and the second names the
/// transport.
pub fn dial_transport(addr: &Multiaddr) -> Result<&'static str, AddrError> {
    let mut iter = addr.iter();
    let _host = iter.next();
    let transport = iter.next();
    match iter.next() {
        Some(Protocol::P2p(_)) => {}
        _ => return Err(AddrError::NotDialable(addr.clone())),
    }
    match transport {
        Some(Protocol::Tcp(_)) => Ok("tcp"),
        Some(Protocol::Udp(_)) => Ok("udp"),
        _ => Err(AddrError::UnknownTransport(addr.clone())),
    }
}

/// Expand a wildcard host (`0.0.0.0` / `::`) into concrete listen
/// addresses. Non-wildcard addresses pass through unchanged.
pub fn expand_wildcard(addr: &Multiaddr) -> Vec<Multiaddr> {
    let mut iter = addr.iter();
    let replacement = match iter.next() {
        Some(Protocol::Ip4(ip)) if ip.is_unspecified() => Protocol::Ip4(Ipv4Addr::LOCALHOST),
        Some(Protocol::Ip6(ip)) if ip.is_unspecified() => Protocol::Ip6(Ipv6Addr::LOCALHOST),
        _ => return vec![addr.clone()],
    };
    vec![iter.fold(Multiaddr::empty().with(replacement), |acc, p| acc.with(p))]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer_id() -> PeerId {
        libp2p_identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id()
    }

    #[test]
    fn peer_id_roundtrip() {
        let id = test_peer_id();
        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert_eq!(peer_id(&bare), None);

        let full = with_peer_id(&bare, id);
        assert_eq!(peer_id(&full), Some(id));
        assert_eq!(transport_tail(&full), bare);
    }

    #[test]
    fn with_peer_id_replaces_existing_suffix() {
        let a = test_peer_id();
        let b = test_peer_id();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{a}").parse().unwrap();
        assert_eq!(peer_id(&with_peer_id(&addr, b)), Some(b));
    }

    #[test]
    fn prefix_matching() {
        let a: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let b: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", test_peer_id())
            .parse()
            .unwrap();
        let c: Multiaddr = "/ip4/127.0.0.2/tcp/4001".parse().unwrap();

        assert!(prefix_matches(&a, &b));
        assert!(prefix_matches(&b, &a));
        assert!(!prefix_matches(&a, &c));
    }

    #[test]
    fn dial_transport_requires_third_p2p() {
        let id = test_peer_id();
        let tcp: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{id}").parse().unwrap();
        assert_eq!(dial_transport(&tcp).unwrap(), "tcp");

        let udp: Multiaddr = format!("/ip4/127.0.0.1/udp/4001/p2p/{id}").parse().unwrap();
        assert_eq!(dial_transport(&udp).unwrap(), "udp");

        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(matches!(
            dial_transport(&bare),
            Err(AddrError::NotDialable(_))
        ));
    }

    #[test]
    fn wildcard_expansion() {
        let wild: Multiaddr = "/ip4/0.0.0.0/tcp/4001".parse().unwrap();
        assert_eq!(
            expand_wildcard(&wild),
            vec!["/ip4/127.0.0.1/tcp/4001".parse::<Multiaddr>().unwrap()]
        );

        let concrete: Multiaddr = "/ip4/192.168.1.2/tcp/4001".parse().unwrap();
        assert_eq!(expand_wildcard(&concrete), vec![concrete]);
    }
}
