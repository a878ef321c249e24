//! Swarm lifecycle events and the non-blocking broadcast emitter.

use std::sync::Arc;

use lattice_net_primitives::Peer;
use tokio::sync::broadcast;

use crate::connection::PeerConnection;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Out-of-band notifications published by the swarm and its companions.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// A peer entered the registry for the first time.
    PeerDiscovered(Arc<Peer>),
    /// A peer was deregistered.
    PeerRemoved(Arc<Peer>),
    /// A connection completed its handshake and was retained.
    ConnectionEstablished(Arc<PeerConnection>),
    /// A connection was disposed.
    ConnectionClosed(Arc<PeerConnection>),
    /// A peer's last active connection went away.
    PeerDisconnected(Arc<Peer>),
    /// Every dial attempt to the peer failed.
    PeerNotReachable(Arc<Peer>),
    /// The local peer started listening; carries the local peer with its
    /// updated address list.
    ListenerEstablished(Arc<Peer>),
}

/// Non-blocking broadcast emitter. Publishing never waits; slow
/// subscribers drop events independently.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<SwarmEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: SwarmEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn peer_discovered(&self, peer: Arc<Peer>) {
        self.emit(SwarmEvent::PeerDiscovered(peer));
    }

    pub fn peer_removed(&self, peer: Arc<Peer>) {
        self.emit(SwarmEvent::PeerRemoved(peer));
    }

    pub fn connection_established(&self, conn: Arc<PeerConnection>) {
        self.emit(SwarmEvent::ConnectionEstablished(conn));
    }

    pub fn connection_closed(&self, conn: Arc<PeerConnection>) {
        self.emit(SwarmEvent::ConnectionClosed(conn));
    }

    pub fn peer_disconnected(&self, peer: Arc<Peer>) {
        self.emit(SwarmEvent::PeerDisconnected(peer));
    }

    pub fn peer_not_reachable(&self, peer: Arc<Peer>) {
        self.emit(SwarmEvent::PeerNotReachable(peer));
    }

    pub fn listener_established(&self, peer: Arc<Peer>) {
        self.emit(SwarmEvent::ListenerEstablished(peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_net_primitives::Keypair;

    fn test_peer() -> Arc<Peer> {
        Arc::new(Peer::from_public_key(
            Keypair::generate_ed25519().public(),
        ))
    }

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let emitter = EventEmitter::default();
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        let peer = test_peer();
        emitter.peer_discovered(peer.clone());

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                SwarmEvent::PeerDiscovered(p) => assert_eq!(p.id(), peer.id()),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let emitter = EventEmitter::default();
        emitter.peer_not_reachable(test_peer());
    }
}
