//! Connection bookkeeping: at most one active connection per peer, and
//! exactly one `PeerDisconnected` per transition to zero.

use std::collections::HashMap;
use std::sync::Arc;

use lattice_net_primitives::PeerId;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::PeerConnection;
use crate::events::EventEmitter;

/// Peer-id -> ordered connection list. Connections route their own
/// disposal back through [`remove`](ConnectionManager::remove) via the
/// close watcher registered in [`add`](ConnectionManager::add).
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connections: Mutex<HashMap<PeerId, Vec<Arc<PeerConnection>>>>,
    events: EventEmitter,
}

enum AddOutcome {
    /// The submitted connection was stored (or already was).
    Kept,
    /// Collapsed onto an existing active connection.
    Collapsed(Arc<PeerConnection>),
}

impl ConnectionManager {
    pub fn new(events: EventEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Store a connection under its remote peer id.
    ///
    /// Returns the retained connection: the submitted one when stored,
    /// or the existing active one when the submitted connection lost a
    /// connect race (the loser is disposed).
    pub fn add(&self, conn: Arc<PeerConnection>) -> Arc<PeerConnection> {
        let Some(peer) = conn.remote_peer() else {
            // Identity never completed; nothing to index by.
            return conn;
        };

        let outcome = {
            let mut map = self.inner.connections.lock();
            let list = map.entry(peer.id()).or_default();
            if list.iter().any(|c| Arc::ptr_eq(c, &conn)) {
                AddOutcome::Kept
            } else if let Some(active) = list.iter().find(|c| c.is_active()).cloned() {
                AddOutcome::Collapsed(active)
            } else {
                list.push(conn.clone());
                if peer.connected_address().is_none() {
                    peer.set_connected_address(Some(conn.remote_addr().clone()));
                }
                AddOutcome::Kept
            }
        };

        match outcome {
            AddOutcome::Kept => {
                trace!(peer = %peer, "connection stored");
                self.watch_close(conn.clone());
                conn
            }
            AddOutcome::Collapsed(existing) => {
                debug!(peer = %peer, "duplicate connection collapsed");
                conn.dispose();
                existing
            }
        }
    }

    fn watch_close(&self, conn: Arc<PeerConnection>) {
        let manager = self.clone();
        let closed = conn.closed_token();
        tokio::spawn(async move {
            closed.cancelled().await;
            manager.remove(&conn);
        });
    }

    /// Drop and dispose one connection, maintaining the peer's
    /// `connected_address` and publishing `PeerDisconnected` exactly
    /// once when the last connection goes.
    pub fn remove(&self, conn: &Arc<PeerConnection>) {
        let Some(peer) = conn.remote_peer() else {
            conn.dispose();
            return;
        };

        let mut disconnected = false;
        {
            let mut map = self.inner.connections.lock();
            if let Some(list) = map.get_mut(&peer.id()) {
                list.retain(|c| !Arc::ptr_eq(c, conn));
                if list.is_empty() {
                    map.remove(&peer.id());
                    if peer.connected_address().is_some() {
                        peer.set_connected_address(None);
                        disconnected = true;
                    }
                } else {
                    let last = list.last().expect("list is non-empty");
                    peer.set_connected_address(Some(last.remote_addr().clone()));
                }
            }
        }

        conn.dispose();
        if disconnected {
            debug!(peer = %peer, "peer disconnected");
            self.inner.events.peer_disconnected(peer);
        }
    }

    /// Drop and dispose every connection of a peer.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        let list = self.inner.connections.lock().remove(peer_id);
        let Some(list) = list else { return };

        let mut disconnected_peer = None;
        for conn in &list {
            if let Some(peer) = conn.remote_peer() {
                if peer.connected_address().is_some() {
                    peer.set_connected_address(None);
                    disconnected_peer = Some(peer);
                }
            }
            conn.dispose();
        }
        if let Some(peer) = disconnected_peer {
            debug!(peer = %peer, "peer disconnected");
            self.inner.events.peer_disconnected(peer);
        }
    }

    /// The first active connection for the peer. No side effects.
    pub fn try_get(&self, peer_id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.inner
            .connections
            .lock()
            .get(peer_id)
            .and_then(|list| list.iter().find(|c| c.is_active()).cloned())
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.try_get(peer_id).is_some()
    }

    /// Count of peers with at least one active connection.
    pub fn active_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .values()
            .filter(|list| list.iter().any(|c| c.is_active()))
            .count()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|(_, list)| list.iter().any(|c| c.is_active()))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Dispose everything. Addresses are cleared without publishing
    /// disconnect events; this is the shutdown path.
    pub fn clear(&self) {
        let drained: Vec<_> = self.inner.connections.lock().drain().collect();
        for (_, list) in drained {
            for conn in list {
                if let Some(peer) = conn.remote_peer() {
                    peer.set_connected_address(None);
                }
                conn.dispose();
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("peers", &self.inner.connections.lock().len())
            .finish()
    }
}
