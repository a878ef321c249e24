//! Dead-peer backoff and blacklist control loop.
//!
//! An unreachable peer goes on the deny list under `/p2p/<id>` with an
//! exponentially growing retry delay. The background loop lifts the
//! deny entry when a retry is due and attempts a reconnect; a peer
//! whose next delay would exceed the ceiling is deregistered for good.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lattice_net_primitives::{Multiaddr, Peer, PeerId, Protocol};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::events::SwarmEvent;
use crate::swarm::Swarm;

#[derive(Debug, Clone)]
struct DeadPeer {
    peer: Arc<Peer>,
    backoff: Duration,
    next_attempt: Instant,
}

#[derive(Debug)]
pub struct PeerMonitor {
    swarm: Arc<Swarm>,
    initial_backoff: Duration,
    max_backoff: Duration,
    dead: Arc<Mutex<HashMap<PeerId, DeadPeer>>>,
    cancel: CancellationToken,
}

impl PeerMonitor {
    pub fn new(swarm: Arc<Swarm>) -> Self {
        let initial_backoff = swarm.config().initial_backoff;
        let max_backoff = swarm.config().max_backoff;
        Self {
            swarm,
            initial_backoff,
            max_backoff,
            dead: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_dead(&self, peer_id: &PeerId) -> bool {
        self.dead.lock().contains_key(peer_id)
    }

    pub fn dead_count(&self) -> usize {
        self.dead.lock().len()
    }

    pub fn start(&self) {
        self.spawn_event_loop();
        self.spawn_retry_loop();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn spawn_event_loop(&self) {
        let swarm = self.swarm.clone();
        let dead = self.dead.clone();
        let initial = self.initial_backoff;
        let max = self.max_backoff;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut events = swarm.events().subscribe();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(SwarmEvent::ConnectionEstablished(conn)) => {
                        if let Some(peer) = conn.remote_peer() {
                            Self::mark_reachable(&swarm, &dead, &peer);
                        }
                    }
                    Ok(SwarmEvent::PeerNotReachable(peer)) => {
                        Self::mark_unreachable(&swarm, &dead, peer, initial, max);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "peer monitor lagged behind events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_retry_loop(&self) {
        let swarm = self.swarm.clone();
        let dead = self.dead.clone();
        let period = self.initial_backoff;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let due: Vec<Arc<Peer>> = {
                    let now = Instant::now();
                    let mut dead = dead.lock();
                    dead.values_mut()
                        .filter(|entry| entry.next_attempt <= now)
                        .map(|entry| {
                            // Push the deadline out so the entry is not
                            // re-picked while the attempt is in flight.
                            entry.next_attempt = now + entry.backoff;
                            entry.peer.clone()
                        })
                        .collect()
                };
                for peer in due {
                    trace!(peer = %peer, "retrying dead peer");
                    swarm.policy().deny.remove(&identity_addr(&peer.id()));
                    let swarm = swarm.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = swarm.connect(peer.clone(), cancel).await {
                            trace!(peer = %peer, error = %e, "dead peer still unreachable");
                        }
                    });
                }
            }
        });
    }

    fn mark_reachable(swarm: &Arc<Swarm>, dead: &Mutex<HashMap<PeerId, DeadPeer>>, peer: &Arc<Peer>) {
        if dead.lock().remove(&peer.id()).is_some() {
            debug!(peer = %peer, "peer reachable again");
        }
        swarm.policy().deny.remove(&identity_addr(&peer.id()));
    }

    fn mark_unreachable(
        swarm: &Arc<Swarm>,
        dead: &Mutex<HashMap<PeerId, DeadPeer>>,
        peer: Arc<Peer>,
        initial: Duration,
        max: Duration,
    ) {
        let give_up = {
            let mut dead = dead.lock();
            match dead.get_mut(&peer.id()) {
                Some(entry) if entry.backoff * 2 > max => true,
                Some(entry) => {
                    entry.backoff *= 2;
                    entry.next_attempt = Instant::now() + entry.backoff;
                    debug!(peer = %peer, backoff = ?entry.backoff, "dead peer backoff doubled");
                    false
                }
                None => {
                    dead.insert(
                        peer.id(),
                        DeadPeer {
                            peer: peer.clone(),
                            backoff: initial,
                            next_attempt: Instant::now() + initial,
                        },
                    );
                    debug!(peer = %peer, backoff = ?initial, "peer marked dead");
                    false
                }
            }
        };

        if give_up {
            // Out of patience; the deny entry stays.
            dead.lock().remove(&peer.id());
            warn!(peer = %peer, "giving up on dead peer");
            swarm.deregister_peer(&peer.id());
            return;
        }
        swarm.policy().deny.add(identity_addr(&peer.id()));
    }
}

fn identity_addr(peer_id: &PeerId) -> Multiaddr {
    Multiaddr::empty().with(Protocol::P2p(*peer_id))
}
