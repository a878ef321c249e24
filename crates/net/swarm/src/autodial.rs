//! Minimum-connection maintenance.
//!
//! Listens for `PeerDiscovered` and `PeerDisconnected` and tops the
//! swarm back up to its connection floor: discovered peers are dialed
//! directly, a disconnect triggers a dial to a random unconnected known
//! peer. Dial failures are logged and swallowed; the next trigger
//! retries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lattice_net_primitives::Peer;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::events::SwarmEvent;
use crate::swarm::Swarm;

#[derive(Debug)]
pub struct AutoDialer {
    swarm: Arc<Swarm>,
    min_connections: usize,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl AutoDialer {
    /// The connection floor comes from the swarm's config.
    pub fn new(swarm: Arc<Swarm>) -> Self {
        let min_connections = swarm.config().min_connections;
        Self::with_min_connections(swarm, min_connections)
    }

    pub fn with_min_connections(swarm: Arc<Swarm>, min_connections: usize) -> Self {
        Self {
            swarm,
            min_connections,
            pending: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Dials in flight right now.
    pub fn pending_connects(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        let swarm = self.swarm.clone();
        let min = self.min_connections;
        let pending = self.pending.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut events = swarm.events().subscribe();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        Self::on_event(&swarm, min, &pending, &cancel, event);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "auto-dialer lagged behind events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn on_event(
        swarm: &Arc<Swarm>,
        min: usize,
        pending: &Arc<AtomicUsize>,
        cancel: &CancellationToken,
        event: SwarmEvent,
    ) {
        if !swarm.is_running() {
            return;
        }
        let active = swarm.manager().active_count();
        if active + pending.load(Ordering::Acquire) >= min {
            return;
        }

        let target = match event {
            SwarmEvent::PeerDiscovered(peer) => Some(peer),
            SwarmEvent::PeerDisconnected(lost) => Self::pick_candidate(swarm, &lost),
            _ => None,
        };
        let Some(target) = target else { return };

        trace!(peer = %target, active, "auto-dialing");
        pending.fetch_add(1, Ordering::AcqRel);
        let swarm = swarm.clone();
        let pending = pending.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = swarm.connect(target.clone(), cancel).await {
                debug!(peer = %target, error = %e, "auto-dial failed");
            }
            pending.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// A uniformly random known peer that is unconnected, not the one
    /// just lost, policy-allowed and not already being dialed.
    fn pick_candidate(swarm: &Arc<Swarm>, lost: &Arc<Peer>) -> Option<Arc<Peer>> {
        let candidates: Vec<Arc<Peer>> = swarm
            .known_peers()
            .into_iter()
            .filter(|p| {
                p.connected_address().is_none()
                    && p.id() != lost.id()
                    && swarm.is_allowed(p)
                    && !swarm.has_pending_dial(&p.id())
            })
            .collect();
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}
