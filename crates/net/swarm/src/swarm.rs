//! The swarm: peer registry, dial coordinator, listener set and policy
//! gate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use lattice_net_mplex::PROTOCOL_ID as MPLEX_ID;
use lattice_net_primitives::{
    addr, BandwidthMeter, DynStream, Keypair, MeteredStream, Multiaddr, Peer, PeerId, Protocol,
};
use lattice_net_transport::{AcceptHandler, TransportRegistry};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::SwarmConfig;
use crate::connection::PeerConnection;
use crate::events::EventEmitter;
use crate::filter::AddressPolicy;
use crate::identify::Identify;
use crate::manager::ConnectionManager;
use crate::ping::Ping;
use crate::protocol::{NetworkProtector, ProtocolTable, StreamProtocol};
use crate::security::{Plaintext, SecurityProtocol};
use crate::util::linked_token;
use crate::SwarmError;

type DialShared = Shared<BoxFuture<'static, Result<Arc<PeerConnection>, Arc<SwarmError>>>>;

struct ListenerEntry {
    group: u64,
    token: CancellationToken,
}

/// The node-side runtime: owns peers, dials, listeners and the
/// per-connection handshake pipeline.
pub struct Swarm {
    config: SwarmConfig,
    local_key: Option<Keypair>,
    local_peer: Arc<Peer>,
    known_peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    pending_outbound: Mutex<HashMap<PeerId, (u64, DialShared)>>,
    pending_inbound: Mutex<HashSet<Multiaddr>>,
    listeners: Mutex<HashMap<Multiaddr, ListenerEntry>>,
    seq: AtomicU64,
    transports: TransportRegistry,
    manager: ConnectionManager,
    policy: AddressPolicy,
    protocols: ProtocolTable,
    events: EventEmitter,
    protector: RwLock<Option<Arc<dyn NetworkProtector>>>,
    bandwidth: BandwidthMeter,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
}

impl Swarm {
    /// A swarm whose local peer identity is derived from `keypair`.
    pub fn new(keypair: Keypair, config: SwarmConfig) -> Arc<Self> {
        let local_peer = Arc::new(Peer::from_public_key(keypair.public()));
        Self::with_local_peer(local_peer, Some(keypair), config)
    }

    pub fn with_local_peer(
        local_peer: Arc<Peer>,
        local_key: Option<Keypair>,
        config: SwarmConfig,
    ) -> Arc<Self> {
        local_peer.set_agent_version(config.agent_version.clone());
        local_peer.set_protocol_version(config.protocol_version.clone());

        let events = EventEmitter::default();
        let protocols = ProtocolTable::new();
        protocols.add_security_protocol(Arc::new(Plaintext));
        protocols.add_muxer(MPLEX_ID);
        protocols.add_stream_protocol(Arc::new(Identify));
        protocols.add_stream_protocol(Arc::new(Ping));

        Arc::new(Self {
            config,
            local_key,
            local_peer,
            known_peers: RwLock::new(HashMap::new()),
            pending_outbound: Mutex::new(HashMap::new()),
            pending_inbound: Mutex::new(HashSet::new()),
            listeners: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            transports: TransportRegistry::new(),
            manager: ConnectionManager::new(events.clone()),
            policy: AddressPolicy::default(),
            protocols,
            events,
            protector: RwLock::new(None),
            bandwidth: BandwidthMeter::new(),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn local_peer(&self) -> Arc<Peer> {
        self.local_peer.clone()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn bandwidth(&self) -> &BandwidthMeter {
        &self.bandwidth
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().clone()
    }

    /// Register an application protocol served on future connections.
    pub fn register_protocol(&self, protocol: Arc<dyn StreamProtocol>) {
        self.protocols.add_stream_protocol(protocol);
    }

    /// Install a private-network protector applied to every raw stream.
    pub fn set_protector(&self, protector: Arc<dyn NetworkProtector>) {
        *self.protector.write() = Some(protector);
    }

    pub fn register_security_protocol(&self, protocol: Arc<dyn SecurityProtocol>) {
        self.protocols.add_security_protocol(protocol);
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shutdown.lock() = CancellationToken::new();
        self.bandwidth.start_rate_ticker();
        info!(peer = %self.local_peer, "swarm started");
    }

    /// Stop everything: listeners, connections, registry, policies.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.lock().cancel();

        let drained: Vec<(Multiaddr, ListenerEntry)> =
            self.listeners.lock().drain().collect();
        let mut cancelled = HashSet::new();
        for (address, entry) in &drained {
            if cancelled.insert(entry.group) {
                entry.token.cancel();
            }
            trace!(%address, "listener stopped");
        }
        let removed: Vec<Multiaddr> = drained.into_iter().map(|(a, _)| a).collect();
        self.local_peer.retain_addresses(|a| !removed.contains(a));

        self.manager.clear();
        self.known_peers.write().clear();
        self.pending_outbound.lock().clear();
        self.pending_inbound.lock().clear();
        self.policy.reset();
        self.bandwidth.stop_rate_ticker();
        info!(peer = %self.local_peer, "swarm stopped");
    }

    // -- peer registry ----------------------------------------------------

    /// Register the peer named by a `/p2p`-terminated address.
    pub fn register_peer_address(&self, address: &Multiaddr) -> Result<Arc<Peer>, SwarmError> {
        let peer = Peer::from_address(address.clone())?;
        self.register_peer(Arc::new(peer))
    }

    /// Merge a peer into the registry, enforcing policy and the
    /// not-the-local-peer invariant. `PeerDiscovered` fires on first
    /// insert only.
    pub fn register_peer(&self, peer: Arc<Peer>) -> Result<Arc<Peer>, SwarmError> {
        if peer.id() == self.local_peer.id() {
            return Err(SwarmError::SelfDial);
        }
        if !self.policy.is_peer_allowed(&peer) {
            return Err(SwarmError::PeerDenied(peer.id()));
        }

        let (peer, discovered) = {
            let mut peers = self.known_peers.write();
            match peers.get(&peer.id()) {
                Some(existing) => {
                    existing.merge_from(&peer)?;
                    (existing.clone(), false)
                }
                None => {
                    peers.insert(peer.id(), peer.clone());
                    (peer, true)
                }
            }
        };
        if discovered {
            debug!(peer = %peer, "peer discovered");
            self.events.peer_discovered(peer.clone());
        }
        Ok(peer)
    }

    pub fn deregister_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        let removed = self.known_peers.write().remove(peer_id);
        if let Some(peer) = &removed {
            debug!(peer = %peer, "peer removed");
            self.events.peer_removed(peer.clone());
        }
        removed
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.known_peers.read().get(peer_id).cloned()
    }

    pub fn known_peers(&self) -> Vec<Arc<Peer>> {
        self.known_peers.read().values().cloned().collect()
    }

    pub fn is_allowed(&self, peer: &Peer) -> bool {
        self.policy.is_peer_allowed(peer)
    }

    pub fn has_pending_dial(&self, peer_id: &PeerId) -> bool {
        self.pending_outbound.lock().contains_key(peer_id)
    }

    // -- dialing ----------------------------------------------------------

    /// Connect to the peer named by a `/p2p`-terminated address.
    pub async fn connect_address(
        self: &Arc<Self>,
        address: &Multiaddr,
        cancel: CancellationToken,
    ) -> Result<Arc<PeerConnection>, SwarmError> {
        let peer = self.register_peer_address(address)?;
        self.connect(peer, cancel).await
    }

    /// Connect to a peer, sharing any in-flight dial for the same peer.
    pub async fn connect(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        cancel: CancellationToken,
    ) -> Result<Arc<PeerConnection>, SwarmError> {
        if !self.is_running() {
            return Err(SwarmError::NotRunning);
        }
        let peer = self.register_peer(peer)?;
        if let Some(conn) = self.manager.try_get(&peer.id()) {
            return Ok(conn);
        }

        let (seq, dial) = {
            let mut pending = self.pending_outbound.lock();
            match pending.get(&peer.id()) {
                Some((seq, dial)) => (*seq, dial.clone()),
                None => {
                    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                    let linked = linked_token(&self.shutdown_token(), &cancel);
                    let swarm = self.clone();
                    let dial_peer = peer.clone();
                    let dial: DialShared = async move {
                        let result = swarm
                            .dial(dial_peer.clone(), dial_peer.addresses(), linked.clone())
                            .await;
                        linked.cancel();
                        result.map_err(|e| {
                            if !e.is_cancelled() {
                                debug!(peer = %dial_peer, error = %e, "peer not reachable");
                                swarm.events.peer_not_reachable(dial_peer.clone());
                            }
                            Arc::new(e)
                        })
                    }
                    .boxed()
                    .shared();
                    pending.insert(peer.id(), (seq, dial.clone()));
                    (seq, dial)
                }
            }
        };

        let result = dial.await;

        let mut pending = self.pending_outbound.lock();
        if pending.get(&peer.id()).map(|(s, _)| *s) == Some(seq) {
            pending.remove(&peer.id());
        }
        drop(pending);

        Ok(result?)
    }

    /// Race every reachable address of the peer; first connection wins
    /// and the rest are cancelled.
    async fn dial(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        addresses: Vec<Multiaddr>,
        cancel: CancellationToken,
    ) -> Result<Arc<PeerConnection>, SwarmError> {
        // Never dial an address this swarm is listening on.
        let listen_tails: Vec<Multiaddr> = self
            .listeners
            .lock()
            .keys()
            .map(addr::transport_tail)
            .collect();
        let mut candidates: Vec<Multiaddr> = Vec::new();
        for address in &addresses {
            let tail = addr::transport_tail(address);
            if listen_tails.contains(&tail) {
                continue;
            }
            let full = tail.with(Protocol::P2p(peer.id()));
            if !candidates.contains(&full) {
                candidates.push(full);
            }
        }
        if candidates.is_empty() {
            return Err(SwarmError::NoAddresses(peer.id()));
        }

        trace!(peer = %peer, ?candidates, "dialing");
        let attempts = candidates.into_iter().map(|address| {
            let swarm = self.clone();
            let peer = peer.clone();
            let cancel = cancel.child_token();
            async move { swarm.dial_one(&peer, &address, cancel).await }.boxed()
        });

        let raced = tokio::time::timeout(self.config.connect_timeout, future::select_ok(attempts))
            .await
            .map_err(|_| SwarmError::DialTimeout(peer.id()))?;
        let (conn, losers) = raced?;
        drop(losers);

        conn.add_protocols(self.protocols.snapshot());
        match self.finish_outbound(&conn, &cancel).await {
            Ok(retained) => Ok(retained),
            Err(e) => {
                conn.dispose();
                Err(e)
            }
        }
    }

    async fn finish_outbound(
        self: &Arc<Self>,
        conn: &Arc<PeerConnection>,
        cancel: &CancellationToken,
    ) -> Result<Arc<PeerConnection>, SwarmError> {
        conn.initiate(cancel).await?;
        let record = conn
            .identity_slot()
            .peek()
            .ok_or(SwarmError::Disposed)?;
        let remote = self.register_peer(record)?;
        conn.set_remote_peer(remote.clone());

        let retained = self.manager.add(conn.clone());
        if Arc::ptr_eq(&retained, conn) {
            info!(peer = %remote, addr = %conn.remote_addr(), "connection established");
            self.events.connection_established(conn.clone());
        }
        Ok(retained)
    }

    /// Open one transport connection and wrap it into an outbound
    /// [`PeerConnection`].
    async fn dial_one(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        address: &Multiaddr,
        cancel: CancellationToken,
    ) -> Result<Arc<PeerConnection>, SwarmError> {
        if !self.policy.is_address_allowed(address) {
            return Err(SwarmError::AddressDenied(address.clone()));
        }
        let transport_name = addr::dial_transport(address)?;
        let transport = self
            .transports
            .get(transport_name)
            .ok_or_else(|| SwarmError::UnknownTransport(transport_name.to_string()))?;

        let stream = transport.connect(address, cancel).await?;
        let stream: DynStream = Box::new(MeteredStream::new(stream, self.bandwidth.clone()));
        let protector = self.protector.read().clone();
        let stream = match protector {
            Some(protector) => protector.protect(stream).await?,
            None => stream,
        };

        Ok(PeerConnection::outbound(
            self.local_peer.clone(),
            self.local_key.clone(),
            peer.clone(),
            address.clone(),
            stream,
            self.events.clone(),
        ))
    }

    /// Dispose every connection to the peer named by `address`.
    pub fn disconnect(&self, address: &Multiaddr) -> Result<(), SwarmError> {
        let peer_id = addr::require_peer_id(address)?;
        self.manager.remove_peer(&peer_id);
        Ok(())
    }

    // -- listeners --------------------------------------------------------

    /// Start listening. Returns the first recorded listen address with
    /// the local peer id attached (a zero port resolves to the kernel's
    /// choice).
    pub async fn start_listening(
        self: &Arc<Self>,
        address: &Multiaddr,
    ) -> Result<Multiaddr, SwarmError> {
        if !self.is_running() {
            return Err(SwarmError::NotRunning);
        }
        if self.listeners.lock().contains_key(address) {
            return Err(SwarmError::DuplicateListener(address.clone()));
        }

        let transport_name = listen_transport(address)?;
        let transport = self
            .transports
            .get(transport_name)
            .ok_or_else(|| SwarmError::UnknownTransport(transport_name.to_string()))?;

        let token = self.shutdown_token().child_token();
        let weak = Arc::downgrade(self);
        let handler: AcceptHandler = Arc::new(move |stream, local, remote| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(swarm) = weak.upgrade() {
                    swarm.on_remote_connect(stream, local, remote).await;
                }
            })
        });

        let actual = transport.listen(address, handler, token.clone()).await?;

        let group = self.seq.fetch_add(1, Ordering::Relaxed);
        let recorded: Vec<Multiaddr> = addr::expand_wildcard(&actual)
            .into_iter()
            .map(|a| addr::with_peer_id(&a, self.local_peer.id()))
            .collect();
        {
            let mut listeners = self.listeners.lock();
            listeners.insert(
                address.clone(),
                ListenerEntry {
                    group,
                    token: token.clone(),
                },
            );
            for recorded_addr in &recorded {
                listeners.insert(
                    recorded_addr.clone(),
                    ListenerEntry {
                        group,
                        token: token.clone(),
                    },
                );
            }
        }
        self.local_peer.add_addresses(recorded.clone());
        info!(address = %actual, "listener established");
        self.events.listener_established(self.local_peer.clone());

        Ok(recorded
            .first()
            .cloned()
            .unwrap_or_else(|| addr::with_peer_id(&actual, self.local_peer.id())))
    }

    /// Cancel the listener behind `address` and forget every listener
    /// address derived from it.
    pub fn stop_listening(&self, address: &Multiaddr) {
        let mut listeners = self.listeners.lock();
        let Some(entry) = listeners.remove(address) else {
            return;
        };
        entry.token.cancel();
        let group = entry.group;
        let removed: Vec<Multiaddr> = listeners
            .iter()
            .filter(|(_, e)| e.group == group)
            .map(|(a, _)| a.clone())
            .collect();
        for a in &removed {
            listeners.remove(a);
        }
        drop(listeners);

        self.local_peer
            .retain_addresses(|a| *a != *address && !removed.contains(a));
        debug!(%address, "stopped listening");
    }

    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.listeners.lock().keys().cloned().collect()
    }

    // -- inbound ----------------------------------------------------------

    /// Accept-side entry point, invoked by transports for every inbound
    /// stream.
    pub async fn on_remote_connect(
        self: Arc<Self>,
        stream: DynStream,
        local: Multiaddr,
        remote: Multiaddr,
    ) {
        if !self.is_running() {
            return;
        }
        if !self.policy.is_address_allowed(&remote) {
            debug!(%remote, "inbound connection denied by policy");
            return;
        }
        // First inbound connection per remote address wins; a
        // concurrent second one is dropped here.
        if !self.pending_inbound.lock().insert(remote.clone()) {
            debug!(%remote, "duplicate inbound connection, closing");
            return;
        }

        if let Err(e) = self.handle_inbound(stream, local, remote.clone()).await {
            if !e.is_cancelled() {
                debug!(%remote, error = %e, "inbound handshake failed");
            }
        }
        self.pending_inbound.lock().remove(&remote);
    }

    async fn handle_inbound(
        self: &Arc<Self>,
        stream: DynStream,
        local: Multiaddr,
        remote: Multiaddr,
    ) -> Result<(), SwarmError> {
        let stream: DynStream = Box::new(MeteredStream::new(stream, self.bandwidth.clone()));
        let protector = self.protector.read().clone();
        let stream = match protector {
            Some(protector) => protector.protect(stream).await?,
            None => stream,
        };

        let conn = PeerConnection::inbound(
            self.local_peer.clone(),
            self.local_key.clone(),
            local,
            remote,
            stream,
            self.events.clone(),
        );
        conn.add_protocols(self.protocols.snapshot());

        let cancel = self.shutdown_token().child_token();
        tokio::spawn(conn.clone().read_messages(cancel.clone()));

        let handshake = tokio::time::timeout(self.config.connect_timeout, async {
            conn.security_slot()
                .wait()
                .await
                .map_err(|_| SwarmError::Disposed)?;
            let muxer = conn
                .muxer_slot()
                .wait()
                .await
                .map_err(|_| SwarmError::Disposed)?;
            conn.run_identify(&muxer, &cancel).await
        })
        .await;

        let record = match handshake {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                conn.dispose();
                return Err(e);
            }
            Err(_) => {
                conn.dispose();
                return Err(SwarmError::HandshakeTimeout);
            }
        };

        let remote_peer = match self.register_peer(record) {
            Ok(peer) => peer,
            Err(e) => {
                conn.dispose();
                return Err(e);
            }
        };
        conn.set_remote_peer(remote_peer.clone());

        let retained = self.manager.add(conn.clone());
        if Arc::ptr_eq(&retained, &conn) {
            info!(peer = %remote_peer, addr = %conn.remote_addr(), "inbound connection established");
            self.events.connection_established(conn.clone());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("local_peer", &self.local_peer.id())
            .field("running", &self.is_running())
            .field("known_peers", &self.known_peers.read().len())
            .finish_non_exhaustive()
    }
}

/// The transport registry key for a listen address (no peer id suffix
/// required).
fn listen_transport(address: &Multiaddr) -> Result<&'static str, SwarmError> {
    for protocol in address.iter() {
        match protocol {
            Protocol::Tcp(_) => return Ok("tcp"),
            Protocol::Udp(_) => return Ok("udp"),
            _ => {}
        }
    }
    Err(SwarmError::UnknownTransport(address.to_string()))
}
