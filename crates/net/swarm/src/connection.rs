//! A single peer connection and its multi-stage handshake.
//!
//! Outbound, `initiate` drives the pipeline on the base stream:
//! multistream header, secure-channel negotiation, header again on the
//! upgraded stream, mplex negotiation, then the identify exchange over a
//! fresh substream. Inbound, `read_messages` runs the multistream accept
//! loop against the connection's protocol table and the same completion
//! slots fill in as handlers run.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lattice_net_mplex::{Muxer, Substream};
use lattice_net_multistream::{self as multistream, NegotiationError};
use lattice_net_primitives::{addr, DynStream, Keypair, Multiaddr, Peer, RawStream};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::completion::Completion;
use crate::events::EventEmitter;
use crate::identify::{self, IdentifyRecord};
use crate::protocol::{ProtocolHandler, ProtocolTable, StreamProtocol};
use crate::security::SecurityProtocol;
use crate::util::with_cancel;
use crate::SwarmError;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One transport connection to one peer.
pub struct PeerConnection {
    direction: Direction,
    local_peer: Arc<Peer>,
    local_key: Option<Keypair>,
    remote_peer: RwLock<Option<Arc<Peer>>>,
    local_addr: Option<Multiaddr>,
    remote_addr: Multiaddr,
    stream: Mutex<Option<DynStream>>,
    muxer: RwLock<Option<Muxer>>,
    protocols: ProtocolTable,
    security: Completion<bool>,
    muxer_slot: Completion<Muxer>,
    identity: Completion<Arc<Peer>>,
    disposed: AtomicBool,
    closed: CancellationToken,
    events: EventEmitter,
}

impl PeerConnection {
    pub fn outbound(
        local_peer: Arc<Peer>,
        local_key: Option<Keypair>,
        remote_peer: Arc<Peer>,
        remote_addr: Multiaddr,
        stream: DynStream,
        events: EventEmitter,
    ) -> Arc<Self> {
        Arc::new(Self {
            direction: Direction::Outbound,
            local_peer,
            local_key,
            remote_peer: RwLock::new(Some(remote_peer)),
            local_addr: None,
            remote_addr,
            stream: Mutex::new(Some(stream)),
            muxer: RwLock::new(None),
            protocols: ProtocolTable::new(),
            security: Completion::new(),
            muxer_slot: Completion::new(),
            identity: Completion::new(),
            disposed: AtomicBool::new(false),
            closed: CancellationToken::new(),
            events,
        })
    }

    pub fn inbound(
        local_peer: Arc<Peer>,
        local_key: Option<Keypair>,
        local_addr: Multiaddr,
        remote_addr: Multiaddr,
        stream: DynStream,
        events: EventEmitter,
    ) -> Arc<Self> {
        Arc::new(Self {
            direction: Direction::Inbound,
            local_peer,
            local_key,
            remote_peer: RwLock::new(None),
            local_addr: Some(local_addr),
            remote_addr,
            stream: Mutex::new(Some(stream)),
            muxer: RwLock::new(None),
            protocols: ProtocolTable::new(),
            security: Completion::new(),
            muxer_slot: Completion::new(),
            identity: Completion::new(),
            disposed: AtomicBool::new(false),
            closed: CancellationToken::new(),
            events,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn local_peer(&self) -> Arc<Peer> {
        self.local_peer.clone()
    }

    pub fn local_key(&self) -> Option<&Keypair> {
        self.local_key.as_ref()
    }

    pub fn remote_peer(&self) -> Option<Arc<Peer>> {
        self.remote_peer.read().clone()
    }

    pub fn set_remote_peer(&self, peer: Arc<Peer>) {
        *self.remote_peer.write() = Some(peer);
    }

    pub fn local_addr(&self) -> Option<&Multiaddr> {
        self.local_addr.as_ref()
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn muxer(&self) -> Option<Muxer> {
        self.muxer.read().clone()
    }

    pub fn security_slot(&self) -> &Completion<bool> {
        &self.security
    }

    pub fn muxer_slot(&self) -> &Completion<Muxer> {
        &self.muxer_slot
    }

    pub fn identity_slot(&self) -> &Completion<Arc<Peer>> {
        &self.identity
    }

    /// Cancelled exactly once, when the connection is disposed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Active means the connection can still move bytes: either the
    /// handshake owns a live base stream or the muxer is open.
    pub fn is_active(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        match self.muxer.read().as_ref() {
            Some(muxer) => muxer.is_open(),
            None => self.stream.lock().is_some(),
        }
    }

    pub fn protocols(&self) -> &ProtocolTable {
        &self.protocols
    }

    pub fn add_protocol(&self, id: impl Into<String>, handler: ProtocolHandler) {
        self.protocols.add(id, handler);
    }

    pub fn add_protocols<I: IntoIterator<Item = (String, ProtocolHandler)>>(&self, entries: I) {
        self.protocols.add_all(entries);
    }

    pub fn add_stream_protocol(&self, protocol: Arc<dyn StreamProtocol>) {
        self.protocols.add_stream_protocol(protocol);
    }

    fn take_stream(&self) -> Option<DynStream> {
        self.stream.lock().take()
    }

    /// Offer the registered versions of `name` in semver-descending
    /// order on an already-headered stream.
    pub async fn establish_protocol<S>(
        &self,
        name: &str,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<String, SwarmError>
    where
        S: RawStream + ?Sized,
    {
        let candidates = self.protocols.ids_for_name(name);
        with_cancel(cancel, async {
            multistream::select_without_header(stream, candidates)
                .await
                .map_err(Into::into)
        })
        .await
    }

    /// Drive the outbound handshake to completion. Any stage failure
    /// disposes the connection and cancels all three completion slots.
    pub async fn initiate(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), SwarmError> {
        let result = self.initiate_inner(cancel).await;
        if let Err(e) = &result {
            debug!(remote = %self.remote_addr, error = %e, "handshake failed");
            self.dispose();
        }
        result
    }

    async fn initiate_inner(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), SwarmError> {
        let mut stream = self.take_stream().ok_or(SwarmError::Disposed)?;

        // 1. multistream header on the raw stream.
        with_cancel(cancel, async {
            multistream::connect_header(&mut stream)
                .await
                .map_err(Into::into)
        })
        .await?;

        // 2. secure channel: registration order, aggregate what failed.
        let mut failures = Vec::new();
        let mut chosen: Option<Arc<dyn SecurityProtocol>> = None;
        for (id, protocol) in self.protocols.security_protocols() {
            let accepted = with_cancel(cancel, async {
                multistream::offer(&mut stream, &id).await.map_err(Into::into)
            })
            .await?;
            if accepted {
                chosen = Some(protocol);
                break;
            }
            failures.push(format!("{id}: refused by remote"));
        }
        let protocol = chosen.ok_or(SwarmError::SecurityFailed(failures))?;
        let mut stream = protocol.encrypt(self, stream, cancel).await?;
        trace!(protocol = %protocol.id(), "secure channel negotiated");

        // 3. multistream header again on the upgraded stream.
        with_cancel(cancel, async {
            multistream::connect_header(&mut stream)
                .await
                .map_err(Into::into)
        })
        .await?;

        // 4. multiplexer.
        self.establish_protocol("mplex", &mut stream, cancel).await?;
        let muxer = Muxer::new(stream, true);
        self.bind_muxer(muxer.clone());

        // 5. identify the remote over a fresh substream.
        self.run_identify(&muxer, cancel).await?;
        Ok(())
    }

    /// Bind the negotiated muxer: resolve the slot, start the read loop,
    /// the substream dispatcher, and the teardown watcher.
    pub(crate) fn bind_muxer(self: &Arc<Self>, muxer: Muxer) {
        *self.muxer.write() = Some(muxer.clone());
        self.muxer_slot.try_resolve(muxer.clone());

        let loop_muxer = muxer.clone();
        let loop_cancel = self.closed.child_token();
        tokio::spawn(async move {
            if let Err(e) = loop_muxer.process_requests(loop_cancel).await {
                debug!(error = %e, "muxer read loop failed");
            }
        });

        // Muxer death takes the whole connection with it.
        let watcher_conn = self.clone();
        let muxer_closed = muxer.closed_token();
        tokio::spawn(async move {
            muxer_closed.cancelled().await;
            watcher_conn.dispose();
        });

        let acceptor_conn = self.clone();
        let acceptor_cancel = self.closed.child_token();
        tokio::spawn(async move {
            loop {
                let substream = tokio::select! {
                    _ = acceptor_cancel.cancelled() => break,
                    substream = muxer.accept_substream() => substream,
                };
                let Some(substream) = substream else { break };
                let conn = acceptor_conn.clone();
                let cancel = acceptor_cancel.clone();
                tokio::spawn(async move {
                    conn.dispatch_substream(substream, cancel).await;
                });
            }
        });
    }

    /// Query the remote's identity, resolving the identity slot with the
    /// validated record merged with the connection's remote address.
    pub(crate) async fn run_identify(
        self: &Arc<Self>,
        muxer: &Muxer,
        cancel: &CancellationToken,
    ) -> Result<Arc<Peer>, SwarmError> {
        let mut stream = muxer.create_stream("identify").await?;

        with_cancel(cancel, async {
            multistream::connect_header(&mut stream)
                .await
                .map_err(Into::into)
        })
        .await?;
        self.establish_protocol(identify::NAME, &mut stream, cancel)
            .await?;

        let record = with_cancel(cancel, IdentifyRecord::read(&mut stream)).await?;
        let expected = self.remote_peer().map(|p| p.id());
        let peer = record.into_peer(expected)?;
        peer.add_address(addr::with_peer_id(&self.remote_addr, peer.id()));

        self.identity.try_resolve(peer.clone());
        let _ = muxer.remove_stream(stream.id()).await;
        trace!(peer = %peer, "identity established");
        Ok(peer)
    }

    /// The base-stream read loop: multistream accept against the
    /// protocol table. Exits when the stream ends, the token fires, or
    /// the stream is handed to the muxer; every other exit disposes the
    /// connection.
    pub async fn read_messages(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut stream) = self.take_stream() else {
            return;
        };

        loop {
            let proposal = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                // Disposal must release the socket even before the
                // muxer takes over.
                _ = self.closed.cancelled() => break,
                proposal = multistream::read_proposal(&mut stream) => proposal,
            };
            let proposal = match proposal {
                Ok(p) => p,
                Err(NegotiationError::Framing(e)) if e.is_eof() => {
                    trace!(remote = %self.remote_addr, "connection stream ended");
                    break;
                }
                Err(e) => {
                    debug!(remote = %self.remote_addr, error = %e, "read loop error");
                    break;
                }
            };

            match proposal.as_str() {
                multistream::HEADER => {
                    if let Err(e) = multistream::respond_accept(&mut stream, multistream::HEADER).await {
                        debug!(error = %e, "failed to answer multistream header");
                        break;
                    }
                }
                multistream::LIST => {
                    warn!("remote requested protocol listing, not supported");
                    break;
                }
                name => match self.protocols.get(name) {
                    Some(ProtocolHandler::Security(protocol)) => {
                        if let Err(e) = multistream::respond_accept(&mut stream, name).await {
                            debug!(error = %e, "failed to accept security protocol");
                            break;
                        }
                        match protocol.encrypt(&self, stream, &cancel).await {
                            Ok(upgraded) => stream = upgraded,
                            Err(e) => {
                                warn!(error = %e, "secure channel upgrade failed");
                                self.dispose();
                                return;
                            }
                        }
                    }
                    Some(ProtocolHandler::Muxer) => {
                        if let Err(e) = multistream::respond_accept(&mut stream, name).await {
                            debug!(error = %e, "failed to accept muxer protocol");
                            break;
                        }
                        let muxer = Muxer::new(stream, false);
                        self.bind_muxer(muxer);
                        // The muxer owns the stream now; this loop is done.
                        return;
                    }
                    Some(ProtocolHandler::Stream(protocol)) => {
                        if let Err(e) = multistream::respond_accept(&mut stream, name).await {
                            debug!(error = %e, "failed to accept protocol");
                            break;
                        }
                        if let Err(e) = protocol.handle(self.clone(), &mut stream).await {
                            warn!(protocol = name, error = %e, "protocol handler failed");
                        }
                    }
                    None => {
                        trace!(protocol = name, "unknown protocol proposed");
                        if multistream::respond_unavailable(&mut stream).await.is_err() {
                            break;
                        }
                    }
                },
            }
        }

        self.dispose();
    }

    /// Per-substream multistream dispatch on the accept side.
    async fn dispatch_substream(self: &Arc<Self>, mut substream: Substream, cancel: CancellationToken) {
        let id = substream.id();
        if let Err(e) = multistream::accept_header(&mut substream).await {
            debug!(id, error = %e, "substream header exchange failed");
            self.close_substream(id).await;
            return;
        }

        loop {
            let proposal = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                proposal = multistream::read_proposal(&mut substream) => proposal,
            };
            let proposal = match proposal {
                Ok(p) => p,
                Err(_) => break,
            };

            match proposal.as_str() {
                multistream::HEADER => {
                    if multistream::respond_accept(&mut substream, multistream::HEADER)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                multistream::LIST => {
                    warn!(id, "remote requested protocol listing on substream");
                    break;
                }
                name => match self.protocols.get(name) {
                    Some(ProtocolHandler::Stream(protocol)) => {
                        if multistream::respond_accept(&mut substream, name).await.is_err() {
                            break;
                        }
                        if let Err(e) = protocol.handle(self.clone(), &mut substream).await {
                            warn!(id, protocol = name, error = %e, "substream handler failed");
                        }
                        break;
                    }
                    // Security and muxer upgrades make no sense on a
                    // substream; tell the peer to try something else.
                    _ => {
                        if multistream::respond_unavailable(&mut substream).await.is_err() {
                            break;
                        }
                    }
                },
            }
        }

        drop(substream);
        self.close_substream(id).await;
    }

    async fn close_substream(&self, id: u64) {
        if let Some(muxer) = self.muxer() {
            let _ = muxer.remove_stream(id).await;
        }
    }

    /// Dispose the connection: close the stream exactly once, cancel any
    /// pending completion slot, and publish `ConnectionClosed` once.
    pub fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(remote = %self.remote_addr, direction = ?self.direction, "disposing connection");
        self.stream.lock().take();
        self.security.cancel();
        self.muxer_slot.cancel();
        self.identity.cancel();
        self.closed.cancel();
        self.events.connection_closed(self.clone());
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field(
                "remote_peer",
                &self.remote_peer.read().as_ref().map(|p| p.id()),
            )
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
