//! The muxer: one per connection, carrying many substreams over a single
//! duplex channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lattice_net_primitives::DynStream;
use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::frame::{self, Header, PacketType};
use crate::substream::Substream;
use crate::MplexError;

/// Protocol id negotiated for this muxer.
pub const PROTOCOL_ID: &str = "/mplex/6.7.0";

/// First stream id handed out by the connection initiator. The receiver
/// side starts one above, keeping id parity disjoint.
const FIRST_STREAM_ID: u64 = 1000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Substream lifecycle notifications, broadcast per muxer.
#[derive(Debug, Clone)]
pub enum MuxerEvent {
    SubstreamCreated { id: u64, name: String },
    SubstreamClosed { id: u64, name: String },
}

pub(crate) struct StreamEntry {
    pub(crate) name: String,
    pub(crate) data_tx: mpsc::UnboundedSender<Bytes>,
}

pub(crate) struct Shared {
    pub(crate) writer: tokio::sync::Mutex<Option<WriteHalf<DynStream>>>,
    pub(crate) substreams: Mutex<HashMap<u64, StreamEntry>>,
    next_stream_id: AtomicU64,
    initiator: AtomicBool,
    /// Latched once any stream exists; fixes the role.
    allocated: AtomicBool,
    pub(crate) events: broadcast::Sender<MuxerEvent>,
    closed: CancellationToken,
}

impl Shared {
    /// Serialise one packet onto the channel; the write lock is held for
    /// the duration of the frame.
    pub(crate) async fn write_packet(
        &self,
        header: Header,
        payload: &[u8],
    ) -> Result<(), MplexError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(MplexError::Closed)?;
        frame::write_packet(writer, header, payload).await
    }

    pub(crate) fn emit(&self, event: MuxerEvent) {
        let _ = self.events.send(event);
    }
}

/// Handle to a connection's multiplexer. Clones share state; the read
/// loop ([`Muxer::process_requests`]) runs once.
#[derive(Clone)]
pub struct Muxer {
    shared: Arc<Shared>,
    reader: Arc<Mutex<Option<ReadHalf<DynStream>>>>,
    incoming_tx: mpsc::UnboundedSender<Substream>,
    incoming_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Substream>>>,
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("initiator", &self.is_initiator())
            .field("substreams", &self.shared.substreams.lock().len())
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl Muxer {
    /// Take ownership of the connection's channel.
    pub fn new(channel: DynStream, initiator: bool) -> Self {
        let (read_half, write_half) = tokio::io::split(channel);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let first_id = if initiator {
            FIRST_STREAM_ID
        } else {
            FIRST_STREAM_ID + 1
        };
        Self {
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(Some(write_half)),
                substreams: Mutex::new(HashMap::new()),
                next_stream_id: AtomicU64::new(first_id),
                initiator: AtomicBool::new(initiator),
                allocated: AtomicBool::new(false),
                events,
                closed: CancellationToken::new(),
            }),
            reader: Arc::new(Mutex::new(Some(read_half))),
            incoming_tx,
            incoming_rx: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.shared.initiator.load(Ordering::Acquire)
    }

    /// Flip the allocation parity. Only legal while no stream has ever
    /// been opened on this muxer.
    pub fn set_initiator(&self, initiator: bool) -> Result<(), MplexError> {
        if self.shared.allocated.load(Ordering::Acquire) {
            return Err(MplexError::RoleFixed);
        }
        let was = self.shared.initiator.swap(initiator, Ordering::AcqRel);
        if was != initiator {
            if initiator {
                self.shared.next_stream_id.fetch_sub(1, Ordering::AcqRel);
            } else {
                self.shared.next_stream_id.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// True while the channel can still carry frames.
    pub fn is_open(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    /// Cancelled when the read loop terminates; the owning connection
    /// watches this to dispose itself.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MuxerEvent> {
        self.shared.events.subscribe()
    }

    pub fn substream_count(&self) -> usize {
        self.shared.substreams.lock().len()
    }

    pub fn substream_ids(&self) -> Vec<u64> {
        self.shared.substreams.lock().keys().copied().collect()
    }

    /// Open a new substream and announce it to the remote.
    pub async fn create_stream(&self, name: impl Into<String>) -> Result<Substream, MplexError> {
        if !self.is_open() {
            return Err(MplexError::Closed);
        }
        let name = name.into();
        self.shared.allocated.store(true, Ordering::Release);
        let id = self.shared.next_stream_id.fetch_add(2, Ordering::AcqRel);

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        self.shared.substreams.lock().insert(
            id,
            StreamEntry {
                name: name.clone(),
                data_tx,
            },
        );

        if let Err(e) = self
            .shared
            .write_packet(Header::new(id, PacketType::NewStream), name.as_bytes())
            .await
        {
            self.shared.substreams.lock().remove(&id);
            return Err(e);
        }

        trace!(id, %name, "substream created");
        Ok(Substream::new(
            id,
            name,
            true,
            Arc::downgrade(&self.shared),
            data_rx,
        ))
    }

    /// Close a substream by id: announce the close and drop the entry.
    pub async fn remove_stream(&self, id: u64) -> Result<(), MplexError> {
        let entry = self.shared.substreams.lock().remove(&id);
        let Some(entry) = entry else { return Ok(()) };
        let result = self
            .shared
            .write_packet(Header::new(id, PacketType::CloseInitiator), &[])
            .await;
        self.shared.emit(MuxerEvent::SubstreamClosed {
            id,
            name: entry.name,
        });
        result
    }

    /// The next substream opened by the remote, if the muxer is alive.
    pub async fn accept_substream(&self) -> Option<Substream> {
        self.incoming_rx.lock().await.recv().await
    }

    /// The muxer read loop.
    ///
    /// Terminates cleanly on EOF, channel errors and cancellation; an
    /// unknown packet type is the one invalid-data failure surfaced to
    /// the caller. Either way the channel is torn down and every
    /// substream dropped on exit.
    pub async fn process_requests(&self, cancel: CancellationToken) -> Result<(), MplexError> {
        let Some(mut reader) = self.reader.lock().take() else {
            return Ok(());
        };

        let result = loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("muxer read loop cancelled");
                    break Ok(());
                }
                packet = frame::read_packet(&mut reader) => packet,
            };
            match packet {
                Ok((header, payload)) => {
                    if let Err(e) = self.handle_packet(header, payload).await {
                        break Err(e);
                    }
                }
                Err(MplexError::UnknownPacketType(t)) => {
                    warn!(packet_type = t, "unknown mplex packet type, closing channel");
                    break Err(MplexError::UnknownPacketType(t));
                }
                Err(e) => {
                    // EOF, reset and the like all end the channel quietly.
                    debug!(error = %e, "muxer channel ended");
                    break Ok(());
                }
            }
        };

        self.teardown().await;
        result
    }

    async fn handle_packet(&self, header: Header, payload: Bytes) -> Result<(), MplexError> {
        let id = header.stream_id;
        match header.packet_type {
            PacketType::NewStream => {
                if self.shared.substreams.lock().contains_key(&id) {
                    warn!(id, "duplicate NewStream id, ignoring");
                    return Ok(());
                }
                let name = String::from_utf8_lossy(&payload).into_owned();
                self.shared.allocated.store(true, Ordering::Release);

                let (data_tx, data_rx) = mpsc::unbounded_channel();
                self.shared.substreams.lock().insert(
                    id,
                    StreamEntry {
                        name: name.clone(),
                        data_tx,
                    },
                );
                self.shared.emit(MuxerEvent::SubstreamCreated {
                    id,
                    name: name.clone(),
                });

                // Interop shim: the reference implementation expects the
                // receiver to echo a NewStream for odd ids.
                if !self.is_initiator() && id % 2 == 1 {
                    self.shared
                        .write_packet(Header::new(id, PacketType::NewStream), name.as_bytes())
                        .await?;
                }

                let substream =
                    Substream::new(id, name, false, Arc::downgrade(&self.shared), data_rx);
                let _ = self.incoming_tx.send(substream);
            }
            PacketType::MessageReceiver | PacketType::MessageInitiator => {
                let delivered = {
                    let substreams = self.shared.substreams.lock();
                    match substreams.get(&id) {
                        Some(entry) => entry.data_tx.send(payload).is_ok(),
                        None => false,
                    }
                };
                if !delivered {
                    warn!(id, "message for unknown substream, dropping");
                }
            }
            PacketType::CloseReceiver
            | PacketType::CloseInitiator
            | PacketType::ResetReceiver
            | PacketType::ResetInitiator => {
                let entry = self.shared.substreams.lock().remove(&id);
                if let Some(entry) = entry {
                    trace!(id, name = %entry.name, "substream closed by remote");
                    self.shared.emit(MuxerEvent::SubstreamClosed {
                        id,
                        name: entry.name,
                    });
                }
            }
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.shared.closed.cancel();
        // Dropping the write half closes the channel; dropping the
        // entries ends every substream's read side.
        *self.shared.writer.lock().await = None;
        let entries: Vec<(u64, StreamEntry)> =
            self.shared.substreams.lock().drain().collect();
        for (id, entry) in entries {
            self.shared.emit(MuxerEvent::SubstreamClosed {
                id,
                name: entry.name,
            });
        }
    }
}
