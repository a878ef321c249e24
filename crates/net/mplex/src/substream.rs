//! A logical bidirectional stream inside a muxer.
//!
//! The read side is fed by the muxer loop through an unbounded channel;
//! the write side serialises frames through the muxer's write mutex.
//! Substreams hold only a weak back-pointer, so dropping the muxer drops
//! them safely.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::trace;

use crate::frame::{Header, PacketType};
use crate::muxer::{MuxerEvent, Shared};

type WriteFuture = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;
type CloseFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

pub struct Substream {
    id: u64,
    name: String,
    /// True when this side opened the stream.
    local: bool,
    shared: Weak<Shared>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    current: Bytes,
    write_closed: bool,
    write_fut: Option<WriteFuture>,
    close_fut: Option<CloseFuture>,
}

impl Substream {
    pub(crate) fn new(
        id: u64,
        name: String,
        local: bool,
        shared: Weak<Shared>,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            id,
            name,
            local,
            shared,
            data_rx,
            current: Bytes::new(),
            write_closed: false,
            write_fut: None,
            close_fut: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when this side initiated the stream (id parity follows the
    /// muxer role).
    pub fn is_local(&self) -> bool {
        self.local
    }

    fn message_type(&self) -> PacketType {
        if self.local {
            PacketType::MessageInitiator
        } else {
            PacketType::MessageReceiver
        }
    }

    fn close_type(&self) -> PacketType {
        if self.local {
            PacketType::CloseInitiator
        } else {
            PacketType::CloseReceiver
        }
    }
}

impl AsyncRead for Substream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.remaining());
                buf.put_slice(&self.current[..n]);
                self.current.advance(n);
                return Poll::Ready(Ok(()));
            }
            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => self.current = bytes,
                // All senders gone: remote closed or muxer torn down.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Substream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if self.write_fut.is_none() {
            let Some(shared) = self.shared.upgrade() else {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            };
            let header = Header::new(self.id, self.message_type());
            let data = Bytes::copy_from_slice(buf);
            let len = data.len();
            self.write_fut = Some(Box::pin(async move {
                shared
                    .write_packet(header, &data)
                    .await
                    .map_err(io::Error::from)?;
                Ok(len)
            }));
        }
        let result = self.write_fut.as_mut().expect("just set").as_mut().poll(cx);
        if result.is_ready() {
            self.write_fut = None;
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames flush the channel as they are written.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed && self.close_fut.is_none() {
            return Poll::Ready(Ok(()));
        }
        if self.close_fut.is_none() {
            let Some(shared) = self.shared.upgrade() else {
                self.write_closed = true;
                return Poll::Ready(Ok(()));
            };
            let header = Header::new(self.id, self.close_type());
            // Half-close: the map entry stays, so remote data keeps
            // arriving until the matching close from the other side.
            self.close_fut = Some(Box::pin(async move {
                shared
                    .write_packet(header, &[])
                    .await
                    .map_err(io::Error::from)
            }));
        }
        let result = self.close_fut.as_mut().expect("just set").as_mut().poll(cx);
        if result.is_ready() {
            self.close_fut = None;
            self.write_closed = true;
        }
        result
    }
}

impl Drop for Substream {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let removed = shared.substreams.lock().remove(&self.id);
        if let Some(entry) = removed {
            trace!(id = self.id, name = %entry.name, "substream dropped");
            shared.emit(MuxerEvent::SubstreamClosed {
                id: self.id,
                name: entry.name,
            });
            if !self.write_closed {
                let header = Header::new(self.id, self.close_type());
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = shared.write_packet(header, &[]).await;
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for Substream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substream")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("local", &self.local)
            .finish()
    }
}
