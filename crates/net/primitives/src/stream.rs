//! The duplex byte stream abstraction and its byte-counting wrapper.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::bandwidth::BandwidthMeter;

/// A duplex byte stream as produced by a transport or a secure channel.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> RawStream for T {}

/// Boxed stream handed between handshake stages.
pub type DynStream = Box<dyn RawStream>;

/// A stream wrapper feeding transferred byte counts into a
/// [`BandwidthMeter`].
pub struct MeteredStream<S> {
    inner: S,
    meter: BandwidthMeter,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, meter: BandwidthMeter) -> Self {
        Self { inner, meter }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.meter.record_inbound((buf.filled().len() - before) as u64);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.meter.record_outbound(n as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_bytes_both_ways() {
        let meter = BandwidthMeter::new();
        let (a, b) = tokio::io::duplex(64);
        let mut metered = MeteredStream::new(a, meter.clone());
        let mut other = b;

        metered.write_all(b"hello").await.unwrap();
        metered.flush().await.unwrap();

        let mut buf = [0u8; 5];
        other.read_exact(&mut buf).await.unwrap();
        other.write_all(b"worlds!").await.unwrap();

        let mut buf = [0u8; 7];
        metered.read_exact(&mut buf).await.unwrap();

        assert_eq!(meter.total_outbound(), 5);
        assert_eq!(meter.total_inbound(), 7);
    }
}
