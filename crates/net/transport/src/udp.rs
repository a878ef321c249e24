//! UDP transport: connected-datagram streams, dial side only.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use lattice_net_primitives::DynStream;
use multiaddr::Multiaddr;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{socket_addr, AcceptHandler, Transport, TransportError};

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTransport;

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(
        &self,
        addr: &Multiaddr,
        cancel: CancellationToken,
    ) -> Result<DynStream, TransportError> {
        let target = socket_addr(addr, "udp")?;
        let bind: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            socket = async {
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(target).await?;
                io::Result::Ok(socket)
            } => socket?,
        };
        trace!(%addr, "udp socket connected");
        Ok(Box::new(UdpStream { socket }))
    }

    async fn listen(
        &self,
        _addr: &Multiaddr,
        _handler: AcceptHandler,
        _cancel: CancellationToken,
    ) -> Result<Multiaddr, TransportError> {
        Err(TransportError::ListenUnsupported)
    }
}

/// A connected UDP socket exposed as a duplex byte stream. Each write is
/// one datagram; reads yield one datagram at a time.
struct UdpStream {
    socket: UdpSocket,
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
