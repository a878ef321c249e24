//! TCP transport.

use async_trait::async_trait;
use lattice_net_primitives::DynStream;
use multiaddr::Multiaddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{multiaddr_of, socket_addr, AcceptHandler, Transport, TransportError};

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        addr: &Multiaddr,
        cancel: CancellationToken,
    ) -> Result<DynStream, TransportError> {
        let target = socket_addr(addr, "tcp")?;
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            stream = TcpStream::connect(target) => stream?,
        };
        stream.set_nodelay(true)?;
        trace!(%addr, "tcp connected");
        Ok(Box::new(stream))
    }

    async fn listen(
        &self,
        addr: &Multiaddr,
        handler: AcceptHandler,
        cancel: CancellationToken,
    ) -> Result<Multiaddr, TransportError> {
        let bind = socket_addr(addr, "tcp")?;
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        let local_addr = multiaddr_of(local, "tcp");
        debug!(%local_addr, "tcp listener bound");

        tokio::spawn(accept_loop(listener, local_addr.clone(), handler, cancel));
        Ok(local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: Multiaddr,
    handler: AcceptHandler,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            // Cancellation drops the listener socket on the way out.
            _ = cancel.cancelled() => {
                debug!(%local_addr, "tcp listener stopped");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(%remote, error = %e, "failed to set nodelay");
                }
                let remote_addr = multiaddr_of(remote, "tcp");
                trace!(%remote_addr, "tcp stream accepted");
                // Each stream gets its own task so one slow or failing
                // handler cannot stall the listener.
                tokio::spawn(handler(
                    Box::new(stream) as DynStream,
                    local_addr.clone(),
                    remote_addr,
                ));
            }
            Err(e) => {
                warn!(%local_addr, error = %e, "tcp accept failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn listen_resolves_kernel_port_and_accepts() {
        let transport = TcpTransport;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handler: AcceptHandler = Arc::new(move |mut stream, _local, remote| {
            let tx = tx.clone();
            Box::pin(async move {
                let mut buf = [0u8; 5];
                stream.read_exact(&mut buf).await.unwrap();
                tx.send((buf, remote)).unwrap();
            })
        });

        let wildcard: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
        let bound = transport
            .listen(&wildcard, handler, cancel.clone())
            .await
            .unwrap();
        assert_ne!(bound.to_string(), wildcard.to_string());

        let mut stream = transport.connect(&bound, cancel.clone()).await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let (received, _remote) = rx.recv().await.unwrap();
        assert_eq!(&received, b"hello");

        cancel.cancel();
    }

    #[tokio::test]
    async fn connect_honours_cancellation() {
        let transport = TcpTransport;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        assert!(matches!(
            transport.connect(&addr, cancel).await,
            Err(TransportError::Cancelled)
        ));
    }
}
