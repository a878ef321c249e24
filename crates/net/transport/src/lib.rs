//! Transports: strategies for opening duplex byte streams to
//! multiaddresses, and the registry the swarm selects them from.

mod error;
mod tcp;
mod udp;

pub use error::TransportError;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lattice_net_primitives::DynStream;
use multiaddr::{Multiaddr, Protocol};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Invoked by a listener for every accepted stream, with the listener's
/// local address and the remote address. The handler owns the stream; a
/// failing handler takes down only that stream, never the listener.
pub type AcceptHandler =
    Arc<dyn Fn(DynStream, Multiaddr, Multiaddr) -> BoxFuture<'static, ()> + Send + Sync>;

/// A strategy for opening duplex byte streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream to `addr`. Cancellation releases the underlying
    /// socket; the 30 s connect ceiling is the caller's business.
    async fn connect(
        &self,
        addr: &Multiaddr,
        cancel: CancellationToken,
    ) -> Result<DynStream, TransportError>;

    /// Listen on `addr`, invoking `handler` per accepted stream, until
    /// `cancel` fires. Returns the actual listen address (a zero port is
    /// replaced by the kernel-chosen one).
    async fn listen(
        &self,
        addr: &Multiaddr,
        handler: AcceptHandler,
        cancel: CancellationToken,
    ) -> Result<Multiaddr, TransportError>;
}

/// Transport-protocol-name -> transport.
pub struct TransportRegistry {
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    pub fn empty() -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in tcp and udp transports.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register("tcp", Arc::new(TcpTransport));
        registry.register("udp", Arc::new(UdpTransport));
        registry
    }

    pub fn register(&self, name: impl Into<String>, transport: Arc<dyn Transport>) {
        self.transports.write().insert(name.into(), transport);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.read().get(name).cloned()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field(
                "transports",
                &self.transports.read().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Extract `ip:port` from a `/ip4|ip6/<host>/<tcp|udp>/<port>` prefix.
pub(crate) fn socket_addr(
    addr: &Multiaddr,
    transport: &str,
) -> Result<SocketAddr, TransportError> {
    let mut iter = addr.iter();
    let ip: IpAddr = match iter.next() {
        Some(Protocol::Ip4(ip)) => ip.into(),
        Some(Protocol::Ip6(ip)) => ip.into(),
        _ => return Err(TransportError::UnsupportedAddress(addr.clone())),
    };
    let port = match (iter.next(), transport) {
        (Some(Protocol::Tcp(port)), "tcp") => port,
        (Some(Protocol::Udp(port)), "udp") => port,
        _ => return Err(TransportError::UnsupportedAddress(addr.clone())),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Rebuild a multiaddress from a socket address.
pub(crate) fn multiaddr_of(socket: SocketAddr, transport: &str) -> Multiaddr {
    let host = match socket.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };
    let port = match transport {
        "udp" => Protocol::Udp(socket.port()),
        _ => Protocol::Tcp(socket.port()),
    };
    Multiaddr::empty().with(host).with(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_conversion() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let socket = socket_addr(&addr, "tcp").unwrap();
        assert_eq!(socket.to_string(), "127.0.0.1:4001");
        assert_eq!(multiaddr_of(socket, "tcp"), addr);

        assert!(matches!(
            socket_addr(&addr, "udp"),
            Err(TransportError::UnsupportedAddress(_))
        ));
    }

    #[test]
    fn registry_lookup() {
        let registry = TransportRegistry::new();
        assert!(registry.get("tcp").is_some());
        assert!(registry.get("udp").is_some());
        assert!(registry.get("quic").is_none());
    }
}
