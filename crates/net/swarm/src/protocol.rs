//! The per-connection protocol dispatch table and its capability seams.
//!
//! Closed concerns (the muxer endpoint) are enum variants; open concerns
//! (security upgrades, stream-served protocols, private-network
//! protectors) are trait objects plugged in at registration time.

use std::sync::Arc;

use async_trait::async_trait;
use lattice_net_multistream::{split_protocol_id, Version};
use lattice_net_primitives::{DynStream, RawStream};
use parking_lot::RwLock;

use crate::connection::PeerConnection;
use crate::security::SecurityProtocol;
use crate::SwarmError;

/// A protocol served over an individual stream (the connection's base
/// stream during the handshake, a muxed substream afterwards).
#[async_trait]
pub trait StreamProtocol: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// The versioned id this protocol negotiates under.
    fn id(&self) -> String {
        format!("/{}/{}", self.name(), self.version())
    }

    /// Serve one stream that negotiated this protocol.
    async fn handle(
        &self,
        conn: Arc<PeerConnection>,
        stream: &mut (dyn RawStream + '_),
    ) -> Result<(), SwarmError>;
}

/// Transforms raw streams for private networks before any negotiation.
#[async_trait]
pub trait NetworkProtector: Send + Sync {
    async fn protect(&self, stream: DynStream) -> Result<DynStream, SwarmError>;
}

/// What to do with a stream once a protocol id is negotiated.
#[derive(Clone)]
pub enum ProtocolHandler {
    /// Upgrade the base stream through a secure channel.
    Security(Arc<dyn SecurityProtocol>),
    /// Hand the base stream over to the multiplexer.
    Muxer,
    /// Delegate the stream to a protocol handler.
    Stream(Arc<dyn StreamProtocol>),
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Security(p) => write!(f, "Security({})", p.id()),
            Self::Muxer => write!(f, "Muxer"),
            Self::Stream(p) => write!(f, "Stream({})", p.id()),
        }
    }
}

/// Ordered mapping of versioned protocol id -> handler.
///
/// Registration order is meaningful for the security set (tried in that
/// order); version ordering inside one name is semver-descending.
#[derive(Debug, Default)]
pub struct ProtocolTable {
    entries: RwLock<Vec<(String, ProtocolHandler)>>,
}

impl ProtocolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous entry for the id.
    pub fn add(&self, id: impl Into<String>, handler: ProtocolHandler) {
        let id = id.into();
        let mut entries = self.entries.write();
        entries.retain(|(existing, _)| *existing != id);
        entries.push((id, handler));
    }

    pub fn add_all<I: IntoIterator<Item = (String, ProtocolHandler)>>(&self, entries: I) {
        for (id, handler) in entries {
            self.add(id, handler);
        }
    }

    pub fn add_stream_protocol(&self, protocol: Arc<dyn StreamProtocol>) {
        self.add(protocol.id(), ProtocolHandler::Stream(protocol));
    }

    pub fn add_security_protocol(&self, protocol: Arc<dyn SecurityProtocol>) {
        self.add(protocol.id(), ProtocolHandler::Security(protocol));
    }

    pub fn add_muxer(&self, id: impl Into<String>) {
        self.add(id, ProtocolHandler::Muxer);
    }

    pub fn get(&self, id: &str) -> Option<ProtocolHandler> {
        self.entries
            .read()
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, handler)| handler.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// The security set, in registration order.
    pub fn security_protocols(&self) -> Vec<(String, Arc<dyn SecurityProtocol>)> {
        self.entries
            .read()
            .iter()
            .filter_map(|(id, handler)| match handler {
                ProtocolHandler::Security(p) => Some((id.clone(), p.clone())),
                _ => None,
            })
            .collect()
    }

    /// Registered ids sharing a name, ordered semver-descending.
    pub fn ids_for_name(&self, name: &str) -> Vec<String> {
        let mut matching: Vec<(Version, String)> = self
            .entries
            .read()
            .iter()
            .filter_map(|(id, _)| {
                let (entry_name, version) = split_protocol_id(id)?;
                (entry_name == name).then(|| {
                    (
                        version.parse().unwrap_or(Version::ZERO),
                        id.clone(),
                    )
                })
            })
            .collect();
        matching.sort_by(|a, b| b.0.cmp(&a.0));
        matching.into_iter().map(|(_, id)| id).collect()
    }

    /// A copy of every entry, for mounting onto a fresh connection.
    pub fn snapshot(&self) -> Vec<(String, ProtocolHandler)> {
        self.entries.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str, &'static str);

    #[async_trait]
    impl StreamProtocol for Dummy {
        fn name(&self) -> &str {
            self.0
        }
        fn version(&self) -> &str {
            self.1
        }
        async fn handle(
            &self,
            _conn: Arc<PeerConnection>,
            _stream: &mut (dyn RawStream + '_),
        ) -> Result<(), SwarmError> {
            Ok(())
        }
    }

    #[test]
    fn versions_order_descending() {
        let table = ProtocolTable::new();
        table.add_stream_protocol(Arc::new(Dummy("echo", "1.0.0")));
        table.add_stream_protocol(Arc::new(Dummy("echo", "2.1.0")));
        table.add_stream_protocol(Arc::new(Dummy("echo", "2.0.3")));
        table.add_stream_protocol(Arc::new(Dummy("other", "9.0.0")));

        assert_eq!(
            table.ids_for_name("echo"),
            vec!["/echo/2.1.0", "/echo/2.0.3", "/echo/1.0.0"]
        );
    }

    #[test]
    fn re_registration_replaces() {
        let table = ProtocolTable::new();
        table.add_stream_protocol(Arc::new(Dummy("echo", "1.0.0")));
        table.add_stream_protocol(Arc::new(Dummy("echo", "1.0.0")));
        assert_eq!(table.snapshot().len(), 1);
        assert!(table.contains("/echo/1.0.0"));
    }
}
