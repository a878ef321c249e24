//! The identify exchange.
//!
//! After the muxer is up, each side opens a fresh substream, negotiates
//! `/ipfs/id/1.0.0` and reads the responder's record: protocol and agent
//! versions, the public key, listen addresses and the observed remote
//! address, all as length-prefixed blobs inside one outer blob. A record
//! whose key does not hash to the expected peer id is rejected.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use lattice_net_framing as framing;
use lattice_net_primitives::{Multiaddr, Peer, PeerId, PublicKey, RawStream};
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::connection::PeerConnection;
use crate::protocol::StreamProtocol;
use crate::SwarmError;

pub const NAME: &str = "ipfs/id";
pub const VERSION: &str = "1.0.0";

/// Responder side: answers an identify request with the local record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identify;

#[async_trait]
impl StreamProtocol for Identify {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        VERSION
    }

    async fn handle(
        &self,
        conn: Arc<PeerConnection>,
        stream: &mut (dyn RawStream + '_),
    ) -> Result<(), SwarmError> {
        let record = IdentifyRecord::local(&conn)?;
        record.write(stream).await?;
        stream.flush().await?;
        trace!(peer = %conn.local_peer(), "identify record sent");
        Ok(())
    }
}

/// The identity record exchanged over the wire.
#[derive(Debug, Clone)]
pub struct IdentifyRecord {
    pub protocol_version: String,
    pub agent_version: String,
    pub public_key: PublicKey,
    pub listen_addresses: Vec<Multiaddr>,
    pub observed_address: Option<Multiaddr>,
}

impl IdentifyRecord {
    /// The local node's record as seen from `conn`.
    pub fn local(conn: &PeerConnection) -> Result<Self, SwarmError> {
        let local = conn.local_peer();
        let public_key = local.public_key().ok_or_else(|| {
            SwarmError::InvalidIdentity("local peer has no public key".to_string())
        })?;
        Ok(Self {
            protocol_version: local.protocol_version().unwrap_or_default(),
            agent_version: local.agent_version().unwrap_or_default(),
            public_key,
            listen_addresses: local.addresses(),
            observed_address: Some(conn.remote_addr().clone()),
        })
    }

    pub async fn write<S>(&self, stream: &mut S) -> Result<(), SwarmError>
    where
        S: RawStream + ?Sized,
    {
        let mut body = Cursor::new(Vec::new());
        framing::write_blob(&mut body, self.protocol_version.as_bytes()).await?;
        framing::write_blob(&mut body, self.agent_version.as_bytes()).await?;
        framing::write_blob(&mut body, &self.public_key.encode_protobuf()).await?;
        framing::write_varint(&mut body, self.listen_addresses.len() as u64).await?;
        for addr in &self.listen_addresses {
            framing::write_blob(&mut body, &addr.to_vec()).await?;
        }
        let observed = self
            .observed_address
            .as_ref()
            .map(|a| a.to_vec())
            .unwrap_or_default();
        framing::write_blob(&mut body, &observed).await?;

        framing::write_blob(stream, &body.into_inner()).await?;
        Ok(())
    }

    pub async fn read<S>(stream: &mut S) -> Result<Self, SwarmError>
    where
        S: RawStream + ?Sized,
    {
        let body = framing::read_blob(stream).await?;
        let mut body = &body[..];

        let protocol_version = read_string_blob(&mut body).await?;
        let agent_version = read_string_blob(&mut body).await?;
        let key_bytes = framing::read_blob(&mut body).await?;
        let public_key = PublicKey::try_decode_protobuf(&key_bytes)
            .map_err(|e| SwarmError::InvalidIdentity(format!("bad public key: {e}")))?;

        let count = framing::read_varint(&mut body).await?;
        let mut listen_addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let bytes = framing::read_blob(&mut body).await?;
            let addr = Multiaddr::try_from(bytes.to_vec())
                .map_err(|e| SwarmError::InvalidIdentity(format!("bad listen address: {e}")))?;
            listen_addresses.push(addr);
        }

        let observed = framing::read_blob(&mut body).await?;
        let observed_address = if observed.is_empty() {
            None
        } else {
            Some(Multiaddr::try_from(observed.to_vec()).map_err(|e| {
                SwarmError::InvalidIdentity(format!("bad observed address: {e}"))
            })?)
        };

        Ok(Self {
            protocol_version,
            agent_version,
            public_key,
            listen_addresses,
            observed_address,
        })
    }

    /// Turn the record into a peer, enforcing `id == hash(public_key)`
    /// against the id the caller expected to reach, when known.
    pub fn into_peer(self, expected: Option<PeerId>) -> Result<Arc<Peer>, SwarmError> {
        let id = self.public_key.to_peer_id();
        if let Some(expected) = expected {
            if expected != id {
                return Err(SwarmError::InvalidIdentity(format!(
                    "key hashes to {id}, expected {expected}"
                )));
            }
        }
        let peer = Peer::from_public_key(self.public_key);
        if !self.protocol_version.is_empty() {
            peer.set_protocol_version(self.protocol_version);
        }
        if !self.agent_version.is_empty() {
            peer.set_agent_version(self.agent_version);
        }
        peer.add_addresses(self.listen_addresses);
        Ok(Arc::new(peer))
    }
}

async fn read_string_blob(body: &mut &[u8]) -> Result<String, SwarmError> {
    let blob = framing::read_blob(body).await?;
    String::from_utf8(blob.to_vec())
        .map_err(|e| SwarmError::InvalidIdentity(format!("non-utf8 field: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_net_primitives::Keypair;

    #[tokio::test]
    async fn record_roundtrip_and_validation() {
        let key = Keypair::generate_ed25519();
        let record = IdentifyRecord {
            protocol_version: "lattice/1.0.0".to_string(),
            agent_version: "lattice/0.1.0".to_string(),
            public_key: key.public(),
            listen_addresses: vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
            observed_address: Some("/ip4/127.0.0.1/tcp/9999".parse().unwrap()),
        };

        let (mut a, mut b) = tokio::io::duplex(4096);
        record.write(&mut a).await.unwrap();
        let decoded = IdentifyRecord::read(&mut b).await.unwrap();

        assert_eq!(decoded.agent_version, "lattice/0.1.0");
        assert_eq!(decoded.listen_addresses.len(), 1);
        assert_eq!(
            decoded.observed_address.as_ref().map(|a| a.to_string()),
            Some("/ip4/127.0.0.1/tcp/9999".to_string())
        );

        let expected = key.public().to_peer_id();
        let peer = decoded.into_peer(Some(expected)).unwrap();
        assert_eq!(peer.id(), expected);
        assert_eq!(peer.agent_version().as_deref(), Some("lattice/0.1.0"));
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let key = Keypair::generate_ed25519();
        let record = IdentifyRecord {
            protocol_version: String::new(),
            agent_version: String::new(),
            public_key: key.public(),
            listen_addresses: vec![],
            observed_address: None,
        };

        let other = Keypair::generate_ed25519().public().to_peer_id();
        assert!(matches!(
            record.into_peer(Some(other)),
            Err(SwarmError::InvalidIdentity(_))
        ));
    }
}
