//! Substream echo ping; measures round-trip latency per peer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lattice_net_multistream as multistream;
use lattice_net_primitives::RawStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connection::PeerConnection;
use crate::protocol::StreamProtocol;
use crate::SwarmError;

pub const NAME: &str = "ipfs/ping";
pub const VERSION: &str = "1.0.0";

const PING_SIZE: usize = 32;

/// Responder side: echoes 32-byte payloads until the stream ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

#[async_trait]
impl StreamProtocol for Ping {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        VERSION
    }

    async fn handle(
        &self,
        _conn: Arc<PeerConnection>,
        stream: &mut (dyn RawStream + '_),
    ) -> Result<(), SwarmError> {
        let mut payload = [0u8; PING_SIZE];
        loop {
            match stream.read_exact(&mut payload).await {
                Ok(_) => {
                    stream.write_all(&payload).await?;
                    stream.flush().await?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Ping the connection's remote once, recording the measured round trip
/// as the peer's latency.
pub async fn ping(
    conn: &Arc<PeerConnection>,
    cancel: &CancellationToken,
) -> Result<Duration, SwarmError> {
    let muxer = conn.muxer().ok_or(SwarmError::Disposed)?;
    let mut stream = muxer.create_stream("ping").await?;

    multistream::connect_header(&mut stream).await?;
    conn.establish_protocol(NAME, &mut stream, cancel).await?;

    let payload: [u8; PING_SIZE] = rand::random();
    let started = Instant::now();
    stream.write_all(&payload).await?;
    stream.flush().await?;

    let mut echo = [0u8; PING_SIZE];
    stream.read_exact(&mut echo).await?;
    if echo != payload {
        return Err(SwarmError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "ping echo mismatch",
        )));
    }

    let rtt = started.elapsed();
    if let Some(peer) = conn.remote_peer() {
        peer.set_latency(rtt);
        trace!(peer = %peer, ?rtt, "ping round trip");
    }
    let _ = muxer.remove_stream(stream.id()).await;
    Ok(rtt)
}
