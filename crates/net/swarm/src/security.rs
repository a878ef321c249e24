//! Secure channel adapters.
//!
//! A security protocol wraps the connection's base stream in an
//! authenticated one, resolving the connection's security slot on the
//! way. The plaintext variant is the degenerate member of the set, used
//! whenever no real secure channel is configured.

use async_trait::async_trait;
use lattice_net_primitives::DynStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connection::PeerConnection;
use crate::SwarmError;

/// A secure-channel upgrade over the connection's base stream.
#[async_trait]
pub trait SecurityProtocol: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    fn id(&self) -> String {
        format!("/{}/{}", self.name(), self.version())
    }

    /// Authenticate and wrap `stream`, resolving the connection's
    /// security slot as a side effect. Runs symmetrically on both the
    /// dialing and the accepting side after negotiation.
    async fn encrypt(
        &self,
        conn: &PeerConnection,
        stream: DynStream,
        cancel: &CancellationToken,
    ) -> Result<DynStream, SwarmError>;
}

/// No-op secure channel: completes the slot and passes the stream
/// through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl Plaintext {
    pub const NAME: &'static str = "plaintext";
    pub const VERSION: &'static str = "1.0.0";
}

#[async_trait]
impl SecurityProtocol for Plaintext {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        Self::VERSION
    }

    async fn encrypt(
        &self,
        conn: &PeerConnection,
        stream: DynStream,
        _cancel: &CancellationToken,
    ) -> Result<DynStream, SwarmError> {
        // try-set: some paths negotiate plaintext twice; the slot
        // resolves once.
        if conn.security_slot().try_resolve(true) {
            trace!("plaintext channel established");
        }
        Ok(stream)
    }
}
