//! mplex: many bidirectional substreams over one duplex channel.
//!
//! One [`Muxer`] owns each connection's channel after the handshake. The
//! initiator allocates even stream ids, the receiver odd ones; frame
//! writes are serialised through an async mutex so a frame's bytes are
//! never interleaved.

mod error;
pub mod frame;
mod muxer;
mod substream;

pub use error::MplexError;
pub use frame::{Header, PacketType, MAX_PAYLOAD_LEN};
pub use muxer::{Muxer, MuxerEvent, PROTOCOL_ID};
pub use substream::Substream;
