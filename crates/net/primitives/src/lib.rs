//! Peer identity, addressing and stream primitives shared across the
//! lattice network stack.
//!
//! - [`Peer`] - a remote (or the local) participant, keyed by the
//!   multihash of its public key
//! - [`addr`] - protocol-level multiaddress helpers (prefix matching,
//!   peer-id extraction, wildcard expansion)
//! - [`RawStream`] / [`DynStream`] - the duplex byte stream every layer
//!   of the stack is written against
//! - [`MeteredStream`] / [`BandwidthMeter`] - byte accounting

pub mod addr;
mod bandwidth;
mod error;
mod peer;
mod stream;

pub use bandwidth::BandwidthMeter;
pub use error::{AddrError, PeerError};
pub use peer::Peer;
pub use stream::{DynStream, MeteredStream, RawStream};

pub use libp2p_identity::{Keypair, PeerId, PublicKey};
pub use multiaddr::{Multiaddr, Protocol};
