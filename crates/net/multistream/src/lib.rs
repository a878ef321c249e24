//! multistream-select: per-stream protocol negotiation.
//!
//! Every fresh stream (the base connection and each muxed substream)
//! starts with a header exchange, after which the offering side proposes
//! protocol ids until one is echoed back. The accepting side answers
//! known ids with an echo and unknown ids with `"na"`, leaving the stream
//! open for another proposal.

mod error;
mod version;

pub use error::NegotiationError;
pub use version::{split_protocol_id, Version};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use lattice_net_framing as framing;

/// Negotiation header, exchanged in both directions on a fresh stream.
pub const HEADER: &str = "/multistream/1.0.0";
/// Answer for a protocol the accepting side does not serve.
pub const NOT_AVAILABLE: &str = "na";
/// Protocol listing request; receiving it is a protocol error.
pub const LIST: &str = "ls";

/// Offer-side header exchange: send the header, expect it echoed.
pub async fn connect_header<S>(stream: &mut S) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    framing::write_string(stream, HEADER).await?;
    let reply = framing::read_string(stream).await?;
    if reply != HEADER {
        return Err(NegotiationError::InvalidHeader { received: reply });
    }
    Ok(())
}

/// Accept-side header exchange: expect the header, echo it.
pub async fn accept_header<S>(stream: &mut S) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let header = framing::read_string(stream).await?;
    if header != HEADER {
        return Err(NegotiationError::InvalidHeader { received: header });
    }
    framing::write_string(stream, HEADER).await?;
    Ok(())
}

/// Propose a single protocol id; true when the remote echoed it.
pub async fn offer<S>(stream: &mut S, protocol: &str) -> Result<bool, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    framing::write_string(stream, protocol).await?;
    let reply = framing::read_string(stream).await?;
    trace!(%protocol, %reply, "multistream offer answered");
    Ok(reply == protocol)
}

/// Run the full offer-side negotiation: header exchange, then the
/// candidates in the given order. Fails with the offered list when none
/// is accepted.
pub async fn select<S, I>(stream: &mut S, candidates: I) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    connect_header(stream).await?;
    select_without_header(stream, candidates).await
}

/// Offer candidates on a stream whose header exchange already happened.
pub async fn select_without_header<S, I>(
    stream: &mut S,
    candidates: I,
) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut offered = Vec::new();
    for candidate in candidates {
        let candidate = candidate.as_ref();
        if offer(stream, candidate).await? {
            return Ok(candidate.to_owned());
        }
        offered.push(candidate.to_owned());
    }
    Err(NegotiationError::NoAgreement { offered })
}

/// Read the next proposal on the accept side.
pub async fn read_proposal<S>(stream: &mut S) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Ok(framing::read_string(stream).await?)
}

/// Echo an accepted proposal back.
pub async fn respond_accept<S>(stream: &mut S, protocol: &str) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Ok(framing::write_string(stream, protocol).await?)
}

/// Answer `"na"` without closing the stream.
pub async fn respond_unavailable<S>(stream: &mut S) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Ok(framing::write_string(stream, NOT_AVAILABLE).await?)
}
