//! The mplex packet layout.
//!
//! Each packet is `header-varint || length-varint || payload`, the header
//! encoding `(stream_id << 3) | packet_type`. Unlike multistream frames
//! there is no newline terminator; payload boundaries are byte-exact.

use bytes::Bytes;
use lattice_net_framing as framing;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MplexError;

/// Largest accepted message payload.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// mplex packet types, carried in the low three header bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    NewStream = 0,
    MessageReceiver = 1,
    MessageInitiator = 2,
    CloseReceiver = 3,
    CloseInitiator = 4,
    ResetReceiver = 5,
    ResetInitiator = 6,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Result<Self, MplexError> {
        Ok(match value {
            0 => Self::NewStream,
            1 => Self::MessageReceiver,
            2 => Self::MessageInitiator,
            3 => Self::CloseReceiver,
            4 => Self::CloseInitiator,
            5 => Self::ResetReceiver,
            6 => Self::ResetInitiator,
            other => return Err(MplexError::UnknownPacketType(other)),
        })
    }

    pub fn is_message(self) -> bool {
        matches!(self, Self::MessageReceiver | Self::MessageInitiator)
    }

    /// Close and reset are equivalent at this layer: both end the stream.
    pub fn ends_stream(self) -> bool {
        matches!(
            self,
            Self::CloseReceiver | Self::CloseInitiator | Self::ResetReceiver | Self::ResetInitiator
        )
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub stream_id: u64,
    pub packet_type: PacketType,
}

impl Header {
    pub fn new(stream_id: u64, packet_type: PacketType) -> Self {
        Self {
            stream_id,
            packet_type,
        }
    }

    pub fn encode(self) -> u64 {
        (self.stream_id << 3) | self.packet_type as u64
    }

    pub fn decode(value: u64) -> Result<Self, MplexError> {
        Ok(Self {
            stream_id: value >> 3,
            packet_type: PacketType::from_u8((value & 0x7) as u8)?,
        })
    }
}

/// Read one packet, consuming exactly `length` payload bytes.
pub async fn read_packet<R>(reader: &mut R) -> Result<(Header, Bytes), MplexError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let header = Header::decode(framing::read_varint(reader).await?)?;
    let len = framing::read_varint(reader).await? as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(MplexError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((header, Bytes::from(payload)))
}

/// Write one packet and flush it.
pub async fn write_packet<W>(
    writer: &mut W,
    header: Header,
    payload: &[u8],
) -> Result<(), MplexError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    framing::write_varint(writer, header.encode()).await?;
    framing::write_varint(writer, payload.len() as u64).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_bit_layout() {
        let header = Header::new(1000, PacketType::NewStream);
        assert_eq!(header.encode(), 1000 << 3);
        assert_eq!(Header::decode(1000 << 3).unwrap(), header);

        let header = Header::new(1001, PacketType::MessageReceiver);
        assert_eq!(header.encode(), (1001 << 3) | 1);
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(matches!(
            Header::decode(7),
            Err(MplexError::UnknownPacketType(7))
        ));
    }

    #[tokio::test]
    async fn new_stream_wire_bytes() {
        let mut cursor = Cursor::new(Vec::new());
        write_packet(
            &mut cursor,
            Header::new(1000, PacketType::NewStream),
            b"foo",
        )
        .await
        .unwrap();
        let wire = cursor.into_inner();

        // varint(1000 << 3) == varint(8000) == [0xc0, 0x3e], then
        // varint(3) and the name, with no newline terminator.
        assert_eq!(wire, vec![0xc0, 0x3e, 0x03, b'f', b'o', b'o']);

        let (header, payload) = read_packet(&mut wire.as_slice()).await.unwrap();
        assert_eq!(header, Header::new(1000, PacketType::NewStream));
        assert_eq!(&payload[..], b"foo");
    }
}
