//! Wire framing for protocol negotiation.
//!
//! Two encodings share the unsigned-varint length prefix:
//!
//! - **negotiation frames** (`varint(len + 1) || payload || 0x0a`) carry
//!   the short ASCII protocol names exchanged by multistream-select; a
//!   frame without its terminating newline is invalid data
//! - **blobs** (`varint(len) || payload`) carry binary records such as
//!   the identify exchange
//!
//! Both are read byte-exact: a decoder never consumes past the frame it
//! returns.

mod error;

pub use error::FramingError;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Negotiation frames are short protocol names; anything larger is a
/// corrupt stream.
pub const MAX_FRAME_LEN: usize = 1024;

/// Upper bound for length-prefixed blobs (identify records and the like).
pub const MAX_BLOB_LEN: usize = 8192;

const NEWLINE: u8 = 0x0a;

/// Read a base-128 unsigned varint, one byte at a time.
pub async fn read_varint<R>(reader: &mut R) -> Result<u64, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    // u64 varints are at most 10 bytes; the high bit marks continuation.
    let mut buf = [0u8; 10];
    for i in 0..buf.len() {
        buf[i] = reader.read_u8().await?;
        if buf[i] & 0x80 == 0 {
            let (value, _) = unsigned_varint::decode::u64(&buf[..=i])?;
            return Ok(value);
        }
    }
    Err(unsigned_varint::decode::Error::Overflow.into())
}

pub async fn write_varint<W>(writer: &mut W, value: u64) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = unsigned_varint::encode::u64_buffer();
    let encoded = unsigned_varint::encode::u64(value, &mut buf);
    writer.write_all(encoded).await?;
    Ok(())
}

/// Read one negotiation frame, failing when the trailing newline is
/// absent.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let prefixed = read_varint(reader).await? as usize;
    if prefixed == 0 {
        return Err(FramingError::EmptyFrame);
    }
    let len = prefixed - 1;
    if len > MAX_FRAME_LEN {
        return Err(FramingError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    if reader.read_u8().await? != NEWLINE {
        return Err(FramingError::MissingNewline);
    }
    Ok(Bytes::from(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_varint(writer, payload.len() as u64 + 1).await?;
    writer.write_all(payload).await?;
    writer.write_all(&[NEWLINE]).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a negotiation frame as a utf-8 string.
pub async fn read_string<R>(reader: &mut R) -> Result<String, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let frame = read_frame(reader).await?;
    Ok(std::str::from_utf8(&frame)?.to_owned())
}

pub async fn write_string<W>(writer: &mut W, value: &str) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_frame(writer, value.as_bytes()).await
}

/// Read a raw length-prefixed blob (no newline terminator).
pub async fn read_blob<R>(reader: &mut R) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = read_varint(reader).await? as usize;
    if len > MAX_BLOB_LEN {
        return Err(FramingError::FrameTooLarge {
            len,
            max: MAX_BLOB_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

pub async fn write_blob<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_varint(writer, payload.len() as u64).await?;
    writer.write_all(payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    async fn encode_frame(payload: &[u8]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        write_frame(&mut cursor, payload).await.unwrap();
        cursor.into_inner()
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let wire = encode_frame(b"/multistream/1.0.0").await;
        let decoded = read_frame(&mut wire.as_slice()).await.unwrap();
        assert_eq!(&decoded[..], b"/multistream/1.0.0");
    }

    #[tokio::test]
    async fn frame_wire_layout() {
        // "na" -> varint(3) || "na" || '\n'
        assert_eq!(encode_frame(b"na").await, vec![3, b'n', b'a', b'\n']);
    }

    #[tokio::test]
    async fn missing_newline_is_invalid_data() {
        let mut wire = encode_frame(b"ls").await;
        *wire.last_mut().unwrap() = b'x';
        assert!(matches!(
            read_frame(&mut wire.as_slice()).await,
            Err(FramingError::MissingNewline)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut cursor = Cursor::new(Vec::new());
        write_varint(&mut cursor, MAX_FRAME_LEN as u64 + 2).await.unwrap();
        let wire = cursor.into_inner();
        assert!(matches!(
            read_frame(&mut wire.as_slice()).await,
            Err(FramingError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn varint_multibyte() {
        let mut cursor = Cursor::new(Vec::new());
        write_varint(&mut cursor, 1000 << 3).await.unwrap();
        let wire = cursor.into_inner();
        assert_eq!(read_varint(&mut wire.as_slice()).await.unwrap(), 1000 << 3);
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let mut cursor = Cursor::new(Vec::new());
        write_blob(&mut cursor, b"record").await.unwrap();
        let wire = cursor.into_inner();
        // No newline after a blob.
        assert_eq!(wire, vec![6, b'r', b'e', b'c', b'o', b'r', b'd']);
        let decoded = read_blob(&mut wire.as_slice()).await.unwrap();
        assert_eq!(&decoded[..], b"record");
    }

    proptest! {
        #[test]
        fn frame_roundtrip_holds(payload in proptest::collection::vec(any::<u8>(), 0..MAX_FRAME_LEN)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let wire = encode_frame(&payload).await;
                let decoded = read_frame(&mut wire.as_slice()).await.unwrap();
                assert_eq!(&decoded[..], &payload[..]);
            });
        }
    }
}
