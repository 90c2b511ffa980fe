//! SOME/IP stream framing for TCP endpoints.
//!
//! A TCP stream carries back-to-back SOME/IP messages; the only framing is
//! the header's own length field. Reads therefore pull the 16-byte header,
//! validate it, and then pull exactly the advertised payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SomeIpError};
use crate::header::{SomeIpHeader, HEADER_SIZE};
use crate::message::SomeIpMessage;

/// Upper bound on a framed message; anything larger is a framing error and
/// terminates the connection.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Read one complete SOME/IP message from an async stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SomeIpMessage> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = SomeIpHeader::from_bytes(&header_buf)?;
    let payload_len = header.payload_length() as usize;

    if header.length < 8 || HEADER_SIZE + payload_len > MAX_FRAME_SIZE {
        return Err(SomeIpError::ProtocolViolation(format!(
            "unreasonable frame length {}",
            header.length
        )));
    }

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok(SomeIpMessage::new(header, payload))
}

/// Write one complete SOME/IP message to an async stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &SomeIpMessage,
) -> Result<()> {
    writer.write_all(&message.header.to_bytes()).await?;
    writer.write_all(&message.payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{MethodId, ServiceId};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let original = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001))
            .payload(b"test payload".as_slice())
            .build();

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &original).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let parsed = read_frame(&mut cursor).await.unwrap();
        assert_eq!(original, parsed);
    }

    #[tokio::test]
    async fn test_frame_empty_payload() {
        let original = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001)).build();

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &original).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let parsed = read_frame(&mut cursor).await.unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let first = SomeIpMessage::request(ServiceId(0x1111), MethodId(0x0001))
            .payload(b"one".as_slice())
            .build();
        let second = SomeIpMessage::request(ServiceId(0x2222), MethodId(0x0002))
            .payload(b"two".as_slice())
            .build();

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &first).await.unwrap();
        write_frame(&mut buffer, &second).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), first);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let msg = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001)).build();
        let mut bytes = msg.to_bytes();
        // Forge an absurd length field.
        bytes[4..8].copy_from_slice(&(u32::MAX).to_be_bytes());

        let mut cursor = Cursor::new(bytes);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(SomeIpError::ProtocolViolation(_))));
    }
}
