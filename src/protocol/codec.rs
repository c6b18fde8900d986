//! Length-prefixed framing
//!
//! `FrameReader` is cancel-safe: partially received frames stay in its
//! internal buffer, so `read_frame` can sit in a `tokio::select!` next to
//! cancellation and heartbeat timers without losing data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
use crate::error::{ProtocolError, Result};

/// Prefix a frame body with its length
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Write one frame body to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    writer.write_all(&encode_frame(body)).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads length-prefixed frames from a byte stream
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default maximum frame size
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_size(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a reader that rejects frames larger than `max_frame_size`
    pub fn with_max_frame_size(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Read the next frame body
    ///
    /// Returns `Ok(None)` on a clean end of stream (no partial frame pending).
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::UnexpectedEof.into());
            }
        }
    }

    fn parse_frame(&mut self) -> std::result::Result<Option<Bytes>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = (&self.buf[..FRAME_HEADER_SIZE]).get_u32() as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_SIZE + len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_SIZE);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Get the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frames_split_across_writes() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        let frame = encode_frame(b"hello world");
        tokio::spawn(async move {
            client.write_all(&frame[..3]).await.unwrap();
            client.write_all(&frame[3..]).await.unwrap();
            client.write_all(&encode_frame(b"second")).await.unwrap();
        });

        assert_eq!(&reader.read_frame().await.unwrap().unwrap()[..], b"hello world");
        assert_eq!(&reader.read_frame().await.unwrap().unwrap()[..], b"second");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::with_max_frame_size(server, 4);

        client.write_all(&encode_frame(b"too long")).await.unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Protocol(ProtocolError::FrameTooLarge { size: 8, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        let frame = encode_frame(b"partial");
        client.write_all(&frame[..6]).await.unwrap();
        drop(client);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, crate::Error::Protocol(ProtocolError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        write_frame(&mut client, b"").await.unwrap();
        assert!(reader.read_frame().await.unwrap().unwrap().is_empty());
    }
}
