//! Frame codec
//!
//! Two framings over the same JSON bodies, selected by configuration:
//!
//! - length-prefixed (default): 4-byte big-endian body length, then body
//! - newline-delimited: one JSON body per line
//!
//! A frame that cannot be delimited (bad length, over the size cap, EOF
//! mid-body) is malformed: the caller closes the connection without a
//! response. A frame that delimits fine but carries bad JSON is a
//! protocol-level `BadRequest` instead.

use crate::config::Framing;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a frame body: a 64 KiB command plus envelope overhead.
pub const MAX_FRAME_BYTES: usize = 96 * 1024;

/// Reads frames from one connection.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    framing: Framing,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            inner: BufReader::new(reader),
            framing,
        }
    }

    /// Next frame body. `Ok(None)` is a clean EOF at a frame boundary;
    /// any `Err` means the stream is unusable and must be closed.
    pub async fn next(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match self.framing {
            Framing::LengthPrefixed => self.next_length_prefixed().await,
            Framing::NewlineDelimited => self.next_newline().await,
        }
    }

    async fn next_length_prefixed(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame length {} outside 1..={}", len, MAX_FRAME_BYTES),
            ));
        }
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    async fn next_newline(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut body = Vec::new();
        // bounded read_until: take() guards against an endless line
        let mut limited = (&mut self.inner).take(MAX_FRAME_BYTES as u64 + 1);
        let n = tokio::io::AsyncBufReadExt::read_until(&mut limited, b'\n', &mut body).await?;
        if n == 0 {
            return Ok(None);
        }
        if body.last() != Some(&b'\n') {
            // either over the cap or EOF mid-line
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unterminated or oversized line frame",
            ));
        }
        body.pop();
        if body.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "empty frame",
            ));
        }
        Ok(Some(body))
    }
}

/// Writes frames to one connection.
pub struct FrameWriter<W> {
    inner: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, framing: Framing) -> Self {
        Self {
            inner: writer,
            framing,
        }
    }

    pub async fn write(&mut self, body: &[u8]) -> std::io::Result<()> {
        match self.framing {
            Framing::LengthPrefixed => {
                let mut frame = BytesMut::with_capacity(4 + body.len());
                frame.put_u32(body.len() as u32);
                frame.put_slice(body);
                self.inner.write_all(&frame).await?;
            }
            Framing::NewlineDelimited => {
                self.inner.write_all(body).await?;
                self.inner.write_all(b"\n").await?;
            }
        }
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(framing: Framing, bodies: &[&[u8]]) -> Vec<Vec<u8>> {
        let (client, server) = tokio::io::duplex(1024 * 1024);

        let mut writer = FrameWriter::new(client, framing);
        for body in bodies {
            writer.write(body).await.expect("write");
        }
        // dropping the client end signals EOF to the reader
        drop(writer);

        let mut reader = FrameReader::new(server, framing);
        let mut out = Vec::new();
        while let Some(body) = reader.next().await.expect("read") {
            out.push(body);
        }
        out
    }

    #[tokio::test]
    async fn test_length_prefixed_roundtrip() {
        let bodies: Vec<&[u8]> = vec![br#"{"type":"ping","id":1}"#, br#"{"type":"status","id":2}"#];
        let read = roundtrip(Framing::LengthPrefixed, &bodies).await;
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], bodies[0]);
        assert_eq!(read[1], bodies[1]);
    }

    #[tokio::test]
    async fn test_newline_roundtrip() {
        let bodies: Vec<&[u8]> = vec![br#"{"type":"ping","id":1}"#];
        let read = roundtrip(Framing::NewlineDelimited, &bodies).await;
        assert_eq!(read, vec![bodies[0].to_vec()]);
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_malformed() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0, 0, 0]).await.expect("write");

        let mut reader = FrameReader::new(server, Framing::LengthPrefixed);
        assert!(reader.next().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_malformed() {
        let (mut client, server) = tokio::io::duplex(1024);
        let len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
        client.write_all(&len).await.expect("write");

        let mut reader = FrameReader::new(server, Framing::LengthPrefixed);
        assert!(reader.next().await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_body_is_malformed() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&10u32.to_be_bytes()).await.expect("write");
        client.write_all(b"abc").await.expect("write");
        drop(client);

        let mut reader = FrameReader::new(server, Framing::LengthPrefixed);
        assert!(reader.next().await.is_err());
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (client, server) = tokio::io::duplex(1024);
        drop(client);

        let mut reader = FrameReader::new(server, Framing::LengthPrefixed);
        assert!(reader.next().await.expect("read").is_none());
    }
}
