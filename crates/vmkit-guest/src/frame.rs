//! Frame layout: `| stream byte (1) | length (4, big-endian) | payload |`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use vmkit_core::error::{Error, Result};

const SUBSYSTEM: &str = "guest_channel";

/// Frame too large to be a legitimate control message; guards against a
/// desynced stream spinning up an unbounded allocation.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Stdin,
    Stdout,
    Stderr,
    ErrorOrExit,
    Resize,
}

impl StreamId {
    fn as_byte(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
            Self::ErrorOrExit => 3,
            Self::Resize => 4,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            3 => Ok(Self::ErrorOrExit),
            4 => Ok(Self::Resize),
            other => Err(Error::invalid_input(SUBSYSTEM, format!("unknown stream byte {other}"))),
        }
    }
}

/// Read one frame: a 1-byte stream id, a 4-byte big-endian length, then the
/// payload. Returns the stream id and payload bytes.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(StreamId, Vec<u8>)> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;

    let stream = StreamId::from_byte(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME_SIZE {
        return Err(Error::invalid_input(
            SUBSYSTEM,
            format!("frame of {len} bytes exceeds {MAX_FRAME_SIZE} byte limit"),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok((stream, payload))
}

/// Write one frame for `stream` carrying `payload`.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, stream: StreamId, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::invalid_input(SUBSYSTEM, "payload exceeds u32::MAX"))?;

    let mut header = Vec::with_capacity(5 + payload.len());
    header.push(stream.as_byte());
    header.extend_from_slice(&len.to_be_bytes());
    header.extend_from_slice(payload);

    writer.write_all(&header).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdin_frame_roundtrips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, StreamId::Stdin, b"hello").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (stream, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(stream, StreamId::Stdin);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn empty_payload_roundtrips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, StreamId::ErrorOrExit, b"").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (stream, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(stream, StreamId::ErrorOrExit);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn header_is_exactly_five_bytes() {
        let mut buf = Vec::new();
        write_frame(&mut buf, StreamId::Stdout, b"abc").await.unwrap();
        assert_eq!(buf.len(), 5 + 3);
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..5], &3u32.to_be_bytes());
    }

    #[tokio::test]
    async fn rejects_unknown_stream_byte() {
        let mut buf = Vec::new();
        buf.push(9);
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        buf.push(StreamId::Stdout.as_byte());
        buf.extend_from_slice(&(32u32 * 1024 * 1024).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
