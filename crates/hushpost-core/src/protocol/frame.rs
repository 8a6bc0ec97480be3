//! Length-prefixed framing over the router stream.
//!
//! Each frame is a little-endian `u32` header followed by the payload.
//! The top bit of the header marks a bypass frame, which skips the
//! spooler and its delivery confirmation on both ends. A zero-length
//! frame is a keep-alive probe.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Maximum frame payload: 64 MiB. Anything larger is a protocol
/// violation and kills the connection.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const BYPASS_FLAG: u32 = 1 << 31;

/// A received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub bypass: bool,
}

impl Frame {
    /// True for a zero-length keep-alive probe.
    pub fn is_keep_alive(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Encode a payload into header-plus-body wire bytes.
pub fn encode_frame(payload: &[u8], bypass: bool) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Framing(format!(
            "payload of {} bytes exceeds maximum",
            payload.len()
        )));
    }
    let mut header = payload.len() as u32;
    if bypass {
        header |= BYPASS_FLAG;
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    bypass: bool,
) -> Result<()> {
    let bytes = encode_frame(payload, bypass)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let raw = u32::from_le_bytes(header);
    let bypass = raw & BYPASS_FLAG != 0;
    let len = (raw & !BYPASS_FLAG) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Framing(format!("frame of {} bytes exceeds maximum", len)));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { payload, bypass })
}

/// Incremental frame accumulator for callers that receive raw chunks
/// rather than owning the stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes to the internal buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete frame, if the buffer holds one.
    pub fn try_read(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let raw = u32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);
        let bypass = raw & BYPASS_FLAG != 0;
        let len = (raw & !BYPASS_FLAG) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::Framing(format!("frame of {} bytes exceeds maximum", len)));
        }
        if self.buffer.len() < HEADER_SIZE + len {
            return Ok(None);
        }
        let payload = self.buffer[HEADER_SIZE..HEADER_SIZE + len].to_vec();
        self.buffer.drain(..HEADER_SIZE + len);
        Ok(Some(Frame { payload, bypass }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let bytes = encode_frame(&[0xaa, 0xbb], false).unwrap();
        assert_eq!(bytes, vec![2, 0, 0, 0, 0xaa, 0xbb]);

        let bypass = encode_frame(&[0xaa], true).unwrap();
        assert_eq!(bypass, vec![1, 0, 0, 0x80, 0xaa]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(encode_frame(&big, false).is_err());
    }

    #[test]
    fn test_max_size_payload_accepted() {
        // a header declaring exactly the cap parses, one byte more does not
        let mut reader = FrameReader::new();
        reader.push(&(MAX_FRAME_SIZE as u32).to_le_bytes());
        assert!(matches!(reader.try_read(), Ok(None)));

        let max = vec![0u8; MAX_FRAME_SIZE];
        let encoded = encode_frame(&max, false).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + MAX_FRAME_SIZE);
    }

    #[test]
    fn test_reader_reassembles_split_frames() {
        let mut wire = encode_frame(&[1, 2, 3], false).unwrap();
        wire.extend(encode_frame(&[], true).unwrap());
        wire.extend(encode_frame(&[9; 10], false).unwrap());

        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        // feed one byte at a time
        for b in wire {
            reader.push(&[b]);
            while let Some(frame) = reader.try_read().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload, vec![1, 2, 3]);
        assert!(!frames[0].bypass);
        assert!(frames[1].is_keep_alive());
        assert!(frames[1].bypass);
        assert_eq!(frames[2].payload, vec![9; 10]);
    }

    #[test]
    fn test_reader_rejects_oversized_header() {
        let mut reader = FrameReader::new();
        let raw = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        reader.push(&raw);
        assert!(reader.try_read().is_err());
    }

    #[tokio::test]
    async fn test_async_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &[7, 8, 9], true).await.unwrap();
        write_frame(&mut a, &[], false).await.unwrap();

        let first = read_frame(&mut b).await.unwrap();
        assert_eq!(first.payload, vec![7, 8, 9]);
        assert!(first.bypass);

        let second = read_frame(&mut b).await.unwrap();
        assert!(second.is_keep_alive());
        assert!(!second.bypass);
    }

    #[tokio::test]
    async fn test_async_read_rejects_oversized() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let raw = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &raw).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
