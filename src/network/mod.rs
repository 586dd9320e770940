//! Network Module
//!
//! TCP transport for arbiter messages between nodes. Every frame is a
//! bincode body behind a length and CRC32 header.

mod client;
mod monitor;
mod server;

pub use client::ArbiterClient;
pub use monitor::PeerMonitor;
pub use server::{ArbiterServer, PeerEvent};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::commit::ArbiterMessage;
use crate::error::{Error, Result};
use crate::state::NodeId;

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Wire frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every connection: who is calling
    Hello { node: NodeId },
    /// An acknowledgement for one transaction
    Arbiter(ArbiterMessage),
}

/// Frame header for network transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a header for `data`
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Codec turning a byte stream into [`Frame`]s
#[derive(Debug, Clone)]
pub struct ArbiterCodec {
    max_frame_size: usize,
}

impl ArbiterCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for ArbiterCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for ArbiterCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let mut header_bytes = [0u8; FrameHeader::SIZE];
        header_bytes.copy_from_slice(&src[..FrameHeader::SIZE]);
        let header = FrameHeader::from_bytes(&header_bytes);

        let length = header.length as usize;
        if length > self.max_frame_size {
            return Err(Error::Network(format!(
                "Frame of {} bytes exceeds limit of {}",
                length, self.max_frame_size
            )));
        }

        let total = FrameHeader::SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let body = src.split_to(length);

        if crc32fast::hash(&body) != header.checksum {
            return Err(Error::Network("Message checksum mismatch".into()));
        }

        Ok(Some(bincode::deserialize(&body)?))
    }
}

impl Encoder<Frame> for ArbiterCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let body = bincode::serialize(&frame)?;
        if body.len() > self.max_frame_size {
            return Err(Error::Network(format!(
                "Frame of {} bytes exceeds limit of {}",
                body.len(),
                self.max_frame_size
            )));
        }

        let header = FrameHeader::new(&body);
        dst.reserve(FrameHeader::SIZE + body.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{Gid, MessageCode};

    fn arbiter_frame() -> Frame {
        Frame::Arbiter(ArbiterMessage::new(Gid::new(1, 42), 2, MessageCode::Precommitted))
    }

    #[test]
    fn test_frame_header() {
        let data = b"precommitted";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());
        assert_eq!(header, restored);
        assert_eq!(restored.length, data.len() as u32);
    }

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let mut codec = ArbiterCodec::default();
        let mut encoded = BytesMut::new();
        codec.encode(Frame::Hello { node: 3 }, &mut encoded).unwrap();
        codec.encode(arbiter_frame(), &mut encoded).unwrap();

        let mut src = BytesMut::new();
        src.extend_from_slice(&encoded[..5]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);

        src.extend_from_slice(&encoded[5..]);
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Frame::Hello { node: 3 }));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(arbiter_frame()));
        assert!(src.is_empty());
    }

    #[test]
    fn test_corrupted_body_is_rejected() {
        let mut codec = ArbiterCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(arbiter_frame(), &mut buf).unwrap();

        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(codec.decode(&mut buf), Err(Error::Network(_))));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = ArbiterCodec::new(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&FrameHeader { length: 1024, checksum: 0 }.to_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }
}
