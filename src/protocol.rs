//! Wire format for the duplex channel.
//!
//! Every transport message carries exactly one frame:
//! `[kind: u8][payload: bytes]`. There is no length prefix; the WebSocket
//! message boundary is the frame boundary.

use crate::audio::AudioBlock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: message has no kind byte")]
    MalformedFrame,
}

/// Frame kinds. Unknown discriminators are carried through rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Handshake,
    Audio,
    Text,
    Unknown(u8),
}

impl From<u8> for FrameKind {
    fn from(value: u8) -> Self {
        match value {
            0x00 => FrameKind::Handshake,
            0x01 => FrameKind::Audio,
            0x02 => FrameKind::Text,
            other => FrameKind::Unknown(other),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> Self {
        match kind {
            FrameKind::Handshake => 0x00,
            FrameKind::Audio => 0x01,
            FrameKind::Text => 0x02,
            FrameKind::Unknown(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Empty-payload handshake, as sent by clients that announce themselves.
    pub fn handshake() -> Self {
        Self::new(FrameKind::Handshake, Vec::new())
    }

    pub fn audio(block: &AudioBlock) -> Self {
        Self::new(FrameKind::Audio, block.to_le_bytes())
    }

    pub fn text(text: &str) -> Self {
        Self::new(FrameKind::Text, text.as_bytes().to_vec())
    }

    /// Status byte of a handshake frame, if the peer sent one.
    pub fn handshake_status(&self) -> Option<u8> {
        match self.kind {
            FrameKind::Handshake => self.payload.first().copied(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self.kind, &self.payload)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Size of the encoded frame on the wire.
    pub fn wire_len(&self) -> usize {
        1 + self.payload.len()
    }
}

/// Prepend the kind byte to `payload`.
pub fn encode(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(kind.into());
    bytes.extend_from_slice(payload);
    bytes
}

/// Split a transport message into kind and payload. Only an empty message is rejected.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    let (&kind, payload) = bytes.split_first().ok_or(ProtocolError::MalformedFrame)?;
    Ok(Frame {
        kind: FrameKind::from(kind),
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_known_kinds() {
        for kind in [FrameKind::Handshake, FrameKind::Audio, FrameKind::Text] {
            for len in [0usize, 1, 2, 17, 2048] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let decoded = decode(&encode(kind, &payload)).unwrap();
                assert_eq!(decoded.kind, kind);
                assert_eq!(decoded.payload, payload);
            }
        }
    }

    #[test]
    fn test_decode_empty_is_malformed() {
        assert_eq!(decode(&[]), Err(ProtocolError::MalformedFrame));
    }

    #[test]
    fn test_unknown_kind_passes_through() {
        let frame = decode(&[0x7f, 1, 2, 3]).unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown(0x7f));
        assert_eq!(frame.payload, vec![1, 2, 3]);
        assert_eq!(frame.encode(), vec![0x7f, 1, 2, 3]);
    }

    #[test]
    fn test_kind_byte_only() {
        let frame = decode(&[0x00]).unwrap();
        assert_eq!(frame.kind, FrameKind::Handshake);
        assert!(frame.payload.is_empty());
        assert_eq!(frame.handshake_status(), None);

        let frame = decode(&[0x00, 0x01]).unwrap();
        assert_eq!(frame.handshake_status(), Some(0x01));
    }

    #[test]
    fn test_audio_block_frame_size() {
        let block = AudioBlock::new(vec![0i16; 1024]);
        let frame = Frame::audio(&block);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), 2049);
        assert_eq!(frame.wire_len(), 2049);
        assert_eq!(bytes[0], 0x01);
    }

    #[test]
    fn test_audio_payload_is_little_endian() {
        let block = AudioBlock::new(vec![0x0102, -2]);
        let bytes = Frame::audio(&block).encode();
        assert_eq!(bytes, vec![0x01, 0x02, 0x01, 0xfe, 0xff]);
    }

    #[test]
    fn test_text_frame() {
        let bytes = Frame::text("hé").encode();
        assert_eq!(bytes, vec![0x02, b'h', 0xc3, 0xa9]);
    }
}
