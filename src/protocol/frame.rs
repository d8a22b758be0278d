//! Frame layout and checksum.
//!
//! Every data frame is 11 bytes:
//!
//! ```text
//! +------+------+----+----+----+----+----+----+----+----+-----+
//! | 0x55 | type | d0 | d1 | d2 | d3 | d4 | d5 | d6 | d7 | sum |
//! +------+------+----+----+----+----+----+----+----+----+-----+
//! ```
//!
//! `sum` is the low byte of the sum of the ten preceding bytes.

use crate::error::FramingError;

/// First byte of every data frame.
pub const HEADER: u8 = 0x55;

/// Total frame length, header and checksum included.
pub const FRAME_LEN: usize = 11;

/// Payload length.
pub const PAYLOAD_LEN: usize = 8;

/// Type bytes the device may emit for data frames.
pub const DATA_TYPE_RANGE: std::ops::RangeInclusive<u8> = 0x50..=0x5F;

/// Low byte of the sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// A frame whose header and checksum have been verified.
///
/// Only [`RawFrame::parse`] constructs one, so holding a `RawFrame` means the
/// bytes passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    bytes: [u8; FRAME_LEN],
}

impl RawFrame {
    /// Validate the first [`FRAME_LEN`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.is_empty() {
            return Err(FramingError::Incomplete);
        }
        if bytes[0] != HEADER {
            return Err(FramingError::BadHeader(bytes[0]));
        }
        if bytes.len() < FRAME_LEN {
            return Err(FramingError::Incomplete);
        }

        let expected = checksum(&bytes[..FRAME_LEN - 1]);
        let actual = bytes[FRAME_LEN - 1];
        if expected != actual {
            return Err(FramingError::BadChecksum { expected, actual });
        }

        let mut frame = [0u8; FRAME_LEN];
        frame.copy_from_slice(&bytes[..FRAME_LEN]);
        Ok(Self { bytes: frame })
    }

    /// Packet type byte.
    pub fn kind(&self) -> u8 {
        self.bytes[1]
    }

    /// The eight payload bytes.
    pub fn payload(&self) -> [u8; PAYLOAD_LEN] {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&self.bytes[2..2 + PAYLOAD_LEN]);
        payload
    }

    /// The complete frame.
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.bytes
    }
}

/// Build a complete frame for `kind` carrying `payload`.
pub fn encode_frame(kind: u8, payload: &[u8; PAYLOAD_LEN]) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = HEADER;
    frame[1] = kind;
    frame[2..2 + PAYLOAD_LEN].copy_from_slice(payload);
    frame[FRAME_LEN - 1] = checksum(&frame[..FRAME_LEN - 1]);
    frame
}

/// Little-endian signed word `index` (0..4) of a payload.
pub(crate) fn word(payload: &[u8; PAYLOAD_LEN], index: usize) -> i16 {
    i16::from_le_bytes([payload[2 * index], payload[2 * index + 1]])
}

/// Little-endian unsigned double word `index` (0..2) of a payload.
pub(crate) fn dword(payload: &[u8; PAYLOAD_LEN], index: usize) -> u32 {
    let at = 4 * index;
    u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

/// Pack four signed words into a payload.
pub(crate) fn pack_words(words: [i16; 4]) -> [u8; PAYLOAD_LEN] {
    let mut payload = [0u8; PAYLOAD_LEN];
    for (i, w) in words.iter().enumerate() {
        payload[2 * i..2 * i + 2].copy_from_slice(&w.to_le_bytes());
    }
    payload
}
