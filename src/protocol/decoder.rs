//! Streaming frame decoder.
//!
//! Bytes are appended with [`FrameDecoder::push`] and packets are pulled with
//! [`FrameDecoder::decode_next`]. The decoder never fails: malformed input is
//! counted, logged through a throttle, and skipped until the next header.

use super::frame::{RawFrame, DATA_TYPE_RANGE, FRAME_LEN, HEADER};
use super::packet::{decode_routine, DecodedPacket};
use crate::error::FramingError;
use crate::throttle::KeyedThrottle;
use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Window for repeated framing diagnostics.
const REJECT_LOG_WINDOW: Duration = Duration::from_secs(5);

/// Category of a rejected frame, used as the histogram key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BadHeader,
    BadChecksum,
    UnknownType,
}

impl RejectReason {
    /// Histogram key for a framing error; `Incomplete` is not a rejection.
    pub fn of(err: &FramingError) -> Option<Self> {
        match err {
            FramingError::BadHeader(_) => Some(RejectReason::BadHeader),
            FramingError::BadChecksum { .. } => Some(RejectReason::BadChecksum),
            FramingError::UnknownType(_) => Some(RejectReason::UnknownType),
            FramingError::Incomplete => None,
        }
    }
}

/// Decoder counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    /// Candidate frames examined (header found and enough bytes buffered)
    pub frames_seen: u64,
    /// Frames that produced a packet
    pub frames_decoded: u64,
    /// Frames rejected for any reason
    pub frames_rejected: u64,
    /// Bytes thrown away while resynchronising
    pub bytes_discarded: u64,
    /// Rejections per reason
    pub rejects: BTreeMap<RejectReason, u64>,
}

impl DecoderStats {
    fn reject(&mut self, reason: RejectReason) {
        self.frames_rejected += 1;
        *self.rejects.entry(reason).or_insert(0) += 1;
    }

    /// Fold another set of counters into this one.
    pub fn merge(&mut self, other: &DecoderStats) {
        self.frames_seen += other.frames_seen;
        self.frames_decoded += other.frames_decoded;
        self.frames_rejected += other.frames_rejected;
        self.bytes_discarded += other.bytes_discarded;
        for (reason, count) in &other.rejects {
            *self.rejects.entry(*reason).or_insert(0) += count;
        }
    }
}

/// Decode a verified frame through the dispatch table.
pub fn decode_frame(frame: &RawFrame) -> Result<DecodedPacket, FramingError> {
    let kind = frame.kind();
    let payload = frame.payload();
    match decode_routine(kind) {
        Some(decode) => Ok(decode(&payload)),
        None if DATA_TYPE_RANGE.contains(&kind) => Ok(DecodedPacket::Other { kind, payload }),
        None => Err(FramingError::UnknownType(kind)),
    }
}

/// Incremental decoder over an append-only byte buffer.
pub struct FrameDecoder {
    buffer: BytesMut,
    stats: DecoderStats,
    throttle: KeyedThrottle<RejectReason>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * FRAME_LEN),
            stats: DecoderStats::default(),
            throttle: KeyedThrottle::new(REJECT_LOG_WINDOW),
        }
    }

    /// Append raw bytes from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    /// Drop buffered bytes. Counters are kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Decode the next packet, or `None` when more bytes are needed.
    pub fn decode_next(&mut self) -> Option<DecodedPacket> {
        loop {
            self.skip_to_header();
            if self.buffer.len() < FRAME_LEN {
                return None;
            }

            self.stats.frames_seen += 1;
            let result = RawFrame::parse(&self.buffer).and_then(|frame| decode_frame(&frame));
            match result {
                Ok(packet) => {
                    self.buffer.advance(FRAME_LEN);
                    self.stats.frames_decoded += 1;
                    return Some(packet);
                }
                Err(FramingError::Incomplete) => return None,
                Err(err @ FramingError::UnknownType(_)) => {
                    // Checksum passed, so the frame length is trustworthy.
                    self.buffer.advance(FRAME_LEN);
                    self.stats.bytes_discarded += FRAME_LEN as u64;
                    self.rejected(RejectReason::UnknownType, &err);
                }
                Err(err) => {
                    // The next header may start inside the rejected frame.
                    self.buffer.advance(1);
                    self.stats.bytes_discarded += 1;
                    if let Some(reason) = RejectReason::of(&err) {
                        self.rejected(reason, &err);
                    }
                }
            }
        }
    }

    /// Decode every complete packet currently buffered.
    pub fn drain(&mut self) -> Vec<DecodedPacket> {
        let mut packets = Vec::with_capacity(self.buffer.len() / FRAME_LEN);
        while let Some(packet) = self.decode_next() {
            packets.push(packet);
        }
        packets
    }

    fn skip_to_header(&mut self) {
        if self.buffer.first() == Some(&HEADER) {
            return;
        }
        let skip = self
            .buffer
            .iter()
            .position(|&b| b == HEADER)
            .unwrap_or(self.buffer.len());
        if skip == 0 {
            return;
        }
        let first = self.buffer[0];
        self.buffer.advance(skip);
        self.stats.bytes_discarded += skip as u64;
        self.stats.reject(RejectReason::BadHeader);
        if let Some(suppressed) = self.throttle.hit(RejectReason::BadHeader) {
            debug!(
                skipped = skip,
                suppressed,
                error = %FramingError::BadHeader(first),
                "Resynchronising on frame header"
            );
        }
    }

    fn rejected(&mut self, reason: RejectReason, err: &FramingError) {
        self.stats.reject(reason);
        if let Some(suppressed) = self.throttle.hit(reason) {
            warn!(
                error = %err,
                suppressed,
                total = self.stats.rejects.get(&reason).copied().unwrap_or(0),
                "Rejected frame"
            );
        }
    }
}
