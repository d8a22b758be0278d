//! Payload encoding and optional compression.

use crate::config::{PayloadEncoding, PublisherConfig};
use crate::error::{AppResult, DaqError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes messages, then optionally LZ4-compresses them.
///
/// Compressed payloads carry the uncompressed size as a 4-byte
/// little-endian prefix (LZ4 block format).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadCodec {
    encoding: PayloadEncoding,
    compress: bool,
}

impl PayloadCodec {
    pub fn new(encoding: PayloadEncoding, compress: bool) -> Self {
        Self { encoding, compress }
    }

    pub fn from_config(config: &PublisherConfig) -> Self {
        Self::new(config.encoding, config.compress)
    }

    pub fn encode<T: Serialize>(&self, message: &T) -> AppResult<Vec<u8>> {
        let bytes = match self.encoding {
            PayloadEncoding::Json => serde_json::to_vec(message)?,
            PayloadEncoding::Bincode => bincode::serialize(message)?,
        };
        if !self.compress {
            return Ok(bytes);
        }
        lz4::block::compress(&bytes, Some(lz4::block::CompressionMode::FAST(1)), true)
            .map_err(|e| DaqError::Serialization(format!("lz4 compression failed: {e}")))
    }

    /// Inverse of [`encode`](Self::encode).
    ///
    /// Bincode cannot decode types that skip fields when serializing, such as
    /// [`Envelope`](super::message::Envelope).
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> AppResult<T> {
        let decompressed;
        let bytes = if self.compress {
            decompressed = lz4::block::decompress(payload, None)
                .map_err(|e| DaqError::Serialization(format!("lz4 decompression failed: {e}")))?;
            decompressed.as_slice()
        } else {
            payload
        };
        match self.encoding {
            PayloadEncoding::Json => Ok(serde_json::from_slice(bytes)?),
            PayloadEncoding::Bincode => Ok(bincode::deserialize(bytes)?),
        }
    }
}
