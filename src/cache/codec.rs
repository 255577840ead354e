//! Volatile Tier Value Codec
//!
//! Records travel through the volatile tier as opaque bytes: JSON, LZ4
//! compressed once the JSON reaches the configured threshold.
//!
//! # Wire format
//!
//! ```text
//! ┌──────┬──────────────────────────────────────────────┐
//! │ tag  │ payload                                      │
//! │ 0x00 │ JSON                                         │
//! │ 0x01 │ LZ4 block (size-prefixed) wrapping the JSON  │
//! └──────┴──────────────────────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::record::CacheRecord;
use crate::error::{Error, Result};

const TAG_RAW: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;

/// Payload encoding inside a volatile value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Raw,
    Lz4,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Raw => "raw",
            Encoding::Lz4 => "lz4",
        }
    }
}

/// Encodes and decodes [`CacheRecord`]s for the volatile tier
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    compression_threshold: usize,
}

impl RecordCodec {
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
        }
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    /// Serialize a record. Compression is only kept when it shrinks the value.
    pub fn encode(&self, record: &CacheRecord) -> Result<Bytes> {
        let json = serde_json::to_vec(record)?;
        if json.len() >= self.compression_threshold {
            match lz4::block::compress(&json, None, true) {
                Ok(compressed) if compressed.len() < json.len() => {
                    return Ok(frame(TAG_LZ4, &compressed));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("LZ4 compression failed, storing raw JSON: {}", e);
                }
            }
        }
        Ok(frame(TAG_RAW, &json))
    }

    /// Parse a value produced by [`encode`](Self::encode)
    pub fn decode(&self, value: &[u8]) -> Result<CacheRecord> {
        let (tag, payload) = value
            .split_first()
            .ok_or_else(|| Error::Codec("empty volatile value".to_string()))?;
        match *tag {
            TAG_RAW => Ok(serde_json::from_slice(payload)?),
            TAG_LZ4 => {
                let json = lz4::block::decompress(payload, None)
                    .map_err(|e| Error::Codec(format!("LZ4 decompression failed: {}", e)))?;
                Ok(serde_json::from_slice(&json)?)
            }
            other => Err(Error::Codec(format!("unknown value tag 0x{:02x}", other))),
        }
    }

    /// Which encoding a stored value uses
    pub fn encoding_of(value: &[u8]) -> Option<Encoding> {
        match value.first() {
            Some(&TAG_RAW) => Some(Encoding::Raw),
            Some(&TAG_LZ4) => Some(Encoding::Lz4),
            _ => None,
        }
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_COMPRESSION_THRESHOLD)
    }
}

fn frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(tag);
    buf.put_slice(payload);
    buf.freeze()
}
