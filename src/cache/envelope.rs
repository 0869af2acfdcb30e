//! Wire format for entries in the distributed store.
//!
//! Every stored entry is a bincode-framed envelope carrying the strategy it
//! was written under, its creation timestamp, and the serialized payload,
//! gzip-compressed when the strategy's policy asks for it. Readers on any
//! instance can recover the remaining TTL from `created_at_ms` without an
//! extra store round trip.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::strategy::{CacheStrategy, StrategyPolicy};
use crate::error::CodecError;
use crate::store::now_ms;

const GZIP_LEVEL: u32 = 6;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    strategy: CacheStrategy,
    created_at_ms: u64,
    compressed: bool,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// Result of encoding a value for the store.
pub(crate) struct EncodedEntry {
    pub bytes: Vec<u8>,
    /// Uncompressed payload size, used for local memory accounting.
    pub serialized_len: usize,
}

/// Result of decoding a stored entry.
pub(crate) struct DecodedEntry {
    pub value: Value,
    pub strategy: CacheStrategy,
    pub created_at_ms: u64,
    pub serialized_len: usize,
}

pub(crate) fn encode(
    value: &Value,
    strategy: CacheStrategy,
    policy: &StrategyPolicy,
) -> Result<EncodedEntry, CodecError> {
    let raw = serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
    let serialized_len = raw.len();
    let (payload, compressed) = if policy.compression.applies_to(serialized_len) {
        (gzip(&raw)?, true)
    } else {
        (raw, false)
    };
    let envelope = Envelope {
        strategy,
        created_at_ms: now_ms(),
        compressed,
        payload,
    };
    let bytes =
        bincode::serialize(&envelope).map_err(|e| CodecError::Serialize(e.to_string()))?;
    Ok(EncodedEntry {
        bytes,
        serialized_len,
    })
}

pub(crate) fn decode(bytes: &[u8]) -> Result<DecodedEntry, CodecError> {
    let envelope: Envelope =
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))?;
    let raw = if envelope.compressed {
        gunzip(&envelope.payload)?
    } else {
        envelope.payload
    };
    let serialized_len = raw.len();
    let value =
        serde_json::from_slice(&raw).map_err(|e| CodecError::Deserialize(e.to_string()))?;
    Ok(DecodedEntry {
        value,
        strategy: envelope.strategy,
        created_at_ms: envelope.created_at_ms,
        serialized_len,
    })
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(data.len() / 2),
        flate2::Compression::new(GZIP_LEVEL),
    );
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Compress(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::Compress(e.to_string()))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    Ok(out)
}
