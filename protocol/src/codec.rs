//! Payload compression.
//!
//! Application payloads are compressed by the client before they leave the
//! process and decompressed after a recv. Relay hops carry the compressed
//! bytes untouched, so only the two end clients ever run this code.

use crate::config::COMPRESSION_LEVEL;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Compresses `payload` into a single zstd frame.
pub fn compress(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::encode_all(payload, COMPRESSION_LEVEL).map_err(CodecError::Compress)
}

/// Inverse of [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::decode_all(data).map_err(CodecError::Decompress)
}
