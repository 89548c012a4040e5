//! Output blob compression.
//!
//! The compression choice is data on the output row, not a server-wide
//! constant: the server writes zstd by default, accepts lzma from older
//! managers, and permits `none` for callers that compress upstream.

use crate::error::QcGridError;
use crate::types::CompressionType;

/// Above this size, prefer a faster zstd level.
const LARGE_BLOB_BYTES: usize = 15 * 1024 * 1024;

/// zstd level used for ordinary blobs.
const ZSTD_LEVEL_DEFAULT: i32 = 16;
/// zstd level used for large blobs.
const ZSTD_LEVEL_LARGE: i32 = 6;

/// Compress a payload. Returns the bytes actually stored along with the
/// applied compression type and level (which may differ from the request -
/// `none` always reports level 0, and lzma has a single fixed preset).
pub fn compress(
    data: &[u8],
    compression_type: CompressionType,
    level: Option<i32>,
) -> Result<(Vec<u8>, CompressionType, i32), QcGridError> {
    match compression_type {
        CompressionType::None => Ok((data.to_vec(), CompressionType::None, 0)),
        CompressionType::Zstd => {
            let level = level.unwrap_or(if data.len() > LARGE_BLOB_BYTES {
                ZSTD_LEVEL_LARGE
            } else {
                ZSTD_LEVEL_DEFAULT
            });
            let compressed = zstd::stream::encode_all(data, level)
                .map_err(|e| QcGridError::Internal(anyhow::anyhow!("zstd compression: {e}")))?;
            Ok((compressed, CompressionType::Zstd, level))
        }
        CompressionType::Lzma => {
            let mut compressed = Vec::new();
            lzma_rs::lzma_compress(&mut &data[..], &mut compressed)
                .map_err(|e| QcGridError::Internal(anyhow::anyhow!("lzma compression: {e}")))?;
            Ok((compressed, CompressionType::Lzma, 0))
        }
    }
}

/// Decompress a stored blob back to the original payload.
pub fn decompress(data: &[u8], compression_type: CompressionType) -> Result<Vec<u8>, QcGridError> {
    match compression_type {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => zstd::stream::decode_all(data)
            .map_err(|e| QcGridError::Internal(anyhow::anyhow!("zstd decompression: {e}"))),
        CompressionType::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_decompress(&mut &data[..], &mut out)
                .map_err(|e| QcGridError::Internal(anyhow::anyhow!("lzma decompression: {e}")))?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        // compressible, non-trivial payload
        "the quick brown fox jumps over the lazy dog\n"
            .repeat(200)
            .into_bytes()
    }

    #[test]
    fn test_round_trip_all_types() {
        let data = sample();
        for ctype in [CompressionType::None, CompressionType::Zstd, CompressionType::Lzma] {
            let (stored, applied, _level) = compress(&data, ctype, None).unwrap();
            assert_eq!(applied, ctype);
            assert_eq!(decompress(&stored, applied).unwrap(), data);
        }
    }

    #[test]
    fn test_zstd_actually_compresses() {
        let data = sample();
        let (stored, _, level) = compress(&data, CompressionType::Zstd, None).unwrap();
        assert!(stored.len() < data.len());
        assert_eq!(level, 16);
    }

    #[test]
    fn test_none_is_identity() {
        let data = b"raw".to_vec();
        let (stored, ctype, level) = compress(&data, CompressionType::None, Some(9)).unwrap();
        assert_eq!(stored, data);
        assert_eq!(ctype, CompressionType::None);
        assert_eq!(level, 0);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        for ctype in [CompressionType::None, CompressionType::Zstd, CompressionType::Lzma] {
            let (stored, applied, _) = compress(b"", ctype, None).unwrap();
            assert_eq!(decompress(&stored, applied).unwrap(), Vec::<u8>::new());
        }
    }

    #[test]
    fn test_explicit_zstd_level_respected() {
        let data = sample();
        let (_, _, level) = compress(&data, CompressionType::Zstd, Some(3)).unwrap();
        assert_eq!(level, 3);
    }
}
