/*!
Compression adapters for engine images.

Images are packed before they reach the object store so that the
quota-limited store holds as many bytes of engine state as possible.

Unpacking sniffs the stored bytes instead of trusting the configured adapter:
a gzip stream is inflated and a raw engine image passes through. Toggling
`compress` in the storage config therefore never strands an existing snapshot.
*/

use crate::engine::has_sqlite_header;
use crate::{KeepError, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Turns engine images into stored bytes and back
pub trait CompressionAdapter: Send + Sync {
    /// Encode an engine image for storage
    fn pack(&self, image: &[u8]) -> Result<Vec<u8>>;

    /// Recover the engine image from stored bytes
    fn unpack(&self, stored: &[u8]) -> Result<Vec<u8>> {
        unpack_any(stored)
    }

    /// Name recorded in snapshot metadata
    fn name(&self) -> &'static str;
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

fn inflate(stored: &[u8]) -> Result<Vec<u8>> {
    let mut image = Vec::with_capacity(stored.len() * 4);
    GzDecoder::new(stored)
        .read_to_end(&mut image)
        .map_err(|e| KeepError::compression(format!("gzip stream is damaged: {e}")))?;
    Ok(image)
}

/// Inflate gzip, pass raw images through, reject anything else
fn unpack_any(stored: &[u8]) -> Result<Vec<u8>> {
    if is_gzip(stored) {
        inflate(stored)
    } else if has_sqlite_header(stored) {
        Ok(stored.to_vec())
    } else {
        Err(KeepError::compression(
            "stored bytes are neither gzip nor an engine image",
        ))
    }
}

/// Gzip adapter
///
/// # Example
/// ```rust
/// use keepsql_core::{CompressionAdapter, GzipCompressor};
///
/// let mut image = b"SQLite format 3\0".to_vec();
/// image.resize(8192, 0);
///
/// let gzip = GzipCompressor::new();
/// let stored = gzip.pack(&image)?;
/// assert!(stored.len() < image.len());
/// assert_eq!(gzip.unpack(&stored)?, image);
/// # Ok::<(), keepsql_core::KeepError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    level: Compression,
}

impl GzipCompressor {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Gzip at `level` (0-9, clamped)
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn pack(&self, image: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(image.len() / 4), self.level);
        encoder
            .write_all(image)
            .and_then(|_| encoder.finish())
            .map_err(|e| KeepError::compression(format!("gzip encoding failed: {e}")))
    }

    fn name(&self) -> &'static str {
        "gzip"
    }
}

/// Stores images as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl CompressionAdapter for NoCompression {
    fn pack(&self, image: &[u8]) -> Result<Vec<u8>> {
        Ok(image.to_vec())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(pages: usize) -> Vec<u8> {
        let mut image = b"SQLite format 3\0".to_vec();
        image.resize(4096 * pages, 0);
        image
    }

    #[test]
    fn test_gzip_shrinks_zero_padded_pages() {
        let gzip = GzipCompressor::new();
        let image = image(4);

        let stored = gzip.pack(&image).unwrap();
        assert!(stored.len() < image.len() / 10);
        assert!(is_gzip(&stored));
        assert_eq!(gzip.unpack(&stored).unwrap(), image);
    }

    #[test]
    fn test_adapters_read_each_others_output() {
        let image = image(2);
        let gzipped = GzipCompressor::with_level(1).pack(&image).unwrap();
        let raw = NoCompression.pack(&image).unwrap();

        assert_eq!(NoCompression.unpack(&gzipped).unwrap(), image);
        assert_eq!(GzipCompressor::new().unpack(&raw).unwrap(), image);
    }

    #[test]
    fn test_unpack_rejects_unknown_bytes() {
        let result = GzipCompressor::new().unpack(b"<html>not a snapshot</html>");
        assert!(matches!(result, Err(KeepError::Compression(_))));
    }

    #[test]
    fn test_unpack_rejects_truncated_gzip() {
        let stored = GzipCompressor::new().pack(&image(2)).unwrap();
        let result = NoCompression.unpack(&stored[..stored.len() / 2]);
        assert!(matches!(result, Err(KeepError::Compression(_))));
    }

    #[test]
    fn test_names() {
        assert_eq!(GzipCompressor::new().name(), "gzip");
        assert_eq!(NoCompression.name(), "none");
    }
}
