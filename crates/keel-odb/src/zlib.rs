//! zlib helpers over `flate2`.

use std::io::{Read as _, Write as _};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::OdbError;

/// Deflate a buffer at the default compression level.
#[must_use]
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Inflate a complete zlib stream.
///
/// # Errors
/// Fails with [`OdbError::Corrupt`] on an invalid stream.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, OdbError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| OdbError::corrupt("zlib stream", e.to_string()))?;
    Ok(out)
}

/// Inflate a zlib stream that starts at the head of `data` but does not
/// necessarily span all of it (pack entries are stored back to back).
///
/// Returns the inflated bytes plus the number of compressed bytes consumed,
/// so the caller can find the next entry.
///
/// # Errors
/// Fails with [`OdbError::Corrupt`] on an invalid stream.
#[allow(clippy::cast_possible_truncation)]
pub fn inflate_prefix(data: &[u8]) -> Result<(Vec<u8>, usize), OdbError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| OdbError::corrupt("zlib stream", e.to_string()))?;
    let consumed = decoder.total_in() as usize;
    Ok((out, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data = b"the quick brown fox".repeat(100);
        assert_eq!(inflate(&deflate(&data)).unwrap(), data);
    }

    #[test]
    fn inflate_prefix_reports_consumed_bytes() {
        let mut stream = deflate(b"first");
        let first_len = stream.len();
        stream.extend_from_slice(&deflate(b"second"));

        let (out, consumed) = inflate_prefix(&stream).unwrap();
        assert_eq!(out, b"first");
        assert_eq!(consumed, first_len);

        let (out, _) = inflate_prefix(&stream[consumed..]).unwrap();
        assert_eq!(out, b"second");
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(inflate(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
