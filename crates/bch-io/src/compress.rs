//! Transparent extent compression.
//!
//! Writes try the configured algorithm and fall back to storing the
//! data uncompressed when it does not shrink by at least one sector —
//! the on-disk unit compression has to win back.

use bch_error::{Error, Result};
use bch_types::{CompressionType, SECTOR_SIZE};
use std::io::{Read, Write};

/// Compress `data` with `ty`. Returns `None` when compression does not
/// save at least one sector (caller stores uncompressed).
pub fn compress(ty: CompressionType, data: &[u8]) -> Result<Option<Vec<u8>>> {
    let compressed = match ty {
        CompressionType::None => return Ok(None),
        CompressionType::Lz4 => lz4_flex::compress_prepend_size(data),
        CompressionType::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?
        }
        CompressionType::Zstd => zstd::bulk::compress(data, 0)
            .map_err(|err| Error::Io(std::io::Error::other(err)))?,
    };

    let sector = SECTOR_SIZE as usize;
    if compressed.len().div_ceil(sector) < data.len().div_ceil(sector) {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Decompress an extent image back to exactly `out_len` bytes.
pub fn decompress(ty: CompressionType, data: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let out = match ty {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|err| Error::Io(std::io::Error::other(err)))?,
        CompressionType::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::with_capacity(out_len);
            decoder.read_to_end(&mut out)?;
            out
        }
        CompressionType::Zstd => zstd::bulk::decompress(data, out_len)
            .map_err(|err| Error::Io(std::io::Error::other(err)))?,
    };
    if out.len() != out_len {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("decompressed {} bytes, expected {out_len}", out.len()),
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bch_block::pattern_bytes;

    #[test]
    fn round_trip_all_algorithms() {
        // Compressible payload: long runs.
        let data = vec![0x61_u8; 64 << 10];
        for ty in [
            CompressionType::Lz4,
            CompressionType::Gzip,
            CompressionType::Zstd,
        ] {
            let compressed = compress(ty, &data)
                .unwrap()
                .unwrap_or_else(|| panic!("{ty} did not compress runs"));
            assert!(compressed.len() < data.len());
            let back = decompress(ty, &compressed, data.len()).unwrap();
            assert_eq!(back, data);
        }
    }

    #[test]
    fn incompressible_data_falls_back() {
        let data = pattern_bytes(4096, 0x1D);
        // The byte pattern cycles with period 256; shuffle it harder.
        let data: Vec<u8> = data
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ ((i * 7) as u8) ^ ((i >> 3) as u8).wrapping_mul(13))
            .collect();
        let lz4 = compress(CompressionType::Lz4, &data).unwrap();
        // Either it compressed below a sector boundary or fell back;
        // both are legal, but a fallback must be None, not bigger.
        if let Some(c) = lz4 {
            assert!(c.len() < data.len());
        }
    }

    #[test]
    fn none_never_compresses() {
        assert!(compress(CompressionType::None, b"aaaa").unwrap().is_none());
        let back = decompress(CompressionType::None, b"abc", 3).unwrap();
        assert_eq!(back, b"abc");
    }

    #[test]
    fn wrong_length_is_an_error() {
        let data = vec![7_u8; 1024];
        let compressed = compress(CompressionType::Zstd, &data).unwrap().unwrap();
        assert!(decompress(CompressionType::Zstd, &compressed, 999).is_err());
    }
}
