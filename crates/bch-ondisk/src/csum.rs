//! Checksum dispatch.
//!
//! The format selects a checksum algorithm per superblock field and per
//! extent: {none, crc32c, crc64, xxh3, poly1305}. The first four are
//! unkeyed; poly1305 authenticates with a one-time key derived from the
//! encryption master key and the per-object nonce.

use bch_error::{Error, Result};
use bch_types::ChecksumType;
use crc::{CRC_64_XZ, Crc};
use poly1305::Poly1305;
use poly1305::universal_hash::KeyInit;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// 128-bit checksum container. Narrow algorithms fill `lo` and zero
/// `hi`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Csum {
    pub lo: u64,
    pub hi: u64,
}

impl Csum {
    #[must_use]
    pub fn to_words(self) -> [u64; 2] {
        [self.lo, self.hi]
    }

    #[must_use]
    pub fn from_words(words: [u64; 2]) -> Self {
        Self {
            lo: words[0],
            hi: words[1],
        }
    }
}

/// Per-object nonce. Extents derive it from `(inode, offset, gen)`;
/// superblocks and nodes from their device offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Nonce(pub [u8; 12]);

impl Nonce {
    /// Nonce for an extent image: `(inode, offset, write generation)`.
    /// The generation component comes from the extent's crc descriptor
    /// so every replica derives the same nonce.
    #[must_use]
    pub fn for_extent(inode: u64, offset: u64, gen: u32) -> Self {
        let mut n = [0_u8; 12];
        n[..8].copy_from_slice(&(inode ^ offset.rotate_left(32)).to_le_bytes());
        n[8..12].copy_from_slice(&gen.to_le_bytes());
        Self(n)
    }

    /// Nonce for a metadata object at a fixed device sector.
    #[must_use]
    pub fn for_sector(sector: u64) -> Self {
        let mut n = [0_u8; 12];
        n[..8].copy_from_slice(&sector.to_le_bytes());
        Self(n)
    }
}

/// Compute the checksum of `data` under `ty`.
///
/// `key` is the 32-byte encryption master key; required for poly1305,
/// ignored otherwise.
pub fn csum(ty: ChecksumType, key: Option<&[u8; 32]>, nonce: Nonce, data: &[u8]) -> Result<Csum> {
    Ok(match ty {
        ChecksumType::None => Csum::default(),
        ChecksumType::Crc32c => Csum {
            lo: u64::from(crc32c::crc32c(data)),
            hi: 0,
        },
        ChecksumType::Crc64 => Csum {
            lo: CRC64.checksum(data),
            hi: 0,
        },
        ChecksumType::Xxh3 => Csum {
            lo: xxhash_rust::xxh3::xxh3_64(data),
            hi: 0,
        },
        ChecksumType::Poly1305 => {
            let key = key.ok_or(Error::InvalidArgument(
                "poly1305 checksum requires the encryption key".into(),
            ))?;
            let mac = Poly1305::new_from_slice(&one_time_key(key, nonce))
                .map_err(|_| Error::InvalidArgument("bad poly1305 key length".into()))?
                .compute_unpadded(data);
            let tag: [u8; 16] = mac.into();
            Csum {
                lo: u64::from_le_bytes(tag[..8].try_into().unwrap_or([0; 8])),
                hi: u64::from_le_bytes(tag[8..].try_into().unwrap_or([0; 8])),
            }
        }
    })
}

/// Verify `data` against an expected checksum.
pub fn csum_matches(
    ty: ChecksumType,
    key: Option<&[u8; 32]>,
    nonce: Nonce,
    data: &[u8],
    expected: Csum,
) -> Result<bool> {
    Ok(csum(ty, key, nonce, data)? == expected)
}

/// Derive the one-time poly1305 key for `(master key, nonce)`.
fn one_time_key(key: &[u8; 32], nonce: Nonce) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(&nonce.0);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unkeyed_checksums_detect_flips() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        for ty in [
            ChecksumType::Crc32c,
            ChecksumType::Crc64,
            ChecksumType::Xxh3,
        ] {
            let good = csum(ty, None, Nonce::default(), &data).unwrap();
            let mut flipped = data.clone();
            flipped[10] ^= 1;
            let bad = csum(ty, None, Nonce::default(), &flipped).unwrap();
            assert_ne!(good, bad, "{ty:?} missed a single-bit flip");
            assert!(csum_matches(ty, None, Nonce::default(), &data, good).unwrap());
        }
    }

    #[test]
    fn none_is_always_zero() {
        let c = csum(ChecksumType::None, None, Nonce::default(), b"anything").unwrap();
        assert_eq!(c, Csum::default());
    }

    #[test]
    fn poly1305_requires_key() {
        assert!(csum(ChecksumType::Poly1305, None, Nonce::default(), b"x").is_err());
    }

    #[test]
    fn poly1305_keyed_and_nonced() {
        let key = [7_u8; 32];
        let data = b"extent payload";
        let n1 = Nonce::for_extent(1, 0, 0);
        let n2 = Nonce::for_extent(1, 8, 0);
        let a = csum(ChecksumType::Poly1305, Some(&key), n1, data).unwrap();
        let b = csum(ChecksumType::Poly1305, Some(&key), n2, data).unwrap();
        assert_ne!(a, b, "nonce must separate identical payloads");

        let other_key = [8_u8; 32];
        let c = csum(ChecksumType::Poly1305, Some(&other_key), n1, data).unwrap();
        assert_ne!(a, c, "key must separate identical payloads");

        assert!(csum_matches(ChecksumType::Poly1305, Some(&key), n1, data, a).unwrap());
    }

    #[test]
    fn extent_nonce_varies_with_gen() {
        assert_ne!(Nonce::for_extent(1, 0, 0), Nonce::for_extent(1, 0, 1));
    }
}
