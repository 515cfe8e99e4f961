//! Journal entry codec.
//!
//! An entry is a checksummed header plus a run of update records, each
//! tagged with the btree and level it applies to. Entries are written
//! at sector granularity; the scan side decodes "whatever is at this
//! sector" and reports a clean miss when the magic is absent.

use crate::bkey::{BkeyFormat, decode_bkey, encode_bkey};
use crate::csum::{Csum, Nonce, csum};
use crate::{read_u8, read_u32, read_u64};
use bch_error::{Error, Result};
use bch_types::{BKey, BtreeId, ChecksumType, JournalSeq};

pub const JOURNAL_MAGIC: u64 = 0x6a6e_6c5f_6263_6831; // "jnl_bch1"
pub const JOURNAL_HEADER_BYTES: usize = 56;
pub const JOURNAL_VERSION: u32 = 1;

const FLAG_FLUSH: u32 = 1 << 0;

/// One staged btree update carried by a journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalUpdate {
    pub btree: BtreeId,
    pub level: u8,
    pub key: BKey,
}

/// A decoded journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: JournalSeq,
    /// Oldest sequence still needed by unflushed btree nodes at write
    /// time; everything older may be reclaimed.
    pub last_seq: JournalSeq,
    /// Flush entries are durability barriers.
    pub flush: bool,
    pub updates: Vec<JournalUpdate>,
}

/// Encode an entry, padded to whole sectors.
pub fn encode_entry(
    entry: &JournalEntry,
    csum_ty: ChecksumType,
    key: Option<&[u8; 32]>,
) -> Result<Vec<u8>> {
    let format = BkeyFormat::unpacked();
    let mut records = Vec::new();
    for update in &entry.updates {
        records.push(update.btree as u8);
        records.push(update.level);
        records.extend_from_slice(&[0_u8; 6]);
        records.extend_from_slice(&encode_bkey(&update.key, &format)?);
    }

    let mut tail = Vec::with_capacity(32 + records.len());
    tail.extend_from_slice(&entry.seq.0.to_le_bytes());
    tail.extend_from_slice(&entry.last_seq.0.to_le_bytes());
    tail.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    tail.extend_from_slice(&(if entry.flush { FLAG_FLUSH } else { 0 }).to_le_bytes());
    let nr = u32::try_from(entry.updates.len())
        .map_err(|_| Error::InvalidArgument("too many journal updates".into()))?;
    tail.extend_from_slice(&nr.to_le_bytes());
    let u64s = u32::try_from(records.len() / 8)
        .map_err(|_| Error::InvalidArgument("journal entry too large".into()))?;
    tail.extend_from_slice(&u64s.to_le_bytes());
    tail.extend_from_slice(&records);

    let c = csum(csum_ty, key, Nonce::for_sector(entry.seq.0), &tail)?;
    let mut out = Vec::with_capacity(JOURNAL_HEADER_BYTES + records.len());
    out.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
    out.extend_from_slice(&c.lo.to_le_bytes());
    out.extend_from_slice(&c.hi.to_le_bytes());
    out.extend_from_slice(&tail);

    let padded = out.len().div_ceil(512) * 512;
    out.resize(padded, 0);
    Ok(out)
}

/// Decode the entry at the start of `data`.
///
/// Returns `Ok(None)` when no entry starts here (scan termination);
/// errors mean an entry is present but damaged.
pub fn decode_entry(
    data: &[u8],
    csum_ty: ChecksumType,
    key: Option<&[u8; 32]>,
) -> Result<Option<(JournalEntry, usize)>> {
    if data.len() < JOURNAL_HEADER_BYTES {
        return Ok(None);
    }
    if read_u64(data, 0, "journal header")? != JOURNAL_MAGIC {
        return Ok(None);
    }
    let stored = Csum {
        lo: read_u64(data, 8, "journal header")?,
        hi: read_u64(data, 16, "journal header")?,
    };
    let seq = JournalSeq(read_u64(data, 24, "journal header")?);
    let last_seq = JournalSeq(read_u64(data, 32, "journal header")?);
    let version = read_u32(data, 40, "journal header")?;
    if version != JOURNAL_VERSION {
        return Err(Error::UnknownRequiredFeature {
            bits: u64::from(version),
        });
    }
    let flags = read_u32(data, 44, "journal header")?;
    let nr_entries = read_u32(data, 48, "journal header")? as usize;
    let u64s = read_u32(data, 52, "journal header")? as usize;

    let body_end = JOURNAL_HEADER_BYTES + u64s * 8;
    let tail = crate::ensure(data, 24, body_end - 24, "journal entry")?;
    if csum(csum_ty, key, Nonce::for_sector(seq.0), tail)? != stored {
        return Err(Error::BadChecksum {
            what: "journal entry",
        });
    }

    let format = BkeyFormat::unpacked();
    let mut updates = Vec::with_capacity(nr_entries);
    let mut off = JOURNAL_HEADER_BYTES;
    for _ in 0..nr_entries {
        let btree = BtreeId::from_u8(read_u8(data, off, "journal record")?)?;
        let level = read_u8(data, off + 1, "journal record")?;
        let (bkey, used) = decode_bkey(&data[off + 8..body_end], &format)?;
        updates.push(JournalUpdate {
            btree,
            level,
            key: bkey,
        });
        off += 8 + used;
    }
    if off != body_end {
        return Err(Error::CorruptMetadata {
            btree: BtreeId::Extents,
            pos: bch_types::Pos::MIN,
            detail: format!("journal entry length mismatch: {off} != {body_end}"),
        });
    }

    let consumed = body_end.div_ceil(512) * 512;
    Ok(Some((
        JournalEntry {
            seq,
            last_seq,
            flush: flags & FLAG_FLUSH != 0,
            updates,
        },
        consumed,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bch_types::Pos;
    use bch_types::keys::{BVal, LruV};

    fn entry(seq: u64, n: u64) -> JournalEntry {
        JournalEntry {
            seq: JournalSeq(seq),
            last_seq: JournalSeq(seq.saturating_sub(4)),
            flush: seq % 2 == 0,
            updates: (0..n)
                .map(|i| JournalUpdate {
                    btree: BtreeId::Lru,
                    level: 0,
                    key: BKey::new(Pos::new(0, i), BVal::Lru(LruV { bucket: i })),
                })
                .collect(),
        }
    }

    #[test]
    fn round_trip() {
        for e in [entry(1, 0), entry(2, 1), entry(3, 17)] {
            let bytes = encode_entry(&e, ChecksumType::Crc32c, None).unwrap();
            assert_eq!(bytes.len() % 512, 0);
            let (decoded, used) = decode_entry(&bytes, ChecksumType::Crc32c, None)
                .unwrap()
                .expect("entry present");
            assert_eq!(used, bytes.len());
            assert_eq!(decoded, e);
        }
    }

    #[test]
    fn absent_magic_is_clean_miss() {
        let zeroes = vec![0_u8; 1024];
        assert!(
            decode_entry(&zeroes, ChecksumType::Crc32c, None)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn bitflip_is_detected() {
        let mut bytes = encode_entry(&entry(9, 3), ChecksumType::Crc32c, None).unwrap();
        bytes[JOURNAL_HEADER_BYTES + 5] ^= 0x10;
        assert!(matches!(
            decode_entry(&bytes, ChecksumType::Crc32c, None),
            Err(Error::BadChecksum { .. })
        ));
    }

    #[test]
    fn seq_flip_is_detected() {
        // The sequence feeds the checksum nonce, so a spliced header
        // from another sequence cannot pass.
        let mut bytes = encode_entry(&entry(9, 1), ChecksumType::Crc32c, None).unwrap();
        bytes[24] ^= 1;
        assert!(decode_entry(&bytes, ChecksumType::Crc32c, None).is_err());
    }
}
