//! Btree node images.
//!
//! A node is a fixed-size image: a header carrying the node identity
//! and its packing format, followed by one or more bsets. Each bset is
//! an append-only run of sorted keys written as one unit (separated by
//! journaling events) with its own checksum and ordinal; the decoder
//! validates ordinals so a torn append cannot splice bsets from
//! different writes.

use crate::bkey::{BkeyFormat, decode_bkey, encode_bkey};
use crate::csum::{Csum, Nonce, csum};
use crate::{read_array, read_u8, read_u32, read_u64};
use bch_error::{Error, Result};
use bch_types::{BKey, BtreeId, ChecksumType, Pos};

pub const NODE_MAGIC: u64 = 0x6273_6e6f_6465_3031; // "bsnode01"
pub const BSET_MAGIC: u64 = 0x6273_6574_5f76_3101; // "bset_v1"+1

pub const NODE_HEADER_BYTES: usize = 128;
pub const BSET_HEADER_BYTES: usize = 40;
/// Bsets are written at sector granularity so they can be appended to
/// a live node image without rewriting neighbours.
pub const BSET_ALIGN: usize = 512;

/// Identity and format of one node image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Random identity assigned at allocation; ties bsets to the node
    /// incarnation that wrote them.
    pub node_seq: u64,
    pub btree_id: BtreeId,
    pub level: u8,
    pub format: BkeyFormat,
    pub min_pos: Pos,
    pub max_pos: Pos,
}

/// One decoded bset: the journal sequence it was written under and its
/// keys in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bset {
    pub journal_seq: u64,
    pub keys: Vec<BKey>,
}

fn write_pos(out: &mut Vec<u8>, pos: Pos) {
    out.extend_from_slice(&pos.inode.to_le_bytes());
    out.extend_from_slice(&pos.offset.to_le_bytes());
    out.extend_from_slice(&pos.snapshot.to_le_bytes());
    out.extend_from_slice(&0_u32.to_le_bytes());
}

fn read_pos(data: &[u8], offset: usize) -> Result<Pos> {
    Ok(Pos {
        inode: read_u64(data, offset, "node pos")?,
        offset: read_u64(data, offset + 8, "node pos")?,
        snapshot: read_u32(data, offset + 16, "node pos")?,
    })
}

/// Encode a node header. The checksum covers everything after the
/// checksum field itself.
pub fn encode_node_header(
    header: &NodeHeader,
    csum_ty: ChecksumType,
    key: Option<&[u8; 32]>,
    sector: u64,
) -> Result<Vec<u8>> {
    let mut tail = Vec::with_capacity(NODE_HEADER_BYTES - 24);
    tail.extend_from_slice(&header.node_seq.to_le_bytes());
    tail.push(header.btree_id as u8);
    tail.push(header.level);
    tail.extend_from_slice(&[0_u8; 6]);
    tail.extend_from_slice(&header.format.bits);
    tail.extend_from_slice(&0_u32.to_le_bytes());
    for off in header.format.field_offset {
        tail.extend_from_slice(&off.to_le_bytes());
    }
    write_pos(&mut tail, header.min_pos);
    write_pos(&mut tail, header.max_pos);
    debug_assert_eq!(tail.len(), NODE_HEADER_BYTES - 24);

    let c = csum(csum_ty, key, Nonce::for_sector(sector), &tail)?;
    let mut out = Vec::with_capacity(BSET_ALIGN);
    out.extend_from_slice(&NODE_MAGIC.to_le_bytes());
    out.extend_from_slice(&c.lo.to_le_bytes());
    out.extend_from_slice(&c.hi.to_le_bytes());
    out.extend_from_slice(&tail);
    out.resize(BSET_ALIGN, 0);
    Ok(out)
}

/// Encode one bset from its keys.
pub fn encode_bset(
    keys: &[BKey],
    format: &BkeyFormat,
    journal_seq: u64,
    seq_idx: u32,
    csum_ty: ChecksumType,
    key: Option<&[u8; 32]>,
    sector: u64,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for k in keys {
        body.extend_from_slice(&encode_bkey(k, format)?);
    }
    let c = csum(csum_ty, key, Nonce::for_sector(sector ^ u64::from(seq_idx)), &body)?;

    let mut out = Vec::with_capacity(BSET_HEADER_BYTES + body.len());
    out.extend_from_slice(&BSET_MAGIC.to_le_bytes());
    out.extend_from_slice(&journal_seq.to_le_bytes());
    out.extend_from_slice(&seq_idx.to_le_bytes());
    let u64s = u32::try_from(body.len() / 8)
        .map_err(|_| Error::InvalidArgument("bset too large".into()))?;
    out.extend_from_slice(&u64s.to_le_bytes());
    out.extend_from_slice(&c.lo.to_le_bytes());
    out.extend_from_slice(&c.hi.to_le_bytes());
    out.extend_from_slice(&body);
    out.resize(out.len().div_ceil(BSET_ALIGN) * BSET_ALIGN, 0);
    Ok(out)
}

/// Decode a full node image: header plus every valid bset, in write
/// order. Stops cleanly at the first absent bset; fails on checksum or
/// ordinal mismatches.
pub fn decode_node(
    data: &[u8],
    csum_ty: ChecksumType,
    key: Option<&[u8; 32]>,
    sector: u64,
) -> Result<(NodeHeader, Vec<Bset>)> {
    let magic = read_u64(data, 0, "node header")?;
    if magic != NODE_MAGIC {
        return Err(Error::BadMagic { offset: sector });
    }
    let stored = Csum {
        lo: read_u64(data, 8, "node header")?,
        hi: read_u64(data, 16, "node header")?,
    };
    let tail = crate::ensure(data, 24, NODE_HEADER_BYTES - 24, "node header")?;
    if csum(csum_ty, key, Nonce::for_sector(sector), tail)? != stored {
        return Err(Error::BadChecksum {
            what: "btree node header",
        });
    }

    let node_seq = read_u64(data, 24, "node header")?;
    let btree_id = BtreeId::from_u8(read_u8(data, 32, "node header")?)?;
    let level = read_u8(data, 33, "node header")?;
    let bits: [u8; 4] = read_array(data, 40, "node format")?;
    let mut field_offset = [0_u64; 4];
    for (i, slot) in field_offset.iter_mut().enumerate() {
        *slot = read_u64(data, 48 + i * 8, "node format")?;
    }
    let format = BkeyFormat { bits, field_offset };
    let min_pos = read_pos(data, 80)?;
    let max_pos = read_pos(data, 104)?;

    let header = NodeHeader {
        node_seq,
        btree_id,
        level,
        format,
        min_pos,
        max_pos,
    };

    let mut bsets = Vec::new();
    let mut offset = BSET_ALIGN;
    let mut expect_idx = 0_u32;
    while offset + BSET_HEADER_BYTES <= data.len() {
        let bset_magic = read_u64(data, offset, "bset header")?;
        if bset_magic != BSET_MAGIC {
            break;
        }
        let journal_seq = read_u64(data, offset + 8, "bset header")?;
        let seq_idx = read_u32(data, offset + 16, "bset header")?;
        let u64s = read_u32(data, offset + 20, "bset header")? as usize;
        let stored = Csum {
            lo: read_u64(data, offset + 24, "bset header")?,
            hi: read_u64(data, offset + 32, "bset header")?,
        };

        if seq_idx != expect_idx {
            return Err(Error::CorruptMetadata {
                btree: btree_id,
                pos: min_pos,
                detail: format!("bset ordinal {seq_idx}, expected {expect_idx}"),
            });
        }

        let body_off = offset + BSET_HEADER_BYTES;
        let body = crate::ensure(data, body_off, u64s * 8, "bset keys")?;
        if csum(
            csum_ty,
            key,
            Nonce::for_sector(sector ^ u64::from(seq_idx)),
            body,
        )? != stored
        {
            return Err(Error::BadChecksum { what: "bset" });
        }

        let mut keys = Vec::new();
        let mut pos = 0;
        while pos < body.len() {
            let (k, used) = decode_bkey(&body[pos..], &format)?;
            keys.push(k);
            pos += used;
        }
        bsets.push(Bset { journal_seq, keys });

        offset = (body_off + u64s * 8).div_ceil(BSET_ALIGN) * BSET_ALIGN;
        expect_idx += 1;
    }

    Ok((header, bsets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bch_types::keys::{BVal, LruV};

    fn header() -> NodeHeader {
        NodeHeader {
            node_seq: 0xDEAD_BEEF,
            btree_id: BtreeId::Lru,
            level: 0,
            format: BkeyFormat::for_range(Pos::new(0, 0), Pos::new(4, 1 << 30)),
            min_pos: Pos::MIN,
            max_pos: Pos::MAX,
        }
    }

    fn keys(base: u64, n: u64) -> Vec<BKey> {
        (0..n)
            .map(|i| BKey::new(Pos::new(1, base + i), BVal::Lru(LruV { bucket: i })))
            .collect()
    }

    fn build_image(bsets: &[(u64, Vec<BKey>)]) -> Vec<u8> {
        let h = header();
        let mut image = encode_node_header(&h, ChecksumType::Crc32c, None, 64).unwrap();
        for (idx, (jseq, ks)) in bsets.iter().enumerate() {
            image.extend_from_slice(
                &encode_bset(
                    ks,
                    &h.format,
                    *jseq,
                    u32::try_from(idx).unwrap(),
                    ChecksumType::Crc32c,
                    None,
                    64,
                )
                .unwrap(),
            );
        }
        image.resize(16 << 10, 0);
        image
    }

    #[test]
    fn node_round_trip_multiple_bsets() {
        let image = build_image(&[(5, keys(0, 3)), (9, keys(100, 2))]);
        let (h, bsets) = decode_node(&image, ChecksumType::Crc32c, None, 64).unwrap();
        assert_eq!(h, header());
        assert_eq!(bsets.len(), 2);
        assert_eq!(bsets[0].journal_seq, 5);
        assert_eq!(bsets[0].keys, keys(0, 3));
        assert_eq!(bsets[1].journal_seq, 9);
        assert_eq!(bsets[1].keys, keys(100, 2));
    }

    #[test]
    fn corrupt_bset_ordinal_detected() {
        let h = header();
        let mut image = encode_node_header(&h, ChecksumType::Crc32c, None, 64).unwrap();
        // Ordinal 1 with no preceding bset 0.
        image.extend_from_slice(
            &encode_bset(&keys(0, 1), &h.format, 5, 1, ChecksumType::Crc32c, None, 64).unwrap(),
        );
        image.resize(16 << 10, 0);
        let err = decode_node(&image, ChecksumType::Crc32c, None, 64).unwrap_err();
        assert!(err.is_corruption(), "got {err}");
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut image = build_image(&[(5, keys(0, 4))]);
        // Flip one byte inside the first bset's key area.
        image[BSET_ALIGN + BSET_HEADER_BYTES + 3] ^= 0x40;
        let err = decode_node(&image, ChecksumType::Crc32c, None, 64).unwrap_err();
        assert!(matches!(err, Error::BadChecksum { .. }));
    }

    #[test]
    fn flipped_header_byte_fails_checksum() {
        let mut image = build_image(&[(5, keys(0, 1))]);
        image[40] ^= 1; // format bits
        let err = decode_node(&image, ChecksumType::Crc32c, None, 64).unwrap_err();
        assert!(matches!(err, Error::BadChecksum { .. }));
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut image = build_image(&[(1, keys(0, 1))]);
        image[0] ^= 0xFF;
        assert!(matches!(
            decode_node(&image, ChecksumType::Crc32c, None, 64),
            Err(Error::BadMagic { .. })
        ));
    }

    #[test]
    fn empty_node_has_no_bsets() {
        let h = header();
        let mut image = encode_node_header(&h, ChecksumType::Crc32c, None, 64).unwrap();
        image.resize(16 << 10, 0);
        let (_, bsets) = decode_node(&image, ChecksumType::Crc32c, None, 64).unwrap();
        assert!(bsets.is_empty());
    }
}
