//! Key packing.
//!
//! Keys are stored as a one-word header, the position/size fields
//! (either raw or bit-packed against a per-node format), and the value
//! body. The packed form stores each field minus a per-field offset in
//! a reduced bit width; a node whose keys span a narrow range packs to
//! a fraction of the raw size. The unpacked decoder accepts any packed
//! input by consulting the format table.

use crate::{Writer, bytes_to_u64s, ensure, read_u8, read_u16, read_u32, read_u64};
use bch_error::{Error, Result};
use bch_types::keys::{
    AllocV, BVal, BtreePtrV, CrcDescriptor, DirentV, ExtentPtr, ExtentV, FreespaceV, InodeV,
    KeyType, LruV, ReplicasV, SnapshotV, StripePtr, SubvolumeV, XattrV,
};
use bch_types::{BKey, DeviceIdx, Gen, Pos};

const FORMAT_UNPACKED: u8 = 0;
const FORMAT_PACKED: u8 = 1;

/// Key header plus unpacked position take 4 u64 words.
const UNPACKED_FIXED_U64S: usize = 4;
/// Largest encodable key: the length field is a byte of u64 words.
pub const MAX_KEY_U64S: usize = u8::MAX as usize;

const FIELD_INODE: usize = 0;
const FIELD_OFFSET: usize = 1;
const FIELD_SNAPSHOT: usize = 2;
const FIELD_SIZE: usize = 3;

/// Per-node packing table: bit width and base offset per field, in
/// field order (inode, offset, snapshot, size).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BkeyFormat {
    pub bits: [u8; 4],
    pub field_offset: [u64; 4],
}

impl Default for BkeyFormat {
    fn default() -> Self {
        Self::unpacked()
    }
}

impl BkeyFormat {
    /// The identity format: full-width fields, zero offsets.
    #[must_use]
    pub fn unpacked() -> Self {
        Self {
            bits: [64, 64, 32, 32],
            field_offset: [0; 4],
        }
    }

    /// Format sized for keys within `[min, max]` positions.
    #[must_use]
    pub fn for_range(min: Pos, max: Pos) -> Self {
        Self {
            bits: [
                bits_for(max.inode.saturating_sub(min.inode)),
                bits_for(max.offset.saturating_sub(min.offset)),
                bits_for(u64::from(max.snapshot.saturating_sub(min.snapshot))).min(32),
                32,
            ],
            field_offset: [min.inode, min.offset, u64::from(min.snapshot), 0],
        }
    }

    fn field_values(pos: Pos, size: u32) -> [u64; 4] {
        [
            pos.inode,
            pos.offset,
            u64::from(pos.snapshot),
            u64::from(size),
        ]
    }

    /// Whether `(pos, size)` fits this format's widths and offsets.
    #[must_use]
    pub fn can_pack(&self, pos: Pos, size: u32) -> bool {
        Self::field_values(pos, size)
            .iter()
            .enumerate()
            .all(|(i, &v)| {
                let Some(rel) = v.checked_sub(self.field_offset[i]) else {
                    return false;
                };
                let bits = u32::from(self.bits[i]);
                bits >= 64 || rel < (1_u64 << bits)
            })
    }

    /// Words occupied by the packed field area.
    #[must_use]
    pub fn packed_u64s(&self) -> usize {
        let total_bits: u32 = self.bits.iter().map(|&b| u32::from(b)).sum();
        (total_bits as usize).div_ceil(64)
    }
}

#[must_use]
fn bits_for(max_value: u64) -> u8 {
    if max_value == 0 {
        1
    } else {
        #[allow(clippy::cast_possible_truncation)]
        {
            (64 - max_value.leading_zeros()) as u8
        }
    }
}

// ── Bit stream ──────────────────────────────────────────────────────────────

struct BitWriter {
    words: Vec<u64>,
    bit: usize,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            words: Vec::new(),
            bit: 0,
        }
    }

    fn push(&mut self, value: u64, bits: u8) {
        let mut remaining = u32::from(bits);
        let mut value = if remaining >= 64 {
            value
        } else {
            value & ((1_u64 << remaining) - 1)
        };
        while remaining > 0 {
            let word = self.bit / 64;
            let shift = self.bit % 64;
            if word == self.words.len() {
                self.words.push(0);
            }
            let take = (64 - shift).min(remaining as usize);
            self.words[word] |= value << shift;
            if take < 64 {
                value >>= take;
            } else {
                value = 0;
            }
            self.bit += take;
            remaining -= take as u32;
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn pull(&mut self, bits: u8) -> Result<u64> {
        let mut out = 0_u64;
        let mut got = 0_u32;
        let mut remaining = u32::from(bits);
        while remaining > 0 {
            let byte = self.bit / 8;
            let shift = self.bit % 8;
            let b = *self.data.get(byte).ok_or(Error::Truncated {
                what: "packed key fields",
                needed: byte + 1,
                have: self.data.len(),
            })?;
            let avail = 8 - shift;
            let take = avail.min(remaining as usize);
            let mask = if take == 8 { 0xFF } else { (1_u16 << take) - 1 } as u8;
            let chunk = (b >> shift) & mask;
            if got < 64 {
                out |= u64::from(chunk) << got;
            }
            self.bit += take;
            got += take as u32;
            remaining -= take as u32;
        }
        Ok(out)
    }
}

// ── Key encode/decode ───────────────────────────────────────────────────────

/// Encode a key against `format`. Keys whose fields do not fit the
/// format are written unpacked; readers accept both.
pub fn encode_bkey(key: &BKey, format: &BkeyFormat) -> Result<Vec<u8>> {
    let body = encode_val(&key.val)?;
    debug_assert_eq!(body.len() % 8, 0);

    let mut w = Writer::new();
    let packed = format.can_pack(key.pos, key.size);
    let fixed_u64s = if packed {
        1 + format.packed_u64s()
    } else {
        UNPACKED_FIXED_U64S
    };
    let total_u64s = fixed_u64s + body.len() / 8;
    if total_u64s > MAX_KEY_U64S {
        return Err(Error::InvalidArgument("key too large to encode".into()));
    }

    #[allow(clippy::cast_possible_truncation)]
    w.u8(total_u64s as u8);
    w.u8(if packed { FORMAT_PACKED } else { FORMAT_UNPACKED });
    w.u8(key.val.key_type() as u8);
    w.u8(0);
    w.u32(0);

    if packed {
        let mut bits = BitWriter::new();
        let values = [
            key.pos.inode - format.field_offset[FIELD_INODE],
            key.pos.offset - format.field_offset[FIELD_OFFSET],
            u64::from(key.pos.snapshot) - format.field_offset[FIELD_SNAPSHOT],
            u64::from(key.size) - format.field_offset[FIELD_SIZE],
        ];
        for (i, v) in values.into_iter().enumerate() {
            bits.push(v, format.bits[i]);
        }
        let packed_bytes = bits.into_bytes();
        debug_assert_eq!(packed_bytes.len(), format.packed_u64s() * 8);
        w.bytes(&packed_bytes);
    } else {
        w.u64(key.pos.inode);
        w.u64(key.pos.offset);
        w.u32(key.pos.snapshot);
        w.u32(key.size);
    }

    w.bytes(&body);
    Ok(w.into_vec())
}

/// Decode one key at the start of `data`, returning it and the bytes
/// consumed.
pub fn decode_bkey(data: &[u8], format: &BkeyFormat) -> Result<(BKey, usize)> {
    let u64s = usize::from(read_u8(data, 0, "key header")?);
    if u64s == 0 {
        return Err(Error::InvalidArgument("zero-length key".into()));
    }
    let total = u64s * 8;
    ensure(data, 0, total, "key body")?;

    let fmt = read_u8(data, 1, "key header")?;
    let ty = KeyType::from_u8(read_u8(data, 2, "key header")?)?;

    let (pos, size, fixed) = match fmt {
        FORMAT_UNPACKED => {
            let inode = read_u64(data, 8, "key position")?;
            let offset = read_u64(data, 16, "key position")?;
            let snapshot = read_u32(data, 24, "key position")?;
            let size = read_u32(data, 28, "key position")?;
            (
                Pos {
                    inode,
                    offset,
                    snapshot,
                },
                size,
                UNPACKED_FIXED_U64S * 8,
            )
        }
        FORMAT_PACKED => {
            let field_area = format.packed_u64s() * 8;
            let raw = ensure(data, 8, field_area, "packed key fields")?;
            let mut r = BitReader::new(raw);
            let mut values = [0_u64; 4];
            for (i, slot) in values.iter_mut().enumerate() {
                *slot = r
                    .pull(format.bits[i])?
                    .checked_add(format.field_offset[i])
                    .ok_or(Error::InvalidArgument("packed field overflow".into()))?;
            }
            let snapshot = u32::try_from(values[FIELD_SNAPSHOT])
                .map_err(|_| Error::InvalidArgument("packed snapshot overflow".into()))?;
            let size = u32::try_from(values[FIELD_SIZE])
                .map_err(|_| Error::InvalidArgument("packed size overflow".into()))?;
            (
                Pos {
                    inode: values[FIELD_INODE],
                    offset: values[FIELD_OFFSET],
                    snapshot,
                },
                size,
                8 + field_area,
            )
        }
        other => {
            return Err(Error::InvalidArgument(format!(
                "unknown key format byte {other}"
            )));
        }
    };

    if fixed > total {
        return Err(Error::Truncated {
            what: "key value",
            needed: fixed,
            have: total,
        });
    }
    let val = decode_val(ty, &data[fixed..total])?;
    Ok((BKey { pos, size, val }, total))
}

// ── Value bodies ────────────────────────────────────────────────────────────

fn encode_val(val: &BVal) -> Result<Vec<u8>> {
    let mut w = Writer::new();
    match val {
        BVal::Deleted | BVal::NeedDiscard | BVal::Freespace(FreespaceV) => {}
        BVal::Inode(i) => {
            w.u16(i.mode);
            w.u16(0);
            w.u32(i.nlink);
            w.u64(i.size);
            w.u64(i.sectors);
            w.u64(i.atime);
            w.u64(i.mtime);
            w.u64(i.ctime);
            w.u32(i.flags);
            w.u32(i.subvol);
            let mut present = 0_u32;
            for (bit, set) in [
                i.compression.is_some(),
                i.data_checksum.is_some(),
                i.data_replicas.is_some(),
                i.foreground_target.is_some(),
                i.background_target.is_some(),
                i.promote_target.is_some(),
            ]
            .into_iter()
            .enumerate()
            {
                if set {
                    present |= 1 << bit;
                }
            }
            w.u32(present);
            w.u8(i.compression.unwrap_or(0));
            w.u8(i.data_checksum.unwrap_or(0));
            w.u8(i.data_replicas.unwrap_or(0));
            w.u8(0);
            w.u32(i.foreground_target.unwrap_or(0));
            w.u32(i.background_target.unwrap_or(0));
            w.u32(i.promote_target.unwrap_or(0));
            w.u32(i.explicit);
        }
        BVal::Dirent(d) => {
            if d.name.len() > u8::MAX as usize {
                return Err(Error::InvalidArgument("dirent name too long".into()));
            }
            w.u64(d.target);
            w.u8(d.d_type);
            #[allow(clippy::cast_possible_truncation)]
            w.u8(d.name.len() as u8);
            w.u16(0);
            w.u32(0);
            w.bytes(&d.name);
        }
        BVal::Xattr(x) => {
            if x.name.len() > u8::MAX as usize {
                return Err(Error::InvalidArgument("xattr name too long".into()));
            }
            if x.value.len() > 1024 {
                return Err(Error::InvalidArgument("xattr value too long".into()));
            }
            #[allow(clippy::cast_possible_truncation)]
            w.u8(x.name.len() as u8);
            w.zeroes(3);
            #[allow(clippy::cast_possible_truncation)]
            w.u32(x.value.len() as u32);
            w.bytes(&x.name);
            w.bytes(&x.value);
        }
        BVal::Extent(e) => {
            if e.ptrs.len() > u8::MAX as usize {
                return Err(Error::InvalidArgument("too many extent pointers".into()));
            }
            w.u8(e.nr_required);
            #[allow(clippy::cast_possible_truncation)]
            w.u8(e.ptrs.len() as u8);
            w.u8(u8::from(e.stripe.is_some()));
            w.u8(0);
            w.u32(0);
            w.u8(e.crc.csum_type);
            w.u8(e.crc.compression_type);
            w.u16(0);
            w.u32(e.crc.offset);
            w.u32(e.crc.compressed_sectors);
            w.u32(e.crc.uncompressed_sectors);
            w.u32(e.crc.nonce);
            w.u32(0);
            w.u64(e.crc.csum[0]);
            w.u64(e.crc.csum[1]);
            if let Some(s) = e.stripe {
                w.u64(s.idx);
                w.u8(s.block);
                w.zeroes(7);
            }
            for p in &e.ptrs {
                w.u32(p.dev.0);
                w.u8(p.gen.0);
                w.u8(u8::from(p.cached));
                w.u16(0);
                w.u64(p.offset);
            }
        }
        BVal::Alloc(a) => {
            w.u8(a.gen.0);
            w.u8(a.data_type);
            w.u8(a.flags);
            w.u8(0);
            w.u32(a.dirty_sectors);
            w.u32(a.cached_sectors);
            w.u32(a.stripe);
            w.u64(a.io_time[0]);
            w.u64(a.io_time[1]);
            w.u64(a.journal_seq);
        }
        BVal::Lru(l) => {
            w.u64(l.bucket);
        }
        BVal::Replicas(r) => {
            if r.devs.len() > u8::MAX as usize {
                return Err(Error::InvalidArgument("too many replica devices".into()));
            }
            w.u8(r.data_type);
            #[allow(clippy::cast_possible_truncation)]
            w.u8(r.devs.len() as u8);
            w.u16(0);
            w.u32(0);
            w.u64(r.sectors);
            for d in &r.devs {
                w.u32(*d);
            }
        }
        BVal::Snapshot(s) => {
            w.u32(s.parent);
            w.u32(s.children[0]);
            w.u32(s.children[1]);
            w.u32(s.subvol);
        }
        BVal::Subvolume(s) => {
            w.u64(s.root_inode);
            w.u32(s.snapshot);
            w.u8(u8::from(s.readonly));
            w.zeroes(3);
        }
        BVal::BtreePtr(p) => {
            if p.ptrs.len() > u8::MAX as usize {
                return Err(Error::InvalidArgument("too many node replicas".into()));
            }
            #[allow(clippy::cast_possible_truncation)]
            w.u8(p.ptrs.len() as u8);
            w.zeroes(7);
            w.u64(p.node_seq);
            w.u64(p.min_pos.inode);
            w.u64(p.min_pos.offset);
            w.u32(p.min_pos.snapshot);
            w.u32(0);
            for ptr in &p.ptrs {
                w.u32(ptr.dev.0);
                w.u8(ptr.gen.0);
                w.u8(u8::from(ptr.cached));
                w.u16(0);
                w.u64(ptr.offset);
            }
        }
    }
    w.pad_to(8);
    Ok(w.into_vec())
}

fn decode_val(ty: KeyType, body: &[u8]) -> Result<BVal> {
    Ok(match ty {
        KeyType::Deleted => BVal::Deleted,
        KeyType::NeedDiscard => BVal::NeedDiscard,
        KeyType::Freespace => BVal::Freespace(FreespaceV),
        KeyType::Inode => {
            let present = read_u32(body, 56, "inode options")?;
            let opt_u8 = |bit: u32, off: usize| -> Result<Option<u8>> {
                Ok((present & (1 << bit) != 0).then_some(read_u8(body, off, "inode options")?))
            };
            let opt_u32 = |bit: u32, off: usize| -> Result<Option<u32>> {
                Ok((present & (1 << bit) != 0).then_some(read_u32(body, off, "inode options")?))
            };
            BVal::Inode(InodeV {
                mode: read_u16(body, 0, "inode")?,
                nlink: read_u32(body, 4, "inode")?,
                size: read_u64(body, 8, "inode")?,
                sectors: read_u64(body, 16, "inode")?,
                atime: read_u64(body, 24, "inode")?,
                mtime: read_u64(body, 32, "inode")?,
                ctime: read_u64(body, 40, "inode")?,
                flags: read_u32(body, 48, "inode")?,
                subvol: read_u32(body, 52, "inode")?,
                compression: opt_u8(0, 60)?,
                data_checksum: opt_u8(1, 61)?,
                data_replicas: opt_u8(2, 62)?,
                foreground_target: opt_u32(3, 64)?,
                background_target: opt_u32(4, 68)?,
                promote_target: opt_u32(5, 72)?,
                explicit: read_u32(body, 76, "inode options")?,
            })
        }
        KeyType::Dirent => {
            let target = read_u64(body, 0, "dirent")?;
            let d_type = read_u8(body, 8, "dirent")?;
            let name_len = usize::from(read_u8(body, 9, "dirent")?);
            let name = ensure(body, 16, name_len, "dirent name")?.to_vec();
            BVal::Dirent(DirentV {
                target,
                d_type,
                name,
            })
        }
        KeyType::Xattr => {
            let name_len = usize::from(read_u8(body, 0, "xattr")?);
            let val_len = read_u32(body, 4, "xattr")? as usize;
            let name = ensure(body, 8, name_len, "xattr name")?.to_vec();
            let value = ensure(body, 8 + name_len, val_len, "xattr value")?.to_vec();
            BVal::Xattr(XattrV { name, value })
        }
        KeyType::Extent => {
            let nr_required = read_u8(body, 0, "extent")?;
            let nr_ptrs = usize::from(read_u8(body, 1, "extent")?);
            let has_stripe = read_u8(body, 2, "extent")? != 0;
            let crc = CrcDescriptor {
                csum_type: read_u8(body, 8, "extent crc")?,
                compression_type: read_u8(body, 9, "extent crc")?,
                offset: read_u32(body, 12, "extent crc")?,
                compressed_sectors: read_u32(body, 16, "extent crc")?,
                uncompressed_sectors: read_u32(body, 20, "extent crc")?,
                nonce: read_u32(body, 24, "extent crc")?,
                csum: [
                    read_u64(body, 32, "extent crc")?,
                    read_u64(body, 40, "extent crc")?,
                ],
            };
            let mut off = 48;
            let stripe = if has_stripe {
                let s = StripePtr {
                    idx: read_u64(body, off, "extent stripe")?,
                    block: read_u8(body, off + 8, "extent stripe")?,
                };
                off += 16;
                Some(s)
            } else {
                None
            };
            let mut ptrs = Vec::with_capacity(nr_ptrs);
            for _ in 0..nr_ptrs {
                ptrs.push(ExtentPtr {
                    dev: DeviceIdx(read_u32(body, off, "extent ptr")?),
                    gen: Gen(read_u8(body, off + 4, "extent ptr")?),
                    cached: read_u8(body, off + 5, "extent ptr")? != 0,
                    offset: read_u64(body, off + 8, "extent ptr")?,
                });
                off += 16;
            }
            BVal::Extent(ExtentV {
                ptrs,
                crc,
                stripe,
                nr_required,
            })
        }
        KeyType::Alloc => BVal::Alloc(AllocV {
            gen: Gen(read_u8(body, 0, "alloc")?),
            data_type: read_u8(body, 1, "alloc")?,
            flags: read_u8(body, 2, "alloc")?,
            dirty_sectors: read_u32(body, 4, "alloc")?,
            cached_sectors: read_u32(body, 8, "alloc")?,
            stripe: read_u32(body, 12, "alloc")?,
            io_time: [
                read_u64(body, 16, "alloc")?,
                read_u64(body, 24, "alloc")?,
            ],
            journal_seq: read_u64(body, 32, "alloc")?,
        }),
        KeyType::Lru => BVal::Lru(LruV {
            bucket: read_u64(body, 0, "lru")?,
        }),
        KeyType::Replicas => {
            let data_type = read_u8(body, 0, "replicas")?;
            let nr = usize::from(read_u8(body, 1, "replicas")?);
            let sectors = read_u64(body, 8, "replicas")?;
            let mut devs = Vec::with_capacity(nr);
            for i in 0..nr {
                devs.push(read_u32(body, 16 + i * 4, "replicas devs")?);
            }
            BVal::Replicas(ReplicasV {
                data_type,
                devs,
                sectors,
            })
        }
        KeyType::Snapshot => BVal::Snapshot(SnapshotV {
            parent: read_u32(body, 0, "snapshot")?,
            children: [
                read_u32(body, 4, "snapshot")?,
                read_u32(body, 8, "snapshot")?,
            ],
            subvol: read_u32(body, 12, "snapshot")?,
        }),
        KeyType::Subvolume => BVal::Subvolume(SubvolumeV {
            root_inode: read_u64(body, 0, "subvolume")?,
            snapshot: read_u32(body, 8, "subvolume")?,
            readonly: read_u8(body, 12, "subvolume")? != 0,
        }),
        KeyType::BtreePtr => {
            let nr = usize::from(read_u8(body, 0, "btree ptr")?);
            let node_seq = read_u64(body, 8, "btree ptr")?;
            let min_pos = Pos {
                inode: read_u64(body, 16, "btree ptr")?,
                offset: read_u64(body, 24, "btree ptr")?,
                snapshot: read_u32(body, 32, "btree ptr")?,
            };
            let mut ptrs = Vec::with_capacity(nr);
            let mut off = 40;
            for _ in 0..nr {
                ptrs.push(ExtentPtr {
                    dev: DeviceIdx(read_u32(body, off, "btree ptr")?),
                    gen: Gen(read_u8(body, off + 4, "btree ptr")?),
                    cached: read_u8(body, off + 5, "btree ptr")? != 0,
                    offset: read_u64(body, off + 8, "btree ptr")?,
                });
                off += 16;
            }
            BVal::BtreePtr(BtreePtrV {
                ptrs,
                node_seq,
                min_pos,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bch_types::SnapshotId;

    fn sample_keys() -> Vec<BKey> {
        vec![
            BKey::deleted(Pos::new(5, 9)),
            BKey::new(
                Pos::with_snapshot(10, 0, SnapshotId(3)),
                BVal::Inode(InodeV {
                    mode: 0o100_644,
                    nlink: 1,
                    size: 1_048_576,
                    sectors: 2048,
                    atime: 111,
                    mtime: 222,
                    ctime: 333,
                    flags: 0,
                    subvol: 1,
                    compression: Some(3),
                    data_checksum: None,
                    data_replicas: Some(2),
                    foreground_target: None,
                    background_target: Some(7),
                    promote_target: None,
                    explicit: 0b101,
                }),
            ),
            BKey::new(
                Pos::new(10, 0xDEAD),
                BVal::Dirent(DirentV {
                    target: 42,
                    d_type: 4,
                    name: b"some-file".to_vec(),
                }),
            ),
            BKey::new(
                Pos::new(10, 0xBEEF),
                BVal::Xattr(XattrV {
                    name: b"bcachefs.compression".to_vec(),
                    value: b"zstd".to_vec(),
                }),
            ),
            BKey::extent(
                Pos::with_snapshot(10, 128, SnapshotId(3)),
                64,
                ExtentV {
                    ptrs: vec![
                        ExtentPtr {
                            dev: DeviceIdx(0),
                            offset: 4096,
                            gen: Gen(2),
                            cached: false,
                        },
                        ExtentPtr {
                            dev: DeviceIdx(1),
                            offset: 8192,
                            gen: Gen(9),
                            cached: true,
                        },
                    ],
                    crc: CrcDescriptor {
                        csum_type: 1,
                        compression_type: 3,
                        compressed_sectors: 32,
                        uncompressed_sectors: 64,
                        offset: 4,
                        nonce: 0xFACE,
                        csum: [0xAABB, 0xCCDD],
                    },
                    stripe: Some(StripePtr { idx: 77, block: 1 }),
                    nr_required: 2,
                },
            ),
            BKey::new(
                Pos::bucket(DeviceIdx(1), bch_types::BucketIdx(55)),
                BVal::Alloc(AllocV {
                    gen: Gen(4),
                    data_type: 3,
                    dirty_sectors: 100,
                    cached_sectors: 0,
                    io_time: [12, 34],
                    stripe: 0,
                    flags: 1,
                    journal_seq: 99,
                }),
            ),
            BKey::new(Pos::new(2, 1 << 40), BVal::Freespace(FreespaceV)),
            BKey::new(Pos::new(2, 77), BVal::NeedDiscard),
            BKey::new(Pos::new(1, 123_456), BVal::Lru(LruV { bucket: 55 })),
            BKey::new(
                bch_types::keys::replicas_pos(4),
                BVal::Replicas(ReplicasV {
                    data_type: 3,
                    devs: vec![0, 2],
                    sectors: 4096,
                }),
            ),
            BKey::new(
                Pos::new(0, 4),
                BVal::Snapshot(SnapshotV {
                    parent: 1,
                    children: [5, 6],
                    subvol: 2,
                }),
            ),
            BKey::new(
                Pos::new(0, 2),
                BVal::Subvolume(SubvolumeV {
                    root_inode: 4096,
                    snapshot: 4,
                    readonly: true,
                }),
            ),
            BKey::new(
                Pos::new(77, 1 << 30),
                BVal::BtreePtr(BtreePtrV {
                    ptrs: vec![
                        ExtentPtr {
                            dev: DeviceIdx(0),
                            offset: 2048,
                            gen: Gen(1),
                            cached: false,
                        },
                        ExtentPtr {
                            dev: DeviceIdx(2),
                            offset: 4096,
                            gen: Gen(7),
                            cached: false,
                        },
                    ],
                    node_seq: 0xFEED,
                    min_pos: Pos::new(77, 0),
                }),
            ),
        ]
    }

    #[test]
    fn unpacked_round_trip() {
        let format = BkeyFormat::unpacked();
        for key in sample_keys() {
            let bytes = encode_bkey(&key, &format).unwrap();
            assert_eq!(bytes.len() % 8, 0);
            let (decoded, consumed) = decode_bkey(&bytes, &format).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(decoded, key, "round trip failed for {key:?}");
        }
    }

    #[test]
    fn packed_round_trip() {
        let format = BkeyFormat::for_range(
            Pos::new(10, 0),
            Pos {
                inode: 10,
                offset: 1 << 20,
                snapshot: 16,
            },
        );
        let key = BKey::extent(
            Pos::with_snapshot(10, 128, SnapshotId(3)),
            64,
            ExtentV {
                ptrs: vec![ExtentPtr {
                    dev: DeviceIdx(0),
                    offset: 4096,
                    gen: Gen(2),
                    cached: false,
                }],
                crc: CrcDescriptor {
                    compressed_sectors: 64,
                    uncompressed_sectors: 64,
                    ..CrcDescriptor::default()
                },
                stripe: None,
                nr_required: 1,
            },
        );
        let bytes = encode_bkey(&key, &format).unwrap();
        assert_eq!(bytes[1], FORMAT_PACKED);
        let (decoded, _) = decode_bkey(&bytes, &format).unwrap();
        assert_eq!(decoded, key);

        // Packed must be smaller than the unpacked rendition.
        let unpacked = encode_bkey(&key, &BkeyFormat::unpacked()).unwrap();
        assert!(bytes.len() < unpacked.len());
    }

    #[test]
    fn out_of_range_key_falls_back_to_unpacked() {
        let format = BkeyFormat::for_range(Pos::new(10, 0), Pos::new(10, 100));
        let key = BKey::deleted(Pos::new(99, 5));
        let bytes = encode_bkey(&key, &format).unwrap();
        assert_eq!(bytes[1], FORMAT_UNPACKED);
        let (decoded, _) = decode_bkey(&bytes, &format).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let format = BkeyFormat::unpacked();
        let key = BKey::new(
            Pos::new(10, 1),
            BVal::Dirent(DirentV {
                target: 1,
                d_type: 8,
                name: b"x".to_vec(),
            }),
        );
        let bytes = encode_bkey(&key, &format).unwrap();
        for cut in 1..bytes.len() {
            assert!(
                decode_bkey(&bytes[..cut], &format).is_err(),
                "cut at {cut} decoded"
            );
        }
    }

    #[test]
    fn bit_writer_reader_agree() {
        let mut w = BitWriter::new();
        w.push(0x3, 2);
        w.push(0x1FF, 9);
        w.push(u64::MAX, 64);
        w.push(0, 1);
        w.push(12345, 17);
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.pull(2).unwrap(), 0x3);
        assert_eq!(r.pull(9).unwrap(), 0x1FF);
        assert_eq!(r.pull(64).unwrap(), u64::MAX);
        assert_eq!(r.pull(1).unwrap(), 0);
        assert_eq!(r.pull(17).unwrap(), 12345);
    }
}
