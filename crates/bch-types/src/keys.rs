//! Keys and key values.
//!
//! A [`BKey`] is a position, a size, and a tagged value. The value enum
//! is the closed set of key types the filesystem understands; each
//! variant knows how to validate itself. Byte-level packing lives in
//! `bch-ondisk`.

use crate::{BtreeId, BucketIdx, DeviceIdx, Gen, Pos, SnapshotId, TypeError};
use serde::{Deserialize, Serialize};

/// On-disk key type tags. The tag is stable; renumbering is a format
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyType {
    Deleted = 0,
    Inode = 1,
    Dirent = 2,
    Xattr = 3,
    Extent = 4,
    Alloc = 5,
    Freespace = 6,
    NeedDiscard = 7,
    Lru = 8,
    Replicas = 9,
    Snapshot = 10,
    Subvolume = 11,
    BtreePtr = 12,
}

impl KeyType {
    pub const ALL: [Self; 13] = [
        Self::Deleted,
        Self::Inode,
        Self::Dirent,
        Self::Xattr,
        Self::Extent,
        Self::Alloc,
        Self::Freespace,
        Self::NeedDiscard,
        Self::Lru,
        Self::Replicas,
        Self::Snapshot,
        Self::Subvolume,
        Self::BtreePtr,
    ];

    pub fn from_u8(v: u8) -> Result<Self, TypeError> {
        Self::ALL
            .get(v as usize)
            .copied()
            .ok_or(TypeError::UnknownKeyType { ty: v })
    }
}

// ── Value payloads ──────────────────────────────────────────────────────────

/// Inode value. Sizes and times are bytes and nanoseconds; `sectors` is
/// the on-disk footprint used for usage accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeV {
    pub mode: u16,
    pub nlink: u32,
    pub size: u64,
    pub sectors: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub flags: u32,
    pub subvol: u32,
    /// Per-inode option overrides. `None` inherits the filesystem
    /// default (or the parent directory's override via re-inherit).
    pub compression: Option<u8>,
    pub data_checksum: Option<u8>,
    pub data_replicas: Option<u8>,
    pub foreground_target: Option<u32>,
    pub background_target: Option<u32>,
    pub promote_target: Option<u32>,
    /// Which overrides were set on this inode directly (bit per option,
    /// in field order). Re-inherit skips them; copies written by
    /// propagation leave the bit clear.
    pub explicit: u32,
}

impl InodeV {
    /// Whether any option override is set explicitly on this inode.
    #[must_use]
    pub fn has_override(&self) -> bool {
        self.compression.is_some()
            || self.data_checksum.is_some()
            || self.data_replicas.is_some()
            || self.foreground_target.is_some()
            || self.background_target.is_some()
            || self.promote_target.is_some()
    }
}

/// Directory entry: name under a directory inode, pointing at a target
/// inode. Key position is `(dir_inode, name_hash, snapshot)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirentV {
    pub target: u64,
    pub d_type: u8,
    pub name: Vec<u8>,
}

/// Extended attribute. Key position is `(inode, name_hash, snapshot)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrV {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// One replica pointer of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub dev: DeviceIdx,
    /// Device offset in sectors.
    pub offset: u64,
    /// Bucket generation the pointer was written under. A mismatch with
    /// the live alloc record means the pointer is stale.
    pub gen: Gen,
    /// Cached replicas may be dropped without violating durability.
    pub cached: bool,
}

/// Checksum/compression descriptor for an extent's on-disk image.
///
/// The image always covers `uncompressed_sectors` of logical data;
/// when a key is trimmed, `offset` moves instead of rewriting the
/// image, so checksums stay valid over the original write unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrcDescriptor {
    pub csum_type: u8,
    pub compression_type: u8,
    /// Sectors occupied on disk (after compression, rounded up).
    pub compressed_sectors: u32,
    /// Sectors of logical data the image decodes to.
    pub uncompressed_sectors: u32,
    /// Logical offset of this key's data within the decoded image.
    pub offset: u32,
    /// Per-extent nonce component; feeds the checksum/encryption nonce
    /// so identical payloads at identical positions stay distinct
    /// across rewrites. Replica-independent by construction.
    pub nonce: u32,
    pub csum: [u64; 2],
}

/// Back-reference from an extent to the erasure stripe holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripePtr {
    pub idx: u64,
    pub block: u8,
}

/// Extent value: where the data lives, how it is protected, and how
/// many replicas the caller requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentV {
    pub ptrs: Vec<ExtentPtr>,
    pub crc: CrcDescriptor,
    pub stripe: Option<StripePtr>,
    pub nr_required: u8,
}

impl ExtentV {
    /// Pointers that still count toward durability (not cached).
    pub fn durable_ptrs(&self) -> impl Iterator<Item = &ExtentPtr> {
        self.ptrs.iter().filter(|p| !p.cached)
    }
}

/// Allocator bucket flags.
pub const ALLOC_NEED_DISCARD: u8 = 1 << 0;
pub const ALLOC_NEED_INC_GEN: u8 = 1 << 1;

/// Bucket io_time slots.
pub const IO_TIME_READ: usize = 0;
pub const IO_TIME_WRITE: usize = 1;

/// Full allocator state of one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocV {
    pub gen: Gen,
    pub data_type: u8,
    pub dirty_sectors: u32,
    pub cached_sectors: u32,
    /// `[read, write]` clocks. The read clock doubles as the bucket's
    /// LRU index (invariant: one LRU entry per cached bucket).
    pub io_time: [u64; 2],
    pub stripe: u32,
    pub flags: u8,
    /// Journal sequence at the last state transition; discards wait
    /// until this is durable.
    pub journal_seq: u64,
}

impl AllocV {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirty_sectors == 0 && self.cached_sectors == 0
    }

    #[must_use]
    pub fn need_discard(&self) -> bool {
        self.flags & ALLOC_NEED_DISCARD != 0
    }

    #[must_use]
    pub fn need_inc_gen(&self) -> bool {
        self.flags & ALLOC_NEED_INC_GEN != 0
    }
}

/// Freespace entries carry no payload; the position encodes device,
/// generation bits, and bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreespaceV;

/// LRU entries point back at their bucket; the position encodes the
/// read-time index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruV {
    pub bucket: u64,
}

/// Replica-set accounting entry: how many extents reference this exact
/// (data type, device list) combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasV {
    pub data_type: u8,
    pub devs: Vec<u32>,
    pub sectors: u64,
}

/// Node in the snapshot tree. Children are zero when absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotV {
    pub parent: u32,
    pub children: [u32; 2],
    pub subvol: u32,
}

/// Subvolume: a named root inode with its own snapshot identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeV {
    pub root_inode: u64,
    pub snapshot: u32,
    pub readonly: bool,
}

/// Interior-node pointer to a child btree node. The key's position is
/// the child's max position, so interior search is "first key >=
/// cursor". Child locations are plain replica pointers — interior
/// nodes never own their children, the node cache does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreePtrV {
    pub ptrs: Vec<ExtentPtr>,
    /// Identity the child's bsets must carry.
    pub node_seq: u64,
    /// First position the child covers.
    pub min_pos: Pos,
}

// ── The key ─────────────────────────────────────────────────────────────────

/// Tagged value union over the closed key-type set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BVal {
    Deleted,
    Inode(InodeV),
    Dirent(DirentV),
    Xattr(XattrV),
    Extent(ExtentV),
    Alloc(AllocV),
    Freespace(FreespaceV),
    NeedDiscard,
    Lru(LruV),
    Replicas(ReplicasV),
    Snapshot(SnapshotV),
    Subvolume(SubvolumeV),
    BtreePtr(BtreePtrV),
}

impl BVal {
    #[must_use]
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Deleted => KeyType::Deleted,
            Self::Inode(_) => KeyType::Inode,
            Self::Dirent(_) => KeyType::Dirent,
            Self::Xattr(_) => KeyType::Xattr,
            Self::Extent(_) => KeyType::Extent,
            Self::Alloc(_) => KeyType::Alloc,
            Self::Freespace(_) => KeyType::Freespace,
            Self::NeedDiscard => KeyType::NeedDiscard,
            Self::Lru(_) => KeyType::Lru,
            Self::Replicas(_) => KeyType::Replicas,
            Self::Snapshot(_) => KeyType::Snapshot,
            Self::Subvolume(_) => KeyType::Subvolume,
            Self::BtreePtr(_) => KeyType::BtreePtr,
        }
    }
}

/// A complete key: position, logical size (sectors; extents only), and
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BKey {
    pub pos: Pos,
    pub size: u32,
    pub val: BVal,
}

impl BKey {
    #[must_use]
    pub fn new(pos: Pos, val: BVal) -> Self {
        Self { pos, size: 0, val }
    }

    /// Whiteout at `pos`.
    #[must_use]
    pub fn deleted(pos: Pos) -> Self {
        Self {
            pos,
            size: 0,
            val: BVal::Deleted,
        }
    }

    /// Extent covering `size` sectors starting at `pos.offset`.
    #[must_use]
    pub fn extent(pos: Pos, size: u32, val: ExtentV) -> Self {
        Self {
            pos,
            size,
            val: BVal::Extent(val),
        }
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        matches!(self.val, BVal::Deleted)
    }

    /// First offset past the range this key covers.
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.pos.offset.saturating_add(u64::from(self.size))
    }

    /// Structural validation appropriate to the btree the key is bound
    /// for. Invariant violations here are corruption, not user error.
    pub fn validate(&self, btree: BtreeId) -> Result<(), TypeError> {
        let ok_for_btree = matches!(
            (btree, &self.val),
            (_, BVal::Deleted)
                | (_, BVal::BtreePtr(_))
                | (BtreeId::Extents | BtreeId::Reflink, BVal::Extent(_))
                | (BtreeId::Inodes, BVal::Inode(_))
                | (BtreeId::Dirents, BVal::Dirent(_))
                | (BtreeId::Xattrs, BVal::Xattr(_))
                | (BtreeId::Alloc, BVal::Alloc(_))
                | (BtreeId::Freespace, BVal::Freespace(_))
                | (BtreeId::NeedDiscard, BVal::NeedDiscard)
                | (BtreeId::Lru, BVal::Lru(_))
                | (BtreeId::Subvolumes, BVal::Subvolume(_) | BVal::Replicas(_))
                | (BtreeId::Snapshots, BVal::Snapshot(_))
        );
        if !ok_for_btree {
            return Err(TypeError::InvalidKey {
                reason: "key type not valid for btree",
            });
        }

        if self.size != 0 && !matches!(self.val, BVal::Extent(_) | BVal::Deleted) {
            return Err(TypeError::InvalidKey {
                reason: "nonzero size on non-extent key",
            });
        }

        match &self.val {
            BVal::Extent(e) => {
                if self.size == 0 {
                    return Err(TypeError::InvalidKey {
                        reason: "zero-size extent",
                    });
                }
                if e.ptrs.is_empty() {
                    return Err(TypeError::InvalidKey {
                        reason: "extent with no pointers",
                    });
                }
                let covered = u64::from(e.crc.offset) + u64::from(self.size);
                if covered > u64::from(e.crc.uncompressed_sectors) {
                    return Err(TypeError::InvalidKey {
                        reason: "extent crc does not cover key size",
                    });
                }
                if self.pos.offset.checked_add(u64::from(self.size)).is_none() {
                    return Err(TypeError::InvalidKey {
                        reason: "extent end overflows",
                    });
                }
            }
            BVal::Dirent(d) => {
                if d.name.is_empty() || d.name.len() > 255 {
                    return Err(TypeError::InvalidKey {
                        reason: "dirent name length out of range",
                    });
                }
            }
            BVal::Xattr(x) => {
                if x.name.is_empty() || x.name.len() > 255 {
                    return Err(TypeError::InvalidKey {
                        reason: "xattr name length out of range",
                    });
                }
            }
            BVal::Snapshot(s) => {
                if s.parent == self.pos.offset as u32 && s.parent != 0 {
                    return Err(TypeError::InvalidKey {
                        reason: "snapshot is its own parent",
                    });
                }
            }
            BVal::BtreePtr(p) => {
                if p.ptrs.is_empty() {
                    return Err(TypeError::InvalidKey {
                        reason: "btree pointer with no replicas",
                    });
                }
                if p.min_pos > self.pos {
                    return Err(TypeError::InvalidKey {
                        reason: "btree pointer min above max",
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether `self` immediately followed by `next` can be merged into
    /// one key. Only extent keys merge, and only when the images are
    /// physically contiguous on every replica.
    #[must_use]
    pub fn can_merge(&self, next: &Self) -> bool {
        let (BVal::Extent(a), BVal::Extent(b)) = (&self.val, &next.val) else {
            return false;
        };
        if self.pos.inode != next.pos.inode
            || self.pos.snapshot != next.pos.snapshot
            || self.end_offset() != next.pos.offset
        {
            return false;
        }
        if a.crc.csum_type != b.crc.csum_type
            || a.crc.compression_type != 0
            || b.crc.compression_type != 0
            || a.crc.csum_type != 0
        {
            // Checksummed or compressed images cover a fixed range and
            // cannot be concatenated without rewriting.
            return false;
        }
        if a.ptrs.len() != b.ptrs.len() || a.stripe.is_some() || b.stripe.is_some() {
            return false;
        }
        a.ptrs.iter().zip(b.ptrs.iter()).all(|(pa, pb)| {
            pa.dev == pb.dev
                && pa.gen == pb.gen
                && pa.cached == pb.cached
                && pa.offset + u64::from(a.crc.compressed_sectors) == pb.offset
        })
    }
}

// ── Position encodings for bucket-keyed btrees ──────────────────────────────

/// Number of low bits of the bucket generation folded into freespace
/// key offsets.
pub const FREESPACE_GEN_BITS: u32 = 8;

/// Freespace btree position for `(dev, bucket, gen)`: generation bits
/// are concatenated above the bucket index.
#[must_use]
pub fn freespace_pos(dev: DeviceIdx, bucket: BucketIdx, gen: Gen) -> Pos {
    Pos {
        inode: u64::from(dev.0),
        offset: (u64::from(gen.0) << (64 - FREESPACE_GEN_BITS)) | bucket.0,
        snapshot: 0,
    }
}

/// Decode a freespace position back into `(bucket, gen_bits)`.
#[must_use]
pub fn freespace_decode(pos: Pos) -> (BucketIdx, u8) {
    let gen_bits = (pos.offset >> (64 - FREESPACE_GEN_BITS)) as u8;
    let bucket = pos.offset & ((1_u64 << (64 - FREESPACE_GEN_BITS)) - 1);
    (BucketIdx(bucket), gen_bits)
}

/// LRU btree position for a cached bucket: keyed by read time so the
/// head of the btree is the invalidation candidate.
#[must_use]
pub fn lru_pos(dev: DeviceIdx, read_time: u64) -> Pos {
    Pos {
        inode: u64::from(dev.0),
        offset: read_time,
        snapshot: 0,
    }
}

/// Snapshot tree key position.
#[must_use]
pub fn snapshot_pos(id: SnapshotId) -> Pos {
    Pos::new(0, u64::from(id.0))
}

/// Subvolume key position.
#[must_use]
pub fn subvolume_pos(subvol: u32) -> Pos {
    Pos::new(SUBVOL_INUM, u64::from(subvol))
}

/// Inode namespace of subvolume keys within the subvolumes btree.
pub const SUBVOL_INUM: u64 = 0;
/// Inode namespace of replica-set accounting keys within the
/// subvolumes btree. Keeping them in a btree (rather than a superblock
/// side table) lets the accounting trigger commit them in the same
/// transaction as the extents they count.
pub const REPLICAS_INUM: u64 = 1;

/// Replica-set accounting key position. `idx` is the stable index
/// assigned when the (data type, device set) combination is first seen.
#[must_use]
pub fn replicas_pos(idx: u64) -> Pos {
    Pos::new(REPLICAS_INUM, idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_extent(ptrs: Vec<ExtentPtr>, size: u32) -> ExtentV {
        ExtentV {
            ptrs,
            crc: CrcDescriptor {
                compressed_sectors: size,
                uncompressed_sectors: size,
                ..CrcDescriptor::default()
            },
            stripe: None,
            nr_required: 1,
        }
    }

    fn ptr(dev: u32, offset: u64) -> ExtentPtr {
        ExtentPtr {
            dev: DeviceIdx(dev),
            offset,
            gen: Gen(0),
            cached: false,
        }
    }

    #[test]
    fn key_type_round_trip() {
        for ty in KeyType::ALL {
            assert_eq!(KeyType::from_u8(ty as u8).unwrap(), ty);
        }
        assert!(KeyType::from_u8(99).is_err());
    }

    #[test]
    fn validate_rejects_cross_btree_values() {
        let k = BKey::new(Pos::new(1, 0), BVal::Inode(InodeV::default()));
        assert!(k.validate(BtreeId::Inodes).is_ok());
        assert!(k.validate(BtreeId::Extents).is_err());
    }

    #[test]
    fn validate_extent_shape() {
        let good = BKey::extent(Pos::new(1, 8), 8, test_extent(vec![ptr(0, 64)], 8));
        assert!(good.validate(BtreeId::Extents).is_ok());

        let no_ptrs = BKey::extent(Pos::new(1, 8), 8, test_extent(vec![], 8));
        assert!(no_ptrs.validate(BtreeId::Extents).is_err());

        let mut bad_crc = good.clone();
        if let BVal::Extent(e) = &mut bad_crc.val {
            e.crc.uncompressed_sectors = 4;
        }
        assert!(bad_crc.validate(BtreeId::Extents).is_err());
    }

    #[test]
    fn extent_merge_requires_contiguity() {
        let a = BKey::extent(Pos::new(1, 0), 8, test_extent(vec![ptr(0, 100)], 8));
        let b = BKey::extent(Pos::new(1, 8), 8, test_extent(vec![ptr(0, 108)], 8));
        let c = BKey::extent(Pos::new(1, 8), 8, test_extent(vec![ptr(0, 200)], 8));
        assert!(a.can_merge(&b));
        assert!(!a.can_merge(&c));
        // Gap in the logical range.
        let d = BKey::extent(Pos::new(1, 9), 8, test_extent(vec![ptr(0, 108)], 8));
        assert!(!a.can_merge(&d));
    }

    #[test]
    fn checksummed_extents_do_not_merge() {
        let mut av = test_extent(vec![ptr(0, 100)], 8);
        av.crc.csum_type = 1;
        let mut bv = test_extent(vec![ptr(0, 108)], 8);
        bv.crc.csum_type = 1;
        let a = BKey::extent(Pos::new(1, 0), 8, av);
        let b = BKey::extent(Pos::new(1, 8), 8, bv);
        assert!(!a.can_merge(&b));
    }

    #[test]
    fn freespace_pos_round_trip() {
        let pos = freespace_pos(DeviceIdx(2), BucketIdx(1234), Gen(0xAB));
        assert_eq!(pos.inode, 2);
        let (bucket, gen_bits) = freespace_decode(pos);
        assert_eq!(bucket, BucketIdx(1234));
        assert_eq!(gen_bits, 0xAB);
    }

    #[test]
    fn freespace_orders_gen_before_bucket() {
        let old = freespace_pos(DeviceIdx(0), BucketIdx(9999), Gen(0));
        let newer = freespace_pos(DeviceIdx(0), BucketIdx(1), Gen(1));
        assert!(old < newer);
    }
}
