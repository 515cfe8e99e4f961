#![forbid(unsafe_code)]
//! Semantic types shared across the workspace.
//!
//! Defines the key-space position tuple, btree identifiers, bucket and
//! member state, target encoding, and the option metadata table. No I/O
//! and no on-disk byte layout here — codecs live in `bch-ondisk`.

pub mod keys;
pub mod opts;
pub mod target;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use keys::{
    AllocV, BKey, BVal, BtreePtrV, CrcDescriptor, DirentV, ExtentPtr, ExtentV, InodeV, KeyType,
    LruV, ReplicasV, SnapshotV, StripePtr, SubvolumeV, XattrV,
};
pub use opts::{ChecksumType, CompressionType, ErrorAction, OptKind, OptMeta, OptScope, Opts};
pub use target::Target;

/// On-disk sector size in bytes. All on-disk offsets are in sectors
/// unless stated otherwise.
pub const SECTOR_SIZE: u32 = 512;

/// Byte offset of the primary superblock on every member device.
pub const SB_OFFSET_BYTES: u64 = 4096;
/// Sector of the primary superblock.
pub const SB_SECTOR: u64 = SB_OFFSET_BYTES / SECTOR_SIZE as u64;
/// Sector holding the superblock layout record.
pub const SB_LAYOUT_SECTOR: u64 = 7;
/// Maximum number of superblock copies a layout can describe.
pub const SB_LAYOUT_MAX_OFFSETS: usize = 61;

/// Minimum number of buckets a member device must provide.
pub const MIN_NR_BUCKETS: u64 = 64;

/// Default btree node size in bytes (256 KiB).
pub const BTREE_NODE_SIZE_DEFAULT: u32 = 256 << 10;

// ── Scalar newtypes ─────────────────────────────────────────────────────────

/// Index of a member device within the filesystem (slot in the member table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u32);

/// Bucket index on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketIdx(pub u64);

/// Bucket generation. Incremented when a bucket is reused and stale
/// pointers into it must be invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gen(pub u8);

impl Gen {
    /// Next generation, wrapping. Wrapping is safe because pointer
    /// staleness is a gen *equality* check, not a comparison.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Journal sequence number. Dense and monotonically increasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Snapshot identifier carried in the position tuple. Zero means
/// "no snapshot" (internal btrees that do not version their keys).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u32);

impl SnapshotId {
    pub const NONE: Self = Self(0);
    /// Snapshot id of the initial subvolume created at format time.
    pub const ROOT: Self = Self(1);
}

// ── Position ────────────────────────────────────────────────────────────────

/// Key-space position: `(inode, offset, snapshot)` ordered
/// lexicographically. Bucket-keyed btrees reuse the tuple with the
/// device index in `inode` and the bucket (or encoded bucket) in
/// `offset`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Pos {
    pub inode: u64,
    pub offset: u64,
    pub snapshot: u32,
}

impl Pos {
    pub const MIN: Self = Self {
        inode: 0,
        offset: 0,
        snapshot: 0,
    };

    pub const MAX: Self = Self {
        inode: u64::MAX,
        offset: u64::MAX,
        snapshot: u32::MAX,
    };

    #[must_use]
    pub const fn new(inode: u64, offset: u64) -> Self {
        Self {
            inode,
            offset,
            snapshot: 0,
        }
    }

    #[must_use]
    pub const fn with_snapshot(inode: u64, offset: u64, snapshot: SnapshotId) -> Self {
        Self {
            inode,
            offset,
            snapshot: snapshot.0,
        }
    }

    /// Position of a bucket in the alloc btree.
    #[must_use]
    pub const fn bucket(dev: DeviceIdx, bucket: BucketIdx) -> Self {
        Self {
            inode: dev.0 as u64,
            offset: bucket.0,
            snapshot: 0,
        }
    }

    /// The immediate successor position, saturating at `Pos::MAX`.
    #[must_use]
    pub fn successor(self) -> Self {
        if self.snapshot < u32::MAX {
            return Self {
                snapshot: self.snapshot + 1,
                ..self
            };
        }
        if self.offset < u64::MAX {
            return Self {
                offset: self.offset + 1,
                snapshot: 0,
                ..self
            };
        }
        if self.inode < u64::MAX {
            return Self {
                inode: self.inode + 1,
                offset: 0,
                snapshot: 0,
            };
        }
        Self::MAX
    }

    /// The immediate predecessor position, saturating at `Pos::MIN`.
    #[must_use]
    pub fn predecessor(self) -> Self {
        if self.snapshot > 0 {
            return Self {
                snapshot: self.snapshot - 1,
                ..self
            };
        }
        if self.offset > 0 {
            return Self {
                offset: self.offset - 1,
                snapshot: u32::MAX,
                ..self
            };
        }
        if self.inode > 0 {
            return Self {
                inode: self.inode - 1,
                offset: u64::MAX,
                snapshot: u32::MAX,
            };
        }
        Self::MIN
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.inode, self.offset, self.snapshot)
    }
}

// ── Btree identifiers ───────────────────────────────────────────────────────

/// Identifier of one ordered key/value store. Each id names a distinct
/// btree with its own root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BtreeId {
    Extents = 0,
    Inodes = 1,
    Dirents = 2,
    Xattrs = 3,
    Alloc = 4,
    Freespace = 5,
    NeedDiscard = 6,
    Lru = 7,
    Reflink = 8,
    Subvolumes = 9,
    Snapshots = 10,
}

impl BtreeId {
    pub const ALL: [Self; 11] = [
        Self::Extents,
        Self::Inodes,
        Self::Dirents,
        Self::Xattrs,
        Self::Alloc,
        Self::Freespace,
        Self::NeedDiscard,
        Self::Lru,
        Self::Reflink,
        Self::Subvolumes,
        Self::Snapshots,
    ];

    pub fn from_u8(v: u8) -> Result<Self, TypeError> {
        Self::ALL
            .get(v as usize)
            .copied()
            .ok_or(TypeError::UnknownBtreeId { id: v })
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extents => "extents",
            Self::Inodes => "inodes",
            Self::Dirents => "dirents",
            Self::Xattrs => "xattrs",
            Self::Alloc => "alloc",
            Self::Freespace => "freespace",
            Self::NeedDiscard => "need_discard",
            Self::Lru => "lru",
            Self::Reflink => "reflink",
            Self::Subvolumes => "subvolumes",
            Self::Snapshots => "snapshots",
        }
    }

    /// Keys in the extents btree may be merged with adjacent keys;
    /// everywhere else keys are unique under the ordering.
    #[must_use]
    pub fn is_extents(self) -> bool {
        matches!(self, Self::Extents | Self::Reflink)
    }

    /// Btrees whose positions are versioned by snapshot.
    #[must_use]
    pub fn is_snapshot_keyed(self) -> bool {
        matches!(
            self,
            Self::Extents | Self::Inodes | Self::Dirents | Self::Xattrs
        )
    }
}

impl fmt::Display for BtreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Data types and member state ─────────────────────────────────────────────

/// What kind of data a bucket (or a replica set) holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Free = 0,
    Journal = 1,
    Btree = 2,
    User = 3,
    Cached = 4,
    Parity = 5,
}

impl DataType {
    pub const ALL: [Self; 6] = [
        Self::Free,
        Self::Journal,
        Self::Btree,
        Self::User,
        Self::Cached,
        Self::Parity,
    ];

    pub fn from_u8(v: u8) -> Result<Self, TypeError> {
        Self::ALL
            .get(v as usize)
            .copied()
            .ok_or(TypeError::UnknownDataType { ty: v })
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Journal => "journal",
            Self::Btree => "btree",
            Self::User => "user",
            Self::Cached => "cached",
            Self::Parity => "parity",
        }
    }

    /// Bit in a member's `data_allowed` mask.
    #[must_use]
    pub fn mask_bit(self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Journal => 1 << 0,
            Self::Btree => 1 << 1,
            Self::User => 1 << 2,
            Self::Cached => 1 << 3,
            Self::Parity => 1 << 4,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default `data_allowed` mask: everything except cached.
#[must_use]
pub fn data_allowed_default() -> u8 {
    DataType::Journal.mask_bit()
        | DataType::Btree.mask_bit()
        | DataType::User.mask_bit()
        | DataType::Parity.mask_bit()
}

/// Parse a comma-separated `data_allowed` list ("journal,btree,user").
pub fn parse_data_allowed(s: &str) -> Result<u8, TypeError> {
    let mut mask = 0_u8;
    for part in s.split(',').filter(|p| !p.is_empty()) {
        let ty = DataType::ALL
            .iter()
            .find(|t| t.as_str() == part)
            .ok_or_else(|| TypeError::UnknownFlag {
                flag: part.to_owned(),
            })?;
        mask |= ty.mask_bit();
    }
    Ok(mask)
}

/// Lifecycle state of a member device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MemberState {
    Rw = 0,
    Ro = 1,
    Failed = 2,
    Spare = 3,
}

impl MemberState {
    pub fn from_u8(v: u8) -> Result<Self, TypeError> {
        match v {
            0 => Ok(Self::Rw),
            1 => Ok(Self::Ro),
            2 => Ok(Self::Failed),
            3 => Ok(Self::Spare),
            _ => Err(TypeError::UnknownMemberState { state: v }),
        }
    }

    pub fn parse(s: &str) -> Result<Self, TypeError> {
        match s {
            "rw" => Ok(Self::Rw),
            "ro" => Ok(Self::Ro),
            "failed" => Ok(Self::Failed),
            "spare" => Ok(Self::Spare),
            _ => Err(TypeError::UnknownFlag { flag: s.to_owned() }),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rw => "rw",
            Self::Ro => "ro",
            Self::Failed => "failed",
            Self::Spare => "spare",
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// Validation errors for the semantic types. Codec errors live in
/// `bch-ondisk`, I/O errors in `bch-error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("unknown btree id {id}")]
    UnknownBtreeId { id: u8 },
    #[error("unknown key type {ty}")]
    UnknownKeyType { ty: u8 },
    #[error("unknown data type {ty}")]
    UnknownDataType { ty: u8 },
    #[error("unknown member state {state}")]
    UnknownMemberState { state: u8 },
    #[error("unknown flag {flag:?}")]
    UnknownFlag { flag: String },
    #[error("invalid key: {reason}")]
    InvalidKey { reason: &'static str },
    #[error("invalid option {opt}: {reason}")]
    InvalidOpt { opt: &'static str, reason: String },
    #[error("no such option {opt:?}")]
    NoSuchOpt { opt: String },
}

// ── Sector arithmetic ───────────────────────────────────────────────────────

/// Convert a sector count to bytes, `None` on overflow.
#[must_use]
pub fn sectors_to_bytes(sectors: u64) -> Option<u64> {
    sectors.checked_mul(u64::from(SECTOR_SIZE))
}

/// Convert a byte count to sectors, rounding up.
#[must_use]
pub fn bytes_to_sectors_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(u64::from(SECTOR_SIZE))
}

/// Round `value` down to the nearest multiple of `alignment`
/// (non-zero power of two), `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`
/// (non-zero power of two), `None` on overflow.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pos_ordering_is_lexicographic() {
        let a = Pos {
            inode: 1,
            offset: 100,
            snapshot: 0,
        };
        let b = Pos {
            inode: 1,
            offset: 100,
            snapshot: 1,
        };
        let c = Pos {
            inode: 1,
            offset: 101,
            snapshot: 0,
        };
        let d = Pos {
            inode: 2,
            offset: 0,
            snapshot: 0,
        };
        assert!(a < b && b < c && c < d);
        assert!(Pos::MIN < a && d < Pos::MAX);
    }

    #[test]
    fn pos_successor_predecessor_round_trip() {
        let p = Pos {
            inode: 3,
            offset: 7,
            snapshot: 2,
        };
        assert_eq!(p.successor().predecessor(), p);

        let wrap = Pos {
            inode: 3,
            offset: 7,
            snapshot: u32::MAX,
        };
        assert_eq!(
            wrap.successor(),
            Pos {
                inode: 3,
                offset: 8,
                snapshot: 0
            }
        );
        assert_eq!(wrap.successor().predecessor(), wrap);

        assert_eq!(Pos::MAX.successor(), Pos::MAX);
        assert_eq!(Pos::MIN.predecessor(), Pos::MIN);
    }

    #[test]
    fn btree_id_round_trip() {
        for id in BtreeId::ALL {
            assert_eq!(BtreeId::from_u8(id as u8).unwrap(), id);
        }
        assert!(BtreeId::from_u8(200).is_err());
    }

    #[test]
    fn data_allowed_parse() {
        assert_eq!(
            parse_data_allowed("journal,btree").unwrap(),
            DataType::Journal.mask_bit() | DataType::Btree.mask_bit()
        );
        assert!(parse_data_allowed("journal,bogus").is_err());
        // Default excludes cached.
        assert_eq!(data_allowed_default() & DataType::Cached.mask_bit(), 0);
    }

    #[test]
    fn gen_wraps() {
        assert_eq!(Gen(255).next(), Gen(0));
        assert_eq!(Gen(0).next(), Gen(1));
    }

    #[test]
    fn sector_math() {
        assert_eq!(sectors_to_bytes(8), Some(4096));
        assert_eq!(bytes_to_sectors_ceil(4096), 8);
        assert_eq!(bytes_to_sectors_ceil(4097), 9);
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(100, 3), None);
    }
}
