//! Superblock codec.
//!
//! The superblock is a self-describing, checksummed record: fixed
//! fields, an embedded copy of the layout record, then variable-length
//! trailing sections introduced by `(type, bytes)` headers and decoded
//! through a type dispatcher. Unknown section types are skipped so a
//! newer writer does not brick an older reader; unknown *feature* bits
//! in the incompat word do fail the read.

use crate::csum::{Csum, Nonce, csum};
use crate::{Writer, ensure, read_array, read_u8, read_u16, read_u32, read_u64};
use bch_error::{Error, Result};
use bch_types::{BKey, BtreeId, ChecksumType, MemberState, SB_LAYOUT_MAX_OFFSETS, SECTOR_SIZE};
use uuid::Uuid;

pub const SB_MAGIC: u64 = 0x6263_6873_6230_6431; // "bchsb0d1"
pub const SB_VERSION: u16 = 1;

/// Default superblock copy size: 64 sectors (32 KiB).
pub const SB_SIZE_BITS_DEFAULT: u8 = 6;

/// Feature bit: freespace btree is populated (clear forces a
/// freespace-init scan on the next mount).
pub const FEAT_FREESPACE: u64 = 1 << 0;
/// All feature bits this implementation understands.
pub const KNOWN_FEATURES: u64 = FEAT_FREESPACE;

/// Member flag: this device's freespace/need-discard indices were
/// initialized from the alloc btree.
pub const MEMBER_FREESPACE_INITIALIZED: u8 = 1 << 0;

const SECTION_MEMBERS: u32 = 1;
const SECTION_GROUPS: u32 = 2;
const SECTION_CRYPT: u32 = 3;
const SECTION_JOURNAL_BUCKETS: u32 = 4;
const SECTION_BLACKLIST: u32 = 5;
const SECTION_BTREE_ROOTS: u32 = 6;

const LABEL_BYTES: usize = 32;
const FIXED_BYTES: usize = 176;
const LAYOUT_BYTES: usize = SECTOR_SIZE as usize;

// ── Layout record ───────────────────────────────────────────────────────────

/// The layout record: where superblock copies live on this device.
/// Written standalone at sector 7 and embedded in every superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbLayout {
    pub sb_max_size_bits: u8,
    /// Sector offsets of the copies, in write order. The last entry is
    /// the backup at end-of-device.
    pub offsets: Vec<u64>,
}

impl SbLayout {
    /// Bytes one superblock copy may occupy.
    #[must_use]
    pub fn max_sb_bytes(&self) -> u64 {
        (1_u64 << self.sb_max_size_bits) * u64::from(SECTOR_SIZE)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.offsets.is_empty() || self.offsets.len() > SB_LAYOUT_MAX_OFFSETS {
            return Err(Error::InvalidArgument(format!(
                "layout must carry 1..={SB_LAYOUT_MAX_OFFSETS} offsets"
            )));
        }
        let mut w = Writer::new();
        w.u64(SB_MAGIC);
        w.u8(0); // layout type
        w.u8(self.sb_max_size_bits);
        #[allow(clippy::cast_possible_truncation)]
        w.u8(self.offsets.len() as u8);
        w.zeroes(5);
        for &off in &self.offsets {
            w.u64(off);
        }
        w.zeroes((SB_LAYOUT_MAX_OFFSETS - self.offsets.len()) * 8);
        let mut out = w.into_vec();
        out.resize(LAYOUT_BYTES, 0);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if read_u64(data, 0, "sb layout")? != SB_MAGIC {
            return Err(Error::BadMagic {
                offset: bch_types::SB_LAYOUT_SECTOR,
            });
        }
        let sb_max_size_bits = read_u8(data, 9, "sb layout")?;
        let nr = usize::from(read_u8(data, 10, "sb layout")?);
        if nr == 0 || nr > SB_LAYOUT_MAX_OFFSETS {
            return Err(Error::InvalidArgument(format!(
                "layout claims {nr} superblocks"
            )));
        }
        let mut offsets = Vec::with_capacity(nr);
        for i in 0..nr {
            offsets.push(read_u64(data, 16 + i * 8, "sb layout offsets")?);
        }
        Ok(Self {
            sb_max_size_bits,
            offsets,
        })
    }
}

// ── Sections ────────────────────────────────────────────────────────────────

/// One device's row in the member table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub uuid: Uuid,
    pub nbuckets: u64,
    /// Bucket size in sectors.
    pub bucket_size: u32,
    pub first_bucket: u32,
    pub state: MemberState,
    pub discard: bool,
    pub durability: u8,
    pub data_allowed: u8,
    pub flags: u8,
    /// Disk group, one-based; zero means ungrouped.
    pub group: u32,
}

impl Member {
    #[must_use]
    pub fn freespace_initialized(&self) -> bool {
        self.flags & MEMBER_FREESPACE_INITIALIZED != 0
    }
}

/// One label in the disk-group tree. `parent` is one-based; zero means
/// a top-level group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskGroup {
    pub label: String,
    pub parent: u32,
    pub deleted: bool,
}

/// Encryption key material: the master key wrapped by a key derived
/// from the passphrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptSection {
    pub kdf_type: u32,
    pub salt: [u8; 16],
    pub nonce: [u8; 12],
    /// ChaCha20-Poly1305 sealed master key: 32 bytes of key + 16 tag.
    pub wrapped_key: [u8; 48],
}

/// Journal buckets of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalBucketsSection {
    pub dev: u32,
    pub buckets: Vec<u64>,
}

/// Persisted btree root: the pointer key for one btree's root node.
/// Journal replay may supersede these with newer root updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtreeRoot {
    pub btree_id: BtreeId,
    pub level: u8,
    pub key: BKey,
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Persistent filesystem-wide option values carried in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbOpts {
    pub btree_node_size: u32,
    pub metadata_replicas: u8,
    pub data_replicas: u8,
    pub metadata_checksum_type: u8,
    pub data_checksum_type: u8,
    pub compression: u8,
    pub error_action: u8,
    pub gc_reserve_percent: u8,
}

impl Default for SbOpts {
    fn default() -> Self {
        Self {
            btree_node_size: bch_types::BTREE_NODE_SIZE_DEFAULT,
            metadata_replicas: 1,
            data_replicas: 1,
            metadata_checksum_type: ChecksumType::Crc32c as u8,
            data_checksum_type: ChecksumType::Crc32c as u8,
            compression: 0,
            error_action: 1,
            gc_reserve_percent: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version: u16,
    pub csum_type: ChecksumType,
    pub encryption_type: u8,
    /// Bumped on every write; the reader picks the newest valid copy.
    pub seq: u64,
    /// Internal UUID: identity of this filesystem's metadata.
    pub uuid: Uuid,
    /// External UUID: what mount-by-UUID matches on.
    pub user_uuid: Uuid,
    pub label: String,
    pub block_size: u32,
    pub dev_idx: u32,
    pub time_base_lo: u64,
    pub time_precision: u32,
    pub features: u64,
    pub compat_features: u64,
    pub foreground_target: u32,
    pub background_target: u32,
    pub promote_target: u32,
    pub metadata_target: u32,
    pub opts: SbOpts,
    pub layout: SbLayout,
    pub members: Vec<Member>,
    pub groups: Vec<DiskGroup>,
    pub crypt: Option<CryptSection>,
    pub journal_buckets: Vec<JournalBucketsSection>,
    /// Blacklisted journal sequence ranges, inclusive.
    pub blacklist: Vec<(u64, u64)>,
    /// Btree roots as of the last superblock write.
    pub roots: Vec<BtreeRoot>,
}

impl Superblock {
    /// Encode, computing the checksum last. The same image is written
    /// at every layout offset.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.u16(self.version);
        w.u16(SB_VERSION); // oldest version able to read this
        w.u8(self.csum_type as u8);
        w.u8(self.encryption_type);
        w.u16(0);
        w.u64(self.seq);
        w.bytes(self.uuid.as_bytes());
        w.bytes(self.user_uuid.as_bytes());
        let mut label = [0_u8; LABEL_BYTES];
        let lbytes = self.label.as_bytes();
        if lbytes.len() > LABEL_BYTES {
            return Err(Error::InvalidArgument("label too long".into()));
        }
        label[..lbytes.len()].copy_from_slice(lbytes);
        w.bytes(&label);
        w.u32(self.block_size);
        w.u32(self.dev_idx);
        w.u64(self.time_base_lo);
        w.u32(self.time_precision);
        w.u32(self.opts.btree_node_size);
        w.u64(self.features);
        w.u64(self.compat_features);
        w.u32(self.foreground_target);
        w.u32(self.background_target);
        w.u32(self.promote_target);
        w.u32(self.metadata_target);
        w.u8(self.opts.metadata_replicas);
        w.u8(self.opts.data_replicas);
        w.u8(self.opts.metadata_checksum_type);
        w.u8(self.opts.data_checksum_type);
        w.u8(self.opts.compression);
        w.u8(self.opts.error_action);
        w.u8(self.opts.gc_reserve_percent);
        w.u8(0);

        let sections = self.encode_sections()?;
        let nr_sections = u32::try_from(sections.len())
            .map_err(|_| Error::InvalidArgument("too many superblock sections".into()))?;
        w.u32(nr_sections);
        w.u32(0);
        debug_assert_eq!(w.len() + 24, FIXED_BYTES);

        w.bytes(&self.layout.encode()?);
        for section in &sections {
            w.bytes(section);
        }
        let tail = w.into_vec();

        if (tail.len() + 24) as u64 > self.layout.max_sb_bytes() {
            return Err(Error::InvalidArgument(
                "superblock exceeds layout max size".into(),
            ));
        }

        let c = csum(self.csum_type, None, Nonce::default(), &tail)?;
        let mut out = Vec::with_capacity(24 + tail.len());
        out.extend_from_slice(&SB_MAGIC.to_le_bytes());
        out.extend_from_slice(&c.lo.to_le_bytes());
        out.extend_from_slice(&c.hi.to_le_bytes());
        out.extend_from_slice(&tail);
        Ok(out)
    }

    fn encode_sections(&self) -> Result<Vec<Vec<u8>>> {
        let mut sections = Vec::new();

        let mut m = Writer::new();
        let nr = u32::try_from(self.members.len())
            .map_err(|_| Error::InvalidArgument("too many members".into()))?;
        m.u32(nr);
        m.u32(0);
        for member in &self.members {
            m.bytes(member.uuid.as_bytes());
            m.u64(member.nbuckets);
            m.u32(member.bucket_size);
            m.u32(member.first_bucket);
            m.u8(member.state as u8);
            m.u8(u8::from(member.discard));
            m.u8(member.durability);
            m.u8(member.data_allowed);
            m.u8(member.flags);
            m.zeroes(3);
            m.u32(member.group);
            m.u32(0);
        }
        sections.push(section_frame(SECTION_MEMBERS, m.into_vec())?);

        if !self.groups.is_empty() {
            let mut g = Writer::new();
            let nr = u32::try_from(self.groups.len())
                .map_err(|_| Error::InvalidArgument("too many disk groups".into()))?;
            g.u32(nr);
            g.u32(0);
            for group in &self.groups {
                let lbytes = group.label.as_bytes();
                if lbytes.len() > LABEL_BYTES {
                    return Err(Error::InvalidArgument("group label too long".into()));
                }
                g.u32(group.parent);
                g.u8(u8::from(group.deleted));
                g.zeroes(3);
                let mut label = [0_u8; LABEL_BYTES];
                label[..lbytes.len()].copy_from_slice(lbytes);
                g.bytes(&label);
            }
            sections.push(section_frame(SECTION_GROUPS, g.into_vec())?);
        }

        if let Some(crypt) = &self.crypt {
            let mut c = Writer::new();
            c.u32(crypt.kdf_type);
            c.u32(0);
            c.bytes(&crypt.salt);
            c.bytes(&crypt.nonce);
            c.u32(0);
            c.bytes(&crypt.wrapped_key);
            sections.push(section_frame(SECTION_CRYPT, c.into_vec())?);
        }

        for jb in &self.journal_buckets {
            let mut j = Writer::new();
            j.u32(jb.dev);
            let nr = u32::try_from(jb.buckets.len())
                .map_err(|_| Error::InvalidArgument("too many journal buckets".into()))?;
            j.u32(nr);
            for &b in &jb.buckets {
                j.u64(b);
            }
            sections.push(section_frame(SECTION_JOURNAL_BUCKETS, j.into_vec())?);
        }

        if !self.blacklist.is_empty() {
            let mut b = Writer::new();
            let nr = u32::try_from(self.blacklist.len())
                .map_err(|_| Error::InvalidArgument("too many blacklist entries".into()))?;
            b.u32(nr);
            b.u32(0);
            for &(start, end) in &self.blacklist {
                b.u64(start);
                b.u64(end);
            }
            sections.push(section_frame(SECTION_BLACKLIST, b.into_vec())?);
        }

        if !self.roots.is_empty() {
            let format = crate::bkey::BkeyFormat::unpacked();
            let mut r = Writer::new();
            let nr = u32::try_from(self.roots.len())
                .map_err(|_| Error::InvalidArgument("too many btree roots".into()))?;
            r.u32(nr);
            r.u32(0);
            for root in &self.roots {
                r.u8(root.btree_id as u8);
                r.u8(root.level);
                r.zeroes(6);
                r.bytes(&crate::bkey::encode_bkey(&root.key, &format)?);
            }
            sections.push(section_frame(SECTION_BTREE_ROOTS, r.into_vec())?);
        }

        Ok(sections)
    }

    /// Decode and validate one superblock image.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if read_u64(data, 0, "superblock")? != SB_MAGIC {
            return Err(Error::BadMagic {
                offset: bch_types::SB_SECTOR,
            });
        }
        let stored = Csum {
            lo: read_u64(data, 8, "superblock")?,
            hi: read_u64(data, 16, "superblock")?,
        };
        let version = read_u16(data, 24, "superblock")?;
        let version_min = read_u16(data, 26, "superblock")?;
        if version_min > SB_VERSION {
            return Err(Error::UnknownRequiredFeature {
                bits: u64::from(version_min),
            });
        }
        let csum_type = ChecksumType::from_u8(read_u8(data, 28, "superblock")?)?;
        let encryption_type = read_u8(data, 29, "superblock")?;

        // Sections must be walked to learn the true length, so checksum
        // verification happens in two passes: parse, then verify over
        // the exact encoded extent.
        let seq = read_u64(data, 32, "superblock")?;
        let uuid = Uuid::from_bytes(read_array::<16>(data, 40, "superblock uuid")?);
        let user_uuid = Uuid::from_bytes(read_array::<16>(data, 56, "superblock uuid")?);
        let label = trim_nul(&read_array::<LABEL_BYTES>(data, 72, "superblock label")?);
        let block_size = read_u32(data, 104, "superblock")?;
        let dev_idx = read_u32(data, 108, "superblock")?;
        let time_base_lo = read_u64(data, 112, "superblock")?;
        let time_precision = read_u32(data, 120, "superblock")?;
        let btree_node_size = read_u32(data, 124, "superblock")?;
        let features = read_u64(data, 128, "superblock")?;
        let compat_features = read_u64(data, 136, "superblock")?;
        if features & !KNOWN_FEATURES != 0 {
            return Err(Error::UnknownRequiredFeature {
                bits: features & !KNOWN_FEATURES,
            });
        }
        let foreground_target = read_u32(data, 144, "superblock")?;
        let background_target = read_u32(data, 148, "superblock")?;
        let promote_target = read_u32(data, 152, "superblock")?;
        let metadata_target = read_u32(data, 156, "superblock")?;
        let opts = SbOpts {
            btree_node_size,
            metadata_replicas: read_u8(data, 160, "superblock opts")?,
            data_replicas: read_u8(data, 161, "superblock opts")?,
            metadata_checksum_type: read_u8(data, 162, "superblock opts")?,
            data_checksum_type: read_u8(data, 163, "superblock opts")?,
            compression: read_u8(data, 164, "superblock opts")?,
            error_action: read_u8(data, 165, "superblock opts")?,
            gc_reserve_percent: read_u8(data, 166, "superblock opts")?,
        };
        let nr_sections = read_u32(data, 168, "superblock")? as usize;

        let layout = SbLayout::decode(ensure(data, FIXED_BYTES, LAYOUT_BYTES, "sb layout")?)?;

        let mut members = Vec::new();
        let mut groups = Vec::new();
        let mut crypt = None;
        let mut journal_buckets = Vec::new();
        let mut blacklist = Vec::new();
        let mut roots = Vec::new();

        let mut off = FIXED_BYTES + LAYOUT_BYTES;
        for _ in 0..nr_sections {
            let ty = read_u32(data, off, "sb section header")?;
            let bytes = read_u32(data, off + 4, "sb section header")? as usize;
            let payload = ensure(data, off + 8, bytes, "sb section payload")?;
            match ty {
                SECTION_MEMBERS => {
                    let nr = read_u32(payload, 0, "members")? as usize;
                    let mut p = 8;
                    for _ in 0..nr {
                        members.push(Member {
                            uuid: Uuid::from_bytes(read_array::<16>(payload, p, "member uuid")?),
                            nbuckets: read_u64(payload, p + 16, "member")?,
                            bucket_size: read_u32(payload, p + 24, "member")?,
                            first_bucket: read_u32(payload, p + 28, "member")?,
                            state: MemberState::from_u8(read_u8(payload, p + 32, "member")?)?,
                            discard: read_u8(payload, p + 33, "member")? != 0,
                            durability: read_u8(payload, p + 34, "member")?,
                            data_allowed: read_u8(payload, p + 35, "member")?,
                            flags: read_u8(payload, p + 36, "member")?,
                            group: read_u32(payload, p + 40, "member")?,
                        });
                        p += 48;
                    }
                }
                SECTION_GROUPS => {
                    let nr = read_u32(payload, 0, "groups")? as usize;
                    let mut p = 8;
                    for _ in 0..nr {
                        groups.push(DiskGroup {
                            parent: read_u32(payload, p, "group")?,
                            deleted: read_u8(payload, p + 4, "group")? != 0,
                            label: trim_nul(&read_array::<LABEL_BYTES>(
                                payload,
                                p + 8,
                                "group label",
                            )?),
                        });
                        p += 8 + LABEL_BYTES;
                    }
                }
                SECTION_CRYPT => {
                    crypt = Some(CryptSection {
                        kdf_type: read_u32(payload, 0, "crypt")?,
                        salt: read_array(payload, 8, "crypt salt")?,
                        nonce: read_array(payload, 24, "crypt nonce")?,
                        wrapped_key: read_array(payload, 40, "crypt key")?,
                    });
                }
                SECTION_JOURNAL_BUCKETS => {
                    let dev = read_u32(payload, 0, "journal buckets")?;
                    let nr = read_u32(payload, 4, "journal buckets")? as usize;
                    let mut buckets = Vec::with_capacity(nr);
                    for i in 0..nr {
                        buckets.push(read_u64(payload, 8 + i * 8, "journal buckets")?);
                    }
                    journal_buckets.push(JournalBucketsSection { dev, buckets });
                }
                SECTION_BLACKLIST => {
                    let nr = read_u32(payload, 0, "blacklist")? as usize;
                    for i in 0..nr {
                        blacklist.push((
                            read_u64(payload, 8 + i * 16, "blacklist")?,
                            read_u64(payload, 16 + i * 16, "blacklist")?,
                        ));
                    }
                }
                SECTION_BTREE_ROOTS => {
                    let format = crate::bkey::BkeyFormat::unpacked();
                    let nr = read_u32(payload, 0, "btree roots")? as usize;
                    let mut p = 8;
                    for _ in 0..nr {
                        let btree_id = BtreeId::from_u8(read_u8(payload, p, "btree root")?)?;
                        let level = read_u8(payload, p + 1, "btree root")?;
                        let (key, used) =
                            crate::bkey::decode_bkey(&payload[p + 8..], &format)?;
                        roots.push(BtreeRoot {
                            btree_id,
                            level,
                            key,
                        });
                        p += 8 + used;
                    }
                }
                _ => {} // forward compat: skip unknown sections
            }
            off += 8 + bytes.div_ceil(8) * 8;
        }

        let tail = ensure(data, 24, off - 24, "superblock body")?;
        if csum(csum_type, None, Nonce::default(), tail)? != stored {
            return Err(Error::BadChecksum { what: "superblock" });
        }

        if (dev_idx as usize) >= members.len() {
            return Err(Error::InvalidArgument(format!(
                "dev_idx {dev_idx} out of range for {} members",
                members.len()
            )));
        }

        Ok(Self {
            version,
            csum_type,
            encryption_type,
            seq,
            uuid,
            user_uuid,
            label,
            block_size,
            dev_idx,
            time_base_lo,
            time_precision,
            features,
            compat_features,
            foreground_target,
            background_target,
            promote_target,
            metadata_target,
            opts,
            layout,
            members,
            groups,
            crypt,
            journal_buckets,
            blacklist,
            roots,
        })
    }

    /// The member record of the device this copy was read from.
    pub fn this_member(&self) -> Result<&Member> {
        self.members
            .get(self.dev_idx as usize)
            .ok_or_else(|| Error::InvalidArgument("dev_idx out of range".into()))
    }

    /// Whether `seq` falls in a blacklisted range.
    #[must_use]
    pub fn seq_blacklisted(&self, seq: u64) -> bool {
        self.blacklist
            .iter()
            .any(|&(start, end)| (start..=end).contains(&seq))
    }
}

fn section_frame(ty: u32, payload: Vec<u8>) -> Result<Vec<u8>> {
    let bytes = u32::try_from(payload.len())
        .map_err(|_| Error::InvalidArgument("superblock section too large".into()))?;
    let mut w = Writer::new();
    w.u32(ty);
    w.u32(bytes);
    w.bytes(&payload);
    w.pad_to(8);
    Ok(w.into_vec())
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sb() -> Superblock {
        Superblock {
            version: SB_VERSION,
            csum_type: ChecksumType::Crc32c,
            encryption_type: 0,
            seq: 7,
            uuid: Uuid::from_u128(0x1111_2222_3333_4444_5555_6666_7777_8888),
            user_uuid: Uuid::from_u128(0xAAAA_BBBB_CCCC_DDDD_EEEE_FFFF_0000_1111),
            label: "scratch".into(),
            block_size: 4096,
            dev_idx: 1,
            time_base_lo: 123_456_789,
            time_precision: 1,
            features: FEAT_FREESPACE,
            compat_features: 0,
            foreground_target: 0,
            background_target: 0,
            promote_target: (2 << 30) | 1,
            metadata_target: 0,
            opts: SbOpts {
                data_replicas: 2,
                ..SbOpts::default()
            },
            layout: SbLayout {
                sb_max_size_bits: SB_SIZE_BITS_DEFAULT,
                offsets: vec![8, 72, 16320],
            },
            members: vec![
                Member {
                    uuid: Uuid::from_u128(1),
                    nbuckets: 1024,
                    bucket_size: 256,
                    first_bucket: 1,
                    state: MemberState::Rw,
                    discard: false,
                    durability: 1,
                    data_allowed: bch_types::data_allowed_default(),
                    flags: MEMBER_FREESPACE_INITIALIZED,
                    group: 0,
                },
                Member {
                    uuid: Uuid::from_u128(2),
                    nbuckets: 512,
                    bucket_size: 256,
                    first_bucket: 1,
                    state: MemberState::Rw,
                    discard: true,
                    durability: 2,
                    data_allowed: bch_types::DataType::Cached.mask_bit(),
                    flags: 0,
                    group: 2,
                },
            ],
            groups: vec![
                DiskGroup {
                    label: "ssd".into(),
                    parent: 0,
                    deleted: false,
                },
                DiskGroup {
                    label: "fast".into(),
                    parent: 1,
                    deleted: false,
                },
            ],
            crypt: None,
            journal_buckets: vec![
                JournalBucketsSection {
                    dev: 0,
                    buckets: vec![1, 2, 3, 4],
                },
                JournalBucketsSection {
                    dev: 1,
                    buckets: vec![1, 2],
                },
            ],
            blacklist: vec![(10, 12)],
            roots: vec![BtreeRoot {
                btree_id: BtreeId::Extents,
                level: 1,
                key: BKey::new(
                    bch_types::Pos::MAX,
                    bch_types::BVal::BtreePtr(bch_types::BtreePtrV {
                        ptrs: vec![bch_types::ExtentPtr {
                            dev: bch_types::DeviceIdx(0),
                            offset: 512,
                            gen: bch_types::Gen(0),
                            cached: false,
                        }],
                        node_seq: 42,
                        min_pos: bch_types::Pos::MIN,
                    }),
                ),
            }],
        }
    }

    #[test]
    fn round_trip() {
        let sb = sample_sb();
        let bytes = sb.encode().unwrap();
        let decoded = Superblock::decode(&bytes).unwrap();
        assert_eq!(decoded, sb);
    }

    #[test]
    fn round_trip_with_crypt() {
        let mut sb = sample_sb();
        sb.encryption_type = 1;
        sb.crypt = Some(CryptSection {
            kdf_type: 1,
            salt: [9; 16],
            nonce: [3; 12],
            wrapped_key: [5; 48],
        });
        let bytes = sb.encode().unwrap();
        assert_eq!(Superblock::decode(&bytes).unwrap(), sb);
    }

    #[test]
    fn torn_write_is_detected() {
        let sb = sample_sb();
        let mut bytes = sb.encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            Superblock::decode(&bytes),
            Err(Error::BadChecksum { .. })
        ));
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample_sb().encode().unwrap();
        bytes[3] ^= 1;
        assert!(matches!(
            Superblock::decode(&bytes),
            Err(Error::BadMagic { .. })
        ));
    }

    #[test]
    fn unknown_required_feature_fails() {
        let mut sb = sample_sb();
        sb.features |= 1 << 40;
        let bytes = sb.encode().unwrap();
        assert!(matches!(
            Superblock::decode(&bytes),
            Err(Error::UnknownRequiredFeature { .. })
        ));
    }

    #[test]
    fn truncated_fails() {
        let bytes = sample_sb().encode().unwrap();
        assert!(Superblock::decode(&bytes[..100]).is_err());
    }

    #[test]
    fn layout_round_trip() {
        let layout = SbLayout {
            sb_max_size_bits: 6,
            offsets: vec![8, 72, 99999],
        };
        let bytes = layout.encode().unwrap();
        assert_eq!(bytes.len(), LAYOUT_BYTES);
        assert_eq!(SbLayout::decode(&bytes).unwrap(), layout);
    }

    #[test]
    fn blacklist_ranges() {
        let sb = sample_sb();
        assert!(!sb.seq_blacklisted(9));
        assert!(sb.seq_blacklisted(10));
        assert!(sb.seq_blacklisted(12));
        assert!(!sb.seq_blacklisted(13));
    }

    #[test]
    fn seq_comparison_prefers_newest() {
        let mut a = sample_sb();
        let mut b = sample_sb();
        a.seq = 5;
        b.seq = 6;
        assert!(b.seq > a.seq);
    }
}
