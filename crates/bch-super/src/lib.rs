#![forbid(unsafe_code)]
//! Superblock manager.
//!
//! Owns reading, validating, and rewriting the superblock copies on a
//! member device, the member table, the disk-group tree, target
//! resolution, and the encryption key material. The journal and btree
//! layers treat this crate as the source of truth for geometry.

pub mod crypt;
pub mod groups;
pub mod target;

use asupersync::Cx;
use bch_block::{ByteDevice, cx_checkpoint};
use bch_error::{Error, Result};
use bch_ondisk::sb::{SB_SIZE_BITS_DEFAULT, SbLayout, Superblock};
use bch_types::{
    MIN_NR_BUCKETS, SB_LAYOUT_SECTOR, SB_SECTOR, SECTOR_SIZE, align_down, sectors_to_bytes,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use crypt::{unlock_master_key, wrap_master_key};
pub use groups::{disk_path_find, disk_path_find_or_create, group_and_ancestors};
pub use target::{parse_target, target_devices};

/// A device handle bound to its decoded superblock.
pub struct SbHandle {
    pub dev: Arc<dyn ByteDevice>,
    pub sb: Superblock,
}

impl SbHandle {
    /// Open a device: read the layout record, then the first valid
    /// superblock copy. A bad primary falls back to the remaining
    /// offsets, ending with the backup at the device end; only if every
    /// copy is bad is the device unusable.
    pub fn open(cx: &Cx, dev: Arc<dyn ByteDevice>) -> Result<Self> {
        let sb = read_super(cx, dev.as_ref())?;
        Ok(Self { dev, sb })
    }

    /// Rewrite every superblock copy declared in the layout, bumping
    /// the sequence number first and flushing afterwards. A torn write
    /// leaves either the old or the new image valid at each offset;
    /// the reader picks the newest valid copy.
    pub fn write(&mut self, cx: &Cx) -> Result<()> {
        self.sb.seq = self.sb.seq.wrapping_add(1);
        write_super(cx, self.dev.as_ref(), &self.sb)
    }
}

/// Read and validate the superblock from a device, trying each layout
/// offset in order.
pub fn read_super(cx: &Cx, dev: &dyn ByteDevice) -> Result<Superblock> {
    let layout = read_layout(cx, dev).ok();

    // Candidate offsets: what the layout declares, else the well-known
    // primary plus an end-of-device probe.
    let offsets: Vec<u64> = match &layout {
        Some(layout) => layout.offsets.clone(),
        None => vec![SB_SECTOR, fallback_backup_sector(dev)],
    };
    let max_bytes = layout
        .as_ref()
        .map_or(1_u64 << (SB_SIZE_BITS_DEFAULT + 9), SbLayout::max_sb_bytes);

    let mut best: Option<Superblock> = None;
    let mut last_err = Error::BadMagic { offset: SB_SECTOR };
    for &sector in &offsets {
        cx_checkpoint(cx)?;
        match read_super_at(cx, dev, sector, max_bytes) {
            Ok(sb) => {
                let newer = best.as_ref().map_or(true, |b| sb.seq > b.seq);
                if newer {
                    best = Some(sb);
                }
            }
            Err(err) => {
                warn!(
                    target: "bch::super",
                    event = "superblock_copy_bad",
                    sector,
                    error = %err
                );
                last_err = err;
            }
        }
    }

    best.ok_or(last_err)
}

/// Read one superblock copy at `sector`.
pub fn read_super_at(
    cx: &Cx,
    dev: &dyn ByteDevice,
    sector: u64,
    max_bytes: u64,
) -> Result<Superblock> {
    let offset = sectors_to_bytes(sector)
        .ok_or_else(|| Error::InvalidArgument("superblock sector overflow".into()))?;
    let len = max_bytes.min(dev.len_bytes().saturating_sub(offset));
    if len < 512 {
        return Err(Error::Truncated {
            what: "superblock copy",
            needed: 512,
            have: usize::try_from(len).unwrap_or(0),
        });
    }
    let mut buf = vec![
        0_u8;
        usize::try_from(len)
            .map_err(|_| Error::InvalidArgument("superblock size overflows usize".into()))?
    ];
    dev.read_exact_at(cx, offset, &mut buf)?;
    Superblock::decode(&buf)
}

/// Read the standalone layout record at sector 7.
pub fn read_layout(cx: &Cx, dev: &dyn ByteDevice) -> Result<SbLayout> {
    let mut buf = [0_u8; SECTOR_SIZE as usize];
    dev.read_exact_at(cx, SB_LAYOUT_SECTOR * u64::from(SECTOR_SIZE), &mut buf)?;
    SbLayout::decode(&buf)
}

/// Write the superblock to every layout offset, the layout record to
/// sector 7, and flush. The checksum is recomputed by the encoder as
/// the final step before any byte hits the device.
pub fn write_super(cx: &Cx, dev: &dyn ByteDevice, sb: &Superblock) -> Result<()> {
    let image = sb.encode()?;
    let layout_image = sb.layout.encode()?;

    dev.write_all_at(
        cx,
        SB_LAYOUT_SECTOR * u64::from(SECTOR_SIZE),
        &layout_image,
    )?;
    for &sector in &sb.layout.offsets {
        let offset = sectors_to_bytes(sector)
            .ok_or_else(|| Error::InvalidArgument("layout offset overflow".into()))?;
        dev.write_all_at(cx, offset, &image)?;
    }
    dev.sync(cx)?;
    debug!(
        target: "bch::super",
        event = "superblock_written",
        seq = sb.seq,
        copies = sb.layout.offsets.len(),
        bytes = image.len()
    );
    Ok(())
}

fn fallback_backup_sector(dev: &dyn ByteDevice) -> u64 {
    let size_sectors = dev.len_bytes() / u64::from(SECTOR_SIZE);
    size_sectors.saturating_sub(1 << SB_SIZE_BITS_DEFAULT)
}

// ── Geometry chosen at format / device-add time ─────────────────────────────

/// Pick a bucket size (in sectors) for a device of `size_bytes`, given
/// the filesystem block size and btree node size in bytes.
///
/// Buckets must hold at least one btree node, should be at least 128
/// KiB when the device affords it, and are capped at 1 MiB.
pub fn pick_bucket_size(size_bytes: u64, block_size: u32, btree_node_size: u32) -> Result<u32> {
    let min_bucket_bytes = u64::from(block_size.max(btree_node_size)).max(128 << 10);
    let mut bucket_bytes = min_bucket_bytes;

    if size_bytes < MIN_NR_BUCKETS * u64::from(block_size.max(btree_node_size)) {
        return Err(Error::InvalidArgument(format!(
            "device too small: {size_bytes} bytes"
        )));
    }

    while size_bytes < MIN_NR_BUCKETS * bucket_bytes {
        bucket_bytes /= 2;
        if bucket_bytes < u64::from(block_size.max(btree_node_size)) {
            return Err(Error::InvalidArgument(format!(
                "device too small for bucket geometry: {size_bytes} bytes"
            )));
        }
    }

    // Scale up on big devices, capped at 1 MiB.
    while bucket_bytes < (1 << 20) && size_bytes / (bucket_bytes * 2) >= MIN_NR_BUCKETS * 4 {
        bucket_bytes *= 2;
    }

    u32::try_from(bucket_bytes / u64::from(SECTOR_SIZE))
        .map_err(|_| Error::InvalidArgument("bucket size overflow".into()))
}

/// Build the superblock layout for a device: two in-range copies from
/// the well-known primary sector plus a backup at the end of the
/// device, rounded down to a bucket boundary.
pub fn initial_layout(size_bytes: u64, block_size: u32, bucket_size_sectors: u32) -> Result<SbLayout> {
    let sb_size_sectors = 1_u64 << SB_SIZE_BITS_DEFAULT;
    let block_sectors = u64::from(block_size / SECTOR_SIZE).max(1);
    let size_sectors = size_bytes / u64::from(SECTOR_SIZE);

    let mut offsets = Vec::new();
    let mut pos = SB_SECTOR;
    for _ in 0..2 {
        if pos != SB_SECTOR {
            pos = pos.div_ceil(block_sectors) * block_sectors;
        }
        offsets.push(pos);
        pos += sb_size_sectors;
    }

    let backup = align_down(
        size_sectors.saturating_sub(sb_size_sectors),
        u64::from(bucket_size_sectors).next_power_of_two(),
    )
    .unwrap_or(size_sectors.saturating_sub(sb_size_sectors));
    if backup <= pos {
        return Err(Error::InvalidArgument(
            "insufficient space for superblock copies".into(),
        ));
    }
    offsets.push(backup);

    Ok(SbLayout {
        sb_max_size_bits: SB_SIZE_BITS_DEFAULT,
        offsets,
    })
}

// ── Member table edits ──────────────────────────────────────────────────────

/// Add a member row. The UUID must be unique; the slot of a previously
/// removed member may be reused.
pub fn add_member(sb: &mut Superblock, member: bch_ondisk::sb::Member) -> Result<u32> {
    if sb.members.iter().any(|m| m.uuid == member.uuid) {
        return Err(Error::Exists(format!("member uuid {}", member.uuid)));
    }
    if member.nbuckets < MIN_NR_BUCKETS {
        return Err(Error::InvalidArgument(format!(
            "member has {} buckets, need {MIN_NR_BUCKETS}",
            member.nbuckets
        )));
    }

    // Reuse a failed slot with zero buckets if one exists, else grow.
    let slot = sb
        .members
        .iter()
        .position(|m| m.state == bch_types::MemberState::Failed && m.nbuckets == 0);
    let idx = match slot {
        Some(slot) => {
            sb.members[slot] = member;
            slot
        }
        None => {
            sb.members.push(member);
            sb.members.len() - 1
        }
    };
    info!(target: "bch::super", event = "member_added", idx);
    u32::try_from(idx).map_err(|_| Error::InvalidArgument("member table overflow".into()))
}

/// Mark a member removed. The slot is retained (zeroed) so other
/// members' indices stay stable.
pub fn remove_member(sb: &mut Superblock, idx: u32) -> Result<()> {
    let member = sb
        .members
        .get_mut(idx as usize)
        .ok_or_else(|| Error::NotAMember(format!("member index {idx}")))?;
    member.state = bch_types::MemberState::Failed;
    member.nbuckets = 0;
    member.uuid = uuid::Uuid::nil();
    Ok(())
}

pub fn set_member_state(
    sb: &mut Superblock,
    idx: u32,
    state: bch_types::MemberState,
) -> Result<()> {
    let member = sb
        .members
        .get_mut(idx as usize)
        .ok_or_else(|| Error::NotAMember(format!("member index {idx}")))?;
    member.state = state;
    Ok(())
}

/// Grow (or shrink) a member's bucket count.
pub fn resize_member(sb: &mut Superblock, idx: u32, new_nbuckets: u64) -> Result<()> {
    if new_nbuckets < MIN_NR_BUCKETS {
        return Err(Error::InvalidArgument(format!(
            "cannot resize below {MIN_NR_BUCKETS} buckets"
        )));
    }
    let member = sb
        .members
        .get_mut(idx as usize)
        .ok_or_else(|| Error::NotAMember(format!("member index {idx}")))?;
    member.nbuckets = new_nbuckets;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bch_ondisk::sb::{Member, SbOpts};
    use bch_types::{ChecksumType, MemberState};
    use uuid::Uuid;

    fn cx() -> Cx {
        Cx::for_testing()
    }

    fn member(uuid: u128, nbuckets: u64) -> Member {
        Member {
            uuid: Uuid::from_u128(uuid),
            nbuckets,
            bucket_size: 256,
            first_bucket: 1,
            state: MemberState::Rw,
            discard: false,
            durability: 1,
            data_allowed: bch_types::data_allowed_default(),
            flags: 0,
            group: 0,
        }
    }

    fn sample_sb(layout: SbLayout) -> Superblock {
        Superblock {
            version: bch_ondisk::sb::SB_VERSION,
            csum_type: ChecksumType::Crc32c,
            encryption_type: 0,
            seq: 1,
            uuid: Uuid::from_u128(77),
            user_uuid: Uuid::from_u128(88),
            label: "t".into(),
            block_size: 4096,
            dev_idx: 0,
            time_base_lo: 0,
            time_precision: 1,
            features: bch_ondisk::sb::FEAT_FREESPACE,
            compat_features: 0,
            foreground_target: 0,
            background_target: 0,
            promote_target: 0,
            metadata_target: 0,
            opts: SbOpts::default(),
            layout,
            members: vec![member(1, 128)],
            groups: vec![],
            crypt: None,
            journal_buckets: vec![],
            blacklist: vec![],
            roots: vec![],
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let cx = cx();
        let dev = Arc::new(bch_block::MemDevice::new(8 << 20));
        let layout = initial_layout(8 << 20, 4096, 256).unwrap();
        let sb = sample_sb(layout);

        write_super(&cx, dev.as_ref(), &sb).unwrap();
        let back = read_super(&cx, dev.as_ref()).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn handle_rewrites_bump_seq() {
        let cx = cx();
        let dev: Arc<dyn bch_block::ByteDevice> = Arc::new(bch_block::MemDevice::new(8 << 20));
        let layout = initial_layout(8 << 20, 4096, 256).unwrap();
        let sb = sample_sb(layout);
        write_super(&cx, dev.as_ref(), &sb).unwrap();

        let mut handle = SbHandle::open(&cx, Arc::clone(&dev)).unwrap();
        assert_eq!(handle.sb.seq, sb.seq);
        handle.sb.label = "renamed".into();
        handle.write(&cx).unwrap();

        let back = read_super(&cx, dev.as_ref()).unwrap();
        assert_eq!(back.seq, sb.seq + 1);
        assert_eq!(back.label, "renamed");
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let cx = cx();
        let dev = Arc::new(bch_block::MemDevice::new(8 << 20));
        let layout = initial_layout(8 << 20, 4096, 256).unwrap();
        let sb = sample_sb(layout.clone());
        write_super(&cx, dev.as_ref(), &sb).unwrap();

        // Smash the primary copy.
        let primary_byte = usize::try_from(layout.offsets[0] * 512).unwrap();
        for i in 0..64 {
            dev.corrupt(primary_byte + i, 0xFF);
        }
        let back = read_super(&cx, dev.as_ref()).unwrap();
        assert_eq!(back.uuid, sb.uuid);
    }

    #[test]
    fn all_copies_bad_is_fatal() {
        let cx = cx();
        let dev = Arc::new(bch_block::MemDevice::new(8 << 20));
        let layout = initial_layout(8 << 20, 4096, 256).unwrap();
        let sb = sample_sb(layout.clone());
        write_super(&cx, dev.as_ref(), &sb).unwrap();

        for &sector in &layout.offsets {
            let base = usize::try_from(sector * 512).unwrap();
            for i in 0..16 {
                dev.corrupt(base + i, 0xFF);
            }
        }
        assert!(read_super(&cx, dev.as_ref()).is_err());
    }

    #[test]
    fn newest_seq_wins() {
        let cx = cx();
        let dev = Arc::new(bch_block::MemDevice::new(8 << 20));
        let layout = initial_layout(8 << 20, 4096, 256).unwrap();
        let mut sb = sample_sb(layout.clone());
        write_super(&cx, dev.as_ref(), &sb).unwrap();

        // Newer image only at the backup offset (simulates a torn
        // multi-copy update).
        sb.seq = 9;
        sb.label = "newer".into();
        let image = sb.encode().unwrap();
        let backup = *layout.offsets.last().unwrap();
        dev.write_all_at(&cx, backup * 512, &image).unwrap();

        let back = read_super(&cx, dev.as_ref()).unwrap();
        assert_eq!(back.seq, 9);
        assert_eq!(back.label, "newer");
    }

    #[test]
    fn layout_has_primary_and_backup() {
        let layout = initial_layout(64 << 20, 4096, 256).unwrap();
        assert_eq!(layout.offsets[0], SB_SECTOR);
        assert_eq!(layout.offsets.len(), 3);
        let size_sectors = (64 << 20) / 512;
        assert!(*layout.offsets.last().unwrap() < size_sectors);
        assert!(*layout.offsets.last().unwrap() > layout.offsets[1]);
    }

    #[test]
    fn bucket_size_scales_with_device() {
        let small = pick_bucket_size(16 << 20, 4096, 256 << 10).unwrap();
        assert_eq!(small, (256 << 10) / 512); // floor: one btree node
        let large = pick_bucket_size(8 << 30, 4096, 256 << 10).unwrap();
        assert_eq!(large, (1 << 20) / 512); // capped at 1 MiB
        assert!(pick_bucket_size(1 << 20, 4096, 256 << 10).is_err());
    }

    #[test]
    fn member_add_remove() {
        let layout = initial_layout(8 << 20, 4096, 256).unwrap();
        let mut sb = sample_sb(layout);

        let idx = add_member(&mut sb, member(2, 256)).unwrap();
        assert_eq!(idx, 1);
        // Duplicate UUID rejected.
        assert!(add_member(&mut sb, member(2, 256)).is_err());

        remove_member(&mut sb, 1).unwrap();
        assert_eq!(sb.members[1].nbuckets, 0);

        // Freed slot is reused.
        let idx = add_member(&mut sb, member(3, 512)).unwrap();
        assert_eq!(idx, 1);

        set_member_state(&mut sb, 0, MemberState::Ro).unwrap();
        assert_eq!(sb.members[0].state, MemberState::Ro);

        resize_member(&mut sb, 0, 4096).unwrap();
        assert_eq!(sb.members[0].nbuckets, 4096);
        assert!(resize_member(&mut sb, 0, 1).is_err());
    }
}
