//! Format driver.
//!
//! Creates a filesystem across one or more devices: geometry (bucket
//! sizes, superblock layout with two in-range copies and an end-of-
//! device backup), the member table and disk groups, journal buckets,
//! initial btree roots, bucket states, and the root subvolume. The
//! resulting image mounts with an empty journal.

use crate::{Fs, OpenOptions, ROOT_INUM};
use asupersync::Cx;
use bch_alloc::BucketIndexTrigger;
use bch_block::{Device, DeviceSet, FileByteDevice, cx_checkpoint};
use bch_btree::{BtreeConfig, BtreeSys, NodeAlloc};
use bch_error::{Error, Result};
use bch_journal::Journal;
use bch_ondisk::sb::{
    BtreeRoot, JournalBucketsSection, MEMBER_FREESPACE_INITIALIZED, Member, SB_VERSION, Superblock,
};
use bch_super::{disk_path_find_or_create, initial_layout, parse_target, pick_bucket_size,
    write_super};
use bch_txn::{CommitTrigger, commit_do};
use bch_types::keys::{InodeV, SnapshotV, SubvolumeV, snapshot_pos, subvolume_pos};
use bch_types::{
    AllocV, BKey, BVal, BtreeId, BucketIdx, ChecksumType, DataType, DeviceIdx, DevOpts, ExtentPtr,
    Gen, JournalSeq, MemberState, Opts, Pos, SECTOR_SIZE, SnapshotId,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Journal buckets reserved per device at format time.
const JOURNAL_BUCKETS_MIN: u64 = 8;
/// Initial btree region (buckets per device) consumed by the format
/// bootstrap allocator.
const BOOTSTRAP_BUCKETS: u64 = 8;

/// One device being formatted.
#[derive(Debug, Clone)]
pub struct FormatDev {
    pub path: PathBuf,
    pub opts: DevOpts,
    /// Override the detected size (bytes); zero means use the file.
    pub size: u64,
    /// Override the computed bucket size (sectors); zero means pick.
    pub bucket_size: u32,
}

impl FormatDev {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            opts: DevOpts::default(),
            size: 0,
            bucket_size: 0,
        }
    }
}

/// Whole-filesystem format parameters.
#[derive(Debug, Clone, Default)]
pub struct FormatOpts {
    pub opts: Opts,
    pub label: String,
    pub uuid: Option<Uuid>,
    pub passphrase: Option<String>,
    pub foreground_target: String,
    pub background_target: String,
    pub promote_target: String,
    pub metadata_target: String,
}

fn random_bytes<const N: usize>() -> [u8; N] {
    // The OS RNG by way of v4 UUID generation; concatenate as needed.
    let mut out = [0_u8; N];
    let mut filled = 0;
    while filled < N {
        let chunk = *Uuid::new_v4().as_bytes();
        let take = (N - filled).min(16);
        out[filled..filled + take].copy_from_slice(&chunk[..take]);
        filled += take;
    }
    out
}

/// Bump allocator over each device's reserved bootstrap region; only
/// alive until the real allocator has btrees to read.
struct FormatBootstrapAlloc {
    regions: Mutex<Vec<(DeviceIdx, u64, u64)>>, // (dev, next_sector, limit)
    node_sectors: u64,
}

impl NodeAlloc for FormatBootstrapAlloc {
    fn alloc_node(&self, _cx: &Cx) -> Result<Vec<ExtentPtr>> {
        let mut regions = self.regions.lock();
        for (dev, next, limit) in regions.iter_mut() {
            if *next + self.node_sectors <= *limit {
                let sector = *next;
                *next += self.node_sectors;
                return Ok(vec![ExtentPtr {
                    dev: *dev,
                    offset: sector,
                    gen: Gen(0),
                    cached: false,
                }]);
            }
        }
        Err(Error::NoSpace)
    }

    fn free_node(&self, _cx: &Cx, _ptrs: &[ExtentPtr]) {}
}

/// Format `devs` into a new filesystem and return its external UUID.
pub fn format(cx: &Cx, devs: &[FormatDev], format_opts: &FormatOpts) -> Result<Uuid> {
    if devs.is_empty() {
        return Err(Error::InvalidArgument("format needs at least one device".into()));
    }
    let opts = &format_opts.opts;
    let block_size = opts.block_size.unwrap_or(4096);
    let btree_node_size = opts.btree_node_size();

    // Per-device geometry.
    struct Geometry {
        path: PathBuf,
        dev: Arc<FileByteDevice>,
        bucket_size: u32,
        nbuckets: u64,
        layout: bch_ondisk::sb::SbLayout,
        journal_buckets: Vec<u64>,
    }
    let mut geometries = Vec::new();
    for fd in devs {
        let dev = Arc::new(FileByteDevice::open(&fd.path)?);
        let size = if fd.size > 0 {
            fd.size.min(dev.len_bytes())
        } else {
            dev.len_bytes()
        };
        let bucket_size = if fd.bucket_size > 0 {
            fd.bucket_size
        } else {
            pick_bucket_size(size, block_size, btree_node_size)?
        };
        if u64::from(bucket_size) * u64::from(SECTOR_SIZE) < u64::from(btree_node_size) {
            return Err(Error::InvalidArgument(format!(
                "bucket size {bucket_size} sectors cannot hold a btree node"
            )));
        }
        let nbuckets = size / (u64::from(bucket_size) * u64::from(SECTOR_SIZE));
        let layout = initial_layout(size, block_size, bucket_size)?;

        // Journal buckets follow the superblock copies.
        let sb_end_sector = layout.offsets[1] + (1 << layout.sb_max_size_bits);
        let first_usable_bucket = sb_end_sector.div_ceil(u64::from(bucket_size)).max(1);
        let nr_journal = (nbuckets / 256).max(JOURNAL_BUCKETS_MIN);
        let journal_buckets: Vec<u64> =
            (first_usable_bucket..first_usable_bucket + nr_journal).collect();
        if journal_buckets.last().copied().unwrap_or(0) + BOOTSTRAP_BUCKETS + 8 >= nbuckets {
            return Err(Error::InvalidArgument(format!(
                "{} too small to format",
                fd.path.display()
            )));
        }

        geometries.push(Geometry {
            path: fd.path.clone(),
            dev,
            bucket_size,
            nbuckets,
            layout,
            journal_buckets,
        });
    }

    // The superblock.
    let user_uuid = format_opts.uuid.unwrap_or_else(Uuid::new_v4);
    let mut sb = Superblock {
        version: SB_VERSION,
        csum_type: opts.metadata_checksum_type(),
        encryption_type: u8::from(format_opts.passphrase.is_some()),
        seq: 1,
        uuid: Uuid::new_v4(),
        user_uuid,
        label: format_opts.label.clone(),
        block_size,
        dev_idx: 0,
        time_base_lo: crate::attrs::now_nanos(),
        time_precision: 1,
        features: bch_ondisk::sb::FEAT_FREESPACE,
        compat_features: 0,
        foreground_target: 0,
        background_target: 0,
        promote_target: 0,
        metadata_target: 0,
        opts: bch_ondisk::sb::SbOpts {
            btree_node_size,
            metadata_replicas: opts.metadata_replicas(),
            data_replicas: opts.data_replicas(),
            metadata_checksum_type: opts.metadata_checksum_type() as u8,
            data_checksum_type: opts.data_checksum_type() as u8,
            compression: opts.compression() as u8,
            error_action: opts.error_action() as u8,
            gc_reserve_percent: opts.gc_reserve_percent(),
        },
        layout: geometries[0].layout.clone(),
        members: Vec::new(),
        groups: Vec::new(),
        crypt: None,
        journal_buckets: Vec::new(),
        blacklist: Vec::new(),
        roots: Vec::new(),
    };

    for (idx, (geo, fd)) in geometries.iter().zip(devs.iter()).enumerate() {
        let mut member = Member {
            uuid: Uuid::new_v4(),
            nbuckets: geo.nbuckets,
            bucket_size: geo.bucket_size,
            first_bucket: 1,
            state: MemberState::Rw,
            discard: fd.opts.discard,
            durability: fd.opts.durability,
            data_allowed: fd.opts.data_allowed,
            flags: MEMBER_FREESPACE_INITIALIZED,
            group: 0,
        };
        if let Some(group) = &fd.opts.group {
            member.group = disk_path_find_or_create(&mut sb, group)? + 1;
        }
        sb.members.push(member);
        sb.journal_buckets.push(JournalBucketsSection {
            dev: u32::try_from(idx).unwrap_or(u32::MAX),
            buckets: geo.journal_buckets.clone(),
        });
    }

    // Targets resolve against the member table and group tree.
    let dev_paths: Vec<(DeviceIdx, &Path)> = geometries
        .iter()
        .enumerate()
        .map(|(i, g)| (DeviceIdx(u32::try_from(i).unwrap_or(u32::MAX)), g.path.as_path()))
        .collect();
    sb.foreground_target = parse_target(&sb, &dev_paths, &format_opts.foreground_target)?.to_u32();
    sb.background_target = parse_target(&sb, &dev_paths, &format_opts.background_target)?.to_u32();
    sb.promote_target = parse_target(&sb, &dev_paths, &format_opts.promote_target)?.to_u32();
    sb.metadata_target = parse_target(&sb, &dev_paths, &format_opts.metadata_target)?.to_u32();

    // Encryption: a fresh master key sealed under the passphrase.
    if let Some(passphrase) = &format_opts.passphrase {
        let master: [u8; 32] = random_bytes();
        let salt: [u8; 16] = random_bytes();
        let nonce: [u8; 12] = random_bytes();
        sb.crypt = Some(bch_super::wrap_master_key(&master, passphrase, salt, nonce)?);
    }
    let master_key = match (&sb.crypt, &format_opts.passphrase) {
        (Some(crypt), Some(passphrase)) => Some(bch_super::unlock_master_key(crypt, passphrase)?),
        _ => None,
    };

    // Zero the start of each disk so stale magic cannot resurrect.
    for geo in &geometries {
        let zeroes = vec![0_u8; bch_types::SB_OFFSET_BYTES as usize];
        geo.dev.write_all_at(cx, 0, &zeroes)?;
    }

    // Bring up transient structures to write the initial btrees.
    let devices = Arc::new(DeviceSet::new());
    for (idx, geo) in geometries.iter().enumerate() {
        let idx = u32::try_from(idx).unwrap_or(u32::MAX);
        devices.insert(Arc::new(Device::new(
            DeviceIdx(idx),
            geo.path.clone(),
            Arc::<FileByteDevice>::clone(&geo.dev) as Arc<dyn bch_block::ByteDevice>,
            MemberState::Rw,
            geo.bucket_size,
            geo.nbuckets,
            1,
            devs[idx as usize].opts.durability,
            devs[idx as usize].opts.data_allowed,
            devs[idx as usize].opts.discard,
        )));
    }
    let journal_slots: Vec<(Arc<Device>, Vec<u64>)> = geometries
        .iter()
        .enumerate()
        .filter_map(|(idx, geo)| {
            devices
                .get(DeviceIdx(u32::try_from(idx).unwrap_or(u32::MAX)))
                .map(|d| (d, geo.journal_buckets.clone()))
        })
        .collect();
    let metadata_csum = opts.metadata_checksum_type();
    let journal = Arc::new(Journal::new(
        journal_slots,
        JournalSeq(1),
        metadata_csum,
        master_key,
    )?);
    let config = BtreeConfig {
        node_size: btree_node_size,
        csum_type: metadata_csum,
        metadata_replicas: opts.metadata_replicas(),
        key: master_key,
    };
    let sys = Arc::new(BtreeSys::new(
        Arc::clone(&devices),
        config,
        Arc::clone(&journal),
        1024,
        1,
    ));

    // Bootstrap regions right after each device's journal buckets.
    let bootstrap: Vec<(DeviceIdx, u64, u64)> = geometries
        .iter()
        .enumerate()
        .map(|(idx, geo)| {
            let first = geo.journal_buckets.last().copied().unwrap_or(1) + 1;
            let dev = DeviceIdx(u32::try_from(idx).unwrap_or(u32::MAX));
            (
                dev,
                first * u64::from(geo.bucket_size),
                (first + BOOTSTRAP_BUCKETS) * u64::from(geo.bucket_size),
            )
        })
        .collect();
    let bootstrap_ranges: Vec<(u32, u64, u64)> = bootstrap
        .iter()
        .map(|(dev, start, end)| {
            (
                dev.0,
                start / u64::from(geometries[dev.0 as usize].bucket_size),
                end / u64::from(geometries[dev.0 as usize].bucket_size),
            )
        })
        .collect();
    sys.set_alloc(Arc::new(FormatBootstrapAlloc {
        regions: Mutex::new(bootstrap),
        node_sectors: config.node_sectors(),
    }));
    sys.create_initial_roots(cx)?;

    // Seed per-bucket allocator state. The index trigger populates the
    // freespace btree as a side effect, which is why the member flag
    // can be set at format time.
    let triggers: Vec<Arc<dyn CommitTrigger>> = vec![Arc::new(BucketIndexTrigger)];
    for (idx, geo) in geometries.iter().enumerate() {
        let idx_u32 = u32::try_from(idx).unwrap_or(u32::MAX);
        let sb_end_bucket = (geo.layout.offsets[1] + (1 << geo.layout.sb_max_size_bits))
            .div_ceil(u64::from(geo.bucket_size));
        let backup_bucket = geo.layout.offsets.last().copied().unwrap_or(0)
            / u64::from(geo.bucket_size);
        let (boot_start, boot_end) = bootstrap_ranges
            .iter()
            .find(|(d, _, _)| *d == idx_u32)
            .map(|(_, s, e)| (*s, *e))
            .unwrap_or((0, 0));

        for bucket in 1..geo.nbuckets {
            cx_checkpoint(cx)?;
            let in_sb = bucket < sb_end_bucket || bucket >= backup_bucket;
            let in_journal = geo.journal_buckets.contains(&bucket);
            let in_bootstrap = bucket >= boot_start && bucket < boot_end;
            let (data_type, dirty) = if in_journal {
                (DataType::Journal, geo.bucket_size)
            } else if in_sb || in_bootstrap {
                // Superblock copies and the initial btree region are
                // tracked as btree-class metadata.
                (DataType::Btree, geo.bucket_size)
            } else {
                (DataType::Free, 0)
            };
            let key = BKey::new(
                Pos::bucket(DeviceIdx(idx_u32), BucketIdx(bucket)),
                BVal::Alloc(AllocV {
                    data_type: data_type as u8,
                    dirty_sectors: dirty,
                    ..AllocV::default()
                }),
            );
            commit_do(&sys, cx, &triggers, false, |txn, cx| {
                txn.update(cx, BtreeId::Alloc, key.clone())
            })?;
        }
    }

    // Root subvolume: snapshot 1, subvolume 1, root directory inode.
    let now = crate::attrs::now_nanos();
    commit_do(&sys, cx, &triggers, false, |txn, cx| {
        txn.update(
            cx,
            BtreeId::Snapshots,
            BKey::new(
                snapshot_pos(SnapshotId::ROOT),
                BVal::Snapshot(SnapshotV {
                    parent: 0,
                    children: [0, 0],
                    subvol: 1,
                }),
            ),
        )?;
        txn.update(
            cx,
            BtreeId::Subvolumes,
            BKey::new(
                subvolume_pos(1),
                BVal::Subvolume(SubvolumeV {
                    root_inode: ROOT_INUM,
                    snapshot: SnapshotId::ROOT.0,
                    readonly: false,
                }),
            ),
        )?;
        txn.update(
            cx,
            BtreeId::Inodes,
            BKey::new(
                Pos::with_snapshot(ROOT_INUM, 0, SnapshotId::ROOT),
                BVal::Inode(InodeV {
                    mode: 0o040_755,
                    nlink: 2,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    subvol: 1,
                    ..InodeV::default()
                }),
            ),
        )
    })?;

    sys.flush_all(cx)?;
    journal.flush(cx)?;

    // Persist: roots into the superblock, then every copy on every
    // device (checksummed by the encoder as the last step).
    sb.roots = sys
        .root_keys()?
        .into_iter()
        .map(|(btree_id, level, key)| BtreeRoot {
            btree_id,
            level,
            key,
        })
        .collect();
    for (idx, geo) in geometries.iter().enumerate() {
        let mut per_dev = sb.clone();
        per_dev.dev_idx = u32::try_from(idx).unwrap_or(u32::MAX);
        per_dev.layout = geo.layout.clone();
        write_super(cx, geo.dev.as_ref(), &per_dev)?;
    }

    info!(
        target: "bch::fs",
        event = "formatted",
        uuid = %user_uuid,
        devices = geometries.len(),
        block_size,
        btree_node_size
    );
    Ok(user_uuid)
}

/// Format then open, for tests and the migrate driver.
pub fn format_and_open(
    cx: &Cx,
    devs: &[FormatDev],
    format_opts: &FormatOpts,
    open_opts: &OpenOptions,
) -> Result<Arc<Fs>> {
    format(cx, devs, format_opts)?;
    let paths: Vec<PathBuf> = devs.iter().map(|d| d.path.clone()).collect();
    Fs::open(cx, &paths, open_opts)
}
