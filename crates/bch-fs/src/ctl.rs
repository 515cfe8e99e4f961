//! Control plane.
//!
//! The ioctl-style request surface the CLI (and the external FUSE
//! adapter) drive. Each request maps onto one core operation; replies
//! are plain data so callers can render or serialize them.

use crate::data::{DataOp, DataProgress, JobSummary};
use crate::usage::{DevUsage, FsUsage};
use crate::{Fs, OpenOptions};
use asupersync::Cx;
use bch_error::{Error, Result};
use bch_ondisk::sb::Member;
use bch_super::pick_bucket_size;
use bch_types::{DeviceIdx, MemberState, Pos};
use std::path::PathBuf;
use uuid::Uuid;

/// Flags accepted by the destructive device operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFlags {
    /// Proceed even when redundancy drops below policy.
    pub force: bool,
}

/// The request surface.
#[derive(Debug)]
pub enum Ioctl {
    QueryUuid,
    ReadSuper,
    FsUsage,
    DevUsage { dev: u32 },
    DiskAdd { path: PathBuf },
    DiskRemove { dev: u32, flags: DeviceFlags },
    DiskOnline { path: PathBuf },
    DiskOffline { dev: u32, flags: DeviceFlags },
    DiskSetState { dev: u32, state: MemberState, flags: DeviceFlags },
    DiskResize { dev: u32, nbuckets: u64 },
    DiskResizeJournal { dev: u32, nbuckets: u64 },
    Data { op: DataOp, start: Pos, end: Pos },
    SubvolumeCreate { path: String },
    SubvolumeDestroy { path: String },
    SubvolumeSnapshot { src: String, dst: String, readonly: bool },
    ReinheritAttrs { path: String },
}

/// Replies, one variant per request family.
#[derive(Debug)]
pub enum IoctlReply {
    Uuid(Uuid),
    Super(Box<bch_ondisk::sb::Superblock>),
    FsUsage(Box<FsUsage>),
    DevUsage(Box<DevUsage>),
    DeviceIdx(u32),
    Job {
        summary: JobSummary,
        progress: Vec<DataProgress>,
    },
    Subvolume(u32),
    Updated(u64),
    Done,
}

impl Fs {
    /// Dispatch one control-plane request.
    pub fn ioctl(&self, cx: &Cx, request: Ioctl) -> Result<IoctlReply> {
        match request {
            Ioctl::QueryUuid => Ok(IoctlReply::Uuid(self.sb().user_uuid)),
            Ioctl::ReadSuper => Ok(IoctlReply::Super(Box::new((*self.sb()).clone()))),
            Ioctl::FsUsage => Ok(IoctlReply::FsUsage(Box::new(self.fs_usage(cx)?))),
            Ioctl::DevUsage { dev } => Ok(IoctlReply::DevUsage(Box::new(
                self.dev_usage(cx, DeviceIdx(dev))?,
            ))),
            Ioctl::DiskAdd { path } => Ok(IoctlReply::DeviceIdx(self.disk_add(cx, &path)?)),
            Ioctl::DiskRemove { dev, flags } => {
                self.disk_remove(cx, DeviceIdx(dev), flags)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::DiskOnline { path } => {
                Ok(IoctlReply::DeviceIdx(self.disk_online(cx, &path)?))
            }
            Ioctl::DiskOffline { dev, flags } => {
                self.disk_offline(cx, DeviceIdx(dev), flags)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::DiskSetState { dev, state, flags } => {
                self.disk_set_state(cx, DeviceIdx(dev), state, flags)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::DiskResize { dev, nbuckets } => {
                self.disk_resize(cx, DeviceIdx(dev), nbuckets)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::DiskResizeJournal { dev, nbuckets } => {
                self.disk_resize_journal(cx, DeviceIdx(dev), nbuckets)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::Data { op, start, end } => {
                let mut events = Vec::new();
                let summary =
                    self.run_data_job(cx, op, start, end, &mut |p| events.push(p))?;
                Ok(IoctlReply::Job {
                    summary,
                    progress: events,
                })
            }
            Ioctl::SubvolumeCreate { path } => {
                Ok(IoctlReply::Subvolume(self.subvolume_create(cx, &path)?))
            }
            Ioctl::SubvolumeDestroy { path } => {
                self.subvolume_destroy(cx, &path)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::SubvolumeSnapshot { src, dst, readonly } => Ok(IoctlReply::Subvolume(
                self.subvolume_snapshot(cx, &src, &dst, readonly)?,
            )),
            Ioctl::ReinheritAttrs { path } => {
                let (ctx, inum) = self.resolve_path(cx, &path)?;
                Ok(IoctlReply::Updated(self.reinherit_attrs(cx, ctx, inum)?))
            }
        }
    }

    // ── Device lifecycle ────────────────────────────────────────────

    /// Add a fresh device as a new member.
    pub fn disk_add(&self, cx: &Cx, path: &PathBuf) -> Result<u32> {
        self.check_writable()?;
        let dev: std::sync::Arc<dyn bch_block::ByteDevice> =
            std::sync::Arc::new(bch_block::FileByteDevice::open(path)?);
        let sb = self.sb();
        let bucket_size =
            pick_bucket_size(dev.len_bytes(), sb.block_size, sb.opts.btree_node_size)?;
        let nbuckets = dev.len_bytes() / (u64::from(bucket_size) * 512);
        let layout = bch_super::initial_layout(dev.len_bytes(), sb.block_size, bucket_size)?;

        let member = Member {
            uuid: Uuid::new_v4(),
            nbuckets,
            bucket_size,
            first_bucket: 1,
            state: MemberState::Rw,
            discard: false,
            durability: 1,
            data_allowed: bch_types::data_allowed_default(),
            flags: bch_ondisk::sb::MEMBER_FREESPACE_INITIALIZED,
            group: 0,
        };

        let mut new_idx = 0;
        self.update_sb(cx, |sb| {
            if let Ok(idx) = bch_super::add_member(sb, member.clone()) {
                new_idx = idx;
            }
        })?;

        let device = std::sync::Arc::new(bch_block::Device::new(
            DeviceIdx(new_idx),
            path.clone(),
            std::sync::Arc::clone(&dev),
            MemberState::Rw,
            bucket_size,
            nbuckets,
            1,
            1,
            bch_types::data_allowed_default(),
            false,
        ));
        self.devices.insert(std::sync::Arc::clone(&device));
        self.register_sb_slot(new_idx, dev, layout, path.clone());

        // Seed bucket states: everything past the superblock region is
        // free; the index trigger builds the freespace entries.
        let sb_now = self.sb();
        let sb_end_bucket = {
            let l = &self
                .sb_slot_layout(new_idx)
                .unwrap_or_else(|| sb_now.layout.clone());
            (l.offsets[1] + (1 << l.sb_max_size_bits)).div_ceil(u64::from(bucket_size))
        };
        let backup_bucket = self
            .sb_slot_layout(new_idx)
            .and_then(|l| l.offsets.last().copied())
            .unwrap_or(0)
            / u64::from(bucket_size);
        for bucket in 1..nbuckets {
            let in_sb = bucket < sb_end_bucket || bucket >= backup_bucket;
            let (data_type, dirty) = if in_sb {
                (bch_types::DataType::Btree, bucket_size)
            } else {
                (bch_types::DataType::Free, 0)
            };
            let key = bch_types::BKey::new(
                Pos::bucket(DeviceIdx(new_idx), bch_types::BucketIdx(bucket)),
                bch_types::BVal::Alloc(bch_types::AllocV {
                    data_type: data_type as u8,
                    dirty_sectors: dirty,
                    ..bch_types::AllocV::default()
                }),
            );
            self.commit(cx, |txn, cx| {
                txn.update(cx, bch_types::BtreeId::Alloc, key.clone())
            })?;
        }
        self.write_sb(cx)?;
        Ok(new_idx)
    }

    /// Remove a member. The device must hold no data unless forced.
    pub fn disk_remove(&self, cx: &Cx, dev: DeviceIdx, flags: DeviceFlags) -> Result<()> {
        self.check_writable()?;
        let usage = self.dev_usage(cx, dev)?;
        if (usage.buckets_user > 0 || usage.buckets_btree > 0) && !flags.force {
            return Err(Error::DataLossRisk(format!(
                "device {} still holds data; evacuate or force",
                dev.0
            )));
        }
        self.devices.remove(dev);
        self.update_sb(cx, |sb| {
            let _ = bch_super::remove_member(sb, dev.0);
        })?;
        self.drop_sb_slot(dev.0);
        Ok(())
    }

    /// Bring a previously offline member back.
    pub fn disk_online(&self, cx: &Cx, path: &PathBuf) -> Result<u32> {
        let dev: std::sync::Arc<dyn bch_block::ByteDevice> =
            std::sync::Arc::new(bch_block::FileByteDevice::open(path)?);
        let their_sb = bch_super::read_super(cx, dev.as_ref())?;
        let ours = self.sb();
        if their_sb.uuid != ours.uuid {
            return Err(Error::NotAMember(format!("{}", path.display())));
        }
        let idx = their_sb.dev_idx;
        let member = ours
            .members
            .get(idx as usize)
            .ok_or_else(|| Error::NotAMember(format!("member slot {idx}")))?;
        self.devices.insert(std::sync::Arc::new(bch_block::Device::new(
            DeviceIdx(idx),
            path.clone(),
            std::sync::Arc::clone(&dev),
            member.state,
            member.bucket_size,
            member.nbuckets,
            member.first_bucket,
            member.durability,
            member.data_allowed,
            member.discard,
        )));
        self.register_sb_slot(idx, dev, their_sb.layout.clone(), path.clone());
        Ok(idx)
    }

    /// Detach a member from the running filesystem without removing it
    /// from the member table.
    pub fn disk_offline(&self, cx: &Cx, dev: DeviceIdx, flags: DeviceFlags) -> Result<()> {
        if !flags.force {
            // Refuse when this device holds the only copy of anything.
            let usage = self.dev_usage(cx, dev)?;
            if usage.buckets_user > 0 && self.devices.len() == 1 {
                return Err(Error::DataLossRisk(format!(
                    "device {} holds the only copies",
                    dev.0
                )));
            }
        }
        self.devices.remove(dev);
        self.drop_sb_slot(dev.0);
        Ok(())
    }

    /// Change a member's lifecycle state.
    pub fn disk_set_state(
        &self,
        cx: &Cx,
        dev: DeviceIdx,
        state: MemberState,
        flags: DeviceFlags,
    ) -> Result<()> {
        self.check_writable()?;
        if state != MemberState::Rw && !flags.force {
            let usage = self.fs_usage(cx)?;
            if usage.degraded {
                return Err(Error::DataLossRisk(
                    "filesystem already degraded; forcing required".into(),
                ));
            }
        }
        if let Some(device) = self.devices.get(dev) {
            device.set_state(state);
        }
        self.update_sb(cx, |sb| {
            let _ = bch_super::set_member_state(sb, dev.0, state);
        })
    }

    /// Grow or shrink a member's bucket count.
    pub fn disk_resize(&self, cx: &Cx, dev: DeviceIdx, nbuckets: u64) -> Result<()> {
        self.check_writable()?;
        let old = self
            .sb()
            .members
            .get(dev.0 as usize)
            .map(|m| m.nbuckets)
            .ok_or_else(|| Error::NotAMember(format!("device index {}", dev.0)))?;
        if nbuckets < old {
            return Err(Error::NotImplemented("shrinking a member"));
        }
        self.update_sb(cx, |sb| {
            let _ = bch_super::resize_member(sb, dev.0, nbuckets);
        })?;
        // New buckets arrive free.
        for bucket in old..nbuckets {
            let key = bch_types::BKey::new(
                Pos::bucket(dev, bch_types::BucketIdx(bucket)),
                bch_types::BVal::Alloc(bch_types::AllocV::default()),
            );
            self.commit(cx, |txn, cx| {
                txn.update(cx, bch_types::BtreeId::Alloc, key.clone())
            })?;
        }
        Ok(())
    }

    /// Grow a member's journal allocation. The new buckets are claimed
    /// now; the ring adopts them at the next mount.
    pub fn disk_resize_journal(&self, cx: &Cx, dev: DeviceIdx, nbuckets: u64) -> Result<()> {
        self.check_writable()?;
        let current: Vec<u64> = self
            .sb()
            .journal_buckets
            .iter()
            .find(|jb| jb.dev == dev.0)
            .map(|jb| jb.buckets.clone())
            .unwrap_or_default();
        if nbuckets <= current.len() as u64 {
            return Err(Error::NotImplemented("shrinking a journal"));
        }
        let grow = nbuckets - current.len() as u64;
        let new_buckets = self.alloc.reserve_whole_buckets(
            cx,
            self.triggers(),
            dev,
            grow,
            bch_types::DataType::Journal,
        )?;
        self.update_sb(cx, |sb| {
            match sb.journal_buckets.iter_mut().find(|jb| jb.dev == dev.0) {
                Some(jb) => jb.buckets.extend(new_buckets.iter().copied()),
                None => sb.journal_buckets.push(bch_ondisk::sb::JournalBucketsSection {
                    dev: dev.0,
                    buckets: new_buckets.clone(),
                }),
            }
        })
    }

    /// Mount-by-UUID support: open the filesystem named by a UUID from
    /// candidate devices.
    pub fn open_by_uuid(
        cx: &Cx,
        uuid: Uuid,
        candidates: &[PathBuf],
        opts: &OpenOptions,
    ) -> Result<std::sync::Arc<Fs>> {
        let paths = crate::mount::devices_with_uuid(cx, uuid, candidates)?;
        if paths.is_empty() {
            return Err(Error::NotFound(format!("filesystem {uuid}")));
        }
        Fs::open(cx, &paths, opts)
    }
}
