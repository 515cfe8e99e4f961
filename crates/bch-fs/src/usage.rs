//! Capacity and usage accounting.
//!
//! `fs usage` summarizes the alloc btree per device and data type and
//! consults the replica-set accounting keys to decide whether any data
//! is currently degraded (a referenced device missing or not
//! readable).

use crate::Fs;
use asupersync::Cx;
use bch_error::Result;
use bch_types::keys::REPLICAS_INUM;
use bch_types::{BVal, BtreeId, DataType, DeviceIdx, MemberState, Pos};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DevUsage {
    pub dev: u32,
    pub state: String,
    pub bucket_size_sectors: u32,
    pub nbuckets: u64,
    pub buckets_free: u64,
    pub buckets_journal: u64,
    pub buckets_btree: u64,
    pub buckets_user: u64,
    pub buckets_cached: u64,
    pub buckets_parity: u64,
    pub buckets_need_discard: u64,
    pub sectors_dirty: u64,
    pub sectors_cached: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsUsage {
    pub capacity_sectors: u64,
    pub used_sectors: u64,
    pub free_sectors: u64,
    pub reserved_percent: u8,
    pub degraded: bool,
    pub devices: Vec<DevUsage>,
}

impl Fs {
    /// Per-device usage from the alloc btree.
    pub fn dev_usage(&self, cx: &Cx, dev: DeviceIdx) -> Result<DevUsage> {
        let sb = self.sb();
        let member = sb
            .members
            .get(dev.0 as usize)
            .ok_or_else(|| bch_error::Error::NotAMember(format!("device index {}", dev.0)))?;

        let mut usage = DevUsage {
            dev: dev.0,
            state: member.state.to_string(),
            bucket_size_sectors: member.bucket_size,
            nbuckets: member.nbuckets,
            buckets_free: 0,
            buckets_journal: 0,
            buckets_btree: 0,
            buckets_user: 0,
            buckets_cached: 0,
            buckets_parity: 0,
            buckets_need_discard: 0,
            sectors_dirty: 0,
            sectors_cached: 0,
        };

        let mut iter = self.sys.iter(BtreeId::Alloc, Pos::new(u64::from(dev.0), 0));
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            if key.pos.inode != u64::from(dev.0) {
                break;
            }
            iter.advance(&key);
            let BVal::Alloc(a) = &key.val else { continue };
            usage.sectors_dirty += u64::from(a.dirty_sectors);
            usage.sectors_cached += u64::from(a.cached_sectors);
            if a.need_discard() {
                usage.buckets_need_discard += 1;
            }
            match DataType::from_u8(a.data_type) {
                Ok(DataType::Free) => usage.buckets_free += 1,
                Ok(DataType::Journal) => usage.buckets_journal += 1,
                Ok(DataType::Btree) => usage.buckets_btree += 1,
                Ok(DataType::User) => usage.buckets_user += 1,
                Ok(DataType::Cached) => usage.buckets_cached += 1,
                Ok(DataType::Parity) => usage.buckets_parity += 1,
                Err(_) => {}
            }
        }
        Ok(usage)
    }

    /// Filesystem-wide usage summary.
    pub fn fs_usage(&self, cx: &Cx) -> Result<FsUsage> {
        let sb = self.sb();
        let mut devices = Vec::new();
        for (idx, member) in sb.members.iter().enumerate() {
            if member.nbuckets == 0 {
                continue;
            }
            let idx = u32::try_from(idx).unwrap_or(u32::MAX);
            if self.devices.get(DeviceIdx(idx)).is_some() {
                devices.push(self.dev_usage(cx, DeviceIdx(idx))?);
            }
        }

        // Degraded: any replica set referencing a device that is not
        // currently readable, or a missing rw member.
        let mut degraded = sb.members.iter().enumerate().any(|(idx, m)| {
            m.nbuckets > 0
                && m.state == MemberState::Rw
                && self
                    .devices
                    .get(DeviceIdx(u32::try_from(idx).unwrap_or(u32::MAX)))
                    .is_none()
        });
        if !degraded {
            let mut iter = self
                .sys
                .iter(BtreeId::Subvolumes, Pos::new(REPLICAS_INUM, 0));
            while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
                if key.pos.inode != REPLICAS_INUM {
                    break;
                }
                iter.advance(&key);
                let BVal::Replicas(r) = &key.val else { continue };
                if r.sectors == 0 {
                    continue;
                }
                let all_readable = r.devs.iter().all(|d| {
                    self.devices
                        .get(DeviceIdx(*d))
                        .map(|dev| dev.is_readable())
                        .unwrap_or(false)
                });
                if !all_readable {
                    degraded = true;
                    break;
                }
            }
        }

        let capacity = self.alloc.capacity_sectors();
        let used = self.alloc.used_sectors();
        Ok(FsUsage {
            capacity_sectors: capacity,
            used_sectors: used,
            free_sectors: capacity.saturating_sub(used),
            reserved_percent: self.opts.gc_reserve_percent(),
            degraded,
            devices,
        })
    }
}
