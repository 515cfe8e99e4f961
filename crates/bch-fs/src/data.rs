//! Bulk data jobs.
//!
//! Rereplicate walks extents and tops up replica counts; migrate
//! evacuates a device (data and btree nodes); rewrite-old-nodes forces
//! a COW cycle over every btree node. Scrub is reserved and fails
//! rather than guessing semantics. All jobs report progress through a
//! caller-supplied sink.

use crate::Fs;
use asupersync::Cx;
use bch_block::cx_checkpoint;
use bch_error::{Error, Result};
use bch_types::{BVal, BtreeId, DataType, DeviceIdx, MemberState, Pos, Target};
use serde::Serialize;
use tracing::info;

/// The §control-plane data operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOp {
    Rereplicate,
    Migrate { dev: u32 },
    Scrub,
    RewriteOldNodes,
}

impl DataOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rereplicate => "rereplicate",
            Self::Migrate { .. } => "migrate",
            Self::Scrub => "scrub",
            Self::RewriteOldNodes => "rewrite_old_nodes",
        }
    }
}

/// One progress event of a running job.
#[derive(Debug, Clone, Serialize)]
pub struct DataProgress {
    pub op: &'static str,
    pub pos: String,
    pub keys_processed: u64,
    pub sectors_moved: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct JobSummary {
    pub keys_processed: u64,
    pub sectors_moved: u64,
}

impl Fs {
    /// Run a data job over `[start, end)` of the extents keyspace.
    pub fn run_data_job(
        &self,
        cx: &Cx,
        op: DataOp,
        start: Pos,
        end: Pos,
        progress: &mut dyn FnMut(DataProgress),
    ) -> Result<JobSummary> {
        match op {
            DataOp::Scrub => Err(Error::NotImplemented("scrub")),
            DataOp::Rereplicate => self.rereplicate(cx, start, end, progress),
            DataOp::Migrate { dev } => self.migrate(cx, DeviceIdx(dev), progress),
            DataOp::RewriteOldNodes => self.rewrite_old_nodes(cx, progress),
        }
    }

    /// Ensure every extent in range carries its desired replica count
    /// on live devices.
    fn rereplicate(
        &self,
        cx: &Cx,
        start: Pos,
        end: Pos,
        progress: &mut dyn FnMut(DataProgress),
    ) -> Result<JobSummary> {
        self.check_writable()?;
        let mut summary = JobSummary::default();
        let candidates = self.write_candidates(Target::None, DataType::User);
        let desired = self.opts.data_replicas();

        let mut iter = self.sys.iter(BtreeId::Extents, start);
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            if key.pos >= end {
                break;
            }
            cx_checkpoint(cx)?;
            iter.advance(&key);
            let BVal::Extent(e) = &key.val else { continue };

            let live = e
                .durable_ptrs()
                .filter(|p| {
                    self.devices
                        .get(p.dev)
                        .map(|d| d.is_readable())
                        .unwrap_or(false)
                })
                .count();
            let want = usize::from(desired.max(e.nr_required));
            if live < want {
                self.io.add_replica(cx, &key, &candidates, false)?;
                summary.sectors_moved += u64::from(key.size);
            }
            summary.keys_processed += 1;
            if summary.keys_processed % 256 == 0 {
                progress(DataProgress {
                    op: DataOp::Rereplicate.as_str(),
                    pos: key.pos.to_string(),
                    keys_processed: summary.keys_processed,
                    sectors_moved: summary.sectors_moved,
                });
            }
        }
        info!(
            target: "bch::data",
            event = "rereplicate_done",
            keys = summary.keys_processed,
            sectors = summary.sectors_moved
        );
        Ok(summary)
    }

    /// Evacuate a device: every extent replica and btree node moves
    /// elsewhere. The device ends up empty and removable.
    fn migrate(
        &self,
        cx: &Cx,
        dev: DeviceIdx,
        progress: &mut dyn FnMut(DataProgress),
    ) -> Result<JobSummary> {
        self.check_writable()?;
        let mut summary = JobSummary::default();

        // Stop new allocations landing on the victim.
        if let Some(device) = self.devices.get(dev) {
            device.set_state(MemberState::Ro);
        }
        self.update_sb(cx, |sb| {
            if let Some(member) = sb.members.get_mut(dev.0 as usize) {
                member.state = MemberState::Ro;
            }
        })?;

        let others: Vec<DeviceIdx> = self
            .write_candidates(Target::None, DataType::User)
            .into_iter()
            .filter(|d| *d != dev)
            .collect();
        if others.is_empty() {
            return Err(Error::NoSpace);
        }

        // Data: add a replacement replica, then drop the victim's.
        let mut iter = self.sys.iter(BtreeId::Extents, Pos::MIN);
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            cx_checkpoint(cx)?;
            iter.advance(&key);
            let BVal::Extent(e) = &key.val else { continue };
            if !e.ptrs.iter().any(|p| p.dev == dev) {
                continue;
            }
            let durable_elsewhere = e
                .durable_ptrs()
                .any(|p| p.dev != dev && self.devices.get(p.dev).is_some());
            if !durable_elsewhere {
                self.io.add_replica(cx, &key, &others, false)?;
            }
            // Re-read the key after the possible update.
            let mut probe = self.sys.iter(BtreeId::Extents, key.pos);
            if let Some(live) = self
                .sys
                .iter_peek(cx, &mut probe)?
                .filter(|k| k.pos == key.pos)
            {
                self.io.drop_replica(cx, &live, dev)?;
            }
            summary.keys_processed += 1;
            summary.sectors_moved += u64::from(key.size);
            if summary.keys_processed % 128 == 0 {
                progress(DataProgress {
                    op: "migrate",
                    pos: key.pos.to_string(),
                    keys_processed: summary.keys_processed,
                    sectors_moved: summary.sectors_moved,
                });
            }
        }

        // Metadata: rewrite every node with a replica on the victim.
        for btree in BtreeId::ALL {
            let mut targets = Vec::new();
            self.sys.for_each_node_ptr(cx, btree, &mut |level, ptr| {
                if ptr.ptrs.iter().any(|p| p.dev == dev) {
                    targets.push((level, ptr.clone()));
                }
                Ok(())
            })?;
            for (level, ptr) in targets {
                self.sys.rewrite_node(cx, btree, level, &ptr)?;
                summary.keys_processed += 1;
            }
        }
        self.sys.flush_all(cx)?;
        self.write_sb(cx)?;

        info!(
            target: "bch::data",
            event = "migrate_done",
            dev = dev.0,
            keys = summary.keys_processed
        );
        Ok(summary)
    }

    /// Force a COW rewrite of every btree node (format upgrades).
    fn rewrite_old_nodes(
        &self,
        cx: &Cx,
        progress: &mut dyn FnMut(DataProgress),
    ) -> Result<JobSummary> {
        self.check_writable()?;
        let mut summary = JobSummary::default();
        for btree in BtreeId::ALL {
            let mut targets = Vec::new();
            self.sys.for_each_node_ptr(cx, btree, &mut |level, ptr| {
                targets.push((level, ptr.clone()));
                Ok(())
            })?;
            for (level, ptr) in targets {
                cx_checkpoint(cx)?;
                self.sys.rewrite_node(cx, btree, level, &ptr)?;
                summary.keys_processed += 1;
            }
            progress(DataProgress {
                op: "rewrite_old_nodes",
                pos: btree.to_string(),
                keys_processed: summary.keys_processed,
                sectors_moved: 0,
            });
        }
        self.sys.flush_all(cx)?;
        self.write_sb(cx)?;
        Ok(summary)
    }
}

/// One copygc round: relocate live extents out of fragmented buckets
/// so the buckets drain back to the free pool. The background worker
/// runs this when it wakes.
pub fn copygc_pass(fs: &Fs, cx: &Cx) -> Result<()> {
    if fs.is_read_only() {
        return Ok(());
    }
    for device in fs.devices.iter() {
        if !device.is_writable() {
            continue;
        }
        let fragmented = fs.alloc.fragmented_buckets(cx, device.idx, 1)?;
        if fragmented.is_empty() {
            continue;
        }
        let candidates = fs.write_candidates(Target::None, DataType::User);

        // Find the extents living in those buckets. Backpointers are a
        // format revision away; until then copygc pays for a scan.
        let mut iter = fs.sys.iter(BtreeId::Extents, Pos::MIN);
        let mut moved = 0_u64;
        while let Some(key) = fs.sys.iter_peek(cx, &mut iter)? {
            cx_checkpoint(cx)?;
            iter.advance(&key);
            let BVal::Extent(e) = &key.val else { continue };
            let hit = e.ptrs.iter().any(|p| {
                p.dev == device.idx
                    && fragmented.contains(&bch_types::BucketIdx(
                        device.sector_to_bucket(p.offset),
                    ))
            });
            if hit {
                fs.io.relocate_replica(cx, &key, device.idx, &candidates)?;
                moved += 1;
            }
        }
        if moved > 0 {
            info!(
                target: "bch::data",
                event = "copygc_pass",
                dev = device.idx.0,
                extents_moved = moved
            );
        }
    }
    Ok(())
}
