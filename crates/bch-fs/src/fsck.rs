//! Consistency checking and repair.
//!
//! Bulk scans over every btree verifying the cross-btree invariants:
//! key shape, alloc state against the derived indices, extent pointers
//! against bucket state, dirent targets, and replica durability.
//! Repairs run under the caller's policy; anything left unfixed makes
//! the filesystem report uncorrected errors.

use crate::Fs;
use asupersync::Cx;
use bch_block::cx_checkpoint;
use bch_error::{Error, Result};
use bch_types::keys::{
    FreespaceV, IO_TIME_READ, freespace_decode, freespace_pos, lru_pos,
};
use bch_types::{BKey, BVal, BtreeId, BucketIdx, DataType, DeviceIdx, LruV, Pos};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// What to do with a repairable inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairPolicy {
    /// Fix everything fixable.
    Yes,
    /// Report only.
    No,
}

#[derive(Debug, Default, Clone)]
pub struct FsckReport {
    pub keys_checked: u64,
    pub errors_found: u64,
    pub errors_fixed: u64,
    pub notes: Vec<String>,
}

impl FsckReport {
    /// Exit-code classification: 0 clean, 2 fixed, 4 uncorrected.
    #[must_use]
    pub fn exit_code(&self) -> bch_error::ExitCode {
        if self.errors_found == 0 {
            bch_error::ExitCode::Ok
        } else if self.errors_fixed == self.errors_found {
            bch_error::ExitCode::FixedErrors
        } else {
            bch_error::ExitCode::UncorrectedErrors
        }
    }

    fn problem(&mut self, policy: RepairPolicy, fixed: bool, note: String) {
        warn!(target: "bch::fsck", event = "inconsistency", note = %note);
        self.errors_found += 1;
        if policy == RepairPolicy::Yes && fixed {
            self.errors_fixed += 1;
        }
        self.notes.push(note);
    }
}

impl Fs {
    /// Run every consistency pass.
    pub fn fsck(&self, cx: &Cx, policy: RepairPolicy) -> Result<FsckReport> {
        let mut report = FsckReport::default();
        self.fsck_key_shapes(cx, &mut report)?;
        self.fsck_alloc_indices(cx, policy, &mut report)?;
        self.fsck_extent_refs(cx, policy, &mut report)?;
        self.fsck_dirents(cx, &mut report)?;
        info!(
            target: "bch::fsck",
            event = "fsck_done",
            keys = report.keys_checked,
            found = report.errors_found,
            fixed = report.errors_fixed
        );
        Ok(report)
    }

    /// Pass 1: every key decodes, validates, and is ordered.
    fn fsck_key_shapes(&self, cx: &Cx, report: &mut FsckReport) -> Result<()> {
        for btree in BtreeId::ALL {
            let mut last: Option<Pos> = None;
            let mut iter = self.sys.iter(btree, Pos::MIN);
            while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
                cx_checkpoint(cx)?;
                iter.advance(&key);
                report.keys_checked += 1;
                if let Err(err) = key.validate(btree) {
                    report.problem(
                        RepairPolicy::No,
                        false,
                        format!("{btree} {}: invalid key: {err}", key.pos),
                    );
                }
                if let Some(prev) = last {
                    if key.pos <= prev {
                        return Err(Error::Fsck(format!(
                            "{btree}: key order violation at {}",
                            key.pos
                        )));
                    }
                }
                last = Some(key.pos);
            }
        }
        Ok(())
    }

    /// Pass 2: freespace / need-discard / LRU indices mirror the alloc
    /// btree exactly.
    fn fsck_alloc_indices(
        &self,
        cx: &Cx,
        policy: RepairPolicy,
        report: &mut FsckReport,
    ) -> Result<()> {
        // Ground truth from the alloc btree.
        let mut want_freespace: HashMap<Pos, (DeviceIdx, BucketIdx)> = HashMap::new();
        let mut want_discard: HashSet<Pos> = HashSet::new();
        let mut want_lru: HashMap<Pos, u64> = HashMap::new();

        let mut iter = self.sys.iter(BtreeId::Alloc, Pos::MIN);
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            cx_checkpoint(cx)?;
            iter.advance(&key);
            let BVal::Alloc(a) = &key.val else { continue };
            let dev = DeviceIdx(u32::try_from(key.pos.inode).unwrap_or(u32::MAX));
            let bucket = BucketIdx(key.pos.offset);
            if a.is_empty() && a.data_type == DataType::Free as u8 && !a.need_discard() {
                want_freespace.insert(freespace_pos(dev, bucket, a.gen), (dev, bucket));
            }
            if a.need_discard() {
                want_discard.insert(Pos::bucket(dev, bucket));
            }
            if a.dirty_sectors == 0 && a.cached_sectors > 0 {
                want_lru.insert(lru_pos(dev, a.io_time[IO_TIME_READ]), bucket.0);
            }
        }

        // Compare each index, repairing both directions.
        let mut iter = self.sys.iter(BtreeId::Freespace, Pos::MIN);
        let mut have_freespace = HashSet::new();
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            iter.advance(&key);
            have_freespace.insert(key.pos);
            if !want_freespace.contains_key(&key.pos) {
                let (bucket, gen_bits) = freespace_decode(key.pos);
                let fixed = policy == RepairPolicy::Yes
                    && self
                        .commit(cx, |txn, cx| {
                            txn.delete(cx, BtreeId::Freespace, key.pos)
                        })
                        .is_ok();
                report.problem(
                    policy,
                    fixed,
                    format!(
                        "freespace key for non-free bucket {}:{} (gen bits {gen_bits})",
                        key.pos.inode, bucket.0
                    ),
                );
            }
        }
        for (pos, (dev, bucket)) in &want_freespace {
            if !have_freespace.contains(pos) {
                let fixed = policy == RepairPolicy::Yes
                    && self
                        .commit(cx, |txn, _cx| {
                            txn.update_unchecked(
                                BtreeId::Freespace,
                                BKey::new(*pos, BVal::Freespace(FreespaceV)),
                            )
                        })
                        .is_ok();
                report.problem(
                    policy,
                    fixed,
                    format!("free bucket {}:{} missing freespace key", dev.0, bucket.0),
                );
            }
        }

        let mut iter = self.sys.iter(BtreeId::NeedDiscard, Pos::MIN);
        let mut have_discard = HashSet::new();
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            iter.advance(&key);
            have_discard.insert(key.pos);
            if !want_discard.contains(&key.pos) {
                let fixed = policy == RepairPolicy::Yes
                    && self
                        .commit(cx, |txn, cx| txn.delete(cx, BtreeId::NeedDiscard, key.pos))
                        .is_ok();
                report.problem(
                    policy,
                    fixed,
                    format!("need-discard key without the flag at {}", key.pos),
                );
            }
        }
        for pos in &want_discard {
            if !have_discard.contains(pos) {
                let fixed = policy == RepairPolicy::Yes
                    && self
                        .commit(cx, |txn, _cx| {
                            txn.update_unchecked(
                                BtreeId::NeedDiscard,
                                BKey::new(*pos, BVal::NeedDiscard),
                            )
                        })
                        .is_ok();
                report.problem(policy, fixed, format!("missing need-discard key at {pos}"));
            }
        }

        let mut iter = self.sys.iter(BtreeId::Lru, Pos::MIN);
        let mut have_lru = HashSet::new();
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            iter.advance(&key);
            have_lru.insert(key.pos);
            let ok = match (&key.val, want_lru.get(&key.pos)) {
                (BVal::Lru(l), Some(bucket)) => l.bucket == *bucket,
                _ => false,
            };
            if !ok {
                let fixed = policy == RepairPolicy::Yes
                    && self
                        .commit(cx, |txn, cx| txn.delete(cx, BtreeId::Lru, key.pos))
                        .is_ok();
                report.problem(
                    policy,
                    fixed,
                    format!("stale lru entry at {}", key.pos),
                );
            }
        }
        for (pos, bucket) in &want_lru {
            if !have_lru.contains(pos) {
                let fixed = policy == RepairPolicy::Yes
                    && self
                        .commit(cx, |txn, _cx| {
                            txn.update_unchecked(
                                BtreeId::Lru,
                                BKey::new(*pos, BVal::Lru(LruV { bucket: *bucket })),
                            )
                        })
                        .is_ok();
                report.problem(
                    policy,
                    fixed,
                    format!("cached bucket {bucket} missing lru entry"),
                );
            }
        }
        Ok(())
    }

    /// Pass 3: extent pointers reference valid, live buckets, and
    /// replica durability satisfies each key's requirement.
    fn fsck_extent_refs(
        &self,
        cx: &Cx,
        policy: RepairPolicy,
        report: &mut FsckReport,
    ) -> Result<()> {
        let sb = self.sb();
        let mut iter = self.sys.iter(BtreeId::Extents, Pos::MIN);
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            cx_checkpoint(cx)?;
            iter.advance(&key);
            let BVal::Extent(e) = &key.val else { continue };

            let mut durability = 0_u32;
            for ptr in &e.ptrs {
                let Some(member) = sb.members.get(ptr.dev.0 as usize) else {
                    report.problem(
                        policy,
                        false,
                        format!("extent {} references unknown device {}", key.pos, ptr.dev.0),
                    );
                    continue;
                };
                let Some(device) = self.devices.get(ptr.dev) else {
                    continue; // missing member: counted by usage as degraded
                };
                let bucket = BucketIdx(device.sector_to_bucket(ptr.offset));
                match self.alloc.bucket_state(cx, ptr.dev, bucket) {
                    Ok(state) => {
                        if !ptr.cached && state.gen != ptr.gen {
                            report.problem(
                                policy,
                                false,
                                format!(
                                    "extent {} ptr gen {} does not match bucket gen {}",
                                    key.pos, ptr.gen.0, state.gen.0
                                ),
                            );
                        } else if !ptr.cached {
                            durability += u32::from(member.durability);
                        }
                    }
                    Err(_) => {
                        report.problem(
                            policy,
                            false,
                            format!(
                                "extent {} references bucket {}:{} with no alloc record",
                                key.pos, ptr.dev.0, bucket.0
                            ),
                        );
                    }
                }
            }

            if durability < u32::from(e.nr_required) {
                report.notes.push(format!(
                    "extent {} degraded: durability {durability} < required {}",
                    key.pos, e.nr_required
                ));
            }
        }
        Ok(())
    }

    /// Pass 4: every dirent targets an inode (or subvolume) that
    /// exists in some snapshot.
    fn fsck_dirents(&self, cx: &Cx, report: &mut FsckReport) -> Result<()> {
        let mut iter = self.sys.iter(BtreeId::Dirents, Pos::MIN);
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            cx_checkpoint(cx)?;
            iter.advance(&key);
            let BVal::Dirent(d) = &key.val else { continue };
            if d.d_type == crate::DT_WHITEOUT {
                continue; // tombstones shadow ancestors; no target
            }
            let exists = if d.d_type == crate::DT_SUBVOL {
                u32::try_from(d.target)
                    .ok()
                    .map(|s| self.subvolume_get(cx, s).is_ok())
                    .unwrap_or(false)
            } else {
                let mut probe = self.sys.iter(BtreeId::Inodes, Pos::new(d.target, 0));
                self.sys
                    .iter_peek(cx, &mut probe)?
                    .map(|k| k.pos.inode == d.target)
                    .unwrap_or(false)
            };
            if !exists {
                report.problem(
                    RepairPolicy::No,
                    false,
                    format!(
                        "dirent {:?} at {} targets missing {}",
                        String::from_utf8_lossy(&d.name),
                        key.pos,
                        d.target
                    ),
                );
            }
        }
        Ok(())
    }
}

/// Repair any alloc record left behind by an interrupted writer (a
/// bucket marked in use with no data): conservative helper for tests.
pub fn reset_empty_nonfree_buckets(fs: &Fs, cx: &Cx) -> Result<u64> {
    let mut fixed = 0;
    let mut iter = fs.sys.iter(BtreeId::Alloc, Pos::MIN);
    while let Some(key) = fs.sys.iter_peek(cx, &mut iter)? {
        iter.advance(&key);
        let BVal::Alloc(a) = &key.val else { continue };
        if a.is_empty() && a.data_type != DataType::Free as u8 && !a.need_discard() {
            let mut next = *a;
            next.data_type = DataType::Free as u8;
            next.flags |= bch_types::keys::ALLOC_NEED_INC_GEN;
            let pos = key.pos;
            fs.commit(cx, |txn, cx| {
                txn.update(cx, BtreeId::Alloc, BKey::new(pos, BVal::Alloc(next)))
            })?;
            fixed += 1;
        }
    }
    Ok(fixed)
}
