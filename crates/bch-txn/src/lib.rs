#![forbid(unsafe_code)]
//! Transaction layer.
//!
//! Groups multiple btree updates into one atomic, crash-safe step with
//! optimistic concurrency. A transaction stages `(btree, old snapshot,
//! new key)` records; commit reserves journal space, re-checks every
//! old snapshot against the live tree under node locks, appends one
//! journal entry, and applies the updates to the in-memory nodes while
//! holding write locks on every affected leaf — readers see all of a
//! transaction or none of it.
//!
//! Restarts (lock order, journal full, cache reclaim, read conflicts)
//! never escape [`commit_do`]; the closure re-executes from scratch.

use asupersync::Cx;
use bch_block::cx_checkpoint;
use bch_btree::{BtreeSys, LockTracker, UpdatePath, encoded_len};
use bch_error::{Error, RestartReason, Result};
use bch_ondisk::journal::JournalUpdate;
use bch_types::keys::ExtentV;
use bch_types::{BKey, BVal, BtreeId, JournalSeq, Pos};
use std::sync::Arc;
use tracing::{debug, trace};

/// Hook run during commit, after staging and before the journal
/// append. Triggers see staged `(old, new)` pairs and may stage
/// further updates (allocator accounting, replica accounting); updates
/// a trigger stages are themselves fed to the triggers in the next
/// round, until a round stages nothing.
pub trait CommitTrigger: Send + Sync {
    fn on_commit(
        &self,
        cx: &Cx,
        txn: &mut Transaction<'_>,
        range: std::ops::Range<usize>,
    ) -> Result<()>;
}

/// One staged update.
#[derive(Debug, Clone)]
pub struct Update {
    pub btree: BtreeId,
    pub key: BKey,
    /// Live value observed at stage time (`None` = absent); checked
    /// again under lock before the journal append.
    pub old: Option<BKey>,
    /// Whether this update participates in the optimistic re-check.
    /// Trigger-generated accounting updates opt out: they are derived
    /// from the checked updates, not read beforehand.
    pub check_old: bool,
}

/// A transaction: scratch state for one attempt. Dropped and rebuilt
/// on restart.
pub struct Transaction<'a> {
    sys: &'a BtreeSys,
    pub(crate) updates: Vec<Update>,
}

impl<'a> Transaction<'a> {
    fn new(sys: &'a BtreeSys) -> Self {
        Self {
            sys,
            updates: Vec::new(),
        }
    }

    #[must_use]
    pub fn sys(&self) -> &'a BtreeSys {
        self.sys
    }

    /// Live value at exactly `pos` (ignoring whiteouts).
    pub fn get(&self, cx: &Cx, btree: BtreeId, pos: Pos) -> Result<Option<BKey>> {
        // Staged values win over the tree within this transaction.
        if let Some(update) = self
            .updates
            .iter()
            .rev()
            .find(|u| u.btree == btree && u.key.pos == pos)
        {
            return Ok(if update.key.is_deleted() {
                None
            } else {
                Some(update.key.clone())
            });
        }
        let mut iter = self.sys.iter(btree, pos);
        Ok(self
            .sys
            .iter_peek(cx, &mut iter)?
            .filter(|k| k.pos == pos))
    }

    /// Stage an upsert. The current live value is snapshotted for the
    /// commit-time conflict check.
    pub fn update(&mut self, cx: &Cx, btree: BtreeId, key: BKey) -> Result<()> {
        key.validate(btree)?;
        let old = self.get(cx, btree, key.pos)?;
        self.updates.push(Update {
            btree,
            key,
            old,
            check_old: true,
        });
        Ok(())
    }

    /// Stage a whiteout at `pos`.
    pub fn delete(&mut self, cx: &Cx, btree: BtreeId, pos: Pos) -> Result<()> {
        let old = self.get(cx, btree, pos)?;
        self.updates.push(Update {
            btree,
            key: BKey::deleted(pos),
            old,
            check_old: true,
        });
        Ok(())
    }

    /// Stage an update without conflict tracking. Trigger accounting
    /// uses this; user-facing paths should not.
    pub fn update_unchecked(&mut self, btree: BtreeId, key: BKey) -> Result<()> {
        key.validate(btree)?;
        self.updates.push(Update {
            btree,
            key,
            old: None,
            check_old: false,
        });
        Ok(())
    }

    /// Stage whiteouts for every key in `[start, end)`, trimming
    /// extents that straddle the boundaries.
    pub fn delete_range(
        &mut self,
        cx: &Cx,
        btree: BtreeId,
        start: Pos,
        end: Pos,
    ) -> Result<()> {
        // A straddling extent starts before `start` but covers into
        // the range.
        if btree.is_extents() {
            if let Some(prev) = self.prev_same_snapshot(cx, btree, start)? {
                if prev.end_offset() > start.offset {
                    self.trim_extent(btree, &prev, start.offset, end.offset)?;
                }
            }
        }

        let mut iter = self.sys.iter(btree, start);
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            if key.pos >= end {
                break;
            }
            iter.advance(&key);
            if btree.is_extents() {
                if let BVal::Extent(_) = &key.val {
                    self.trim_extent(btree, &key, start.offset, end.offset)?;
                    continue;
                }
            }
            self.delete(cx, btree, key.pos)?;
        }
        Ok(())
    }

    /// Stage an extent insert, resolving overlaps with existing extents
    /// of the same snapshot: covered keys are whited out, straddling
    /// keys are trimmed in place (the checksummed image is never
    /// rewritten — only the key's offset window moves).
    pub fn stage_extent(&mut self, cx: &Cx, btree: BtreeId, key: BKey) -> Result<()> {
        let BVal::Extent(_) = &key.val else {
            return Err(Error::InvalidArgument("stage_extent wants an extent".into()));
        };
        let start = key.pos.offset;
        let end = key.end_offset();

        // Straddler from the left.
        if let Some(prev) = self.prev_same_snapshot(cx, btree, key.pos)? {
            if prev.end_offset() > start {
                self.trim_extent(btree, &prev, start, end)?;
            }
        }

        // Overlaps at and beyond the insert position.
        let mut iter = self.sys.iter(btree, key.pos);
        while let Some(existing) = self.sys.iter_peek(cx, &mut iter)? {
            if existing.pos.inode != key.pos.inode || existing.pos.offset >= end {
                break;
            }
            iter.advance(&existing);
            if existing.pos.snapshot != key.pos.snapshot {
                continue;
            }
            if let BVal::Extent(_) = &existing.val {
                self.trim_extent(btree, &existing, start, end)?;
            }
        }

        self.update(cx, btree, key)
    }

    /// The nearest extent before `from` in the same `(inode,
    /// snapshot)`. Keys of other snapshots interleave in the position
    /// order, so the walk skips them instead of stopping at the first
    /// predecessor.
    fn prev_same_snapshot(
        &self,
        cx: &Cx,
        btree: BtreeId,
        from: Pos,
    ) -> Result<Option<BKey>> {
        let mut cursor = from;
        loop {
            cx_checkpoint(cx)?;
            let mut iter = self.sys.iter(btree, cursor);
            let Some(prev) = self.sys.iter_prev(cx, &mut iter)? else {
                return Ok(None);
            };
            if prev.pos.inode != from.inode {
                return Ok(None);
            }
            if prev.pos.snapshot == from.snapshot {
                return Ok(Some(prev));
            }
            cursor = prev.pos;
        }
    }

    /// Remove `[cut_start, cut_end)` from `old`, staging the surviving
    /// head and/or tail.
    fn trim_extent(
        &mut self,
        btree: BtreeId,
        old: &BKey,
        cut_start: u64,
        cut_end: u64,
    ) -> Result<()> {
        let BVal::Extent(val) = &old.val else {
            return Err(Error::InvalidArgument("trim_extent wants an extent".into()));
        };
        let old_start = old.pos.offset;
        let old_end = old.end_offset();
        debug_assert!(old_start < cut_end && old_end > cut_start);

        // Head survives: same position, shorter size.
        if old_start < cut_start {
            let head_size = u32::try_from(cut_start - old_start)
                .map_err(|_| Error::InvalidArgument("extent trim overflow".into()))?;
            let head = BKey::extent(old.pos, head_size, val.clone());
            self.updates.push(Update {
                btree,
                key: head,
                old: Some(old.clone()),
                check_old: true,
            });
        } else {
            self.updates.push(Update {
                btree,
                key: BKey::deleted(old.pos),
                old: Some(old.clone()),
                check_old: true,
            });
        }

        // Tail survives: new position, window shifted.
        if old_end > cut_end {
            let shift = cut_end - old_start;
            let mut tail_val = val.clone();
            tail_val.crc.offset = tail_val
                .crc
                .offset
                .checked_add(
                    u32::try_from(shift)
                        .map_err(|_| Error::InvalidArgument("extent trim overflow".into()))?,
                )
                .ok_or_else(|| Error::InvalidArgument("extent trim overflow".into()))?;
            let tail_size = u32::try_from(old_end - cut_end)
                .map_err(|_| Error::InvalidArgument("extent trim overflow".into()))?;
            let tail_pos = Pos {
                offset: cut_end,
                ..old.pos
            };
            let tail = BKey::extent(tail_pos, tail_size, tail_val);
            self.updates.push(Update {
                btree,
                key: tail,
                old: None,
                check_old: false,
            });
        }
        Ok(())
    }

    /// Staged updates in `range` (a trigger round's input).
    #[must_use]
    pub fn staged(&self, range: std::ops::Range<usize>) -> &[Update] {
        &self.updates[range]
    }

    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.updates.len()
    }

    /// Commit this attempt. On success every staged update is durable
    /// in the journal and visible in the tree; on a restart error
    /// nothing is.
    fn commit(
        mut self,
        cx: &Cx,
        triggers: &[Arc<dyn CommitTrigger>],
        flush: bool,
    ) -> Result<JournalSeq> {
        cx_checkpoint(cx)?;

        // Pre-commit hooks may append accounting updates; each round
        // feeds the previous round's output back in until quiescent.
        let mut processed = 0;
        for _round in 0..8 {
            let end = self.updates.len();
            if processed == end {
                break;
            }
            for trigger in triggers {
                trigger.on_commit(cx, &mut self, processed..end)?;
            }
            processed = end;
        }
        if processed != self.updates.len() {
            return Err(Error::Fsck("commit triggers did not quiesce".into()));
        }

        if self.updates.is_empty() {
            return Ok(self.sys.journal().durable_seq());
        }

        // Apply order: the global lock order. Later stages of the same
        // position win.
        let mut updates = std::mem::take(&mut self.updates);
        let mut order: Vec<usize> = (0..updates.len()).collect();
        order.sort_by_key(|&i| (updates[i].btree, updates[i].key.pos, i));
        let mut deduped: Vec<Update> = Vec::with_capacity(updates.len());
        for i in order {
            let update = &mut updates[i];
            match deduped.last_mut() {
                Some(last) if last.btree == update.btree && last.key.pos == update.key.pos => {
                    // First stage's snapshot, last stage's value.
                    last.key = update.key.clone();
                }
                _ => deduped.push(update.clone()),
            }
        }

        // Phase 1: lock every affected leaf (intent), grouping
        // consecutive updates that land in the same node. A group that
        // would collectively overflow its leaf releases everything and
        // retries with the accumulated size, so the pre-split makes
        // room for the whole batch.
        let mut tracker = LockTracker::new();
        let mut groups: Vec<(UpdatePath, Vec<usize>, usize)> = Vec::new();
        let threshold = self.sys.split_threshold();
        let mut boost: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
        enum Placement {
            New,
            Reused,
            Overflow(usize, usize),
        }
        'phase1: for attempt in 0..8 {
            tracker.reset();
            groups.clear();
            for (idx, update) in deduped.iter().enumerate() {
                let room = encoded_len(&update.key);
                let placement = match groups.last_mut() {
                    Some((path, members, used)) => {
                        let same_leaf = deduped[members[0]].btree == update.btree
                            && path.covers(update.key.pos);
                        if !same_leaf {
                            Placement::New
                        } else {
                            let leaf_bytes = path.leaf().data.read().bytes;
                            if attempt < 7 && leaf_bytes + *used + room > threshold {
                                Placement::Overflow(members[0], *used + room)
                            } else {
                                members.push(idx);
                                *used += room;
                                Placement::Reused
                            }
                        }
                    }
                    None => Placement::New,
                };
                match placement {
                    Placement::Reused => {}
                    Placement::Overflow(first, total) => {
                        // Batch outgrew the leaf: retry with the full
                        // batch size so the pre-split makes room.
                        boost.insert(first, total);
                        groups.clear();
                        continue 'phase1;
                    }
                    Placement::New => {
                        let want = room.max(boost.get(&idx).copied().unwrap_or(0));
                        let path = self.sys.update_path(
                            cx,
                            &mut tracker,
                            update.btree,
                            update.key.pos,
                            want,
                        )?;
                        groups.push((path, vec![idx], room));
                    }
                }
            }
            break;
        }

        // Phase 2: optimistic re-check of every staged old snapshot.
        for (path, members, _) in &groups {
            for &idx in members {
                let update = &deduped[idx];
                if !update.check_old {
                    continue;
                }
                let live = self
                    .sys
                    .read_for_update(path, update.key.pos)
                    .filter(|k| !k.is_deleted());
                let expect = update.old.as_ref().filter(|k| !k.is_deleted());
                if live.as_ref() != expect {
                    trace!(
                        target: "bch::txn",
                        event = "read_conflict",
                        btree = %update.btree,
                        pos = %update.key.pos
                    );
                    return Err(Error::restart(RestartReason::ReadConflict));
                }
            }
        }

        // Phase 3: journal append under the next sequence.
        let records: Vec<JournalUpdate> = deduped
            .iter()
            .map(|u| JournalUpdate {
                btree: u.btree,
                level: 0,
                key: u.key.clone(),
            })
            .collect();
        let bytes: usize = records
            .iter()
            .map(|r| encoded_len(&r.key) + 8)
            .sum::<usize>()
            + 64;
        let reservation = self.sys.journal().reserve(cx, bytes)?;
        let seq = self.sys.journal().append(cx, reservation, records, flush)?;

        // Phase 4: apply to the in-memory nodes under write locks on
        // every leaf at once, then release.
        for (path, _, _) in &mut groups {
            path.upgrade();
        }
        for (path, members, _) in &groups {
            for &idx in members {
                self.sys.apply(path, deduped[idx].key.clone(), seq);
            }
        }
        drop(groups);
        self.sys.journal().unpin(seq);

        debug!(
            target: "bch::txn",
            event = "commit",
            seq = seq.0,
            updates = deduped.len(),
            flush
        );
        Ok(seq)
    }
}

/// Run `body` as a transaction, retrying transparently on restart.
/// The body must be safe to re-execute from scratch; callers holding
/// external resources re-acquire them inside the closure.
pub fn commit_do<T>(
    sys: &BtreeSys,
    cx: &Cx,
    triggers: &[Arc<dyn CommitTrigger>],
    flush: bool,
    mut body: impl FnMut(&mut Transaction<'_>, &Cx) -> Result<T>,
) -> Result<T> {
    let mut attempts = 0_u32;
    loop {
        cx_checkpoint(cx)?;
        let mut txn = Transaction::new(sys);
        let outcome = body(&mut txn, cx).and_then(|value| {
            txn.commit(cx, triggers, flush).map(|_seq| value)
        });
        match outcome {
            Ok(value) => return Ok(value),
            Err(Error::TransactionRestart { reason }) => {
                attempts += 1;
                trace!(
                    target: "bch::txn",
                    event = "restart",
                    reason = reason.as_str(),
                    attempts
                );
                match reason {
                    RestartReason::JournalFull | RestartReason::CacheReclaim => {
                        // Reclaim: flush dirty nodes until a
                        // reservation can succeed again.
                        sys.refill_node_alloc(cx)?;
                        if !sys.flush_for_reclaim(cx)? {
                            sys.journal().flush(cx)?;
                        }
                    }
                    RestartReason::MemPressure => {
                        // The node allocator's pre-opened pool ran dry;
                        // no locks are held here, so it can refill.
                        sys.refill_node_alloc(cx)?;
                    }
                    RestartReason::LockOrder | RestartReason::ReadConflict => {
                        std::thread::yield_now();
                    }
                }
                if attempts > 10_000 {
                    return Err(Error::Fsck("transaction restart livelock".into()));
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Convenience: commit a single upsert.
pub fn commit_one(
    sys: &BtreeSys,
    cx: &Cx,
    triggers: &[Arc<dyn CommitTrigger>],
    btree: BtreeId,
    key: BKey,
) -> Result<()> {
    commit_do(sys, cx, triggers, false, |txn, cx| {
        txn.update(cx, btree, key.clone())
    })
}

/// Helper shared by the I/O path and fsck: all extents overlapping
/// `[start, end)` of `(inode, snapshot)`, in offset order, including a
/// left straddler.
pub fn extents_overlapping(
    sys: &BtreeSys,
    cx: &Cx,
    btree: BtreeId,
    inode: u64,
    snapshot: u32,
    start: u64,
    end: u64,
) -> Result<Vec<BKey>> {
    let mut out = Vec::new();
    let from = Pos {
        inode,
        offset: start,
        snapshot,
    };
    let mut iter = sys.iter(btree, from);
    if let Some(prev) = sys.iter_prev(cx, &mut iter)? {
        if prev.pos.inode == inode && prev.end_offset() > start {
            out.push(prev);
        }
    }
    let mut iter = sys.iter(btree, from);
    while let Some(key) = sys.iter_peek(cx, &mut iter)? {
        if key.pos.inode != inode || key.pos.offset >= end {
            break;
        }
        iter.advance(&key);
        out.push(key);
    }
    Ok(out)
}

#[cfg(test)]
mod tests;

/// Extent helper used by tests and the I/O path: a one-pointer extent
/// value covering `size` sectors.
#[must_use]
pub fn simple_extent(dev: u32, sector: u64, size: u32) -> ExtentV {
    ExtentV {
        ptrs: vec![bch_types::ExtentPtr {
            dev: bch_types::DeviceIdx(dev),
            offset: sector,
            gen: bch_types::Gen(0),
            cached: false,
        }],
        crc: bch_types::CrcDescriptor {
            compressed_sectors: size,
            uncompressed_sectors: size,
            ..Default::default()
        },
        stripe: None,
        nr_required: 1,
    }
}
