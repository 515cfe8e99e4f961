#![forbid(unsafe_code)]
//! COW B-tree engine.
//!
//! One copy-on-write btree per btree id. Interior nodes store pointer
//! keys to child locations; children are reloaded through the node
//! cache, which owns node memory — paths hold borrowed references
//! guarded by each node's six-state lock. Node writes are COW: a new
//! location is allocated, the image written, and the parent pointer
//! flipped through a journaled update. Short runs of updates append
//! bsets to a node's existing image instead, which is what makes the
//! journal cheap to reclaim.

pub mod cache;
pub mod node;
pub mod six;

use asupersync::Cx;
use bch_block::{DeviceSet, cx_checkpoint};
use bch_error::{Error, RestartReason, Result};
use bch_journal::Journal;
use bch_ondisk::journal::JournalUpdate;
use bch_types::keys::BtreePtrV;
use bch_types::{BKey, BVal, BtreeId, ExtentPtr, JournalSeq, Pos};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

pub use cache::{CachedNode, NodeCache};
pub use node::{BtreeConfig, NodeData, encoded_len};
pub use six::{LockMode, LockOrd, LockTracker, SixLock};

/// Sentinel level in journal update records meaning "this key is the
/// new root of its btree".
pub const ROOT_LEVEL: u8 = 255;

/// Fill fraction (numerator over 4) above which a node splits before
/// taking more keys.
const SPLIT_NUM: usize = 3;

/// Combined fill fraction (numerator over 4) under which two siblings
/// coalesce.
const COALESCE_NUM: usize = 2;

/// Allocation of node-sized space, implemented by the allocator crate
/// and bootstrapped by the format driver before the allocator exists.
pub trait NodeAlloc: Send + Sync {
    /// Allocate node-sized space on `metadata_replicas` devices.
    ///
    /// Must not block on btree locks: callers hold intent locks when a
    /// split needs space. Implementations draw from a pre-opened pool
    /// and fail with a `MemPressure` restart when it runs dry; the
    /// commit wrapper refills with no locks held.
    fn alloc_node(&self, cx: &Cx) -> Result<Vec<ExtentPtr>>;

    /// Release a node's old location once no reachable pointer
    /// references it.
    fn free_node(&self, cx: &Cx, ptrs: &[ExtentPtr]);

    /// Top up the pre-opened pool. Called with no btree locks held.
    fn refill(&self, _cx: &Cx) -> Result<()> {
        Ok(())
    }
}

/// The btree system: roots, cache, node I/O configuration, and the
/// journal used for pointer flips.
pub struct BtreeSys {
    pub config: BtreeConfig,
    devices: Arc<DeviceSet>,
    pub cache: NodeCache,
    journal: Arc<Journal>,
    roots: Vec<RwLock<Option<Arc<CachedNode>>>>,
    alloc: RwLock<Option<Arc<dyn NodeAlloc>>>,
    next_node_seq: AtomicU64,
}

/// A leaf with its read lock held; dropping releases the lock.
pub struct ReadLeaf {
    pub node: Arc<CachedNode>,
}

impl Drop for ReadLeaf {
    fn drop(&mut self) {
        self.node.six.unlock(LockMode::Read);
    }
}

/// A node with intent (or, after upgrade, write) held; dropping
/// releases whatever is held.
pub struct IntentGuard {
    node: Arc<CachedNode>,
    write_held: bool,
}

impl IntentGuard {
    fn new(node: Arc<CachedNode>) -> Self {
        Self {
            node,
            write_held: false,
        }
    }

    #[must_use]
    pub fn node(&self) -> &Arc<CachedNode> {
        &self.node
    }

    pub fn upgrade(&mut self) {
        debug_assert!(!self.write_held);
        self.node.six.upgrade_to_write();
        self.write_held = true;
    }

    pub fn downgrade(&mut self) {
        debug_assert!(self.write_held);
        self.node.six.downgrade_to_intent();
        self.write_held = false;
    }
}

impl Drop for IntentGuard {
    fn drop(&mut self) {
        if self.write_held {
            self.node.six.unlock(LockMode::Write);
        } else {
            self.node.six.unlock(LockMode::Intent);
        }
    }
}

/// A leaf intent-locked for a staged update; the transaction layer
/// upgrades to write at apply time.
pub struct UpdatePath {
    guard: IntentGuard,
}

impl UpdatePath {
    #[must_use]
    pub fn leaf(&self) -> &Arc<CachedNode> {
        self.guard.node()
    }

    pub fn upgrade(&mut self) {
        self.guard.upgrade();
    }

    #[must_use]
    pub fn covers(&self, pos: Pos) -> bool {
        self.guard.node().data.read().covers(pos)
    }
}

/// Forward/backward cursor over one btree. Holds no locks between
/// calls; the position is re-resolved against the live tree each time.
#[derive(Debug, Clone)]
pub struct BtreeIter {
    pub btree: BtreeId,
    pub pos: Pos,
}

impl BtreeIter {
    /// Advance past a key the caller just consumed.
    pub fn advance(&mut self, key: &BKey) {
        self.pos = key.pos.successor();
    }
}

/// Unlock helper for the hand-over-hand descent loops: releases `mode`
/// on `node` and forwards the error.
fn fail_unlock<T>(node: &Arc<CachedNode>, mode: LockMode, err: Error) -> Result<T> {
    node.six.unlock(mode);
    Err(err)
}

impl BtreeSys {
    pub fn new(
        devices: Arc<DeviceSet>,
        config: BtreeConfig,
        journal: Arc<Journal>,
        cache_capacity: usize,
        node_seq_seed: u64,
    ) -> Self {
        Self {
            config,
            devices,
            cache: NodeCache::new(cache_capacity),
            journal,
            roots: BtreeId::ALL.iter().map(|_| RwLock::new(None)).collect(),
            alloc: RwLock::new(None),
            next_node_seq: AtomicU64::new(node_seq_seed.max(1)),
        }
    }

    /// Install (or replace) the node-space allocator.
    pub fn set_alloc(&self, alloc: Arc<dyn NodeAlloc>) {
        *self.alloc.write() = Some(alloc);
    }

    /// Refill the node allocator's pre-opened pool. Restart handling
    /// calls this between attempts, when no locks are held.
    pub fn refill_node_alloc(&self, cx: &Cx) -> Result<()> {
        match self.alloc.read().clone() {
            Some(alloc) => alloc.refill(cx),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    fn fresh_node_seq(&self) -> u64 {
        self.next_node_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_node_ptrs(&self, cx: &Cx) -> Result<Vec<ExtentPtr>> {
        let alloc = self
            .alloc
            .read()
            .clone()
            .ok_or_else(|| Error::InvalidArgument("no node allocator installed".into()))?;
        alloc.alloc_node(cx)
    }

    fn free_node_ptrs(&self, cx: &Cx, ptrs: &[ExtentPtr]) {
        if let Some(alloc) = self.alloc.read().clone() {
            alloc.free_node(cx, ptrs);
        }
    }

    fn root_slot(&self, btree: BtreeId) -> &RwLock<Option<Arc<CachedNode>>> {
        &self.roots[btree as usize]
    }

    fn root(&self, btree: BtreeId) -> Result<Arc<CachedNode>> {
        self.root_slot(btree)
            .read()
            .clone()
            .ok_or_else(|| Error::CorruptMetadata {
                btree,
                pos: Pos::MIN,
                detail: "btree has no root".into(),
            })
    }

    fn root_level(&self, btree: BtreeId) -> Result<u8> {
        Ok(self.root(btree)?.data.read().level)
    }

    // ── Bring-up ────────────────────────────────────────────────────

    /// Create an empty leaf root for every btree and write it out.
    /// Format-time only; roots are then persisted via the superblock.
    pub fn create_initial_roots(&self, cx: &Cx) -> Result<()> {
        for btree in BtreeId::ALL {
            let mut data =
                NodeData::new_empty(btree, 0, self.fresh_node_seq(), Pos::MIN, Pos::MAX);
            let ptrs = self.alloc_node_ptrs(cx)?;
            let ptr = BtreePtrV {
                ptrs,
                node_seq: data.node_seq,
                min_pos: Pos::MIN,
            };
            node::write_node_full(cx, &self.devices, &self.config, &mut data, ptr)?;
            let cached = self.cache.insert(cx, data)?;
            *self.root_slot(btree).write() = Some(cached);
        }
        Ok(())
    }

    /// Install a root from a persisted pointer key (superblock section
    /// or journal root record).
    pub fn set_root_from_key(&self, cx: &Cx, btree: BtreeId, level: u8, key: &BKey) -> Result<()> {
        let BVal::BtreePtr(ptr) = &key.val else {
            return Err(Error::CorruptMetadata {
                btree,
                pos: key.pos,
                detail: "root record is not a btree pointer".into(),
            });
        };
        let cached = self
            .cache
            .get_or_read(cx, &self.devices, &self.config, btree, level, ptr)?;
        *self.root_slot(btree).write() = Some(cached);
        Ok(())
    }

    /// Pointer keys for every btree root, for superblock persistence.
    /// Only meaningful once dirty nodes are flushed.
    pub fn root_keys(&self) -> Result<Vec<(BtreeId, u8, BKey)>> {
        let mut out = Vec::new();
        for btree in BtreeId::ALL {
            let root = self.root(btree)?;
            let data = root.data.read();
            let ptr = data.ptr.clone().ok_or_else(|| Error::CorruptMetadata {
                btree,
                pos: Pos::MIN,
                detail: "root never written".into(),
            })?;
            out.push((
                btree,
                data.level,
                BKey::new(data.max_pos, BVal::BtreePtr(ptr)),
            ));
        }
        Ok(out)
    }

    // ── Descent ─────────────────────────────────────────────────────

    fn child_ptr_of(data: &NodeData, pos: Pos, btree: BtreeId) -> Result<BtreePtrV> {
        let key = data.child_for(pos).ok_or_else(|| Error::CorruptMetadata {
            btree,
            pos,
            detail: "interior node with no children".into(),
        })?;
        match &key.val {
            BVal::BtreePtr(ptr) => Ok(ptr.clone()),
            _ => Err(Error::CorruptMetadata {
                btree,
                pos: key.pos,
                detail: "interior key is not a btree pointer".into(),
            }),
        }
    }

    /// Walk down to the node at `target_level` covering `pos`, locking
    /// hand-over-hand with read locks and taking `final_mode` on the
    /// target. With a tracker, out-of-order acquisitions restart.
    fn descend(
        &self,
        cx: &Cx,
        tracker: Option<&mut LockTracker>,
        btree: BtreeId,
        pos: Pos,
        target_level: u8,
        final_mode: LockMode,
    ) -> Result<Arc<CachedNode>> {
        let mut tracker = tracker;
        'restart: loop {
            cx_checkpoint(cx)?;
            let mut current = self.root(btree)?;
            let mode_for = |level: u8| {
                if level == target_level {
                    final_mode
                } else {
                    LockMode::Read
                }
            };

            let root_level = current.data.read().level;
            if root_level < target_level {
                return Err(Error::CorruptMetadata {
                    btree,
                    pos,
                    detail: format!("descent target level {target_level} above root"),
                });
            }
            let mut mode = mode_for(root_level);
            self.lock_at(&current, mode, tracker.as_deref_mut())?;

            loop {
                let step: Result<Option<Option<(u8, BtreePtrV)>>> = (|| {
                    let data = current.data.read();
                    if data.freed || !data.covers(pos) {
                        Ok(None)
                    } else if data.level == target_level {
                        Ok(Some(None))
                    } else {
                        Ok(Some(Some((
                            data.level,
                            Self::child_ptr_of(&data, pos, btree)?,
                        ))))
                    }
                })();
                let step = match step {
                    Ok(step) => step,
                    Err(err) => return fail_unlock(&current, mode, err),
                };
                match step {
                    None => {
                        current.six.unlock(mode);
                        continue 'restart;
                    }
                    Some(None) => return Ok(current),
                    Some(Some((level, ptr))) => {
                        let child = match self.cache.get_or_read(
                            cx,
                            &self.devices,
                            &self.config,
                            btree,
                            level - 1,
                            &ptr,
                        ) {
                            Ok(child) => child,
                            Err(err) => return fail_unlock(&current, mode, err),
                        };
                        let child_mode = mode_for(level - 1);
                        if let Err(err) =
                            self.lock_at(&child, child_mode, tracker.as_deref_mut())
                        {
                            return fail_unlock(&current, mode, err);
                        }
                        current.six.unlock(mode);
                        current = child;
                        mode = child_mode;
                    }
                }
            }
        }
    }

    /// Acquire `mode` on `node` respecting the global lock order: an
    /// in-order acquisition may block, an out-of-order one converts
    /// contention into a transaction restart.
    fn lock_at(
        &self,
        node: &Arc<CachedNode>,
        mode: LockMode,
        tracker: Option<&mut LockTracker>,
    ) -> Result<()> {
        let Some(tracker) = tracker else {
            node.six.lock(mode);
            return Ok(());
        };
        let ord = {
            let data = node.data.read();
            LockOrd::new(data.btree, data.min_pos, data.level)
        };
        if tracker.in_order(ord) {
            node.six.lock(mode);
            tracker.record(ord);
            Ok(())
        } else if node.six.try_lock(mode) {
            Ok(())
        } else {
            trace!(target: "bch::btree", event = "lock_order_restart");
            Err(Error::restart(RestartReason::LockOrder))
        }
    }

    /// Walk to the leaf covering `pos` for reading.
    pub fn descend_read(&self, cx: &Cx, btree: BtreeId, pos: Pos) -> Result<ReadLeaf> {
        let node = self.descend(cx, None, btree, pos, 0, LockMode::Read)?;
        Ok(ReadLeaf { node })
    }

    /// Intent-lock the leaf covering `pos` with room for `room_bytes`
    /// more key material, splitting first when there is not.
    pub fn update_path(
        &self,
        cx: &Cx,
        tracker: &mut LockTracker,
        btree: BtreeId,
        pos: Pos,
        room_bytes: usize,
    ) -> Result<UpdatePath> {
        loop {
            cx_checkpoint(cx)?;
            let leaf = self.descend(cx, Some(&mut *tracker), btree, pos, 0, LockMode::Intent)?;
            let guard = IntentGuard::new(leaf);
            let needs_split = {
                let data = guard.node().data.read();
                data.bytes + room_bytes > self.split_threshold()
            };
            if !needs_split {
                return Ok(UpdatePath { guard });
            }
            drop(guard);
            self.split_cascade(cx, tracker, btree, pos)?;
        }
    }

    /// Fill level above which a leaf splits before taking more keys.
    /// The transaction layer consults this when batching several
    /// updates into one leaf.
    #[must_use]
    pub fn split_threshold(&self) -> usize {
        self.config.capacity_bytes() * SPLIT_NUM / 4
    }

    // ── Iteration ───────────────────────────────────────────────────

    #[must_use]
    pub fn iter(&self, btree: BtreeId, pos: Pos) -> BtreeIter {
        BtreeIter { btree, pos }
    }

    /// Next live key with position `>= iter.pos`, or `None` at the end
    /// of the keyspace. Does not advance the cursor.
    pub fn iter_peek(&self, cx: &Cx, iter: &mut BtreeIter) -> Result<Option<BKey>> {
        loop {
            cx_checkpoint(cx)?;
            let leaf = self.descend_read(cx, iter.btree, iter.pos)?;
            let data = leaf.node.data.read();
            if let Some(key) = data.peek_from(iter.pos) {
                return Ok(Some(key.clone()));
            }
            if data.max_pos == Pos::MAX {
                return Ok(None);
            }
            iter.pos = data.max_pos.successor();
        }
    }

    /// Previous live key with position `< iter.pos`.
    pub fn iter_prev(&self, cx: &Cx, iter: &mut BtreeIter) -> Result<Option<BKey>> {
        let mut cursor = iter.pos;
        loop {
            cx_checkpoint(cx)?;
            let leaf = self.descend_read(cx, iter.btree, cursor)?;
            let data = leaf.node.data.read();
            if let Some(key) = data.peek_before(iter.pos) {
                return Ok(Some(key.clone()));
            }
            if data.min_pos == Pos::MIN {
                return Ok(None);
            }
            cursor = data.min_pos.predecessor();
        }
    }

    /// The whole leaf at the cursor: its live keys and covered range.
    /// Advances the cursor past the node. Bulk scans use this to walk
    /// trees without per-key descents.
    pub fn iter_next_node(
        &self,
        cx: &Cx,
        iter: &mut BtreeIter,
    ) -> Result<Option<(Pos, Pos, Vec<BKey>)>> {
        if iter.pos == Pos::MAX {
            return Ok(None);
        }
        let leaf = self.descend_read(cx, iter.btree, iter.pos)?;
        let data = leaf.node.data.read();
        let (min, max) = (data.min_pos, data.max_pos);
        let keys = data.live_keys();
        iter.pos = if max == Pos::MAX {
            Pos::MAX
        } else {
            max.successor()
        };
        Ok(Some((min, max, keys)))
    }

    // ── Updates (driven by the transaction layer) ───────────────────

    /// Raw read of the key at exactly `pos` in a locked update path,
    /// whiteouts included; the optimistic re-check needs deletions to
    /// be visible.
    #[must_use]
    pub fn read_for_update(&self, path: &UpdatePath, pos: Pos) -> Option<BKey> {
        path.leaf().data.read().get_raw(pos).cloned()
    }

    /// Apply one key to a write-locked leaf, marking it dirty under
    /// `seq`. The caller holds the journal entry for `seq`.
    pub fn apply(&self, path: &UpdatePath, key: BKey, seq: JournalSeq) {
        debug_assert!(path.guard.write_held);
        let mut data = path.leaf().data.write();
        data.apply_key(key);
        data.dirty = true;
        if data.pin_seq.is_none() {
            data.pin_seq = Some(seq);
            self.journal.pin(seq);
        }
    }

    // ── Split ───────────────────────────────────────────────────────

    /// Split the leaf covering `pos`, then propagate upward while the
    /// interior nodes the split fattened are themselves over the
    /// threshold. Root splits grow the tree.
    fn split_cascade(
        &self,
        cx: &Cx,
        tracker: &mut LockTracker,
        btree: BtreeId,
        pos: Pos,
    ) -> Result<()> {
        let mut level = 0_u8;
        loop {
            tracker.reset();
            if !self.maybe_split_level(cx, tracker, btree, pos, level)? {
                return Ok(());
            }
            level += 1;
            if level > self.root_level(btree)? {
                return Ok(());
            }
        }
    }

    /// Split the node at `level` covering `pos` if it is over the fill
    /// threshold (the leaf that triggered the cascade always is).
    fn maybe_split_level(
        &self,
        cx: &Cx,
        tracker: &mut LockTracker,
        btree: BtreeId,
        pos: Pos,
        level: u8,
    ) -> Result<bool> {
        let root_level = self.root_level(btree)?;
        if level > root_level {
            return Ok(false);
        }

        if level == root_level {
            let root = self.root(btree)?;
            self.lock_at(&root, LockMode::Intent, Some(&mut *tracker))?;
            let mut guard = IntentGuard::new(root);
            let over = {
                let data = guard.node().data.read();
                !data.freed && data.bytes > self.split_threshold()
            };
            if !over {
                return Ok(false);
            }
            self.split_root(cx, btree, &mut guard)?;
            return Ok(true);
        }

        // Take the parent (level + 1) with intent, then the child.
        let parent = self.descend(cx, Some(&mut *tracker), btree, pos, level + 1, LockMode::Intent)?;
        let mut parent_guard = IntentGuard::new(parent);
        let child_ptr = {
            let data = parent_guard.node().data.read();
            if data.freed || !data.covers(pos) {
                return Err(Error::restart(RestartReason::LockOrder));
            }
            Self::child_ptr_of(&data, pos, btree)?
        };
        let child =
            self.cache
                .get_or_read(cx, &self.devices, &self.config, btree, level, &child_ptr)?;
        self.lock_at(&child, LockMode::Intent, Some(&mut *tracker))?;
        let mut child_guard = IntentGuard::new(child);

        let over = {
            let data = child_guard.node().data.read();
            !data.freed && data.bytes > self.split_threshold()
        };
        if !over {
            return Ok(false);
        }
        self.split_child(cx, btree, &mut parent_guard, &mut child_guard)?;
        Ok(true)
    }

    fn build_half(
        &self,
        btree: BtreeId,
        level: u8,
        min_pos: Pos,
        max_pos: Pos,
        keys: &[BKey],
    ) -> NodeData {
        let mut data = NodeData::new_empty(btree, level, self.fresh_node_seq(), min_pos, max_pos);
        for key in keys {
            data.apply_key(key.clone());
        }
        data.unwritten.clear();
        data
    }

    /// Write `data` to freshly allocated space, returning the pointer.
    /// On failure the allocation is released.
    fn write_fresh(&self, cx: &Cx, data: &mut NodeData) -> Result<BtreePtrV> {
        let ptrs = self.alloc_node_ptrs(cx)?;
        let ptr = BtreePtrV {
            ptrs,
            node_seq: data.node_seq,
            min_pos: data.min_pos,
        };
        match node::write_node_full(cx, &self.devices, &self.config, data, ptr.clone()) {
            Ok(()) => Ok(ptr),
            Err(err) => {
                self.free_node_ptrs(cx, &ptr.ptrs);
                Err(err)
            }
        }
    }

    /// Split `child` in two under an intent-locked `parent`. Both
    /// halves hit disk before the parent pointers are journaled, so
    /// every crash boundary replays to a consistent tree.
    fn split_child(
        &self,
        cx: &Cx,
        btree: BtreeId,
        parent: &mut IntentGuard,
        child: &mut IntentGuard,
    ) -> Result<()> {
        child.upgrade();
        let result = self.split_child_locked(cx, btree, parent, child.node().clone());
        child.downgrade();
        result
    }

    fn split_child_locked(
        &self,
        cx: &Cx,
        btree: BtreeId,
        parent: &mut IntentGuard,
        child: Arc<CachedNode>,
    ) -> Result<()> {
        let (mut left, mut right, old_ptr, old_seq, old_pin) = {
            let cdata = child.data.read();
            if cdata.freed {
                return Ok(()); // raced with another splitter
            }
            let live = cdata.live_keys();
            if live.len() < 2 {
                return Err(Error::CorruptMetadata {
                    btree,
                    pos: cdata.min_pos,
                    detail: "cannot split node with fewer than two keys".into(),
                });
            }
            let mid = live.len() / 2;
            let left_max = live[mid - 1].pos;
            (
                self.build_half(btree, cdata.level, cdata.min_pos, left_max, &live[..mid]),
                self.build_half(
                    btree,
                    cdata.level,
                    left_max.successor(),
                    cdata.max_pos,
                    &live[mid..],
                ),
                cdata.ptr.clone(),
                cdata.node_seq,
                cdata.pin_seq,
            )
        };

        let left_ptr = self.write_fresh(cx, &mut left)?;
        let right_ptr = match self.write_fresh(cx, &mut right) {
            Ok(ptr) => ptr,
            Err(err) => {
                self.free_node_ptrs(cx, &left_ptr.ptrs);
                return Err(err);
            }
        };

        let left_key = BKey::new(left.max_pos, BVal::BtreePtr(left_ptr.clone()));
        let right_key = BKey::new(right.max_pos, BVal::BtreePtr(right_ptr.clone()));
        let parent_level = parent.node().data.read().level;
        let updates = vec![
            JournalUpdate {
                btree,
                level: parent_level,
                key: left_key.clone(),
            },
            JournalUpdate {
                btree,
                level: parent_level,
                key: right_key.clone(),
            },
        ];
        let bytes = encoded_len(&left_key) + encoded_len(&right_key) + 64;
        let seq = match self
            .journal
            .reserve_reclaim(cx, bytes)
            .and_then(|r| self.journal.append(cx, r, updates, false))
        {
            Ok(seq) => seq,
            Err(err) => {
                self.free_node_ptrs(cx, &left_ptr.ptrs);
                self.free_node_ptrs(cx, &right_ptr.ptrs);
                return Err(err);
            }
        };

        parent.upgrade();
        {
            let mut pdata = parent.node().data.write();
            pdata.apply_key(left_key);
            pdata.apply_key(right_key);
            pdata.dirty = true;
            if pdata.pin_seq.is_none() {
                pdata.pin_seq = Some(seq);
                self.journal.pin(seq);
            }
        }
        parent.downgrade();
        self.journal.unpin(seq);

        self.cache.insert(cx, left).map(drop)?;
        self.cache.insert(cx, right).map(drop)?;
        {
            let mut cdata = child.data.write();
            cdata.freed = true;
            cdata.dirty = false;
            cdata.pin_seq = None;
        }
        if let Some(pin) = old_pin {
            self.journal.unpin(pin);
        }
        self.cache.remove(old_seq);
        if let Some(old) = old_ptr {
            self.free_node_ptrs(cx, &old.ptrs);
        }

        debug!(
            target: "bch::btree",
            event = "node_split",
            btree = %btree,
            old_seq,
            seq = seq.0
        );
        Ok(())
    }

    /// Split the root, growing the tree by one level. The new root is
    /// written out and recorded through a journal root record.
    fn split_root(&self, cx: &Cx, btree: BtreeId, root_guard: &mut IntentGuard) -> Result<()> {
        root_guard.upgrade();
        let result = self.split_root_locked(cx, btree, root_guard.node().clone());
        root_guard.downgrade();
        result
    }

    fn split_root_locked(&self, cx: &Cx, btree: BtreeId, root: Arc<CachedNode>) -> Result<()> {
        let (mut left, mut right, level, old_ptr, old_seq, old_pin) = {
            let rdata = root.data.read();
            if rdata.freed {
                return Ok(());
            }
            let live = rdata.live_keys();
            if live.len() < 2 {
                return Err(Error::CorruptMetadata {
                    btree,
                    pos: rdata.min_pos,
                    detail: "cannot split root with fewer than two keys".into(),
                });
            }
            let mid = live.len() / 2;
            let left_max = live[mid - 1].pos;
            (
                self.build_half(btree, rdata.level, rdata.min_pos, left_max, &live[..mid]),
                self.build_half(
                    btree,
                    rdata.level,
                    left_max.successor(),
                    rdata.max_pos,
                    &live[mid..],
                ),
                rdata.level,
                rdata.ptr.clone(),
                rdata.node_seq,
                rdata.pin_seq,
            )
        };

        let left_ptr = self.write_fresh(cx, &mut left)?;
        let right_ptr = match self.write_fresh(cx, &mut right) {
            Ok(ptr) => ptr,
            Err(err) => {
                self.free_node_ptrs(cx, &left_ptr.ptrs);
                return Err(err);
            }
        };

        let mut new_root =
            NodeData::new_empty(btree, level + 1, self.fresh_node_seq(), Pos::MIN, Pos::MAX);
        new_root.apply_key(BKey::new(left.max_pos, BVal::BtreePtr(left_ptr)));
        new_root.apply_key(BKey::new(right.max_pos, BVal::BtreePtr(right_ptr)));
        new_root.unwritten.clear();
        let root_ptr = self.write_fresh(cx, &mut new_root)?;

        let root_key = BKey::new(Pos::MAX, BVal::BtreePtr(root_ptr));
        let bytes = encoded_len(&root_key) + 64;
        let reservation = self.journal.reserve_reclaim(cx, bytes)?;
        let seq = self.journal.append(
            cx,
            reservation,
            vec![JournalUpdate {
                btree,
                level: ROOT_LEVEL,
                key: root_key,
            }],
            false,
        )?;
        self.journal.unpin(seq);

        self.cache.insert(cx, left).map(drop)?;
        self.cache.insert(cx, right).map(drop)?;
        let new_root_cached = self.cache.insert(cx, new_root)?;
        *self.root_slot(btree).write() = Some(new_root_cached);

        {
            let mut rdata = root.data.write();
            rdata.freed = true;
            rdata.dirty = false;
            rdata.pin_seq = None;
        }
        if let Some(pin) = old_pin {
            self.journal.unpin(pin);
        }
        self.cache.remove(old_seq);
        if let Some(old) = old_ptr {
            self.free_node_ptrs(cx, &old.ptrs);
        }

        info!(
            target: "bch::btree",
            event = "root_split",
            btree = %btree,
            new_level = level + 1,
            seq = seq.0
        );
        Ok(())
    }

    // ── Coalesce ────────────────────────────────────────────────────

    /// Merge the leaf covering `pos` with its right sibling when the
    /// pair is under the coalesce floor. Returns whether a merge
    /// happened. Maintenance scans call this; it is also how a root
    /// with one child shrinks back.
    pub fn try_coalesce(&self, cx: &Cx, btree: BtreeId, pos: Pos) -> Result<bool> {
        let mut tracker = LockTracker::new();
        let root_level = self.root_level(btree)?;
        if root_level == 0 {
            return Ok(false);
        }

        let parent = self.descend(cx, Some(&mut tracker), btree, pos, 1, LockMode::Intent)?;
        let mut parent_guard = IntentGuard::new(parent);

        let (left_key, right_key) = {
            let data = parent_guard.node().data.read();
            if data.freed || !data.covers(pos) {
                return Ok(false);
            }
            let mut iter = data.keys.range(pos..).filter(|(_, k)| !k.is_deleted());
            let Some((_, left)) = iter.next() else {
                return Ok(false);
            };
            let Some((_, right)) = iter.next() else {
                drop(iter);
                drop(data);
                return self.maybe_shrink_root(cx, btree, &mut parent_guard);
            };
            (left.clone(), right.clone())
        };

        let (BVal::BtreePtr(left_ptr), BVal::BtreePtr(right_ptr)) =
            (&left_key.val, &right_key.val)
        else {
            return Err(Error::CorruptMetadata {
                btree,
                pos,
                detail: "interior key is not a btree pointer".into(),
            });
        };

        let left =
            self.cache
                .get_or_read(cx, &self.devices, &self.config, btree, 0, left_ptr)?;
        self.lock_at(&left, LockMode::Intent, Some(&mut tracker))?;
        let mut left_guard = IntentGuard::new(left);
        let right =
            self.cache
                .get_or_read(cx, &self.devices, &self.config, btree, 0, right_ptr)?;
        self.lock_at(&right, LockMode::Intent, Some(&mut tracker))?;
        let mut right_guard = IntentGuard::new(right);

        let merged_small = {
            let l = left_guard.node().data.read();
            let r = right_guard.node().data.read();
            // Size on live keys: whiteouts die at the rewrite anyway.
            let live_bytes = |d: &NodeData| -> usize {
                d.keys
                    .values()
                    .filter(|k| !k.is_deleted())
                    .map(encoded_len)
                    .sum()
            };
            !l.freed
                && !r.freed
                && live_bytes(&l) + live_bytes(&r)
                    < self.config.capacity_bytes() * COALESCE_NUM / 4
        };
        if !merged_small {
            return Ok(false);
        }

        left_guard.upgrade();
        right_guard.upgrade();
        let result = self.coalesce_locked(
            cx,
            btree,
            &mut parent_guard,
            left_guard.node().clone(),
            right_guard.node().clone(),
            &left_key,
        );
        right_guard.downgrade();
        left_guard.downgrade();
        result.map(|()| true)
    }

    fn coalesce_locked(
        &self,
        cx: &Cx,
        btree: BtreeId,
        parent: &mut IntentGuard,
        left: Arc<CachedNode>,
        right: Arc<CachedNode>,
        left_parent_key: &BKey,
    ) -> Result<()> {
        let (mut merged, lp, ls, lpin, rp, rs, rpin, right_max) = {
            let l = left.data.read();
            let r = right.data.read();
            let mut keys = l.live_keys();
            keys.extend(r.live_keys());
            (
                self.build_half(btree, l.level, l.min_pos, r.max_pos, &keys),
                l.ptr.clone(),
                l.node_seq,
                l.pin_seq,
                r.ptr.clone(),
                r.node_seq,
                r.pin_seq,
                r.max_pos,
            )
        };

        let merged_ptr = self.write_fresh(cx, &mut merged)?;
        let merged_key = BKey::new(right_max, BVal::BtreePtr(merged_ptr));
        let whiteout = BKey::deleted(left_parent_key.pos);
        let parent_level = parent.node().data.read().level;
        let updates = vec![
            JournalUpdate {
                btree,
                level: parent_level,
                key: whiteout.clone(),
            },
            JournalUpdate {
                btree,
                level: parent_level,
                key: merged_key.clone(),
            },
        ];
        let bytes = encoded_len(&merged_key) + encoded_len(&whiteout) + 64;
        let reservation = self.journal.reserve_reclaim(cx, bytes)?;
        let seq = self.journal.append(cx, reservation, updates, false)?;

        parent.upgrade();
        {
            let mut pdata = parent.node().data.write();
            pdata.apply_key(whiteout);
            pdata.apply_key(merged_key);
            pdata.dirty = true;
            if pdata.pin_seq.is_none() {
                pdata.pin_seq = Some(seq);
                self.journal.pin(seq);
            }
        }
        parent.downgrade();
        self.journal.unpin(seq);

        self.cache.insert(cx, merged).map(drop)?;
        for (node, pin, seq_id, ptr) in [(left, lpin, ls, lp), (right, rpin, rs, rp)] {
            {
                let mut data = node.data.write();
                data.freed = true;
                data.dirty = false;
                data.pin_seq = None;
            }
            if let Some(pin) = pin {
                self.journal.unpin(pin);
            }
            self.cache.remove(seq_id);
            if let Some(ptr) = ptr {
                self.free_node_ptrs(cx, &ptr.ptrs);
            }
        }

        debug!(target: "bch::btree", event = "node_coalesce", btree = %btree);
        Ok(())
    }

    /// A root with exactly one child hands its role to the child.
    fn maybe_shrink_root(
        &self,
        cx: &Cx,
        btree: BtreeId,
        root_guard: &mut IntentGuard,
    ) -> Result<bool> {
        let is_root = {
            let slot = self.root_slot(btree).read();
            slot.as_ref()
                .map(|r| Arc::ptr_eq(r, root_guard.node()))
                .unwrap_or(false)
        };
        let only_child = {
            let data = root_guard.node().data.read();
            if !is_root || data.freed || data.level == 0 || data.live_count() != 1 {
                None
            } else {
                data.keys
                    .values()
                    .find(|k| !k.is_deleted())
                    .cloned()
                    .map(|k| (k, data.level, data.node_seq, data.ptr.clone(), data.pin_seq))
            }
        };
        let Some((child_key, level, old_seq, old_ptr, old_pin)) = only_child else {
            return Ok(false);
        };
        let BVal::BtreePtr(_) = &child_key.val else {
            return Ok(false);
        };

        let bytes = encoded_len(&child_key) + 64;
        let reservation = self.journal.reserve_reclaim(cx, bytes)?;
        let seq = self.journal.append(
            cx,
            reservation,
            vec![JournalUpdate {
                btree,
                level: ROOT_LEVEL,
                key: child_key.clone(),
            }],
            false,
        )?;
        self.journal.unpin(seq);

        self.set_root_from_key(cx, btree, level - 1, &child_key)?;

        root_guard.upgrade();
        {
            let mut data = root_guard.node().data.write();
            data.freed = true;
            data.dirty = false;
            data.pin_seq = None;
        }
        root_guard.downgrade();
        if let Some(pin) = old_pin {
            self.journal.unpin(pin);
        }
        self.cache.remove(old_seq);
        if let Some(ptr) = old_ptr {
            self.free_node_ptrs(cx, &ptr.ptrs);
        }
        info!(target: "bch::btree", event = "root_shrink", btree = %btree, new_level = level - 1);
        Ok(true)
    }

    // ── Flush ───────────────────────────────────────────────────────

    /// Write one dirty node out. Appends a bset in place when the image
    /// has room; otherwise COWs to fresh space and flips the parent
    /// pointer (or the root record) through the journal.
    pub fn flush_node(&self, cx: &Cx, target: &Arc<CachedNode>) -> Result<()> {
        loop {
            cx_checkpoint(cx)?;
            let (btree, min_pos, level, dirty, freed) = {
                let data = target.data.read();
                (
                    data.btree,
                    data.min_pos,
                    data.level,
                    data.dirty,
                    data.freed,
                )
            };
            if !dirty || freed {
                return Ok(());
            }

            let is_root = {
                let slot = self.root_slot(btree).read();
                slot.as_ref().map(|r| Arc::ptr_eq(r, target)).unwrap_or(false)
            };

            // Lock-order contention retries here; resource restarts
            // (journal space, node pool) go back to the caller, which
            // can actually free them.
            let lock_order_only = |err: &Error| {
                matches!(
                    err,
                    Error::TransactionRestart {
                        reason: RestartReason::LockOrder
                    }
                )
            };

            let result = if is_root {
                target.six.lock(LockMode::Intent);
                let mut guard = IntentGuard::new(target.clone());
                self.flush_locked(cx, btree, None, &mut guard)
            } else {
                let mut tracker = LockTracker::new();
                let parent = match self.descend(
                    cx,
                    Some(&mut tracker),
                    btree,
                    min_pos,
                    level + 1,
                    LockMode::Intent,
                ) {
                    Ok(p) => p,
                    Err(err) if lock_order_only(&err) => continue,
                    Err(err) => return Err(err),
                };
                let mut parent_guard = IntentGuard::new(parent);
                if let Err(err) = self.lock_at(target, LockMode::Intent, Some(&mut tracker)) {
                    if lock_order_only(&err) {
                        continue;
                    }
                    return Err(err);
                }
                let mut guard = IntentGuard::new(target.clone());
                self.flush_locked(cx, btree, Some(&mut parent_guard), &mut guard)
            };
            match result {
                Err(err) if lock_order_only(&err) => continue,
                other => return other,
            }
        }
    }

    /// Flush with intent held on the node (and its parent, when it has
    /// one).
    fn flush_locked(
        &self,
        cx: &Cx,
        btree: BtreeId,
        mut parent: Option<&mut IntentGuard>,
        guard: &mut IntentGuard,
    ) -> Result<()> {
        guard.upgrade();
        let outcome = (|| -> Result<()> {
            let mut data = guard.node().data.write();
            if !data.dirty || data.freed {
                return Ok(());
            }
            let old_pin = data.pin_seq;

            if node::append_bset_in_place(cx, &self.devices, &self.config, &mut data)? {
                data.pin_seq = None;
                drop(data);
                if let Some(pin) = old_pin {
                    self.journal.unpin(pin);
                }
                return Ok(());
            }

            // COW rewrite: fresh location, full image, pointer flip.
            let old_ptr = data.ptr.clone();
            let node_level = data.level;
            let new_ptrs = self.alloc_node_ptrs(cx)?;
            let new_ptr = BtreePtrV {
                ptrs: new_ptrs,
                node_seq: data.node_seq,
                min_pos: data.min_pos,
            };
            node::write_node_full(cx, &self.devices, &self.config, &mut data, new_ptr.clone())?;
            let ptr_key = BKey::new(data.max_pos, BVal::BtreePtr(new_ptr.clone()));
            drop(data);

            let record_level = if parent.is_some() {
                node_level + 1
            } else {
                ROOT_LEVEL
            };
            let updates = vec![JournalUpdate {
                btree,
                level: record_level,
                key: ptr_key.clone(),
            }];
            let bytes = encoded_len(&ptr_key) + 64;
            let seq = match self
                .journal
                .reserve_reclaim(cx, bytes)
                .and_then(|r| self.journal.append(cx, r, updates, false))
            {
                Ok(seq) => seq,
                Err(err) => {
                    // Roll back to the dirty state; the old on-disk
                    // image plus the journal still describe this node.
                    // Force a fresh COW next time: the compaction just
                    // emptied `unwritten`, so an in-place append would
                    // wrongly conclude there is nothing left to write.
                    let mut data = guard.node().data.write();
                    data.ptr = old_ptr;
                    data.dirty = true;
                    data.force_rewrite = true;
                    data.pin_seq = old_pin;
                    self.free_node_ptrs(cx, &new_ptr.ptrs);
                    return Err(err);
                }
            };

            if let Some(parent_guard) = parent.as_deref_mut() {
                parent_guard.upgrade();
                {
                    let mut pdata = parent_guard.node().data.write();
                    pdata.apply_key(ptr_key);
                    pdata.dirty = true;
                    if pdata.pin_seq.is_none() {
                        pdata.pin_seq = Some(seq);
                        self.journal.pin(seq);
                    }
                }
                parent_guard.downgrade();
            }
            self.journal.unpin(seq);

            {
                let mut data = guard.node().data.write();
                data.pin_seq = None;
            }
            if let Some(pin) = old_pin {
                self.journal.unpin(pin);
            }
            if let Some(old) = old_ptr {
                self.free_node_ptrs(cx, &old.ptrs);
            }
            Ok(())
        })();
        guard.downgrade();
        outcome
    }

    /// Flush the dirty node holding the oldest journal pin. Returns
    /// whether anything was flushed. Journal reclaim calls this until
    /// reservations fit again.
    pub fn flush_oldest(&self, cx: &Cx) -> Result<bool> {
        let dirty = self.cache.dirty_nodes();
        let Some(target) = dirty.into_iter().next() else {
            return Ok(false);
        };
        self.flush_node(cx, &target)?;
        Ok(true)
    }

    /// Flush whichever dirty node can make progress, oldest pin first.
    /// When the oldest node itself needs resources (a COW while the
    /// ring is full), a younger node's in-place append may be what
    /// frees them.
    pub fn flush_for_reclaim(&self, cx: &Cx) -> Result<bool> {
        for target in self.cache.dirty_nodes() {
            cx_checkpoint(cx)?;
            match self.flush_node(cx, &target) {
                Ok(()) => return Ok(true),
                Err(err) if err.is_restart() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    /// Flush every dirty node, leaves before interiors, until the tree
    /// is clean. Used at clean shutdown and after replay. Transient
    /// restarts (journal space, node pool) retry on the next round;
    /// flushing other nodes is what frees the resources they wait on.
    pub fn flush_all(&self, cx: &Cx) -> Result<()> {
        for _round in 0..64 {
            let mut dirty = self.cache.dirty_nodes();
            dirty.retain(|n| !n.data.read().freed);
            if dirty.is_empty() {
                return Ok(());
            }
            dirty.sort_by_key(|n| n.data.read().level);
            let mut deferred = false;
            for target in dirty {
                cx_checkpoint(cx)?;
                match self.flush_node(cx, &target) {
                    Ok(()) => {}
                    Err(err) if err.is_restart() => {
                        self.refill_node_alloc(cx)?;
                        deferred = true;
                    }
                    Err(err) => return Err(err),
                }
            }
            if deferred {
                self.journal.flush(cx)?;
            }
        }
        Err(Error::Fsck("btree flush did not converge".into()))
    }

    // ── Bulk node maintenance ───────────────────────────────────────

    /// Visit every node pointer of `btree`, interior levels first.
    /// Bulk jobs (evacuation, node rewrites) use this instead of
    /// per-key iteration.
    pub fn for_each_node_ptr(
        &self,
        cx: &Cx,
        btree: BtreeId,
        visit: &mut dyn FnMut(u8, &BtreePtrV) -> Result<()>,
    ) -> Result<()> {
        let root = self.root(btree)?;
        let (root_level, root_ptr) = {
            let data = root.data.read();
            (data.level, data.ptr.clone())
        };
        if let Some(ptr) = &root_ptr {
            visit(root_level, ptr)?;
        }

        let mut queue: Vec<(u8, Vec<BKey>)> = vec![(root_level, {
            let data = root.data.read();
            data.live_keys()
        })];
        while let Some((level, keys)) = queue.pop() {
            if level == 0 {
                continue;
            }
            for key in keys {
                cx_checkpoint(cx)?;
                let BVal::BtreePtr(ptr) = &key.val else {
                    continue;
                };
                visit(level - 1, ptr)?;
                if level - 1 > 0 {
                    let child = self.cache.get_or_read(
                        cx,
                        &self.devices,
                        &self.config,
                        btree,
                        level - 1,
                        ptr,
                    )?;
                    child.six.lock(LockMode::Read);
                    let child_keys = child.data.read().live_keys();
                    child.six.unlock(LockMode::Read);
                    queue.push((level - 1, child_keys));
                }
            }
        }
        Ok(())
    }

    /// Force a COW rewrite of the node at `ptr`: mark it dirty with a
    /// full image so the next flush relocates it. Used to move
    /// metadata off a device and to rewrite old-format nodes.
    pub fn rewrite_node(&self, cx: &Cx, btree: BtreeId, level: u8, ptr: &BtreePtrV) -> Result<()> {
        let node = self
            .cache
            .get_or_read(cx, &self.devices, &self.config, btree, level, ptr)?;
        {
            node.six.lock(LockMode::Intent);
            let mut data = node.data.write();
            if data.freed {
                drop(data);
                node.six.unlock(LockMode::Intent);
                return Ok(());
            }
            data.dirty = true;
            data.force_rewrite = true;
            drop(data);
            node.six.unlock(LockMode::Intent);
        }
        self.flush_node(cx, &node)
    }

    // ── Replay ──────────────────────────────────────────────────────

    /// Apply one journaled update during mount-time replay. Root
    /// records reinstall roots; interior and leaf records are applied
    /// into the tree at their level.
    pub fn replay_update(&self, cx: &Cx, btree: BtreeId, level: u8, key: &BKey) -> Result<()> {
        if level == ROOT_LEVEL {
            let node_level = self.probe_root_level(cx, btree, key)?;
            return self.set_root_from_key(cx, btree, node_level, key);
        }

        let mut tracker = LockTracker::new();
        loop {
            cx_checkpoint(cx)?;
            tracker.reset();
            let attempt = if level == 0 {
                self.update_path(cx, &mut tracker, btree, key.pos, encoded_len(key))
                    .map(|mut path| {
                        path.upgrade();
                        let mut data = path.leaf().data.write();
                        data.apply_key(key.clone());
                        data.dirty = true;
                    })
            } else {
                self.replay_interior(cx, &mut tracker, btree, level, key)
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(err) if err.is_restart() => {
                    // Replay is single-threaded; a restart here means a
                    // resource ran dry, not contention.
                    self.refill_node_alloc(cx)?;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn replay_interior(
        &self,
        cx: &Cx,
        tracker: &mut LockTracker,
        btree: BtreeId,
        level: u8,
        key: &BKey,
    ) -> Result<()> {
        let node = self.descend(cx, Some(tracker), btree, key.pos, level, LockMode::Intent)?;
        let mut guard = IntentGuard::new(node);
        guard.upgrade();
        {
            let mut data = guard.node().data.write();
            data.apply_key(key.clone());
            data.dirty = true;
        }
        guard.downgrade();
        Ok(())
    }

    /// The level a replayed root key installs its node at: the node
    /// image itself knows; probe from the bottom.
    fn probe_root_level(&self, cx: &Cx, btree: BtreeId, key: &BKey) -> Result<u8> {
        let BVal::BtreePtr(ptr) = &key.val else {
            return Err(Error::CorruptMetadata {
                btree,
                pos: key.pos,
                detail: "root record is not a btree pointer".into(),
            });
        };
        for level in 0..16_u8 {
            if let Ok(data) = node::read_node(cx, &self.devices, &self.config, btree, level, ptr)
            {
                return Ok(data.level);
            }
        }
        Err(Error::CorruptMetadata {
            btree,
            pos: key.pos,
            detail: "replayed root matches no level".into(),
        })
    }
}

#[cfg(test)]
mod tests;
