#![forbid(unsafe_code)]
//! Multi-device allocator.
//!
//! Per-device bucket state lives in the alloc btree; three derived
//! indices (freespace, need-discard, LRU) are maintained by a commit
//! trigger so they can never drift from the alloc keys they mirror.
//! Allocation pops the first freespace key (ordered oldest generation
//! first), opens the bucket under a write point, and hands out sector
//! ranges; when a device runs out of free buckets the LRU-oldest
//! cached bucket is invalidated and reused.

use asupersync::Cx;
use bch_block::{DeviceSet, cx_checkpoint};
use bch_btree::{BtreeSys, NodeAlloc};
use bch_error::{Error, RestartReason, Result};
use bch_txn::{CommitTrigger, Transaction, commit_do};
use bch_types::keys::{
    ALLOC_NEED_DISCARD, ALLOC_NEED_INC_GEN, FREESPACE_GEN_BITS, FreespaceV, IO_TIME_READ,
    IO_TIME_WRITE, freespace_decode, freespace_pos, lru_pos,
};
use bch_types::{
    AllocV, BKey, BVal, BtreeId, BucketIdx, DataType, DeviceIdx, ExtentPtr, Gen, LruV, Pos,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Number of hashed write points; independent streams land on
/// different points so their data does not interleave.
pub const NR_WRITE_POINTS: usize = 16;

/// Write point reserved for btree node allocation.
pub const WP_BTREE: u64 = 0;
/// First write point used for user data streams.
pub const WP_USER_BASE: u64 = 1;

/// Pre-opened btree node locations kept ready for splits.
const NODE_POOL_TARGET: usize = 8;

/// Map a stream identifier to a write point.
#[must_use]
pub fn write_point_for(stream: u64) -> u64 {
    WP_USER_BASE + (stream.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 40) % (NR_WRITE_POINTS as u64 - 1)
}

#[derive(Debug, Clone, Copy)]
struct OpenBucket {
    bucket: BucketIdx,
    gen: Gen,
    /// Next unused sector within the bucket.
    fill: u64,
}

#[derive(Debug, Default)]
struct WritePoint {
    open: HashMap<DeviceIdx, OpenBucket>,
}

/// The allocator.
pub struct Allocator {
    sys: Arc<BtreeSys>,
    devices: Arc<DeviceSet>,
    write_points: Vec<Mutex<WritePoint>>,
    /// Buckets currently open for allocation; the invalidator must not
    /// touch them.
    open_buckets: Mutex<HashSet<(u32, u64)>>,
    /// Pre-opened node-sized locations for the btree engine.
    node_pool: Mutex<Vec<Vec<ExtentPtr>>>,
    /// Node locations released while btree locks were held; their
    /// accounting runs at the next refill, when nothing is locked.
    deferred_frees: Mutex<Vec<Vec<ExtentPtr>>>,
    /// Monotonic tick feeding bucket io_time and the LRU index.
    clock: AtomicU64,
    /// Runtime usage counter (sectors of live data); rebuilt by
    /// [`Allocator::init_usage`] at mount, maintained by the triggers.
    used_sectors: AtomicU64,
    /// Sectors promised to in-flight writes.
    reserved_sectors: AtomicU64,
    capacity_sectors: u64,
    gc_reserve_percent: u8,
}

impl Allocator {
    pub fn new(sys: Arc<BtreeSys>, devices: Arc<DeviceSet>, gc_reserve_percent: u8) -> Arc<Self> {
        let capacity_sectors = devices
            .iter()
            .into_iter()
            .map(|d| (d.nbuckets - u64::from(d.first_bucket)) * u64::from(d.bucket_size))
            .sum();
        Arc::new(Self {
            sys,
            devices,
            write_points: (0..NR_WRITE_POINTS).map(|_| Mutex::new(WritePoint::default())).collect(),
            open_buckets: Mutex::new(HashSet::new()),
            node_pool: Mutex::new(Vec::new()),
            deferred_frees: Mutex::new(Vec::new()),
            clock: AtomicU64::new(1),
            used_sectors: AtomicU64::new(0),
            reserved_sectors: AtomicU64::new(0),
            capacity_sectors,
            gc_reserve_percent,
        })
    }

    #[must_use]
    pub fn sys(&self) -> &Arc<BtreeSys> {
        &self.sys
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Read one bucket's alloc record.
    pub fn bucket_state(&self, cx: &Cx, dev: DeviceIdx, bucket: BucketIdx) -> Result<AllocV> {
        let pos = Pos::bucket(dev, bucket);
        let mut iter = self.sys.iter(BtreeId::Alloc, pos);
        match self.sys.iter_peek(cx, &mut iter)? {
            Some(key) if key.pos == pos => match key.val {
                BVal::Alloc(a) => Ok(a),
                _ => Err(Error::CorruptMetadata {
                    btree: BtreeId::Alloc,
                    pos,
                    detail: "alloc btree holds a non-alloc key".into(),
                }),
            },
            _ => Err(Error::Fsck(format!(
                "bucket {}:{} has no alloc record",
                dev.0, bucket.0
            ))),
        }
    }

    // ── Usage and reservations ──────────────────────────────────────

    /// Rebuild the runtime usage counter from the alloc btree.
    pub fn init_usage(&self, cx: &Cx) -> Result<()> {
        let mut used = 0_u64;
        let mut iter = self.sys.iter(BtreeId::Alloc, Pos::MIN);
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            iter.advance(&key);
            if let BVal::Alloc(a) = &key.val {
                used += u64::from(a.dirty_sectors);
            }
        }
        self.used_sectors.store(used, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    #[must_use]
    pub fn used_sectors(&self) -> u64 {
        self.used_sectors.load(Ordering::Relaxed)
    }

    fn usable_sectors(&self) -> u64 {
        self.capacity_sectors - self.capacity_sectors * u64::from(self.gc_reserve_percent) / 100
    }

    /// Reserve space for an in-flight write of `sectors` logical
    /// sectors across `replicas` copies. Refunded on drop; a completed
    /// write consumes it instead.
    pub fn disk_reservation_get(
        self: &Arc<Self>,
        sectors: u64,
        replicas: u8,
    ) -> Result<DiskReservation> {
        let want = sectors * u64::from(replicas.max(1));
        let mut reserved = self.reserved_sectors.load(Ordering::Relaxed);
        loop {
            let used = self.used_sectors.load(Ordering::Relaxed);
            if used + reserved + want > self.usable_sectors() {
                debug!(
                    target: "bch::alloc",
                    event = "reservation_denied",
                    want,
                    used,
                    reserved,
                    usable = self.usable_sectors()
                );
                return Err(Error::NoSpace);
            }
            match self.reserved_sectors.compare_exchange_weak(
                reserved,
                reserved + want,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(DiskReservation {
                        alloc: Arc::clone(self),
                        sectors: want,
                    });
                }
                Err(actual) => reserved = actual,
            }
        }
    }

    // ── Bucket open / allocate ──────────────────────────────────────

    /// Open a free bucket on `dev` for `data_type` writes: pop the
    /// first freespace key, transition the alloc record, and shield the
    /// bucket from invalidation.
    fn open_bucket(
        &self,
        cx: &Cx,
        triggers: &[Arc<dyn CommitTrigger>],
        dev: DeviceIdx,
        data_type: DataType,
    ) -> Result<OpenBucket> {
        let now = self.tick();
        let next_seq = self.sys.journal().next_seq().0;
        let opened = commit_do(&self.sys, cx, triggers, false, |txn, cx| {
            let from = Pos::new(u64::from(dev.0), 0);
            let mut iter = txn.sys().iter(BtreeId::Freespace, from);
            let key = txn
                .sys()
                .iter_peek(cx, &mut iter)?
                .filter(|k| k.pos.inode == u64::from(dev.0))
                .ok_or(Error::NoSpace)?;
            let (bucket, gen_bits) = freespace_decode(key.pos);

            let mut alloc = match txn.get(cx, BtreeId::Alloc, Pos::bucket(dev, bucket))? {
                Some(k) => match k.val {
                    BVal::Alloc(a) => a,
                    _ => {
                        return Err(Error::CorruptMetadata {
                            btree: BtreeId::Alloc,
                            pos: k.pos,
                            detail: "alloc btree holds a non-alloc key".into(),
                        });
                    }
                },
                None => {
                    return Err(Error::Fsck(format!(
                        "freespace key references missing bucket {}:{}",
                        dev.0, bucket.0
                    )));
                }
            };
            let gen_mask = (1_u16 << FREESPACE_GEN_BITS) - 1;
            if u16::from(alloc.gen.0) & gen_mask != u16::from(gen_bits) {
                return Err(Error::Fsck(format!(
                    "freespace key gen bits {} do not match bucket gen {}",
                    gen_bits, alloc.gen.0
                )));
            }
            if !alloc.is_empty() || alloc.data_type != DataType::Free as u8 {
                return Err(Error::Fsck(format!(
                    "freespace key references non-free bucket {}:{}",
                    dev.0, bucket.0
                )));
            }

            if alloc.need_inc_gen() {
                alloc.gen = alloc.gen.next();
                alloc.flags &= !ALLOC_NEED_INC_GEN;
            }
            alloc.data_type = data_type as u8;
            alloc.io_time[IO_TIME_WRITE] = now;
            alloc.journal_seq = next_seq;
            let gen = alloc.gen;
            txn.update(
                cx,
                BtreeId::Alloc,
                BKey::new(Pos::bucket(dev, bucket), BVal::Alloc(alloc)),
            )?;
            Ok(OpenBucket {
                bucket,
                gen,
                fill: 0,
            })
        })?;

        self.open_buckets.lock().insert((dev.0, opened.bucket.0));
        trace!(
            target: "bch::alloc",
            event = "bucket_open",
            dev = dev.0,
            bucket = opened.bucket.0,
            data_type = %data_type
        );
        Ok(opened)
    }

    fn close_bucket(&self, dev: DeviceIdx, bucket: BucketIdx) {
        self.open_buckets.lock().remove(&(dev.0, bucket.0));
    }

    /// Allocate `sectors` on each of up to `nr_replicas` devices drawn
    /// from `candidates`, under the write point for `stream`. Returns
    /// one pointer per replica.
    ///
    /// Devices that are out of free buckets fall back to invalidating
    /// their LRU-oldest cached bucket; a device with neither is
    /// skipped. Fewer than `nr_replicas` pointers means the allocation
    /// is degraded; zero means no space.
    pub fn allocate(
        &self,
        cx: &Cx,
        triggers: &[Arc<dyn CommitTrigger>],
        stream: u64,
        candidates: &[DeviceIdx],
        nr_replicas: u8,
        data_type: DataType,
        sectors: u64,
    ) -> Result<Vec<ExtentPtr>> {
        let wp_id = if data_type == DataType::Btree {
            WP_BTREE
        } else {
            write_point_for(stream)
        } as usize
            % NR_WRITE_POINTS;

        let mut out = Vec::new();
        // Rotate the candidate order by stream so independent streams
        // spread over devices.
        let start = if candidates.is_empty() {
            0
        } else {
            (stream as usize) % candidates.len()
        };
        let order: Vec<DeviceIdx> = candidates[start..]
            .iter()
            .chain(candidates[..start].iter())
            .copied()
            .collect();

        for dev in order {
            if out.len() >= usize::from(nr_replicas) {
                break;
            }
            cx_checkpoint(cx)?;
            let Some(device) = self.devices.get(dev) else {
                continue;
            };
            if !device.is_writable() || sectors > u64::from(device.bucket_size) {
                continue;
            }

            match self.alloc_on_device(cx, triggers, wp_id, dev, data_type, sectors) {
                Ok(ptr) => out.push(ptr),
                Err(Error::NoSpace) => {
                    warn!(
                        target: "bch::alloc",
                        event = "device_full",
                        dev = dev.0
                    );
                }
                Err(err) => return Err(err),
            }
        }

        if out.is_empty() {
            return Err(Error::NoSpace);
        }
        Ok(out)
    }

    fn alloc_on_device(
        &self,
        cx: &Cx,
        triggers: &[Arc<dyn CommitTrigger>],
        wp_id: usize,
        dev: DeviceIdx,
        data_type: DataType,
        sectors: u64,
    ) -> Result<ExtentPtr> {
        let device = self.devices.require(dev)?;
        let bucket_sectors = u64::from(device.bucket_size);

        let mut wp = self.write_points[wp_id].lock();
        loop {
            if let Some(open) = wp.open.get_mut(&dev) {
                if open.fill + sectors <= bucket_sectors {
                    let sector = device.bucket_to_sector(open.bucket.0) + open.fill;
                    let ptr = ExtentPtr {
                        dev,
                        offset: sector,
                        gen: open.gen,
                        cached: data_type == DataType::Cached,
                    };
                    open.fill += sectors;
                    if open.fill >= bucket_sectors {
                        let full = wp.open.remove(&dev).map(|o| o.bucket);
                        if let Some(bucket) = full {
                            self.close_bucket(dev, bucket);
                        }
                    }
                    return Ok(ptr);
                }
                // Bucket too full for this write: retire it.
                let stale = wp.open.remove(&dev).map(|o| o.bucket);
                if let Some(bucket) = stale {
                    self.close_bucket(dev, bucket);
                }
            }

            // Need a fresh bucket; drop the write-point lock across the
            // transaction.
            drop(wp);
            let opened = match self.open_bucket(cx, triggers, dev, data_type) {
                Ok(opened) => opened,
                Err(Error::NoSpace) => {
                    // Out of free buckets: invalidate the LRU-oldest
                    // cached bucket and retry once it frees up.
                    if !self.invalidate_one(cx, triggers, dev)? {
                        return Err(Error::NoSpace);
                    }
                    self.open_bucket(cx, triggers, dev, data_type)?
                }
                Err(err) => return Err(err),
            };
            wp = self.write_points[wp_id].lock();
            if let Some(previous) = wp.open.insert(dev, opened) {
                // Lost a race with another allocator on this point;
                // keep ours, release the other.
                self.close_bucket(dev, previous.bucket);
            }
        }
    }

    /// Take `count` whole buckets on `dev` for `data_type` (journal
    /// growth). The buckets never enter a write point; the caller owns
    /// every sector.
    pub fn reserve_whole_buckets(
        &self,
        cx: &Cx,
        triggers: &[Arc<dyn CommitTrigger>],
        dev: DeviceIdx,
        count: u64,
        data_type: DataType,
    ) -> Result<Vec<u64>> {
        let device = self.devices.require(dev)?;
        let mut out = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        for _ in 0..count {
            cx_checkpoint(cx)?;
            let opened = self.open_bucket(cx, triggers, dev, data_type)?;
            // Account the whole bucket as used so it never reads as
            // empty-but-allocated.
            let bucket = opened.bucket;
            let full = device.bucket_size;
            commit_do(&self.sys, cx, triggers, false, |txn, cx| {
                let pos = Pos::bucket(dev, bucket);
                let Some(key) = txn.get(cx, BtreeId::Alloc, pos)? else {
                    return Ok(());
                };
                let BVal::Alloc(mut alloc) = key.val else {
                    return Ok(());
                };
                alloc.dirty_sectors = full;
                txn.update(cx, BtreeId::Alloc, BKey::new(pos, BVal::Alloc(alloc)))
            })?;
            self.used_sectors
                .fetch_add(u64::from(full), Ordering::Relaxed);
            self.close_bucket(dev, bucket);
            out.push(bucket.0);
        }
        Ok(out)
    }

    // ── Invalidation ────────────────────────────────────────────────

    /// Invalidate the LRU-oldest cached bucket on `dev`: bump its
    /// generation (staling any cached pointers into it) and return it
    /// to the free pool. Open buckets are skipped.
    pub fn invalidate_one(
        &self,
        cx: &Cx,
        triggers: &[Arc<dyn CommitTrigger>],
        dev: DeviceIdx,
    ) -> Result<bool> {
        let discard_supported = self.devices.get(dev).map(|d| d.discard).unwrap_or(false);
        commit_do(&self.sys, cx, triggers, false, |txn, cx| {
            let from = Pos::new(u64::from(dev.0), 0);
            let mut iter = txn.sys().iter(BtreeId::Lru, from);
            loop {
                let Some(key) = txn
                    .sys()
                    .iter_peek(cx, &mut iter)?
                    .filter(|k| k.pos.inode == u64::from(dev.0))
                else {
                    return Ok(false);
                };
                iter.advance(&key);
                let BVal::Lru(lru) = &key.val else {
                    return Err(Error::CorruptMetadata {
                        btree: BtreeId::Lru,
                        pos: key.pos,
                        detail: "lru btree holds a non-lru key".into(),
                    });
                };
                let bucket = BucketIdx(lru.bucket);
                if self.open_buckets.lock().contains(&(dev.0, bucket.0)) {
                    continue; // racing open wins
                }

                let Some(alloc_key) = txn.get(cx, BtreeId::Alloc, Pos::bucket(dev, bucket))?
                else {
                    return Err(Error::Fsck(format!(
                        "lru entry references missing bucket {}:{}",
                        dev.0, bucket.0
                    )));
                };
                let BVal::Alloc(mut alloc) = alloc_key.val else {
                    return Err(Error::CorruptMetadata {
                        btree: BtreeId::Alloc,
                        pos: alloc_key.pos,
                        detail: "alloc btree holds a non-alloc key".into(),
                    });
                };
                if alloc.dirty_sectors > 0 || alloc.cached_sectors == 0 {
                    return Err(Error::Fsck(format!(
                        "lru entry references non-cached bucket {}:{}",
                        dev.0, bucket.0
                    )));
                }

                alloc.gen = alloc.gen.next();
                alloc.cached_sectors = 0;
                alloc.data_type = DataType::Free as u8;
                alloc.flags &= !ALLOC_NEED_INC_GEN;
                if discard_supported {
                    alloc.flags |= ALLOC_NEED_DISCARD;
                }
                alloc.journal_seq = txn.sys().journal().next_seq().0;
                txn.update(
                    cx,
                    BtreeId::Alloc,
                    BKey::new(Pos::bucket(dev, bucket), BVal::Alloc(alloc)),
                )?;
                debug!(
                    target: "bch::alloc",
                    event = "bucket_invalidate",
                    dev = dev.0,
                    bucket = bucket.0,
                    new_gen = alloc.gen.0
                );
                return Ok(true);
            }
        })
    }

    // ── Discard ─────────────────────────────────────────────────────

    /// Drain the need-discard queue: issue device discards for buckets
    /// whose state transition is durable in the journal, then return
    /// them to the free pool. Returns the number of buckets processed.
    pub fn discard_pass(&self, cx: &Cx, triggers: &[Arc<dyn CommitTrigger>]) -> Result<u64> {
        // One flush makes every pending transition durable; the
        // per-bucket journal_seq gate is then trivially satisfied.
        self.sys.journal().flush(cx)?;
        let durable = self.sys.journal().durable_seq().0;

        let mut processed = 0_u64;
        let mut iter = self.sys.iter(BtreeId::NeedDiscard, Pos::MIN);
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            iter.advance(&key);
            let dev = DeviceIdx(u32::try_from(key.pos.inode).unwrap_or(u32::MAX));
            let bucket = BucketIdx(key.pos.offset);
            let alloc = self.bucket_state(cx, dev, bucket)?;
            if !alloc.need_discard() {
                return Err(Error::Fsck(format!(
                    "need-discard key for bucket {}:{} without the flag",
                    dev.0, bucket.0
                )));
            }
            if alloc.journal_seq > durable {
                continue;
            }

            if let Some(device) = self.devices.get(dev) {
                let sector = device.bucket_to_sector(bucket.0);
                device.discard_sectors(cx, sector, u64::from(device.bucket_size))?;
            }

            commit_do(&self.sys, cx, triggers, false, |txn, cx| {
                let Some(k) = txn.get(cx, BtreeId::Alloc, Pos::bucket(dev, bucket))? else {
                    return Ok(());
                };
                let BVal::Alloc(mut alloc) = k.val else {
                    return Ok(());
                };
                alloc.flags &= !ALLOC_NEED_DISCARD;
                if alloc.need_inc_gen() {
                    alloc.gen = alloc.gen.next();
                    alloc.flags &= !ALLOC_NEED_INC_GEN;
                }
                txn.update(
                    cx,
                    BtreeId::Alloc,
                    BKey::new(Pos::bucket(dev, bucket), BVal::Alloc(alloc)),
                )
            })?;
            processed += 1;
        }
        if processed > 0 {
            info!(target: "bch::alloc", event = "discard_pass", buckets = processed);
        }
        Ok(processed)
    }

    // ── Copygc support ──────────────────────────────────────────────

    /// Buckets on `dev` holding live data but under `frac_num/4` full:
    /// copygc rewrites their extents to recover the space.
    pub fn fragmented_buckets(
        &self,
        cx: &Cx,
        dev: DeviceIdx,
        frac_num: u64,
    ) -> Result<Vec<BucketIdx>> {
        let device = self.devices.require(dev)?;
        let threshold = u64::from(device.bucket_size) * frac_num / 4;
        let mut out = Vec::new();
        let mut iter = self
            .sys
            .iter(BtreeId::Alloc, Pos::new(u64::from(dev.0), 0));
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            if key.pos.inode != u64::from(dev.0) {
                break;
            }
            iter.advance(&key);
            if let BVal::Alloc(a) = &key.val {
                if a.dirty_sectors > 0 && u64::from(a.dirty_sectors) < threshold {
                    out.push(BucketIdx(key.pos.offset));
                }
            }
        }
        Ok(out)
    }

    // ── Freespace init ──────────────────────────────────────────────

    /// Populate the freespace / need-discard / LRU indices from a full
    /// alloc btree scan. Run once per device on the first mount after a
    /// format that predates the indices; idempotent.
    pub fn freespace_init(
        &self,
        cx: &Cx,
        triggers: &[Arc<dyn CommitTrigger>],
        dev: DeviceIdx,
    ) -> Result<u64> {
        let mut rebuilt = 0_u64;
        let mut iter = self
            .sys
            .iter(BtreeId::Alloc, Pos::new(u64::from(dev.0), 0));
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            if key.pos.inode != u64::from(dev.0) {
                break;
            }
            iter.advance(&key);
            let BVal::Alloc(alloc) = &key.val else {
                continue;
            };
            let bucket = BucketIdx(key.pos.offset);
            let alloc = *alloc;
            rebuilt += commit_do(&self.sys, cx, triggers, false, |txn, cx| {
                let mut touched = 0_u64;
                if bucket_is_free(&alloc) {
                    let pos = freespace_pos(dev, bucket, alloc.gen);
                    if txn.get(cx, BtreeId::Freespace, pos)?.is_none() {
                        txn.update_unchecked(
                            BtreeId::Freespace,
                            BKey::new(pos, BVal::Freespace(FreespaceV)),
                        )?;
                        touched = 1;
                    }
                }
                if alloc.need_discard() {
                    let pos = Pos::bucket(dev, bucket);
                    if txn.get(cx, BtreeId::NeedDiscard, pos)?.is_none() {
                        txn.update_unchecked(BtreeId::NeedDiscard, BKey::new(pos, BVal::NeedDiscard))?;
                        touched = 1;
                    }
                }
                if bucket_is_cached(&alloc) {
                    let pos = lru_pos(dev, alloc.io_time[IO_TIME_READ]);
                    if txn.get(cx, BtreeId::Lru, pos)?.is_none() {
                        txn.update_unchecked(
                            BtreeId::Lru,
                            BKey::new(pos, BVal::Lru(LruV { bucket: bucket.0 })),
                        )?;
                        touched = 1;
                    }
                }
                Ok(touched)
            })?;
        }
        info!(
            target: "bch::alloc",
            event = "freespace_init",
            dev = dev.0,
            rebuilt
        );
        Ok(rebuilt)
    }

    /// Run the accounting for node locations released under btree
    /// locks. Called from refill, with nothing locked.
    fn process_deferred_frees(&self, cx: &Cx) -> Result<()> {
        let pending = std::mem::take(&mut *self.deferred_frees.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let node_sectors = self.sys.config.node_sectors();
        let triggers: Vec<Arc<dyn CommitTrigger>> = vec![Arc::new(BucketIndexTrigger)];
        for ptrs in pending {
            for ptr in ptrs {
                let Some(device) = self.devices.get(ptr.dev) else {
                    continue;
                };
                let bucket = BucketIdx(device.sector_to_bucket(ptr.offset));
                let dev = ptr.dev;
                commit_do(&self.sys, cx, &triggers, false, |txn, cx| {
                    let pos = Pos::bucket(dev, bucket);
                    let Some(key) = txn.get(cx, BtreeId::Alloc, pos)? else {
                        return Ok(());
                    };
                    let BVal::Alloc(mut alloc) = key.val else {
                        return Ok(());
                    };
                    let freed = u32::try_from(node_sectors).unwrap_or(u32::MAX);
                    alloc.dirty_sectors = alloc.dirty_sectors.saturating_sub(freed);
                    if alloc.is_empty() {
                        alloc.data_type = DataType::Free as u8;
                        alloc.flags |= ALLOC_NEED_INC_GEN;
                        alloc.journal_seq = txn.sys().journal().next_seq().0;
                    }
                    txn.update(cx, BtreeId::Alloc, BKey::new(pos, BVal::Alloc(alloc)))
                })?;
                self.used_sectors
                    .fetch_sub(node_sectors, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Record a cache read for LRU ordering: bumps the bucket's read
    /// clock (and thereby its LRU index, through the trigger).
    pub fn touch_cached_bucket(
        &self,
        cx: &Cx,
        triggers: &[Arc<dyn CommitTrigger>],
        dev: DeviceIdx,
        bucket: BucketIdx,
    ) -> Result<()> {
        let now = self.tick();
        commit_do(&self.sys, cx, triggers, false, |txn, cx| {
            let Some(key) = txn.get(cx, BtreeId::Alloc, Pos::bucket(dev, bucket))? else {
                return Ok(());
            };
            let BVal::Alloc(mut alloc) = key.val else {
                return Ok(());
            };
            if !bucket_is_cached(&alloc) {
                return Ok(());
            }
            alloc.io_time[IO_TIME_READ] = now;
            txn.update(
                cx,
                BtreeId::Alloc,
                BKey::new(Pos::bucket(dev, bucket), BVal::Alloc(alloc)),
            )
        })
    }
}

/// In-flight write space, counted against the capacity until the write
/// lands (or the reservation drops).
pub struct DiskReservation {
    alloc: Arc<Allocator>,
    sectors: u64,
}

impl DiskReservation {
    /// The write completed; its sectors are now accounted as used by
    /// the extent trigger, so the reservation just evaporates.
    pub fn consume(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.sectors > 0 {
            self.alloc
                .reserved_sectors
                .fetch_sub(self.sectors, Ordering::Relaxed);
            self.sectors = 0;
        }
    }
}

impl Drop for DiskReservation {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Bucket state helpers ────────────────────────────────────────────────────

fn bucket_is_free(a: &AllocV) -> bool {
    a.is_empty() && a.data_type == DataType::Free as u8 && !a.need_discard()
}

fn bucket_is_cached(a: &AllocV) -> bool {
    a.dirty_sectors == 0 && a.cached_sectors > 0
}

// ── Commit triggers ─────────────────────────────────────────────────────────

/// Maintains the freespace / need-discard / LRU indices from staged
/// alloc-key transitions. Because this runs inside the same commit,
/// the derived btrees can never disagree with the alloc btree.
pub struct BucketIndexTrigger;

impl CommitTrigger for BucketIndexTrigger {
    fn on_commit(
        &self,
        _cx: &Cx,
        txn: &mut Transaction<'_>,
        range: Range<usize>,
    ) -> Result<()> {
        let transitions: Vec<(Pos, Option<AllocV>, Option<AllocV>)> = txn
            .staged(range)
            .iter()
            .filter(|u| u.btree == BtreeId::Alloc)
            .map(|u| {
                let old = match &u.old {
                    Some(BKey {
                        val: BVal::Alloc(a),
                        ..
                    }) => Some(*a),
                    _ => None,
                };
                let new = match &u.key.val {
                    BVal::Alloc(a) => Some(*a),
                    _ => None,
                };
                (u.key.pos, old, new)
            })
            .collect();

        for (pos, old, new) in transitions {
            let dev = DeviceIdx(u32::try_from(pos.inode).unwrap_or(u32::MAX));
            let bucket = BucketIdx(pos.offset);

            let old_free = old.as_ref().map(bucket_is_free).unwrap_or(false);
            let new_free = new.as_ref().map(bucket_is_free).unwrap_or(false);
            let old_fs = old.filter(|_| old_free).map(|a| freespace_pos(dev, bucket, a.gen));
            let new_fs = new.filter(|_| new_free).map(|a| freespace_pos(dev, bucket, a.gen));
            if old_fs != new_fs {
                if let Some(p) = old_fs {
                    txn.update_unchecked(BtreeId::Freespace, BKey::deleted(p))?;
                }
                if let Some(p) = new_fs {
                    txn.update_unchecked(
                        BtreeId::Freespace,
                        BKey::new(p, BVal::Freespace(FreespaceV)),
                    )?;
                }
            }

            let old_nd = old.map(|a| a.need_discard()).unwrap_or(false);
            let new_nd = new.map(|a| a.need_discard()).unwrap_or(false);
            if old_nd != new_nd {
                let p = Pos::bucket(dev, bucket);
                if new_nd {
                    txn.update_unchecked(BtreeId::NeedDiscard, BKey::new(p, BVal::NeedDiscard))?;
                } else {
                    txn.update_unchecked(BtreeId::NeedDiscard, BKey::deleted(p))?;
                }
            }

            let old_lru = old
                .filter(bucket_is_cached)
                .map(|a| lru_pos(dev, a.io_time[IO_TIME_READ]));
            let new_lru = new
                .filter(bucket_is_cached)
                .map(|a| lru_pos(dev, a.io_time[IO_TIME_READ]));
            if old_lru != new_lru {
                if let Some(p) = old_lru {
                    txn.update_unchecked(BtreeId::Lru, BKey::deleted(p))?;
                }
                if let Some(p) = new_lru {
                    txn.update_unchecked(
                        BtreeId::Lru,
                        BKey::new(p, BVal::Lru(LruV { bucket: bucket.0 })),
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Accounts staged extent transitions into the buckets their pointers
/// reference: dirty sectors for durable replicas, cached sectors for
/// cache copies. Runs before [`BucketIndexTrigger`] sees the resulting
/// alloc updates.
pub struct ExtentAccountingTrigger {
    alloc: Arc<Allocator>,
}

impl ExtentAccountingTrigger {
    #[must_use]
    pub fn new(alloc: Arc<Allocator>) -> Self {
        Self { alloc }
    }
}

impl CommitTrigger for ExtentAccountingTrigger {
    fn on_commit(&self, cx: &Cx, txn: &mut Transaction<'_>, range: Range<usize>) -> Result<()> {
        // (dev, bucket) -> (dirty delta, cached delta)
        let mut deltas: HashMap<(u32, u64), (i64, i64)> = HashMap::new();
        let mut side = |key: &BKey, sign: i64, deltas: &mut HashMap<(u32, u64), (i64, i64)>| {
            let BVal::Extent(e) = &key.val else {
                return;
            };
            for ptr in &e.ptrs {
                let Some(device) = self.alloc.devices.get(ptr.dev) else {
                    continue;
                };
                let bucket = device.sector_to_bucket(ptr.offset);
                let entry = deltas.entry((ptr.dev.0, bucket)).or_insert((0, 0));
                let amount = sign * i64::from(key.size);
                if ptr.cached {
                    entry.1 += amount;
                } else {
                    entry.0 += amount;
                }
            }
        };

        for update in txn.staged(range.clone()).to_vec() {
            if !matches!(update.btree, BtreeId::Extents | BtreeId::Reflink) {
                continue;
            }
            if let Some(old) = &update.old {
                side(old, -1, &mut deltas);
            }
            side(&update.key, 1, &mut deltas);
        }

        let mut used_delta = 0_i64;
        for ((dev, bucket), (ddirty, dcached)) in deltas {
            if ddirty == 0 && dcached == 0 {
                continue;
            }
            let dev = DeviceIdx(dev);
            let bucket = BucketIdx(bucket);
            let pos = Pos::bucket(dev, bucket);
            let Some(key) = txn.get(cx, BtreeId::Alloc, pos)? else {
                return Err(Error::Fsck(format!(
                    "extent references bucket {}:{} with no alloc record",
                    dev.0, bucket.0
                )));
            };
            let BVal::Alloc(mut alloc) = key.val else {
                return Err(Error::CorruptMetadata {
                    btree: BtreeId::Alloc,
                    pos,
                    detail: "alloc btree holds a non-alloc key".into(),
                });
            };

            alloc.dirty_sectors = apply_delta(alloc.dirty_sectors, ddirty);
            alloc.cached_sectors = apply_delta(alloc.cached_sectors, dcached);
            used_delta += ddirty;
            if alloc.is_empty() && alloc.data_type != DataType::Free as u8 {
                // Last data left the bucket: back to the free pool,
                // with a generation bump owed at reuse.
                alloc.data_type = DataType::Free as u8;
                alloc.flags |= ALLOC_NEED_INC_GEN;
                if self
                    .alloc
                    .devices
                    .get(dev)
                    .map(|d| d.discard)
                    .unwrap_or(false)
                {
                    alloc.flags |= ALLOC_NEED_DISCARD;
                }
                alloc.journal_seq = txn.sys().journal().next_seq().0;
            }
            txn.update(cx, BtreeId::Alloc, BKey::new(pos, BVal::Alloc(alloc)))?;
        }

        // Runtime usage counter (crash-safe state is the btree).
        if used_delta > 0 {
            self.alloc
                .used_sectors
                .fetch_add(used_delta.unsigned_abs(), Ordering::Relaxed);
        } else if used_delta < 0 {
            self.alloc
                .used_sectors
                .fetch_sub(used_delta.unsigned_abs(), Ordering::Relaxed);
        }
        Ok(())
    }
}

fn apply_delta(value: u32, delta: i64) -> u32 {
    let result = i64::from(value) + delta;
    u32::try_from(result.max(0)).unwrap_or(u32::MAX)
}

// ── Node allocation for the btree engine ────────────────────────────────────

impl NodeAlloc for Allocator {
    fn alloc_node(&self, _cx: &Cx) -> Result<Vec<ExtentPtr>> {
        self.node_pool
            .lock()
            .pop()
            .ok_or(Error::restart(RestartReason::MemPressure))
    }

    fn free_node(&self, _cx: &Cx, ptrs: &[ExtentPtr]) {
        // Callers hold btree locks (splits, COW flushes); the actual
        // accounting transaction runs at the next refill, once no
        // in-flight transaction can still reference the old location.
        self.deferred_frees.lock().push(ptrs.to_vec());
    }

    fn refill(&self, cx: &Cx) -> Result<()> {
        self.process_deferred_frees(cx)?;
        let node_sectors = self.sys.config.node_sectors();
        let replicas = self.sys.config.metadata_replicas;
        let candidates: Vec<DeviceIdx> = self
            .devices
            .iter()
            .into_iter()
            .filter(|d| {
                d.is_writable() && d.data_allowed & DataType::Btree.mask_bit() != 0
            })
            .map(|d| d.idx)
            .collect();

        loop {
            if self.node_pool.lock().len() >= NODE_POOL_TARGET {
                return Ok(());
            }
            cx_checkpoint(cx)?;
            let triggers: Vec<Arc<dyn CommitTrigger>> = vec![Arc::new(BucketIndexTrigger)];
            let ptrs = self.allocate(
                cx,
                &triggers,
                WP_BTREE,
                &candidates,
                replicas,
                DataType::Btree,
                node_sectors,
            )?;

            // Account the node's footprint now; extents never cover
            // btree space.
            for ptr in &ptrs {
                let Some(device) = self.devices.get(ptr.dev) else {
                    continue;
                };
                let bucket = BucketIdx(device.sector_to_bucket(ptr.offset));
                let dev = ptr.dev;
                commit_do(&self.sys, cx, &triggers, false, |txn, cx| {
                    let pos = Pos::bucket(dev, bucket);
                    let Some(key) = txn.get(cx, BtreeId::Alloc, pos)? else {
                        return Err(Error::Fsck(format!(
                            "allocated node in bucket {}:{} with no alloc record",
                            dev.0, bucket.0
                        )));
                    };
                    let BVal::Alloc(mut alloc) = key.val else {
                        return Ok(());
                    };
                    alloc.dirty_sectors = alloc
                        .dirty_sectors
                        .saturating_add(u32::try_from(node_sectors).unwrap_or(u32::MAX));
                    txn.update(cx, BtreeId::Alloc, BKey::new(pos, BVal::Alloc(alloc)))
                })?;
                self.used_sectors.fetch_add(node_sectors, Ordering::Relaxed);
            }
            self.node_pool.lock().push(ptrs);
        }
    }
}

#[cfg(test)]
mod tests;
