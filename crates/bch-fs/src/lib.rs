#![forbid(unsafe_code)]
//! The filesystem handle.
//!
//! Assembles the layers: superblocks and member devices, journal,
//! btrees, allocator, and the extent I/O engine. Owns mount (journal
//! replay, freespace init), clean shutdown, the background workers,
//! and the outward-facing surfaces — files, subvolumes and snapshots,
//! attribute propagation, usage accounting, the control plane, bulk
//! data jobs, format, and fsck.

pub mod attrs;
pub mod ctl;
pub mod data;
pub mod files;
pub mod format;
pub mod fsck;
pub mod mount;
pub mod snap;
pub mod usage;

use arc_swap::ArcSwap;
use asupersync::Cx;
use bch_alloc::{Allocator, BucketIndexTrigger, ExtentAccountingTrigger};
use bch_block::{ByteDevice, Device, DeviceSet, FileByteDevice, cx_checkpoint};
use bch_btree::{BtreeConfig, BtreeSys, NodeAlloc, ROOT_LEVEL};
use bch_error::{Error, Result};
use bch_io::FsIo;
use bch_journal::{Journal, scan_for_replay};
use bch_ondisk::sb::{BtreeRoot, SbLayout, Superblock};
use bch_super::{read_super, write_super};
use bch_txn::{CommitTrigger, Transaction, commit_do};
use bch_types::keys::replicas_pos;
use bch_types::{
    BKey, BVal, BtreeId, ChecksumType, CompressionType, DataType, DeviceIdx, JournalSeq,
    MemberState, Opts, Pos, ReplicasV, SnapshotId, Target,
};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Root directory inode of every subvolume tree.
pub const ROOT_INUM: u64 = 4096;
/// First inode number handed to user files.
pub const FIRST_USER_INUM: u64 = ROOT_INUM + 1;

/// Dirent types.
pub const DT_REG: u8 = 8;
pub const DT_DIR: u8 = 4;
/// Dirent pointing at a subvolume id instead of an inode.
pub const DT_SUBVOL: u8 = 16;
/// Tombstone dirent: the name is absent in this snapshot even though
/// an ancestor still carries it. Plain btree whiteouts cannot express
/// that — iteration would fall through to the ancestor's key.
pub const DT_WHITEOUT: u8 = 0;

/// Mount-time options.
#[derive(Debug, Default, Clone)]
pub struct OpenOptions {
    pub read_only: bool,
    pub passphrase: Option<String>,
    /// Permit mounting with missing members, if redundancy allows it.
    pub degraded: bool,
    pub opts: Opts,
}

// ── Replica-set accounting ──────────────────────────────────────────────────

/// Runtime index of (data type, device set) combinations onto stable
/// accounting-key indices. Rebuilt from the btree at mount.
#[derive(Debug, Default)]
pub struct ReplicasState {
    index: Mutex<HashMap<(u8, Vec<u32>), u64>>,
    next_idx: AtomicU64,
}

impl ReplicasState {
    fn idx_for(&self, data_type: u8, devs: &[u32]) -> u64 {
        let mut index = self.index.lock();
        *index
            .entry((data_type, devs.to_vec()))
            .or_insert_with(|| self.next_idx.fetch_add(1, Ordering::Relaxed))
    }
}

/// Maintains replica-set accounting keys from staged extent
/// transitions; `fs usage` reads them to report degradation.
pub struct ReplicasTrigger {
    state: Arc<ReplicasState>,
}

impl CommitTrigger for ReplicasTrigger {
    fn on_commit(
        &self,
        cx: &Cx,
        txn: &mut Transaction<'_>,
        range: std::ops::Range<usize>,
    ) -> Result<()> {
        let mut deltas: HashMap<Vec<u32>, i64> = HashMap::new();
        for update in txn.staged(range).to_vec() {
            if !matches!(update.btree, BtreeId::Extents | BtreeId::Reflink) {
                continue;
            }
            let mut side = |key: &BKey, sign: i64| {
                if let BVal::Extent(e) = &key.val {
                    let mut devs: Vec<u32> =
                        e.durable_ptrs().map(|p| p.dev.0).collect();
                    devs.sort_unstable();
                    devs.dedup();
                    if !devs.is_empty() {
                        *deltas.entry(devs).or_insert(0) += sign * i64::from(key.size);
                    }
                }
            };
            if let Some(old) = &update.old {
                side(old, -1);
            }
            side(&update.key, 1);
        }

        for (devs, delta) in deltas {
            if delta == 0 {
                continue;
            }
            let idx = self.state.idx_for(DataType::User as u8, &devs);
            let pos = replicas_pos(idx);
            let current = match txn.get(cx, BtreeId::Subvolumes, pos)? {
                Some(BKey {
                    val: BVal::Replicas(r),
                    ..
                }) => r.sectors,
                _ => 0,
            };
            let sectors = if delta >= 0 {
                current.saturating_add(delta.unsigned_abs())
            } else {
                current.saturating_sub(delta.unsigned_abs())
            };
            let key = if sectors == 0 {
                BKey::deleted(pos)
            } else {
                BKey::new(
                    pos,
                    BVal::Replicas(ReplicasV {
                        data_type: DataType::User as u8,
                        devs,
                        sectors,
                    }),
                )
            };
            txn.update(cx, BtreeId::Subvolumes, key)?;
        }
        Ok(())
    }
}

// ── The filesystem ──────────────────────────────────────────────────────────

struct SbSlot {
    dev_idx: u32,
    dev: Arc<dyn ByteDevice>,
    layout: SbLayout,
    path: PathBuf,
}

pub struct Fs {
    pub devices: Arc<DeviceSet>,
    pub journal: Arc<Journal>,
    pub sys: Arc<BtreeSys>,
    pub alloc: Arc<Allocator>,
    pub io: FsIo,
    triggers: Vec<Arc<dyn CommitTrigger>>,
    sb: ArcSwap<Superblock>,
    sb_lock: Mutex<()>,
    sb_slots: Mutex<Vec<SbSlot>>,
    pub opts: Opts,
    key: Option<[u8; 32]>,
    replicas: Arc<ReplicasState>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_hub: Arc<(Mutex<bool>, Condvar)>,
    next_inum: AtomicU64,
    next_snapshot: AtomicU32,
    next_subvol: AtomicU32,
    read_only: AtomicBool,
}

impl Fs {
    /// Open and recover a filesystem from its member device paths.
    pub fn open(cx: &Cx, paths: &[PathBuf], open_opts: &OpenOptions) -> Result<Arc<Fs>> {
        if paths.is_empty() {
            return Err(Error::InvalidArgument("no devices given".into()));
        }

        // Read and cross-check every superblock.
        let mut slots: Vec<SbSlot> = Vec::new();
        let mut newest: Option<Superblock> = None;
        for path in paths {
            let dev: Arc<dyn ByteDevice> = Arc::new(FileByteDevice::open(path)?);
            let sb = read_super(cx, dev.as_ref())?;
            match &newest {
                Some(existing) if existing.uuid != sb.uuid => {
                    return Err(Error::InvalidArgument(format!(
                        "{} belongs to a different filesystem",
                        path.display()
                    )));
                }
                Some(existing) if existing.seq >= sb.seq => {}
                _ => newest = Some(sb.clone()),
            }
            slots.push(SbSlot {
                dev_idx: sb.dev_idx,
                dev,
                layout: sb.layout.clone(),
                path: path.clone(),
            });
        }
        let Some(sb) = newest else {
            return Err(Error::InvalidArgument("no readable superblock".into()));
        };

        // Missing members: tolerated only under the degraded policy.
        let present: Vec<u32> = slots.iter().map(|s| s.dev_idx).collect();
        for (idx, member) in sb.members.iter().enumerate() {
            let idx = u32::try_from(idx).unwrap_or(u32::MAX);
            if member.nbuckets > 0
                && member.state == MemberState::Rw
                && !present.contains(&idx)
            {
                if !open_opts.degraded {
                    return Err(Error::Degraded(format!(
                        "member {idx} ({}) is missing; pass degraded to mount anyway",
                        member.uuid
                    )));
                }
                warn!(target: "bch::fs", event = "mount_degraded", missing = idx);
            }
        }

        // Encryption key material.
        let key = match (&sb.crypt, &open_opts.passphrase) {
            (Some(crypt), Some(passphrase)) => {
                Some(bch_super::unlock_master_key(crypt, passphrase)?)
            }
            (Some(_), None) => {
                return Err(Error::InvalidArgument(
                    "filesystem is encrypted; passphrase required".into(),
                ));
            }
            (None, _) => None,
        };

        // Member devices.
        let devices = Arc::new(DeviceSet::new());
        for slot in &slots {
            let member = sb
                .members
                .get(slot.dev_idx as usize)
                .ok_or_else(|| Error::NotAMember(format!("device index {}", slot.dev_idx)))?;
            devices.insert(Arc::new(Device::new(
                DeviceIdx(slot.dev_idx),
                slot.path.clone(),
                Arc::clone(&slot.dev),
                if open_opts.read_only {
                    MemberState::Ro
                } else {
                    member.state
                },
                member.bucket_size,
                member.nbuckets,
                member.first_bucket,
                member.durability,
                member.data_allowed,
                member.discard,
            )));
        }

        // Journal: scan, then continue the sequence space.
        let journal_slots: Vec<(Arc<Device>, Vec<u64>)> = sb
            .journal_buckets
            .iter()
            .filter_map(|jb| {
                devices
                    .get(DeviceIdx(jb.dev))
                    .map(|d| (d, jb.buckets.clone()))
            })
            .collect();
        let metadata_csum = ChecksumType::from_u8(sb.opts.metadata_checksum_type)?;
        let plan = scan_for_replay(
            cx,
            &journal_slots,
            metadata_csum,
            key.as_ref(),
            &sb.blacklist,
        )?;
        let next_seq = plan.next_seq.max(JournalSeq(1));
        let journal = Arc::new(Journal::new(
            journal_slots,
            next_seq,
            metadata_csum,
            key,
        )?);

        // Btrees, roots from the superblock.
        let config = BtreeConfig {
            node_size: sb.opts.btree_node_size,
            csum_type: metadata_csum,
            metadata_replicas: sb.opts.metadata_replicas,
            key,
        };
        let sys = Arc::new(BtreeSys::new(
            Arc::clone(&devices),
            config,
            Arc::clone(&journal),
            4096,
            sb.seq << 20,
        ));
        for BtreeRoot {
            btree_id,
            level,
            key,
        } in &sb.roots
        {
            sys.set_root_from_key(cx, *btree_id, *level, key)?;
        }

        let alloc = Allocator::new(
            Arc::clone(&sys),
            Arc::clone(&devices),
            sb.opts.gc_reserve_percent,
        );
        sys.set_alloc(Arc::clone(&alloc) as Arc<dyn NodeAlloc>);

        // Replay: keep the un-replayed floor pinned so recovery-time
        // appends cannot reclaim over it, apply allocator state first,
        // then everything else, then flush the lot.
        let floor = plan.entries.first().map_or(next_seq, |e| e.seq);
        journal.pin(floor);
        let alloc_btrees = [
            BtreeId::Alloc,
            BtreeId::Freespace,
            BtreeId::NeedDiscard,
            BtreeId::Lru,
        ];
        for pass in 0..2 {
            for entry in &plan.entries {
                for update in &entry.updates {
                    // Allocator state first: later passes allocate from
                    // the freespace btree being rebuilt here.
                    let is_alloc = alloc_btrees.contains(&update.btree);
                    if (pass == 0) != is_alloc {
                        continue;
                    }
                    sys.replay_update(cx, update.btree, update.level, &update.key)?;
                }
            }
        }
        if !plan.entries.is_empty() {
            info!(
                target: "bch::fs",
                event = "journal_replayed",
                entries = plan.entries.len(),
                skipped_blacklisted = plan.skipped_blacklisted
            );
        }
        if open_opts.read_only {
            // Replayed state stays in the cache; a read-only mount
            // never writes nodes back, so the journal floor stays
            // pinned and the ring untouched.
        } else {
            sys.flush_all(cx)?;
            journal.unpin(floor);

            // First mount after a format predating the indices:
            // rebuild them from the alloc btree.
            let index_triggers: Vec<Arc<dyn CommitTrigger>> =
                vec![Arc::new(BucketIndexTrigger)];
            for (idx, member) in sb.members.iter().enumerate() {
                if member.nbuckets > 0 && !member.freespace_initialized() {
                    let idx = u32::try_from(idx).unwrap_or(u32::MAX);
                    if devices.get(DeviceIdx(idx)).is_some() {
                        alloc.freespace_init(cx, &index_triggers, DeviceIdx(idx))?;
                    }
                }
            }
            alloc.refill(cx)?;
        }
        alloc.init_usage(cx)?;

        let replicas = Arc::new(ReplicasState::default());
        let triggers: Vec<Arc<dyn CommitTrigger>> = vec![
            Arc::new(ExtentAccountingTrigger::new(Arc::clone(&alloc))),
            Arc::new(ReplicasTrigger {
                state: Arc::clone(&replicas),
            }),
            Arc::new(BucketIndexTrigger),
        ];
        let io = FsIo::new(
            Arc::clone(&sys),
            Arc::clone(&alloc),
            Arc::clone(&devices),
            triggers.clone(),
            key,
            sb.block_size,
        );

        let mut opts = open_opts.opts.clone();
        fill_opts_from_sb(&mut opts, &sb);

        let fs = Arc::new(Fs {
            devices,
            journal,
            sys,
            alloc,
            io,
            triggers,
            sb: ArcSwap::from_pointee(sb),
            sb_lock: Mutex::new(()),
            sb_slots: Mutex::new(slots),
            opts,
            key,
            replicas,
            running: Arc::new(AtomicBool::new(true)),
            workers: Mutex::new(Vec::new()),
            worker_hub: Arc::new((Mutex::new(false), Condvar::new())),
            next_inum: AtomicU64::new(FIRST_USER_INUM),
            next_snapshot: AtomicU32::new(2),
            next_subvol: AtomicU32::new(2),
            read_only: AtomicBool::new(open_opts.read_only),
        });
        fs.seed_counters(cx)?;
        if !open_opts.read_only {
            fs.write_sb(cx)?;
            fs.spawn_workers();
        }
        info!(target: "bch::fs", event = "mounted", uuid = %fs.sb().user_uuid);
        Ok(fs)
    }

    /// The current superblock snapshot.
    #[must_use]
    pub fn sb(&self) -> Arc<Superblock> {
        self.sb.load_full()
    }

    #[must_use]
    pub fn master_key(&self) -> Option<[u8; 32]> {
        self.key
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// React to a metadata error per the configured error action.
    pub fn note_error(&self, err: &Error) {
        if !err.is_corruption() {
            return;
        }
        match self.opts.error_action() {
            bch_types::ErrorAction::Continue => {}
            bch_types::ErrorAction::RemountRo => {
                warn!(target: "bch::fs", event = "remount_ro", error = %err);
                self.read_only.store(true, Ordering::Relaxed);
            }
            bch_types::ErrorAction::Panic => {
                panic!("metadata error with error_action=panic: {err}");
            }
        }
    }

    /// Mutate the canonical superblock under the lock and rewrite every
    /// copy on every member.
    pub fn update_sb(&self, cx: &Cx, mutate: impl FnOnce(&mut Superblock)) -> Result<()> {
        let _guard = self.sb_lock.lock();
        let mut sb = (*self.sb.load_full()).clone();
        mutate(&mut sb);
        sb.roots = self
            .sys
            .root_keys()?
            .into_iter()
            .map(|(btree_id, level, key)| BtreeRoot {
                btree_id,
                level,
                key,
            })
            .collect();
        sb.seq = sb.seq.wrapping_add(1);
        let slots = self.sb_slots.lock();
        for slot in slots.iter() {
            let mut per_dev = sb.clone();
            per_dev.dev_idx = slot.dev_idx;
            per_dev.layout = slot.layout.clone();
            write_super(cx, slot.dev.as_ref(), &per_dev)?;
        }
        drop(slots);
        self.sb.store(Arc::new(sb));
        Ok(())
    }

    /// Persist current roots and member table without other changes.
    pub fn write_sb(&self, cx: &Cx) -> Result<()> {
        self.update_sb(cx, |_| {})
    }

    #[must_use]
    pub fn triggers(&self) -> &[Arc<dyn CommitTrigger>] {
        &self.triggers
    }

    pub(crate) fn register_sb_slot(
        &self,
        dev_idx: u32,
        dev: Arc<dyn ByteDevice>,
        layout: SbLayout,
        path: PathBuf,
    ) {
        let mut slots = self.sb_slots.lock();
        slots.retain(|s| s.dev_idx != dev_idx);
        slots.push(SbSlot {
            dev_idx,
            dev,
            layout,
            path,
        });
    }

    pub(crate) fn drop_sb_slot(&self, dev_idx: u32) {
        self.sb_slots.lock().retain(|s| s.dev_idx != dev_idx);
    }

    pub(crate) fn sb_slot_layout(&self, dev_idx: u32) -> Option<SbLayout> {
        self.sb_slots
            .lock()
            .iter()
            .find(|s| s.dev_idx == dev_idx)
            .map(|s| s.layout.clone())
    }

    /// Scan for the next free inode / snapshot / subvolume ids.
    fn seed_counters(&self, cx: &Cx) -> Result<()> {
        let mut iter = self.sys.iter(BtreeId::Inodes, Pos::MIN);
        let mut max_inum = ROOT_INUM;
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            max_inum = max_inum.max(key.pos.inode);
            iter.pos = Pos::new(key.pos.inode + 1, 0);
        }
        self.next_inum.store(max_inum + 1, Ordering::Relaxed);

        let mut iter = self.sys.iter(BtreeId::Snapshots, Pos::MIN);
        let mut max_snap = 1;
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            iter.advance(&key);
            max_snap = max_snap.max(u32::try_from(key.pos.offset).unwrap_or(u32::MAX));
        }
        self.next_snapshot.store(max_snap + 1, Ordering::Relaxed);

        let mut iter = self
            .sys
            .iter(BtreeId::Subvolumes, Pos::new(bch_types::keys::SUBVOL_INUM, 0));
        let mut max_subvol = 1;
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            if key.pos.inode != bch_types::keys::SUBVOL_INUM {
                break;
            }
            iter.advance(&key);
            if matches!(key.val, BVal::Subvolume(_)) {
                max_subvol = max_subvol.max(u32::try_from(key.pos.offset).unwrap_or(u32::MAX));
            }
        }
        self.next_subvol.store(max_subvol + 1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn fresh_inum(&self) -> u64 {
        self.next_inum.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn fresh_snapshot_id(&self) -> SnapshotId {
        SnapshotId(self.next_snapshot.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn fresh_subvol_id(&self) -> u32 {
        self.next_subvol.fetch_add(1, Ordering::Relaxed)
    }

    /// Candidate devices for a data write under `target`.
    #[must_use]
    pub fn write_candidates(&self, target: Target, data_type: DataType) -> Vec<DeviceIdx> {
        let sb = self.sb();
        bch_super::target_devices(&sb, target, &[MemberState::Rw])
            .into_iter()
            .filter(|idx| {
                self.devices
                    .get(*idx)
                    .map(|d| d.is_writable() && d.data_allowed & data_type.mask_bit() != 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    // ── Passphrase management ───────────────────────────────────────

    /// Rewrap the master key under a new passphrase. The key itself
    /// never changes, so existing data stays readable.
    pub fn set_passphrase(&self, cx: &Cx, new_passphrase: &str) -> Result<()> {
        self.check_writable()?;
        let master = self
            .key
            .ok_or_else(|| Error::InvalidArgument("filesystem is not encrypted".into()))?;
        let salt = random_16();
        let nonce = random_12();
        let crypt = bch_super::wrap_master_key(&master, new_passphrase, salt, nonce)?;
        self.update_sb(cx, |sb| {
            sb.crypt = Some(crypt.clone());
        })
    }

    /// Store the master key wrapped under the empty passphrase, so
    /// mounting no longer prompts.
    pub fn remove_passphrase(&self, cx: &Cx) -> Result<()> {
        self.set_passphrase(cx, "")
    }

    /// Verify a passphrase against the stored key material without
    /// keeping the key (the CLI `unlock` check).
    pub fn check_passphrase(sb: &Superblock, passphrase: &str) -> Result<()> {
        let crypt = sb
            .crypt
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("filesystem is not encrypted".into()))?;
        bch_super::unlock_master_key(crypt, passphrase).map(drop)
    }

    // ── Background workers ──────────────────────────────────────────

    /// Wake the background workers (journal writer, discard, copygc).
    pub fn kick_workers(&self) {
        let (lock, cond) = &*self.worker_hub;
        let mut pending = lock.lock();
        *pending = true;
        cond.notify_all();
    }

    fn spawn_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();

        // Journal writer: makes appended sequences durable.
        workers.push(self.spawn_worker("journal", Duration::from_millis(100), |fs, cx| {
            fs.journal.flush(cx)
        }));

        // Discard worker: drains the need-discard queue.
        workers.push(self.spawn_worker("discard", Duration::from_millis(500), |fs, cx| {
            fs.alloc.discard_pass(cx, &fs.triggers).map(drop)
        }));

        // Node writer / allocator keeper: keeps the btree node pool
        // topped up and journal space reclaimable.
        workers.push(self.spawn_worker("node", Duration::from_millis(200), |fs, cx| {
            fs.alloc.refill(cx)?;
            if fs.journal.free_sectors() < 64 {
                fs.sys.flush_oldest(cx)?;
            }
            Ok(())
        }));

        // Copygc: rewrites fragmented buckets when space runs low.
        workers.push(self.spawn_worker("copygc", Duration::from_secs(2), |fs, cx| {
            data::copygc_pass(fs, cx)
        }));
    }

    fn spawn_worker(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        body: impl Fn(&Fs, &Cx) -> Result<()> + Send + 'static,
    ) -> JoinHandle<()> {
        let fs = Arc::clone(self);
        std::thread::spawn(move || {
            let cx = Cx::for_request();
            while fs.running.load(Ordering::Relaxed) {
                if let Err(err) = body(&fs, &cx) {
                    if !matches!(err, Error::Cancelled) {
                        warn!(
                            target: "bch::fs",
                            event = "worker_error",
                            worker = name,
                            error = %err
                        );
                    }
                }
                // Sleep until kicked or the period elapses.
                let (lock, cond) = &*fs.worker_hub;
                let mut pending = lock.lock();
                if !*pending {
                    cond.wait_for(&mut pending, period);
                }
                *pending = false;
            }
            debug!(target: "bch::fs", event = "worker_exit", worker = name);
        })
    }

    /// Clean shutdown: stop workers, flush everything, persist the
    /// superblock with fresh roots.
    pub fn stop(&self, cx: &Cx) -> Result<()> {
        self.running.store(false, Ordering::Relaxed);
        self.kick_workers();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        if !self.is_read_only() {
            self.sys.flush_all(cx)?;
            self.journal.flush(cx)?;
            self.write_sb(cx)?;
        }
        self.devices.sync_all(cx)?;
        info!(target: "bch::fs", event = "stopped");
        Ok(())
    }

    /// Crash simulation for tests: abandon all in-memory state without
    /// flushing dirty nodes. The journal holds whatever was committed.
    pub fn abandon(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.kick_workers();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }

    // ── Commit convenience ──────────────────────────────────────────

    /// Run `body` as a transaction with this filesystem's triggers.
    pub fn commit<T>(
        &self,
        cx: &Cx,
        body: impl FnMut(&mut Transaction<'_>, &Cx) -> Result<T>,
    ) -> Result<T> {
        self.check_writable()?;
        let result = commit_do(&self.sys, cx, &self.triggers, false, body);
        if let Err(err) = &result {
            self.note_error(err);
        }
        cx_checkpoint(cx)?;
        self.kick_workers();
        result
    }
}

fn random_16() -> [u8; 16] {
    *uuid::Uuid::new_v4().as_bytes()
}

fn random_12() -> [u8; 12] {
    let mut out = [0_u8; 12];
    out.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..12]);
    out
}

fn fill_opts_from_sb(opts: &mut Opts, sb: &Superblock) {
    if opts.metadata_replicas.is_none() {
        opts.metadata_replicas = Some(sb.opts.metadata_replicas);
    }
    if opts.data_replicas.is_none() {
        opts.data_replicas = Some(sb.opts.data_replicas);
    }
    if opts.metadata_checksum_type.is_none() {
        opts.metadata_checksum_type = ChecksumType::from_u8(sb.opts.metadata_checksum_type).ok();
    }
    if opts.data_checksum_type.is_none() {
        opts.data_checksum_type = ChecksumType::from_u8(sb.opts.data_checksum_type).ok();
    }
    if opts.compression.is_none() {
        opts.compression = CompressionType::from_u8(sb.opts.compression).ok();
    }
    if opts.gc_reserve_percent.is_none() {
        opts.gc_reserve_percent = Some(sb.opts.gc_reserve_percent);
    }
    if opts.block_size.is_none() {
        opts.block_size = Some(sb.block_size);
    }
    if opts.btree_node_size.is_none() {
        opts.btree_node_size = Some(sb.opts.btree_node_size);
    }
    if opts.foreground_target.is_none() {
        opts.foreground_target = Some(Target::from_u32(sb.foreground_target));
    }
    if opts.background_target.is_none() {
        opts.background_target = Some(Target::from_u32(sb.background_target));
    }
    if opts.promote_target.is_none() {
        opts.promote_target = Some(Target::from_u32(sb.promote_target));
    }
    if opts.metadata_target.is_none() {
        opts.metadata_target = Some(Target::from_u32(sb.metadata_target));
    }
    if opts.error_action.is_none() {
        opts.error_action = bch_types::ErrorAction::from_u8(sb.opts.error_action).ok();
    }
}
