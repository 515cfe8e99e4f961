#![forbid(unsafe_code)]
//! Append-only write-ahead journal.
//!
//! The journal is a ring of entries spread across per-device journal
//! buckets. Entries carry btree update records under dense,
//! monotonically increasing sequence numbers and are replicated to the
//! metadata replica count. A sequence is durable once its containing
//! sectors are synced; dirty btree nodes pin the sequences they were
//! written under, and reclaim frees ring space behind the oldest pin.

use asupersync::Cx;
use bch_block::{Device, cx_checkpoint};
use bch_error::{Error, RestartReason, Result};
use bch_ondisk::journal::{JournalEntry, JournalUpdate, decode_entry, encode_entry};
use bch_types::{ChecksumType, JournalSeq, SECTOR_SIZE};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Reservation threshold: refuse reservations once the ring is this
/// close to full, forcing reclaim first.
const RESERVE_HEADROOM_SECTORS: u64 = 8;

/// One device's journal region: bucket list plus a write cursor.
#[derive(Debug)]
struct JournalSlot {
    device: Arc<Device>,
    /// Bucket indices on the device, in ring order.
    buckets: Vec<u64>,
    /// Current position: (bucket ordinal, sector offset within bucket).
    cursor_bucket: usize,
    cursor_sector: u64,
}

impl JournalSlot {
    fn bucket_sectors(&self) -> u64 {
        u64::from(self.device.bucket_size)
    }

    fn total_sectors(&self) -> u64 {
        self.bucket_sectors() * self.buckets.len() as u64
    }

    /// Advance the cursor past an entry of `sectors`, moving to the
    /// next bucket when the remainder of the current one is too small.
    /// Returns the absolute device sector to write at plus the sectors
    /// wasted skipping a bucket tail (which count against ring space).
    fn place(&mut self, sectors: u64) -> Option<(u64, u64)> {
        if sectors > self.bucket_sectors() {
            return None;
        }
        let mut waste = 0;
        if self.cursor_sector + sectors > self.bucket_sectors() {
            waste = self.bucket_sectors() - self.cursor_sector;
            self.cursor_bucket = (self.cursor_bucket + 1) % self.buckets.len();
            self.cursor_sector = 0;
        }
        let bucket = self.buckets[self.cursor_bucket];
        let sector = self.device.bucket_to_sector(bucket) + self.cursor_sector;
        self.cursor_sector += sectors;
        Some((sector, waste))
    }
}

#[derive(Debug)]
struct JournalInner {
    next_seq: JournalSeq,
    /// Oldest sequence still pinned by unflushed btree nodes.
    last_seq: JournalSeq,
    /// Last sequence known synced to stable storage.
    durable_seq: JournalSeq,
    slots: Vec<JournalSlot>,
    /// Live entries in the ring: (seq, sectors), oldest first.
    live: VecDeque<(JournalSeq, u64)>,
    used_sectors: u64,
    pins: BTreeMap<u64, usize>,
    dirty_since_flush: bool,
}

impl JournalInner {
    fn capacity_sectors(&self) -> u64 {
        self.slots
            .iter()
            .map(JournalSlot::total_sectors)
            .min()
            .unwrap_or(0)
    }

    fn free_sectors(&self) -> u64 {
        self.capacity_sectors().saturating_sub(self.used_sectors)
    }

    /// Drop accounting for entries older than every pin.
    fn reclaim(&mut self) {
        let floor = self
            .pins
            .keys()
            .next()
            .copied()
            .map_or(self.next_seq.0, |oldest| oldest);
        let new_last = JournalSeq(floor.min(self.next_seq.0));
        while let Some(&(seq, sectors)) = self.live.front() {
            if seq >= new_last {
                break;
            }
            self.used_sectors = self.used_sectors.saturating_sub(sectors);
            self.live.pop_front();
        }
        if new_last > self.last_seq {
            trace!(
                target: "bch::journal",
                event = "reclaim",
                last_seq = new_last.0,
                used_sectors = self.used_sectors
            );
            self.last_seq = new_last;
        }
    }
}

/// Space reservation handed back by [`Journal::reserve`]; consumed by
/// [`Journal::append`] or dropped to refund.
#[derive(Debug)]
pub struct JournalReservation {
    sectors: u64,
}

/// The journal.
pub struct Journal {
    inner: Mutex<JournalInner>,
    space_available: Condvar,
    csum_type: ChecksumType,
    key: Option<[u8; 32]>,
}

impl Journal {
    /// Assemble the journal over per-device bucket lists, starting at
    /// `next_seq` (1 on a fresh filesystem; replay end + 1 on mount).
    pub fn new(
        slots: Vec<(Arc<Device>, Vec<u64>)>,
        next_seq: JournalSeq,
        csum_type: ChecksumType,
        key: Option<[u8; 32]>,
    ) -> Result<Self> {
        if slots.iter().all(|(_, buckets)| buckets.is_empty()) {
            return Err(Error::InvalidArgument(
                "journal needs at least one bucket".into(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(JournalInner {
                next_seq,
                last_seq: next_seq,
                durable_seq: JournalSeq(next_seq.0.saturating_sub(1)),
                slots: slots
                    .into_iter()
                    .filter(|(_, buckets)| !buckets.is_empty())
                    .map(|(device, buckets)| JournalSlot {
                        device,
                        buckets,
                        cursor_bucket: 0,
                        cursor_sector: 0,
                    })
                    .collect(),
                live: VecDeque::new(),
                used_sectors: 0,
                pins: BTreeMap::new(),
                dirty_since_flush: false,
            }),
            space_available: Condvar::new(),
            csum_type,
            key,
        })
    }

    /// Reserve ring space for `bytes` of serialized updates.
    ///
    /// Fails with a `JournalFull` restart when the ring is too full;
    /// the commit wrapper reacts by flushing dirty nodes (releasing
    /// pins) and retrying.
    pub fn reserve(&self, cx: &Cx, bytes: usize) -> Result<JournalReservation> {
        self.reserve_inner(cx, bytes, RESERVE_HEADROOM_SECTORS)
    }

    /// Reservation for reclaim-path writes (node pointer flips). These
    /// are what frees ring space, so they spend the headroom ordinary
    /// reservations must leave behind.
    pub fn reserve_reclaim(&self, cx: &Cx, bytes: usize) -> Result<JournalReservation> {
        self.reserve_inner(cx, bytes, 0)
    }

    fn reserve_inner(&self, cx: &Cx, bytes: usize, headroom: u64) -> Result<JournalReservation> {
        cx_checkpoint(cx)?;
        let sectors = (bytes as u64 + u64::from(SECTOR_SIZE)).div_ceil(u64::from(SECTOR_SIZE));
        let mut inner = self.inner.lock();
        inner.reclaim();
        if sectors + headroom > inner.free_sectors() {
            debug!(
                target: "bch::journal",
                event = "journal_full",
                want_sectors = sectors,
                free_sectors = inner.free_sectors()
            );
            return Err(Error::restart(RestartReason::JournalFull));
        }
        inner.used_sectors += sectors;
        Ok(JournalReservation { sectors })
    }

    /// Refund an unused reservation.
    pub fn refund(&self, reservation: JournalReservation) {
        let mut inner = self.inner.lock();
        inner.used_sectors = inner.used_sectors.saturating_sub(reservation.sectors);
        self.space_available.notify_all();
    }

    /// Append one entry under the next sequence number, writing it to
    /// every journal slot (replication). Returns the assigned sequence.
    ///
    /// With `flush` set the entry is a durability barrier: devices are
    /// synced before returning and the sequence is durable on success.
    pub fn append(
        &self,
        cx: &Cx,
        reservation: JournalReservation,
        updates: Vec<JournalUpdate>,
        flush: bool,
    ) -> Result<JournalSeq> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        let entry = JournalEntry {
            seq,
            last_seq: inner.last_seq,
            flush,
            updates,
        };
        let image = encode_entry(&entry, self.csum_type, self.key.as_ref())?;
        let sectors = image.len() as u64 / u64::from(SECTOR_SIZE);
        if sectors > reservation.sectors {
            inner.used_sectors = inner
                .used_sectors
                .saturating_sub(reservation.sectors);
            return Err(Error::InvalidArgument(
                "journal entry exceeds its reservation".into(),
            ));
        }
        // Return the over-reserve.
        inner.used_sectors = inner
            .used_sectors
            .saturating_sub(reservation.sectors - sectors);

        let mut max_waste = 0_u64;
        let mut write_err = None;
        for slot in &mut inner.slots {
            if !slot.device.is_writable() {
                continue;
            }
            let Some((sector, waste)) = slot.place(sectors) else {
                write_err = Some(Error::NoSpace);
                break;
            };
            max_waste = max_waste.max(waste);
            if let Err(err) = slot.device.write_sectors(cx, sector, &image) {
                write_err = Some(err);
                break;
            }
        }
        if let Some(err) = write_err {
            inner.used_sectors = inner.used_sectors.saturating_sub(sectors);
            return Err(err);
        }

        inner.next_seq = seq.next();
        inner.used_sectors += max_waste;
        inner.live.push_back((seq, sectors + max_waste));
        inner.dirty_since_flush = true;
        // The new sequence starts pinned; the transaction layer moves
        // the pin to the dirty nodes it marks.
        *inner.pins.entry(seq.0).or_insert(0) += 1;

        trace!(
            target: "bch::journal",
            event = "append",
            seq = seq.0,
            sectors,
            flush,
            updates = entry.updates.len()
        );

        if flush {
            let devices: Vec<_> = inner
                .slots
                .iter()
                .map(|s| Arc::clone(&s.device))
                .collect();
            drop(inner);
            for device in devices {
                if device.is_writable() {
                    device.sync(cx)?;
                }
            }
            let mut inner = self.inner.lock();
            if seq > inner.durable_seq {
                inner.durable_seq = seq;
            }
            inner.dirty_since_flush = false;
        }

        Ok(seq)
    }

    /// Sync all journal devices, making every appended sequence
    /// durable. The journal-writer background thread calls this.
    pub fn flush(&self, cx: &Cx) -> Result<()> {
        let (devices, target) = {
            let inner = self.inner.lock();
            if !inner.dirty_since_flush {
                return Ok(());
            }
            (
                inner
                    .slots
                    .iter()
                    .map(|s| Arc::clone(&s.device))
                    .collect::<Vec<_>>(),
                JournalSeq(inner.next_seq.0.saturating_sub(1)),
            )
        };
        for device in devices {
            if device.is_writable() {
                device.sync(cx)?;
            }
        }
        let mut inner = self.inner.lock();
        if target > inner.durable_seq {
            inner.durable_seq = target;
        }
        inner.dirty_since_flush = false;
        info!(target: "bch::journal", event = "flush", durable_seq = inner.durable_seq.0);
        Ok(())
    }

    /// Take an additional pin on `seq` (a node was written under it).
    pub fn pin(&self, seq: JournalSeq) {
        let mut inner = self.inner.lock();
        *inner.pins.entry(seq.0).or_insert(0) += 1;
    }

    /// Release one pin on `seq`; when the oldest sequence loses its
    /// last pin the ring space behind it is reclaimed.
    pub fn unpin(&self, seq: JournalSeq) {
        let mut inner = self.inner.lock();
        match inner.pins.get_mut(&seq.0) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.pins.remove(&seq.0);
            }
            None => {
                warn!(target: "bch::journal", event = "unpin_unpinned", seq = seq.0);
            }
        }
        inner.reclaim();
        self.space_available.notify_all();
    }

    #[must_use]
    pub fn durable_seq(&self) -> JournalSeq {
        self.inner.lock().durable_seq
    }

    #[must_use]
    pub fn last_seq(&self) -> JournalSeq {
        self.inner.lock().last_seq
    }

    #[must_use]
    pub fn next_seq(&self) -> JournalSeq {
        self.inner.lock().next_seq
    }

    /// Sectors currently free in the ring.
    #[must_use]
    pub fn free_sectors(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.reclaim();
        inner.free_sectors()
    }
}

// ── Replay ──────────────────────────────────────────────────────────────────

/// Outcome of a journal scan at mount.
#[derive(Debug, Default)]
pub struct ReplayPlan {
    /// Entries to apply, ordered by sequence, blacklist already
    /// filtered out.
    pub entries: Vec<JournalEntry>,
    /// Sequences skipped because they were blacklisted.
    pub skipped_blacklisted: u64,
    /// First sequence the new journal should continue from.
    pub next_seq: JournalSeq,
}

/// Scan every device's journal buckets, merge entries by sequence, drop
/// blacklisted sequences, and order the remainder for replay.
///
/// `blacklisted` receives inclusive sequence ranges from the
/// superblock.
pub fn scan_for_replay(
    cx: &Cx,
    slots: &[(Arc<Device>, Vec<u64>)],
    csum_type: ChecksumType,
    key: Option<&[u8; 32]>,
    blacklisted: &[(u64, u64)],
) -> Result<ReplayPlan> {
    let mut by_seq: BTreeMap<u64, JournalEntry> = BTreeMap::new();

    for (device, buckets) in slots {
        if !device.is_readable() {
            continue;
        }
        let bucket_sectors = u64::from(device.bucket_size);
        let bucket_bytes = usize::try_from(bucket_sectors * u64::from(SECTOR_SIZE))
            .map_err(|_| Error::InvalidArgument("bucket size overflows usize".into()))?;
        let mut buf = vec![0_u8; bucket_bytes];
        for &bucket in buckets {
            cx_checkpoint(cx)?;
            let sector = device.bucket_to_sector(bucket);
            if let Err(err) = device.read_sectors(cx, sector, &mut buf) {
                warn!(
                    target: "bch::journal",
                    event = "replay_bucket_unreadable",
                    dev = device.idx.0,
                    bucket,
                    error = %err
                );
                continue;
            }
            let mut off = 0;
            while off + 512 <= buf.len() {
                match decode_entry(&buf[off..], csum_type, key) {
                    Ok(Some((entry, used))) => {
                        by_seq.entry(entry.seq.0).or_insert(entry);
                        off += used;
                    }
                    Ok(None) => {
                        off += 512;
                    }
                    Err(err) => {
                        // A damaged entry ends this bucket's run; later
                        // buckets may still hold newer entries.
                        debug!(
                            target: "bch::journal",
                            event = "replay_entry_damaged",
                            dev = device.idx.0,
                            bucket,
                            error = %err
                        );
                        off += 512;
                    }
                }
            }
        }
    }

    let Some(newest) = by_seq.keys().next_back().copied() else {
        return Ok(ReplayPlan::default());
    };
    let replay_floor = by_seq
        .get(&newest)
        .map(|e| e.last_seq.0)
        .unwrap_or(0);

    let is_blacklisted =
        |seq: u64| blacklisted.iter().any(|&(s, e)| (s..=e).contains(&seq));

    let mut plan = ReplayPlan {
        next_seq: JournalSeq(newest + 1),
        ..ReplayPlan::default()
    };
    for (seq, entry) in by_seq.into_iter() {
        if seq < replay_floor {
            continue;
        }
        if is_blacklisted(seq) {
            plan.skipped_blacklisted += 1;
            continue;
        }
        plan.entries.push(entry);
    }

    info!(
        target: "bch::journal",
        event = "replay_plan",
        entries = plan.entries.len(),
        skipped_blacklisted = plan.skipped_blacklisted,
        next_seq = plan.next_seq.0
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bch_block::MemDevice;
    use bch_ondisk::journal::JournalUpdate;
    use bch_types::keys::{BVal, LruV};
    use bch_types::{BKey, BtreeId, DeviceIdx, MemberState, Pos};
    use std::path::PathBuf;

    fn cx() -> Cx {
        Cx::for_testing()
    }

    fn device(idx: u32) -> Arc<Device> {
        Arc::new(Device::new(
            DeviceIdx(idx),
            PathBuf::from(format!("/mem/{idx}")),
            Arc::new(MemDevice::new(4 << 20)),
            MemberState::Rw,
            16, // sectors per bucket: small, to exercise wrap
            512,
            1,
            1,
            bch_types::data_allowed_default(),
            false,
        ))
    }

    fn updates(n: u64) -> Vec<JournalUpdate> {
        (0..n)
            .map(|i| JournalUpdate {
                btree: BtreeId::Lru,
                level: 0,
                key: BKey::new(Pos::new(0, i), BVal::Lru(LruV { bucket: i })),
            })
            .collect()
    }

    fn journal_with(devs: Vec<Arc<Device>>, buckets: Vec<u64>) -> (Journal, Vec<(Arc<Device>, Vec<u64>)>) {
        let slots: Vec<_> = devs
            .into_iter()
            .map(|d| (d, buckets.clone()))
            .collect();
        let journal = Journal::new(
            slots.clone(),
            JournalSeq(1),
            ChecksumType::Crc32c,
            None,
        )
        .unwrap();
        (journal, slots)
    }

    #[test]
    fn sequences_are_dense_and_monotone() {
        let cx = cx();
        let (journal, _) = journal_with(vec![device(0)], vec![2, 3, 4, 5]);
        for expect in 1..=20_u64 {
            let r = journal.reserve(&cx, 256).unwrap();
            let seq = journal.append(&cx, r, updates(1), false).unwrap();
            assert_eq!(seq, JournalSeq(expect));
            journal.unpin(seq);
        }
    }

    #[test]
    fn replay_round_trip() {
        let cx = cx();
        let dev = device(0);
        let (journal, slots) = journal_with(vec![Arc::clone(&dev)], vec![2, 3, 4, 5]);

        let mut appended = Vec::new();
        for i in 0..5 {
            let r = journal.reserve(&cx, 512).unwrap();
            let seq = journal.append(&cx, r, updates(i + 1), i == 4).unwrap();
            appended.push(seq);
        }

        let plan = scan_for_replay(&cx, &slots, ChecksumType::Crc32c, None, &[]).unwrap();
        assert_eq!(plan.entries.len(), 5);
        for (entry, seq) in plan.entries.iter().zip(&appended) {
            assert_eq!(entry.seq, *seq);
        }
        // Replay order is sequence order.
        for pair in plan.entries.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
        assert_eq!(plan.next_seq, JournalSeq(6));
    }

    #[test]
    fn blacklisted_sequences_are_skipped() {
        let cx = cx();
        let (journal, slots) = journal_with(vec![device(0)], vec![2, 3, 4, 5]);
        for _ in 0..6 {
            let r = journal.reserve(&cx, 256).unwrap();
            journal.append(&cx, r, updates(1), false).unwrap();
        }
        let plan =
            scan_for_replay(&cx, &slots, ChecksumType::Crc32c, None, &[(2, 3)]).unwrap();
        let seqs: Vec<u64> = plan.entries.iter().map(|e| e.seq.0).collect();
        assert_eq!(seqs, vec![1, 4, 5, 6]);
        assert_eq!(plan.skipped_blacklisted, 2);
    }

    #[test]
    fn replication_scans_from_surviving_device() {
        let cx = cx();
        let dev0 = device(0);
        let dev1 = device(1);
        let (journal, slots) =
            journal_with(vec![Arc::clone(&dev0), Arc::clone(&dev1)], vec![2, 3]);
        for _ in 0..3 {
            let r = journal.reserve(&cx, 256).unwrap();
            journal.append(&cx, r, updates(2), false).unwrap();
        }
        // Lose device 0 entirely.
        dev0.set_state(MemberState::Failed);
        let plan = scan_for_replay(&cx, &slots, ChecksumType::Crc32c, None, &[]).unwrap();
        assert_eq!(plan.entries.len(), 3);
    }

    #[test]
    fn full_ring_requires_reclaim() {
        let cx = cx();
        // Tiny journal: 2 buckets of 16 sectors.
        let (journal, _) = journal_with(vec![device(0)], vec![2, 3]);

        let mut seqs = Vec::new();
        let mut full_seen = false;
        for _ in 0..64 {
            match journal.reserve(&cx, 512) {
                Ok(r) => {
                    let seq = journal.append(&cx, r, updates(1), false).unwrap();
                    seqs.push(seq);
                }
                Err(err) => {
                    assert!(err.is_restart(), "expected journal-full restart, got {err}");
                    full_seen = true;
                    break;
                }
            }
        }
        assert!(full_seen, "ring never filled");

        // Releasing the oldest pins frees space again.
        for seq in seqs {
            journal.unpin(seq);
        }
        assert!(journal.reserve(&cx, 512).is_ok());
    }

    #[test]
    fn flush_advances_durable_seq() {
        let cx = cx();
        let (journal, _) = journal_with(vec![device(0)], vec![2, 3, 4]);
        let r = journal.reserve(&cx, 256).unwrap();
        let seq = journal.append(&cx, r, updates(1), false).unwrap();
        assert!(journal.durable_seq() < seq);
        journal.flush(&cx).unwrap();
        assert_eq!(journal.durable_seq(), seq);
    }

    #[test]
    fn refund_returns_space() {
        let cx = cx();
        let (journal, _) = journal_with(vec![device(0)], vec![2, 3]);
        let before = journal.free_sectors();
        let r = journal.reserve(&cx, 2048).unwrap();
        assert!(journal.free_sectors() < before);
        journal.refund(r);
        assert_eq!(journal.free_sectors(), before);
    }
}
