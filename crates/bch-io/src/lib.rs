#![forbid(unsafe_code)]
//! Extent I/O path.
//!
//! Write assembly: align to block boundaries (read-modify-write of
//! partial blocks), compress with fallback, encrypt with a per-extent
//! nonce, checksum, allocate replicas on hashed write points, submit
//! the block writes, then commit the extent keys and inode update in
//! one transaction. Read assembly: resolve the visible extents, pick a
//! replica, verify, retry alternates, reconstruct from stripe parity
//! within the degradation limit, then decrypt/decompress and slice.

pub mod compress;
pub mod ec;

use asupersync::Cx;
use bch_alloc::Allocator;
use bch_block::{DeviceSet, cx_checkpoint};
use bch_btree::BtreeSys;
use bch_error::{Error, Result};
use bch_ondisk::csum::{Csum, Nonce, csum, csum_matches};
use bch_txn::{CommitTrigger, commit_do};
use bch_types::keys::{CrcDescriptor, ExtentPtr, ExtentV, InodeV};
use bch_types::{
    BKey, BVal, BtreeId, ChecksumType, CompressionType, DataType, DeviceIdx, Pos, SECTOR_SIZE,
    SnapshotId,
};
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Tag};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Largest single extent written by the assembly path.
pub const MAX_EXTENT_SECTORS: u32 = 128;

/// Per-write policy, resolved by the caller from filesystem and inode
/// options.
#[derive(Debug, Clone)]
pub struct WriteOpts {
    pub compression: CompressionType,
    pub csum_type: ChecksumType,
    pub nr_replicas: u8,
    /// Minimum replicas that must land for the write to succeed.
    pub nr_required: u8,
    /// Candidate devices, already filtered by target and data_allowed.
    pub devs: Vec<DeviceIdx>,
    /// Write-point selector; independent streams should differ.
    pub stream: u64,
    pub snapshot: SnapshotId,
    /// Write cached (promote-tier) copies instead of durable ones.
    pub cached: bool,
    /// Inode value visible from an ancestor snapshot, used as the base
    /// when this snapshot has no own inode key yet (first write after
    /// a snapshot).
    pub inherit_inode: Option<InodeV>,
}

/// The extent I/O engine.
pub struct FsIo {
    sys: Arc<BtreeSys>,
    alloc: Arc<Allocator>,
    devices: Arc<DeviceSet>,
    triggers: Vec<Arc<dyn CommitTrigger>>,
    key: Option<[u8; 32]>,
    block_size: u32,
    read_rr: AtomicU64,
    nonce_counter: AtomicU64,
    /// Stripe registry for parity reconstruction.
    stripes: RwLock<HashMap<u64, ec::Stripe>>,
}

impl FsIo {
    pub fn new(
        sys: Arc<BtreeSys>,
        alloc: Arc<Allocator>,
        devices: Arc<DeviceSet>,
        triggers: Vec<Arc<dyn CommitTrigger>>,
        key: Option<[u8; 32]>,
        block_size: u32,
    ) -> Self {
        Self {
            sys,
            alloc,
            devices,
            triggers,
            key,
            block_size,
            read_rr: AtomicU64::new(0),
            nonce_counter: AtomicU64::new(1),
            stripes: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn sys(&self) -> &Arc<BtreeSys> {
        &self.sys
    }

    #[must_use]
    pub fn triggers(&self) -> &[Arc<dyn CommitTrigger>] {
        &self.triggers
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn register_stripe(&self, stripe: ec::Stripe) {
        self.stripes.write().insert(stripe.idx, stripe);
    }

    fn fresh_nonce(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.nonce_counter.fetch_add(1, Ordering::Relaxed) as u32
        }
    }

    // ── Write path ──────────────────────────────────────────────────

    /// Write `buf` at byte `offset` of `inode`, updating the inode's
    /// size and times in the same transaction as the extent keys.
    /// `rank` resolves snapshot visibility for the read-modify-write of
    /// partial edge blocks.
    pub fn write_file_range(
        &self,
        cx: &Cx,
        inode: u64,
        rank: &dyn Fn(u32) -> Option<u32>,
        offset: u64,
        buf: &[u8],
        opts: &WriteOpts,
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let block = u64::from(self.block_size);

        // Read-modify-write alignment to block boundaries.
        let aligned_start = offset / block * block;
        let end = offset + buf.len() as u64;
        let aligned_end = end.div_ceil(block) * block;
        let mut data = Vec::with_capacity((aligned_end - aligned_start) as usize);
        if aligned_start < offset {
            let head = self.read_file_range(
                cx,
                inode,
                rank,
                aligned_start,
                (offset - aligned_start) as usize,
            )?;
            data.extend_from_slice(&head);
        }
        data.extend_from_slice(buf);
        if end < aligned_end {
            let tail =
                self.read_file_range(cx, inode, rank, end, (aligned_end - end) as usize)?;
            data.extend_from_slice(&tail);
        }
        debug_assert_eq!(data.len() as u64, aligned_end - aligned_start);

        let start_sector = aligned_start / u64::from(SECTOR_SIZE);
        let total_sectors = (aligned_end - aligned_start) / u64::from(SECTOR_SIZE);

        let reservation = self
            .alloc
            .disk_reservation_get(total_sectors, opts.nr_replicas)?;

        // Assemble and submit each chunk, collecting the keys.
        let mut keys = Vec::new();
        let mut cursor = 0_u64;
        while cursor < total_sectors {
            cx_checkpoint(cx)?;
            let chunk_sectors =
                (total_sectors - cursor).min(u64::from(MAX_EXTENT_SECTORS));
            let chunk_start = (cursor * u64::from(SECTOR_SIZE)) as usize;
            let chunk = &data[chunk_start..chunk_start + (chunk_sectors * 512) as usize];
            let key = self.write_one_extent(
                cx,
                inode,
                start_sector + cursor,
                chunk,
                opts,
            )?;
            keys.push(key);
            cursor += chunk_sectors;
        }

        // One transaction: extent keys + inode size/times. Atomicity
        // across a crash comes from the single journal entry.
        let new_end = end;
        commit_do(&self.sys, cx, &self.triggers, false, |txn, cx| {
            for key in &keys {
                txn.stage_extent(cx, BtreeId::Extents, key.clone())?;
            }
            let inode_pos = Pos::with_snapshot(inode, 0, opts.snapshot);
            let mut inode_val = match txn.get(cx, BtreeId::Inodes, inode_pos)? {
                Some(BKey {
                    val: BVal::Inode(v),
                    ..
                }) => v,
                _ => opts.inherit_inode.clone().unwrap_or_default(),
            };
            inode_val.size = inode_val.size.max(new_end);
            inode_val.sectors = inode_val.sectors.saturating_add(total_sectors);
            let now = wall_clock_nanos();
            inode_val.mtime = now;
            inode_val.ctime = now;
            txn.update(cx, BtreeId::Inodes, BKey::new(inode_pos, BVal::Inode(inode_val)))
        })?;

        reservation.consume();
        Ok(())
    }

    /// Build, protect, and submit one extent image. Returns the key to
    /// commit.
    fn write_one_extent(
        &self,
        cx: &Cx,
        inode: u64,
        start_sector: u64,
        data: &[u8],
        opts: &WriteOpts,
    ) -> Result<BKey> {
        let uncompressed_sectors = u32::try_from(data.len() / 512)
            .map_err(|_| Error::InvalidArgument("extent too large".into()))?;

        // Compress, falling back when it does not pay.
        let (mut image, compression_type) = match compress::compress(opts.compression, data)? {
            Some(compressed) => (compressed, opts.compression),
            None => (data.to_vec(), CompressionType::None),
        };
        image.resize(image.len().div_ceil(512) * 512, 0);
        let compressed_sectors = u32::try_from(image.len() / 512)
            .map_err(|_| Error::InvalidArgument("extent too large".into()))?;

        // Encrypt: the AEAD tag doubles as the checksum (poly1305).
        let nonce32 = self.fresh_nonce();
        let nonce = Nonce::for_extent(inode, start_sector, nonce32);
        let (csum_value, csum_type) = if let Some(key) = &self.key {
            let tag = encrypt_in_place(key, nonce, &mut image)?;
            (tag, ChecksumType::Poly1305)
        } else {
            (
                csum(opts.csum_type, None, nonce, &image)?,
                opts.csum_type,
            )
        };

        // Allocate and submit, retrying alternates on partial failure.
        let data_type = if opts.cached {
            DataType::Cached
        } else {
            DataType::User
        };
        let mut ptrs = self.alloc.allocate(
            cx,
            &self.triggers,
            opts.stream,
            &opts.devs,
            opts.nr_replicas,
            data_type,
            u64::from(compressed_sectors),
        )?;

        let mut written = Vec::new();
        let mut retries = opts.devs.len();
        while let Some(ptr) = ptrs.pop() {
            let device = self.devices.require(ptr.dev)?;
            match device.write_sectors(cx, ptr.offset, &image) {
                Ok(()) => written.push(ptr),
                Err(err) => {
                    warn!(
                        target: "bch::io",
                        event = "replica_write_failed",
                        dev = ptr.dev.0,
                        error = %err
                    );
                    if retries > 0 {
                        retries -= 1;
                        // Try a replacement replica on the remaining
                        // candidates.
                        if let Ok(mut more) = self.alloc.allocate(
                            cx,
                            &self.triggers,
                            opts.stream.wrapping_add(1),
                            &opts.devs,
                            1,
                            data_type,
                            u64::from(compressed_sectors),
                        ) {
                            ptrs.append(&mut more);
                        }
                    }
                }
            }
        }

        if written.len() < usize::from(opts.nr_required) {
            return Err(Error::DataLossRisk(format!(
                "only {} of {} required replicas written",
                written.len(),
                opts.nr_required
            )));
        }
        if written.len() < usize::from(opts.nr_replicas) {
            warn!(
                target: "bch::io",
                event = "write_degraded",
                want = opts.nr_replicas,
                got = written.len()
            );
        }

        let pos = Pos::with_snapshot(inode, start_sector, opts.snapshot);
        trace!(
            target: "bch::io",
            event = "extent_written",
            inode,
            sector = start_sector,
            sectors = uncompressed_sectors,
            replicas = written.len(),
            compression = %compression_type
        );
        Ok(BKey::extent(
            pos,
            uncompressed_sectors,
            ExtentV {
                ptrs: written,
                crc: CrcDescriptor {
                    csum_type: csum_type as u8,
                    compression_type: compression_type as u8,
                    compressed_sectors,
                    uncompressed_sectors,
                    offset: 0,
                    nonce: nonce32,
                    csum: csum_value.to_words(),
                },
                stripe: None,
                nr_required: opts.nr_required,
            },
        ))
    }

    // ── Read path ───────────────────────────────────────────────────

    /// Read `len` bytes at byte `offset` of `inode`. `rank` maps a
    /// key's snapshot id to its ancestry depth (`None` = not visible);
    /// the deepest (most specific) visible key wins per byte range.
    /// Holes read as zeroes.
    pub fn read_file_range(
        &self,
        cx: &Cx,
        inode: u64,
        rank: &dyn Fn(u32) -> Option<u32>,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0_u8; len];
        if len == 0 {
            return Ok(out);
        }
        let start_sector = offset / u64::from(SECTOR_SIZE);
        let end_byte = offset + len as u64;
        let end_sector = end_byte.div_ceil(u64::from(SECTOR_SIZE));

        // Candidates across all snapshots, shallow ancestors first so
        // more specific copies overwrite them in the output buffer.
        let mut candidates = self.overlapping_candidates(cx, inode, start_sector, end_sector)?;
        candidates.retain(|k| rank(k.pos.snapshot).is_some());
        candidates.sort_by_key(|k| (rank(k.pos.snapshot).unwrap_or(0), k.pos.offset));

        for key in candidates {
            cx_checkpoint(cx)?;
            let bytes = self.read_one_extent(cx, &key)?;
            // Intersect the key's byte range with the request.
            let key_start = key.pos.offset * u64::from(SECTOR_SIZE);
            let key_end = key.end_offset() * u64::from(SECTOR_SIZE);
            let copy_start = key_start.max(offset);
            let copy_end = key_end.min(end_byte);
            if copy_start >= copy_end {
                continue;
            }
            let src = (copy_start - key_start) as usize;
            let dst = (copy_start - offset) as usize;
            let n = (copy_end - copy_start) as usize;
            out[dst..dst + n].copy_from_slice(&bytes[src..src + n]);
        }
        Ok(out)
    }

    fn overlapping_candidates(
        &self,
        cx: &Cx,
        inode: u64,
        start_sector: u64,
        end_sector: u64,
    ) -> Result<Vec<BKey>> {
        let mut out = Vec::new();
        // Walk backward over possible straddlers first (bounded by the
        // largest extent the write path produces).
        let scan_floor = start_sector.saturating_sub(u64::from(MAX_EXTENT_SECTORS));
        let mut iter = self.sys.iter(
            BtreeId::Extents,
            Pos {
                inode,
                offset: scan_floor,
                snapshot: 0,
            },
        );
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            if key.pos.inode != inode || key.pos.offset >= end_sector {
                break;
            }
            iter.advance(&key);
            if key.end_offset() > start_sector {
                if let BVal::Extent(_) = &key.val {
                    out.push(key);
                }
            }
        }
        Ok(out)
    }

    /// Read and decode one extent's full logical window. Replica order
    /// prefers durable copies on readable devices, round-robin among
    /// equals; checksum failures rotate to the next replica, then to
    /// stripe reconstruction, then surface as unrecoverable.
    pub fn read_one_extent(&self, cx: &Cx, key: &BKey) -> Result<Vec<u8>> {
        let BVal::Extent(extent) = &key.val else {
            return Err(Error::InvalidArgument("read_one_extent wants an extent".into()));
        };
        let crc = extent.crc;
        let image_start = key.pos.offset - u64::from(crc.offset);
        let nonce = Nonce::for_extent(key.pos.inode, image_start, crc.nonce);
        let image_bytes = crc.compressed_sectors as usize * 512;

        let mut order: Vec<&ExtentPtr> = extent.ptrs.iter().collect();
        let rr = self.read_rr.fetch_add(1, Ordering::Relaxed) as usize;
        order.sort_by_key(|p| {
            let readable = self
                .devices
                .get(p.dev)
                .map(|d| d.is_readable())
                .unwrap_or(false);
            // Prefer durable over cached, readable over not, then
            // rotate.
            (
                p.cached,
                !readable,
                (p.dev.0 as usize).wrapping_add(rr) % extent.ptrs.len().max(1),
            )
        });

        let mut image = vec![0_u8; image_bytes];
        for ptr in order {
            let Some(device) = self.devices.get(ptr.dev) else {
                continue;
            };
            if !device.is_readable() {
                continue;
            }
            // A cached pointer into a reused bucket is stale; the
            // generation check filters it out.
            if ptr.cached {
                let bucket = bch_types::BucketIdx(device.sector_to_bucket(ptr.offset));
                match self.alloc.bucket_state(cx, ptr.dev, bucket) {
                    Ok(state) if state.gen == ptr.gen => {}
                    _ => {
                        trace!(
                            target: "bch::io",
                            event = "cached_ptr_stale",
                            dev = ptr.dev.0
                        );
                        continue;
                    }
                }
            }
            if let Err(err) = device.read_sectors(cx, ptr.offset, &mut image) {
                warn!(
                    target: "bch::io",
                    event = "replica_read_failed",
                    dev = ptr.dev.0,
                    error = %err
                );
                continue;
            }
            match self.decode_image(&crc, nonce, image.clone()) {
                Ok(bytes) => return self.slice_window(key, &crc, bytes),
                Err(err) => {
                    warn!(
                        target: "bch::io",
                        event = "replica_csum_failed",
                        dev = ptr.dev.0,
                        sector = ptr.offset,
                        error = %err
                    );
                }
            }
        }

        // All replicas failed: reconstruct from the stripe if the
        // extent belongs to one and enough shards survive.
        if let Some(stripe_ref) = extent.stripe {
            if let Some(bytes) = self.reconstruct_from_stripe(cx, stripe_ref.idx, stripe_ref.block)?
            {
                debug!(
                    target: "bch::io",
                    event = "stripe_reconstruct",
                    stripe = stripe_ref.idx,
                    block = stripe_ref.block
                );
                let mut image = bytes;
                image.resize(image_bytes, 0);
                let decoded = self.decode_image(&crc, nonce, image)?;
                return self.slice_window(key, &crc, decoded);
            }
        }

        Err(Error::UnrecoverableRead { pos: key.pos })
    }

    fn decode_image(&self, crc: &CrcDescriptor, nonce: Nonce, mut image: Vec<u8>) -> Result<Vec<u8>> {
        let csum_type = ChecksumType::from_u8(crc.csum_type)?;
        let stored = Csum::from_words(crc.csum);
        if csum_type == ChecksumType::Poly1305 {
            let key = self.key.as_ref().ok_or(Error::InvalidArgument(
                "encrypted extent without an unlocked key".into(),
            ))?;
            decrypt_in_place(key, nonce, &mut image, stored)?;
        } else if !csum_matches(csum_type, None, nonce, &image, stored)? {
            return Err(Error::BadChecksum { what: "extent" });
        }
        let compression = CompressionType::from_u8(crc.compression_type)?;
        compress::decompress(
            compression,
            &image,
            crc.uncompressed_sectors as usize * 512,
        )
    }

    fn slice_window(&self, key: &BKey, crc: &CrcDescriptor, decoded: Vec<u8>) -> Result<Vec<u8>> {
        let start = crc.offset as usize * 512;
        let end = start + key.size as usize * 512;
        decoded
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::CorruptMetadata {
                btree: BtreeId::Extents,
                pos: key.pos,
                detail: "extent window outside decoded image".into(),
            })
    }

    fn reconstruct_from_stripe(
        &self,
        cx: &Cx,
        stripe_idx: u64,
        block: u8,
    ) -> Result<Option<Vec<u8>>> {
        let stripe = match self.stripes.read().get(&stripe_idx) {
            Some(s) => s.clone(),
            None => return Ok(None),
        };
        let shard_bytes = stripe.shard_sectors as usize * 512;
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(stripe.total_shards());
        for (i, shard) in stripe.shards.iter().enumerate() {
            if i == usize::from(block) {
                shards.push(None);
                continue;
            }
            let mut buf = vec![0_u8; shard_bytes];
            let ok = self
                .devices
                .get(shard.dev)
                .filter(|d| d.is_readable())
                .map(|d| d.read_sectors(cx, shard.offset, &mut buf).is_ok())
                .unwrap_or(false);
            shards.push(if ok { Some(buf) } else { None });
        }
        match ec::reconstruct(&mut shards, stripe.data_shards, stripe.parity_shards) {
            Ok(()) => Ok(shards.into_iter().nth(usize::from(block)).flatten()),
            Err(Error::Degraded(msg)) => {
                warn!(target: "bch::io", event = "stripe_degraded", detail = %msg);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    // ── Replication maintenance ─────────────────────────────────────

    /// Copy one extent's image to an additional replica and extend the
    /// key. The image is copied verbatim — checksum and encryption are
    /// replica-independent.
    pub fn add_replica(
        &self,
        cx: &Cx,
        key: &BKey,
        candidates: &[DeviceIdx],
        cached: bool,
    ) -> Result<()> {
        let BVal::Extent(extent) = &key.val else {
            return Err(Error::InvalidArgument("add_replica wants an extent".into()));
        };
        let crc = extent.crc;
        let image_bytes = crc.compressed_sectors as usize * 512;

        // Fetch a verbatim image from any good replica.
        let mut image = vec![0_u8; image_bytes];
        let nonce = Nonce::for_extent(
            key.pos.inode,
            key.pos.offset - u64::from(crc.offset),
            crc.nonce,
        );
        let mut have_image = false;
        for ptr in &extent.ptrs {
            let Some(device) = self.devices.get(ptr.dev) else {
                continue;
            };
            if !device.is_readable() {
                continue;
            }
            if device.read_sectors(cx, ptr.offset, &mut image).is_ok()
                && self.decode_image(&crc, nonce, image.clone()).is_ok()
            {
                have_image = true;
                break;
            }
        }
        if !have_image {
            return Err(Error::UnrecoverableRead { pos: key.pos });
        }

        // Skip devices that already hold a copy.
        let existing: Vec<u32> = extent.ptrs.iter().map(|p| p.dev.0).collect();
        let fresh: Vec<DeviceIdx> = candidates
            .iter()
            .filter(|d| !existing.contains(&d.0))
            .copied()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let data_type = if cached {
            DataType::Cached
        } else {
            DataType::User
        };
        let new_ptrs = self.alloc.allocate(
            cx,
            &self.triggers,
            key.pos.inode,
            &fresh,
            1,
            data_type,
            u64::from(crc.compressed_sectors),
        )?;
        let target = new_ptrs
            .first()
            .copied()
            .ok_or(Error::NoSpace)?;
        self.devices
            .require(target.dev)?
            .write_sectors(cx, target.offset, &image)?;

        let pos = key.pos;
        commit_do(&self.sys, cx, &self.triggers, false, |txn, cx| {
            let Some(live) = txn.get(cx, BtreeId::Extents, pos)? else {
                return Ok(()); // extent moved underneath us
            };
            let BVal::Extent(mut val) = live.val.clone() else {
                return Ok(());
            };
            if val.ptrs.iter().any(|p| p.dev == target.dev) {
                return Ok(());
            }
            val.ptrs.push(ExtentPtr {
                cached,
                ..target
            });
            txn.update(cx, BtreeId::Extents, BKey::extent(pos, live.size, val))
        })?;
        debug!(
            target: "bch::io",
            event = "replica_added",
            pos = %pos,
            dev = target.dev.0,
            cached
        );
        Ok(())
    }

    /// Move the replica of `key` that lives on `dev` to a fresh
    /// location (possibly on the same device) — the copygc primitive.
    pub fn relocate_replica(
        &self,
        cx: &Cx,
        key: &BKey,
        dev: DeviceIdx,
        candidates: &[DeviceIdx],
    ) -> Result<()> {
        let BVal::Extent(extent) = &key.val else {
            return Err(Error::InvalidArgument("relocate wants an extent".into()));
        };
        let Some(old_ptr) = extent.ptrs.iter().find(|p| p.dev == dev).copied() else {
            return Ok(());
        };
        let crc = extent.crc;
        let image_bytes = crc.compressed_sectors as usize * 512;
        let nonce = Nonce::for_extent(
            key.pos.inode,
            key.pos.offset - u64::from(crc.offset),
            crc.nonce,
        );

        let mut image = vec![0_u8; image_bytes];
        let mut have_image = false;
        for ptr in &extent.ptrs {
            let Some(device) = self.devices.get(ptr.dev) else {
                continue;
            };
            if device.is_readable()
                && device.read_sectors(cx, ptr.offset, &mut image).is_ok()
                && self.decode_image(&crc, nonce, image.clone()).is_ok()
            {
                have_image = true;
                break;
            }
        }
        if !have_image {
            return Err(Error::UnrecoverableRead { pos: key.pos });
        }

        let data_type = if old_ptr.cached {
            DataType::Cached
        } else {
            DataType::User
        };
        let new_ptrs = self.alloc.allocate(
            cx,
            &self.triggers,
            key.pos.inode.wrapping_add(old_ptr.offset),
            candidates,
            1,
            data_type,
            u64::from(crc.compressed_sectors),
        )?;
        let target = new_ptrs.first().copied().ok_or(Error::NoSpace)?;
        self.devices
            .require(target.dev)?
            .write_sectors(cx, target.offset, &image)?;

        let pos = key.pos;
        commit_do(&self.sys, cx, &self.triggers, false, |txn, cx| {
            let Some(live) = txn.get(cx, BtreeId::Extents, pos)? else {
                return Ok(());
            };
            let BVal::Extent(mut val) = live.val.clone() else {
                return Ok(());
            };
            let Some(slot) = val.ptrs.iter_mut().find(|p| p.dev == dev && p.offset == old_ptr.offset)
            else {
                return Ok(()); // already moved
            };
            *slot = ExtentPtr {
                cached: old_ptr.cached,
                ..target
            };
            txn.update(cx, BtreeId::Extents, BKey::extent(pos, live.size, val))
        })
    }

    /// Drop the replica of `key` living on `dev` (device evacuation).
    pub fn drop_replica(&self, cx: &Cx, key: &BKey, dev: DeviceIdx) -> Result<()> {
        let pos = key.pos;
        commit_do(&self.sys, cx, &self.triggers, false, |txn, cx| {
            let Some(live) = txn.get(cx, BtreeId::Extents, pos)? else {
                return Ok(());
            };
            let BVal::Extent(mut val) = live.val.clone() else {
                return Ok(());
            };
            let before = val.ptrs.len();
            val.ptrs.retain(|p| p.dev != dev);
            if val.ptrs.len() == before {
                return Ok(());
            }
            if val.ptrs.is_empty() {
                return Err(Error::DataLossRisk(format!(
                    "dropping the last replica of {pos}"
                )));
            }
            txn.update(cx, BtreeId::Extents, BKey::extent(pos, live.size, val))
        })
    }
}

/// Rank function for reads that see exactly one snapshot (no
/// ancestors) — internal writes use this for read-modify-write.
#[must_use]
pub fn exact_snapshot_rank(snapshot: SnapshotId) -> impl Fn(u32) -> Option<u32> {
    move |s| (s == snapshot.0).then_some(0)
}

fn wall_clock_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ── Extent encryption ───────────────────────────────────────────────────────

fn cipher(key: &[u8; 32]) -> Result<ChaCha20Poly1305> {
    ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| Error::InvalidArgument("bad encryption key length".into()))
}

fn encrypt_in_place(key: &[u8; 32], nonce: Nonce, data: &mut [u8]) -> Result<Csum> {
    let tag = cipher(key)?
        .encrypt_in_place_detached(chacha20poly1305::Nonce::from_slice(&nonce.0), b"", data)
        .map_err(|_| Error::InvalidArgument("extent encryption failed".into()))?;
    let tag: [u8; 16] = tag.into();
    Ok(Csum {
        lo: u64::from_le_bytes(tag[..8].try_into().unwrap_or([0; 8])),
        hi: u64::from_le_bytes(tag[8..].try_into().unwrap_or([0; 8])),
    })
}

fn decrypt_in_place(key: &[u8; 32], nonce: Nonce, data: &mut [u8], stored: Csum) -> Result<()> {
    let mut tag = [0_u8; 16];
    tag[..8].copy_from_slice(&stored.lo.to_le_bytes());
    tag[8..].copy_from_slice(&stored.hi.to_le_bytes());
    cipher(key)?
        .decrypt_in_place_detached(
            chacha20poly1305::Nonce::from_slice(&nonce.0),
            b"",
            data,
            Tag::from_slice(&tag),
        )
        .map_err(|_| Error::ChecksumMismatch { dev: 0, sector: 0 })
}

#[cfg(test)]
mod tests;
