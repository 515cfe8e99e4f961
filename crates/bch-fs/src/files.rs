//! Files, directories, and path resolution.
//!
//! Dirents hash names into the position space (linear probing on
//! collision); lookups resolve snapshot visibility per key, so a
//! snapshot sees its ancestors' entries until it overrides them.

use crate::{DT_DIR, DT_REG, DT_SUBVOL, DT_WHITEOUT, Fs};
use asupersync::Cx;
use bch_error::{Error, Result};
use bch_io::WriteOpts;
use bch_txn::extents_overlapping;
use bch_types::keys::{DirentV, InodeV};
use bch_types::{
    BKey, BVal, BtreeId, DataType, Pos, SECTOR_SIZE, SnapshotId, Target,
};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Probe limit for dirent hash collisions.
const DIRENT_PROBES: u64 = 32;

/// Subvolume context a path resolves within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubvolCtx {
    pub subvol: u32,
    pub snapshot: SnapshotId,
    pub readonly: bool,
    pub root_inode: u64,
}

#[must_use]
pub fn dirent_hash(name: &[u8]) -> u64 {
    // Avoid the reserved offset 0 and the all-ones end sentinel.
    (xxhash_rust::xxh3::xxh3_64(name) | 1) & (u64::MAX >> 1)
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl Fs {
    /// Visibility ranking for reads at `snapshot`: each visible
    /// snapshot id maps to its depth along the ancestor chain; deeper
    /// is more specific.
    pub fn rank_fn(
        &self,
        cx: &Cx,
        snapshot: SnapshotId,
    ) -> Result<impl Fn(u32) -> Option<u32> + Send + Sync + 'static> {
        let mut chain = Vec::new();
        let mut cursor = snapshot.0;
        while cursor != 0 {
            chain.push(cursor);
            let node = self.snapshot_node(cx, SnapshotId(cursor))?;
            if chain.len() > 64 {
                return Err(Error::Fsck(format!(
                    "snapshot ancestry too deep or cyclic at {cursor}"
                )));
            }
            cursor = node.parent;
        }
        let depths: HashMap<u32, u32> = chain
            .iter()
            .rev()
            .enumerate()
            .map(|(depth, id)| (*id, u32::try_from(depth).unwrap_or(u32::MAX)))
            .collect();
        Ok(move |s: u32| depths.get(&s).copied())
    }

    /// The most specific visible inode value for `inum`.
    pub fn inode_get(
        &self,
        cx: &Cx,
        rank: &dyn Fn(u32) -> Option<u32>,
        inum: u64,
    ) -> Result<Option<InodeV>> {
        let mut best: Option<(u32, InodeV)> = None;
        let mut iter = self.sys.iter(BtreeId::Inodes, Pos::new(inum, 0));
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            if key.pos.inode != inum || key.pos.offset != 0 {
                break;
            }
            iter.advance(&key);
            let BVal::Inode(v) = &key.val else { continue };
            if let Some(depth) = rank(key.pos.snapshot) {
                if best.as_ref().map_or(true, |(d, _)| depth >= *d) {
                    best = Some((depth, v.clone()));
                }
            }
        }
        Ok(best.map(|(_, v)| v))
    }

    /// Look up `name` under directory `dir`.
    pub fn dirent_lookup(
        &self,
        cx: &Cx,
        rank: &dyn Fn(u32) -> Option<u32>,
        dir: u64,
        name: &[u8],
    ) -> Result<Option<DirentV>> {
        let base = dirent_hash(name);
        for probe in 0..DIRENT_PROBES {
            let offset = base.wrapping_add(probe);
            let mut best: Option<(u32, DirentV)> = None;
            let mut any_visible = false;
            let mut iter = self.sys.iter(BtreeId::Dirents, Pos::new(dir, offset));
            while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
                if key.pos.inode != dir || key.pos.offset != offset {
                    break;
                }
                iter.advance(&key);
                let BVal::Dirent(d) = &key.val else { continue };
                if let Some(depth) = rank(key.pos.snapshot) {
                    any_visible = true;
                    if best.as_ref().map_or(true, |(bd, _)| depth >= *bd) {
                        best = Some((depth, d.clone()));
                    }
                }
            }
            match best {
                // A tombstone with our name means the entry is absent
                // in this snapshot, ancestors notwithstanding.
                Some((_, d)) if d.name == name && d.d_type == DT_WHITEOUT => {
                    return Ok(None);
                }
                Some((_, d)) if d.name == name => return Ok(Some(d)),
                // A visible entry with another name: hash collision,
                // keep probing. Nothing visible at all ends the chain.
                Some(_) => continue,
                None if any_visible => continue,
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Create a dirent; fails if the name already resolves.
    pub fn dirent_create(
        &self,
        cx: &Cx,
        ctx: SubvolCtx,
        dir: u64,
        name: &[u8],
        target: u64,
        d_type: u8,
    ) -> Result<()> {
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        if self.dirent_lookup(cx, &rank, dir, name)?.is_some() {
            return Err(Error::Exists(String::from_utf8_lossy(name).into_owned()));
        }
        // First probe slot that is empty — or that holds a tombstone
        // for this very name, which the new entry overwrites.
        let base = dirent_hash(name);
        let mut slot = None;
        for probe in 0..DIRENT_PROBES {
            let offset = base.wrapping_add(probe);
            let mut best: Option<(u32, DirentV)> = None;
            let mut iter = self.sys.iter(BtreeId::Dirents, Pos::new(dir, offset));
            while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
                if key.pos.inode != dir || key.pos.offset != offset {
                    break;
                }
                iter.advance(&key);
                let BVal::Dirent(d) = &key.val else { continue };
                if let Some(depth) = rank(key.pos.snapshot) {
                    if best.as_ref().map_or(true, |(bd, _)| depth >= *bd) {
                        best = Some((depth, d.clone()));
                    }
                }
            }
            match best {
                None => {
                    slot = Some(offset);
                    break;
                }
                Some((_, d)) if d.name == name => {
                    slot = Some(offset);
                    break;
                }
                Some(_) => {}
            }
        }
        let offset = slot.ok_or_else(|| {
            Error::Fsck(format!(
                "dirent hash chain for {:?} exceeded {DIRENT_PROBES} probes",
                String::from_utf8_lossy(name)
            ))
        })?;

        let key = BKey::new(
            Pos::with_snapshot(dir, offset, ctx.snapshot),
            BVal::Dirent(DirentV {
                target,
                d_type,
                name: name.to_vec(),
            }),
        );
        self.commit(cx, |txn, cx| txn.update(cx, BtreeId::Dirents, key.clone()))
    }

    /// Create a regular file under `dir`. Returns the new inode.
    pub fn file_create(
        &self,
        cx: &Cx,
        ctx: SubvolCtx,
        dir: u64,
        name: &[u8],
        mode: u16,
    ) -> Result<u64> {
        if ctx.readonly {
            return Err(Error::ReadOnly);
        }
        let inum = self.fresh_inum();
        let now = now_nanos();
        let inode = InodeV {
            mode: 0o100_000 | (mode & 0o7777),
            nlink: 1,
            atime: now,
            mtime: now,
            ctime: now,
            subvol: ctx.subvol,
            ..InodeV::default()
        };
        self.commit(cx, |txn, cx| {
            txn.update(
                cx,
                BtreeId::Inodes,
                BKey::new(
                    Pos::with_snapshot(inum, 0, ctx.snapshot),
                    BVal::Inode(inode.clone()),
                ),
            )
        })?;
        self.dirent_create(cx, ctx, dir, name, inum, DT_REG)?;
        Ok(inum)
    }

    /// Create a directory under `dir`. Returns the new inode.
    pub fn mkdir(&self, cx: &Cx, ctx: SubvolCtx, dir: u64, name: &[u8]) -> Result<u64> {
        if ctx.readonly {
            return Err(Error::ReadOnly);
        }
        let inum = self.fresh_inum();
        let now = now_nanos();
        let inode = InodeV {
            mode: 0o040_755,
            nlink: 2,
            atime: now,
            mtime: now,
            ctime: now,
            subvol: ctx.subvol,
            ..InodeV::default()
        };
        self.commit(cx, |txn, cx| {
            txn.update(
                cx,
                BtreeId::Inodes,
                BKey::new(
                    Pos::with_snapshot(inum, 0, ctx.snapshot),
                    BVal::Inode(inode.clone()),
                ),
            )
        })?;
        self.dirent_create(cx, ctx, dir, name, inum, DT_DIR)?;
        Ok(inum)
    }

    /// Remove `name` from `dir`. In the snapshot that carried the
    /// entry itself this deletes the key; where an ancestor still
    /// carries it, a tombstone shadows it instead. The inode and
    /// extents stay until reclaim; fsck accounts them.
    pub fn unlink(&self, cx: &Cx, ctx: SubvolCtx, dir: u64, name: &[u8]) -> Result<()> {
        if ctx.readonly {
            return Err(Error::ReadOnly);
        }
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        let base = dirent_hash(name);
        for probe in 0..DIRENT_PROBES {
            let offset = base.wrapping_add(probe);
            let mut iter = self.sys.iter(BtreeId::Dirents, Pos::new(dir, offset));
            while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
                if key.pos.inode != dir || key.pos.offset != offset {
                    break;
                }
                iter.advance(&key);
                let BVal::Dirent(d) = &key.val else { continue };
                if d.name == name && rank(key.pos.snapshot).is_some() {
                    let pos = Pos::with_snapshot(dir, offset, ctx.snapshot);
                    let replacement = if key.pos.snapshot == ctx.snapshot {
                        BKey::deleted(pos)
                    } else {
                        BKey::new(
                            pos,
                            BVal::Dirent(DirentV {
                                target: 0,
                                d_type: DT_WHITEOUT,
                                name: name.to_vec(),
                            }),
                        )
                    };
                    return self.commit(cx, |txn, cx| {
                        txn.update(cx, BtreeId::Dirents, replacement.clone())
                    });
                }
            }
        }
        Err(Error::NotFound(String::from_utf8_lossy(name).into_owned()))
    }

    /// Visible entries of a directory.
    pub fn readdir(
        &self,
        cx: &Cx,
        ctx: SubvolCtx,
        dir: u64,
    ) -> Result<Vec<(Vec<u8>, u64, u8)>> {
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        let mut out: HashMap<u64, (u32, Option<DirentV>)> = HashMap::new();
        let mut iter = self.sys.iter(BtreeId::Dirents, Pos::new(dir, 0));
        while let Some(key) = self.sys.iter_peek(cx, &mut iter)? {
            if key.pos.inode != dir {
                break;
            }
            iter.advance(&key);
            let Some(depth) = rank(key.pos.snapshot) else {
                continue;
            };
            let entry = out.entry(key.pos.offset).or_insert((0, None));
            if entry.1.is_none() || depth >= entry.0 {
                let value = match &key.val {
                    BVal::Dirent(d) => Some(d.clone()),
                    _ => None, // whiteout in a more specific snapshot
                };
                *entry = (depth, value);
            }
        }
        let mut entries: Vec<(Vec<u8>, u64, u8)> = out
            .into_values()
            .filter_map(|(_, d)| d)
            .filter(|d| d.d_type != DT_WHITEOUT)
            .map(|d| (d.name, d.target, d.d_type))
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// Resolve an absolute path from the root subvolume, crossing
    /// subvolume boundaries. Returns the final context and inode.
    pub fn resolve_path(&self, cx: &Cx, path: &str) -> Result<(SubvolCtx, u64)> {
        let mut ctx = self.subvol_ctx(cx, 1)?;
        let mut inum = ctx.root_inode;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let rank = self.rank_fn(cx, ctx.snapshot)?;
            let dirent = self
                .dirent_lookup(cx, &rank, inum, part.as_bytes())?
                .ok_or_else(|| Error::NotFound(path.to_owned()))?;
            if dirent.d_type == DT_SUBVOL {
                let subvol = u32::try_from(dirent.target)
                    .map_err(|_| Error::Fsck("subvolume dirent target overflow".into()))?;
                ctx = self.subvol_ctx(cx, subvol)?;
                inum = ctx.root_inode;
            } else {
                inum = dirent.target;
            }
        }
        Ok((ctx, inum))
    }

    /// Split a path into its parent directory and final component,
    /// resolving the parent.
    pub fn resolve_parent<'p>(
        &self,
        cx: &Cx,
        path: &'p str,
    ) -> Result<(SubvolCtx, u64, &'p str)> {
        let trimmed = path.trim_end_matches('/');
        let (parent, name) = match trimmed.rfind('/') {
            Some(split) => (&trimmed[..split], &trimmed[split + 1..]),
            None => ("", trimmed),
        };
        if name.is_empty() {
            return Err(Error::InvalidArgument(format!("invalid path {path:?}")));
        }
        let (ctx, dir) = self.resolve_path(cx, parent)?;
        Ok((ctx, dir, name))
    }

    // ── Data plane ──────────────────────────────────────────────────

    /// Effective write policy for one inode: filesystem defaults with
    /// the inode's option overrides applied.
    pub fn write_opts_for(
        &self,
        cx: &Cx,
        ctx: SubvolCtx,
        inum: u64,
    ) -> Result<(WriteOpts, InodeV)> {
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        let inode = self.inode_get(cx, &rank, inum)?.unwrap_or_default();

        let compression = inode
            .compression
            .map(bch_types::CompressionType::from_u8)
            .transpose()?
            .unwrap_or_else(|| self.opts.compression());
        let csum_type = inode
            .data_checksum
            .map(bch_types::ChecksumType::from_u8)
            .transpose()?
            .unwrap_or_else(|| self.opts.data_checksum_type());
        let nr_replicas = inode.data_replicas.unwrap_or_else(|| self.opts.data_replicas());
        let target = inode
            .foreground_target
            .map(Target::from_u32)
            .unwrap_or_else(|| self.opts.foreground_target());
        let devs = self.write_candidates(target, DataType::User);

        Ok((
            WriteOpts {
                compression,
                csum_type,
                nr_replicas,
                nr_required: 1,
                devs,
                stream: inum,
                snapshot: ctx.snapshot,
                cached: false,
                inherit_inode: Some(inode.clone()),
            },
            inode,
        ))
    }

    /// Write file data.
    pub fn file_write(
        &self,
        cx: &Cx,
        ctx: SubvolCtx,
        inum: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.check_writable()?;
        if ctx.readonly {
            return Err(Error::ReadOnly);
        }
        let (opts, _) = self.write_opts_for(cx, ctx, inum)?;
        if opts.devs.is_empty() {
            return Err(Error::NoSpace);
        }
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        self.io
            .write_file_range(cx, inum, &rank, offset, data, &opts)?;
        self.kick_workers();
        Ok(())
    }

    /// Read file data; short reads past end-of-file. When a promote
    /// target is configured, touched extents gain a cached copy there.
    pub fn file_read(
        &self,
        cx: &Cx,
        ctx: SubvolCtx,
        inum: u64,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        let size = self
            .inode_get(cx, &rank, inum)?
            .map(|i| i.size)
            .unwrap_or(0);
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = len.min(usize::try_from(size - offset).unwrap_or(usize::MAX));
        let out = self.io.read_file_range(cx, inum, &rank, offset, len)?;
        self.maybe_promote(cx, ctx, inum, offset, len as u64);
        Ok(out)
    }

    /// Best-effort promote: add cached copies of the extents just read
    /// to the promote target, skipping extents that already have one.
    fn maybe_promote(&self, cx: &Cx, ctx: SubvolCtx, inum: u64, offset: u64, len: u64) {
        let target = self.opts.promote_target();
        if target.is_none() || self.is_read_only() {
            return;
        }
        let devs = self.write_candidates(target, DataType::Cached);
        if devs.is_empty() {
            return;
        }
        let Ok(rank) = self.rank_fn(cx, ctx.snapshot) else {
            return;
        };
        let start = offset / u64::from(SECTOR_SIZE);
        let end = (offset + len).div_ceil(u64::from(SECTOR_SIZE));
        let Ok(keys) = extents_overlapping(&self.sys, cx, BtreeId::Extents, inum, 0, start, end)
        else {
            return;
        };
        for key in keys {
            if rank(key.pos.snapshot).is_none() {
                continue;
            }
            let bch_types::BVal::Extent(e) = &key.val else {
                continue;
            };
            if e.ptrs.iter().any(|p| devs.contains(&p.dev)) {
                continue; // already promoted
            }
            // Promotion failures never fail the read.
            let _ = self.io.add_replica(cx, &key, &devs, true);
        }
    }

    /// Truncate a file: drop extents past the new size.
    pub fn file_truncate(&self, cx: &Cx, ctx: SubvolCtx, inum: u64, new_size: u64) -> Result<()> {
        self.check_writable()?;
        if ctx.readonly {
            return Err(Error::ReadOnly);
        }
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        let inode = self
            .inode_get(cx, &rank, inum)?
            .ok_or_else(|| Error::NotFound(format!("inode {inum}")))?;
        let start_sector = new_size.div_ceil(u64::from(SECTOR_SIZE));
        self.commit(cx, |txn, cx| {
            txn.delete_range(
                cx,
                BtreeId::Extents,
                Pos::with_snapshot(inum, start_sector, ctx.snapshot),
                Pos::with_snapshot(inum, u64::MAX, ctx.snapshot),
            )?;
            let mut updated = inode.clone();
            updated.size = new_size;
            updated.ctime = now_nanos();
            txn.update(
                cx,
                BtreeId::Inodes,
                BKey::new(
                    Pos::with_snapshot(inum, 0, ctx.snapshot),
                    BVal::Inode(updated),
                ),
            )
        })
    }

    /// All extents of one file visible from `ctx`, for data jobs.
    pub fn file_extents(&self, cx: &Cx, ctx: SubvolCtx, inum: u64) -> Result<Vec<BKey>> {
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        let keys = extents_overlapping(&self.sys, cx, BtreeId::Extents, inum, 0, 0, u64::MAX)?;
        Ok(keys
            .into_iter()
            .filter(|k| rank(k.pos.snapshot).is_some())
            .collect())
    }
}
