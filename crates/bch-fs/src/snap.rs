//! Subvolumes and snapshots.
//!
//! A subvolume is a named root inode with its own snapshot identity.
//! Snapshotting splits the source's snapshot node into two children:
//! the source keeps writing under one, the snapshot reads under the
//! other, and every key written before the split is an ancestor both
//! can see.

use crate::files::SubvolCtx;
use crate::{DT_SUBVOL, Fs, ROOT_INUM};
use asupersync::Cx;
use bch_error::{Error, Result};
use bch_types::keys::{InodeV, SnapshotV, SubvolumeV, snapshot_pos, subvolume_pos};
use bch_types::{BKey, BVal, BtreeId, Pos, SnapshotId};

impl Fs {
    /// One snapshot-tree node.
    pub fn snapshot_node(&self, cx: &Cx, id: SnapshotId) -> Result<SnapshotV> {
        let pos = snapshot_pos(id);
        let mut iter = self.sys.iter(BtreeId::Snapshots, pos);
        match self.sys.iter_peek(cx, &mut iter)? {
            Some(key) if key.pos == pos => match key.val {
                BVal::Snapshot(s) => Ok(s),
                _ => Err(Error::CorruptMetadata {
                    btree: BtreeId::Snapshots,
                    pos,
                    detail: "snapshots btree holds a non-snapshot key".into(),
                }),
            },
            _ => Err(Error::NotFound(format!("snapshot {}", id.0))),
        }
    }

    /// One subvolume record.
    pub fn subvolume_get(&self, cx: &Cx, subvol: u32) -> Result<SubvolumeV> {
        let pos = subvolume_pos(subvol);
        let mut iter = self.sys.iter(BtreeId::Subvolumes, pos);
        match self.sys.iter_peek(cx, &mut iter)? {
            Some(key) if key.pos == pos => match key.val {
                BVal::Subvolume(s) => Ok(s),
                _ => Err(Error::CorruptMetadata {
                    btree: BtreeId::Subvolumes,
                    pos,
                    detail: "subvolumes btree holds a non-subvolume key".into(),
                }),
            },
            _ => Err(Error::NotFound(format!("subvolume {subvol}"))),
        }
    }

    /// Resolve a subvolume id into its working context.
    pub fn subvol_ctx(&self, cx: &Cx, subvol: u32) -> Result<SubvolCtx> {
        let v = self.subvolume_get(cx, subvol)?;
        Ok(SubvolCtx {
            subvol,
            snapshot: SnapshotId(v.snapshot),
            readonly: v.readonly,
            root_inode: v.root_inode,
        })
    }

    /// Create a fresh, empty subvolume at `path`.
    pub fn subvolume_create(&self, cx: &Cx, path: &str) -> Result<u32> {
        self.check_writable()?;
        let (parent_ctx, dir, name) = self.resolve_parent(cx, path)?;
        if parent_ctx.readonly {
            return Err(Error::ReadOnly);
        }

        let subvol = self.fresh_subvol_id();
        let snapshot = self.fresh_snapshot_id();
        let root_inode = self.fresh_inum();
        let now = crate::attrs::now_nanos();

        self.commit(cx, |txn, cx| {
            txn.update(
                cx,
                BtreeId::Snapshots,
                BKey::new(
                    snapshot_pos(snapshot),
                    BVal::Snapshot(SnapshotV {
                        parent: 0,
                        children: [0, 0],
                        subvol,
                    }),
                ),
            )?;
            txn.update(
                cx,
                BtreeId::Subvolumes,
                BKey::new(
                    subvolume_pos(subvol),
                    BVal::Subvolume(SubvolumeV {
                        root_inode,
                        snapshot: snapshot.0,
                        readonly: false,
                    }),
                ),
            )?;
            txn.update(
                cx,
                BtreeId::Inodes,
                BKey::new(
                    Pos::with_snapshot(root_inode, 0, snapshot),
                    BVal::Inode(InodeV {
                        mode: 0o040_755,
                        nlink: 2,
                        atime: now,
                        mtime: now,
                        ctime: now,
                        subvol,
                        ..InodeV::default()
                    }),
                ),
            )
        })?;
        self.dirent_create(cx, parent_ctx, dir, name.as_bytes(), u64::from(subvol), DT_SUBVOL)?;
        Ok(subvol)
    }

    /// Snapshot `src_path` (a subvolume) at `dst_path`.
    ///
    /// The source's snapshot node gets two children: the source moves
    /// to one and keeps writing, the new subvolume reads the other.
    pub fn subvolume_snapshot(
        &self,
        cx: &Cx,
        src_path: &str,
        dst_path: &str,
        readonly: bool,
    ) -> Result<u32> {
        self.check_writable()?;
        let src_subvol = self.subvol_at_path(cx, src_path)?;
        let src = self.subvolume_get(cx, src_subvol)?;
        let (dst_parent, dst_dir, dst_name) = self.resolve_parent(cx, dst_path)?;
        if dst_parent.readonly {
            return Err(Error::ReadOnly);
        }

        let old_snap = SnapshotId(src.snapshot);
        let src_snap = self.fresh_snapshot_id();
        let new_snap = self.fresh_snapshot_id();
        let new_subvol = self.fresh_subvol_id();

        self.commit(cx, |txn, cx| {
            // The old snapshot becomes an interior node with two
            // children; both see everything written before the split.
            let mut old_node = self.snapshot_node(cx, old_snap)?;
            old_node.children = [src_snap.0, new_snap.0];
            txn.update(
                cx,
                BtreeId::Snapshots,
                BKey::new(snapshot_pos(old_snap), BVal::Snapshot(old_node)),
            )?;
            txn.update(
                cx,
                BtreeId::Snapshots,
                BKey::new(
                    snapshot_pos(src_snap),
                    BVal::Snapshot(SnapshotV {
                        parent: old_snap.0,
                        children: [0, 0],
                        subvol: src_subvol,
                    }),
                ),
            )?;
            txn.update(
                cx,
                BtreeId::Snapshots,
                BKey::new(
                    snapshot_pos(new_snap),
                    BVal::Snapshot(SnapshotV {
                        parent: old_snap.0,
                        children: [0, 0],
                        subvol: new_subvol,
                    }),
                ),
            )?;
            txn.update(
                cx,
                BtreeId::Subvolumes,
                BKey::new(
                    subvolume_pos(src_subvol),
                    BVal::Subvolume(SubvolumeV {
                        snapshot: src_snap.0,
                        ..src
                    }),
                ),
            )?;
            txn.update(
                cx,
                BtreeId::Subvolumes,
                BKey::new(
                    subvolume_pos(new_subvol),
                    BVal::Subvolume(SubvolumeV {
                        root_inode: src.root_inode,
                        snapshot: new_snap.0,
                        readonly,
                    }),
                ),
            )
        })?;
        self.dirent_create(
            cx,
            dst_parent,
            dst_dir,
            dst_name.as_bytes(),
            u64::from(new_subvol),
            DT_SUBVOL,
        )?;
        Ok(new_subvol)
    }

    /// Delete a subvolume: remove its record and name. Its keys are
    /// reclaimed by maintenance once no snapshot references them.
    pub fn subvolume_destroy(&self, cx: &Cx, path: &str) -> Result<()> {
        self.check_writable()?;
        let subvol = self.subvol_at_path(cx, path)?;
        if subvol == 1 {
            return Err(Error::InvalidArgument(
                "cannot destroy the root subvolume".into(),
            ));
        }
        let (parent_ctx, dir, name) = self.resolve_parent(cx, path)?;
        self.unlink(cx, parent_ctx, dir, name.as_bytes())?;
        self.commit(cx, |txn, cx| {
            txn.delete(cx, BtreeId::Subvolumes, subvolume_pos(subvol))
        })
    }

    /// The subvolume a path names. `/` is the root subvolume.
    pub fn subvol_at_path(&self, cx: &Cx, path: &str) -> Result<u32> {
        if path.split('/').all(str::is_empty) {
            return Ok(1);
        }
        let (parent_ctx, dir, name) = self.resolve_parent(cx, path)?;
        let rank = self.rank_fn(cx, parent_ctx.snapshot)?;
        let dirent = self
            .dirent_lookup(cx, &rank, dir, name.as_bytes())?
            .ok_or_else(|| Error::NotFound(path.to_owned()))?;
        if dirent.d_type != DT_SUBVOL {
            return Err(Error::InvalidArgument(format!(
                "{path:?} is not a subvolume"
            )));
        }
        u32::try_from(dirent.target)
            .map_err(|_| Error::Fsck("subvolume dirent target overflow".into()))
    }

    /// Root inode for external consumers (the mount surface).
    #[must_use]
    pub fn root_inum(&self) -> u64 {
        ROOT_INUM
    }
}
