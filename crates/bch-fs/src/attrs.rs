//! Per-inode option overrides via the attribute namespace.
//!
//! Options with inode scope are settable through extended attributes
//! under the `bcachefs.` prefix. Setting one on a directory propagates
//! to every descendant that has not set the option itself — the
//! re-inherit rule, applied recursively.

use crate::files::SubvolCtx;
use crate::{DT_DIR, Fs};
use asupersync::Cx;
use bch_error::{Error, Result};
use bch_types::keys::InodeV;
use bch_types::{BKey, BVal, BtreeId, Pos, Target};
use std::time::{SystemTime, UNIX_EPOCH};

/// Namespace prefix of the option attributes.
pub const XATTR_PREFIX: &str = "bcachefs.";

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Inode-scoped options, in `explicit`-bitmask order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeOpt {
    Compression = 0,
    DataChecksum = 1,
    DataReplicas = 2,
    ForegroundTarget = 3,
    BackgroundTarget = 4,
    PromoteTarget = 5,
}

impl InodeOpt {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "compression" => Ok(Self::Compression),
            "data_checksum_type" => Ok(Self::DataChecksum),
            "data_replicas" => Ok(Self::DataReplicas),
            "foreground_target" => Ok(Self::ForegroundTarget),
            "background_target" => Ok(Self::BackgroundTarget),
            "promote_target" => Ok(Self::PromoteTarget),
            _ => Err(Error::InvalidArgument(format!(
                "{name:?} is not an inode-scoped option"
            ))),
        }
    }

    #[must_use]
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    fn copy(self, from: &InodeV, to: &mut InodeV) {
        match self {
            Self::Compression => to.compression = from.compression,
            Self::DataChecksum => to.data_checksum = from.data_checksum,
            Self::DataReplicas => to.data_replicas = from.data_replicas,
            Self::ForegroundTarget => to.foreground_target = from.foreground_target,
            Self::BackgroundTarget => to.background_target = from.background_target,
            Self::PromoteTarget => to.promote_target = from.promote_target,
        }
    }

    fn set_from_str(self, fs: &Fs, inode: &mut InodeV, value: &str) -> Result<()> {
        let mut parse_target = |s: &str| -> Result<Option<u32>> {
            if s.is_empty() || s == "none" {
                return Ok(None);
            }
            let sb = fs.sb();
            Ok(Some(bch_super::parse_target(&sb, &[], s)?.to_u32()))
        };
        match self {
            Self::Compression => {
                inode.compression = match value {
                    "" | "inherit" => None,
                    "none" => Some(0),
                    "lz4" => Some(1),
                    "gzip" => Some(2),
                    "zstd" => Some(3),
                    _ => {
                        return Err(Error::InvalidArgument(format!(
                            "unknown compression {value:?}"
                        )));
                    }
                };
            }
            Self::DataChecksum => {
                inode.data_checksum = match value {
                    "" | "inherit" => None,
                    "none" => Some(0),
                    "crc32c" => Some(1),
                    "crc64" => Some(2),
                    "xxh3" => Some(3),
                    _ => {
                        return Err(Error::InvalidArgument(format!(
                            "unknown checksum type {value:?}"
                        )));
                    }
                };
            }
            Self::DataReplicas => {
                inode.data_replicas = match value {
                    "" | "inherit" => None,
                    v => {
                        let n: u8 = v.parse().map_err(|_| {
                            Error::InvalidArgument(format!("bad replica count {value:?}"))
                        })?;
                        if !(1..=4).contains(&n) {
                            return Err(Error::InvalidArgument(
                                "replicas must be in 1..=4".into(),
                            ));
                        }
                        Some(n)
                    }
                };
            }
            Self::ForegroundTarget => inode.foreground_target = parse_target(value)?,
            Self::BackgroundTarget => inode.background_target = parse_target(value)?,
            Self::PromoteTarget => inode.promote_target = parse_target(value)?,
        }
        Ok(())
    }

    fn render(self, inode: &InodeV) -> Option<String> {
        match self {
            Self::Compression => inode.compression.map(|v| {
                bch_types::CompressionType::from_u8(v)
                    .map(|c| c.as_str().to_owned())
                    .unwrap_or_else(|_| v.to_string())
            }),
            Self::DataChecksum => inode.data_checksum.map(|v| {
                bch_types::ChecksumType::from_u8(v)
                    .map(|c| c.as_str().to_owned())
                    .unwrap_or_else(|_| v.to_string())
            }),
            Self::DataReplicas => inode.data_replicas.map(|v| v.to_string()),
            Self::ForegroundTarget => inode.foreground_target.map(|v| Target::from_u32(v).to_string()),
            Self::BackgroundTarget => inode.background_target.map(|v| Target::from_u32(v).to_string()),
            Self::PromoteTarget => inode.promote_target.map(|v| Target::from_u32(v).to_string()),
        }
    }
}

impl Fs {
    /// Set a `bcachefs.` option attribute at `path`. On directories
    /// the value propagates into descendants under the re-inherit
    /// rule.
    pub fn setattr(&self, cx: &Cx, path: &str, attr_name: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        let opt_name = attr_name
            .strip_prefix(XATTR_PREFIX)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "attribute {attr_name:?} is outside the {XATTR_PREFIX} namespace"
                ))
            })?;
        let opt = InodeOpt::parse(opt_name)?;
        let (ctx, inum) = self.resolve_path(cx, path)?;
        if ctx.readonly {
            return Err(Error::ReadOnly);
        }
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        let mut inode = self
            .inode_get(cx, &rank, inum)?
            .ok_or_else(|| Error::NotFound(path.to_owned()))?;

        opt.set_from_str(self, &mut inode, value)?;
        let clearing = matches!(value, "" | "inherit");
        if clearing {
            inode.explicit &= !opt.bit();
        } else {
            inode.explicit |= opt.bit();
        }
        inode.ctime = now_nanos();
        let is_dir = inode.mode & 0o170_000 == 0o040_000;
        let snapshot = ctx.snapshot;
        self.commit(cx, |txn, cx| {
            txn.update(
                cx,
                BtreeId::Inodes,
                BKey::new(
                    Pos::with_snapshot(inum, 0, snapshot),
                    BVal::Inode(inode.clone()),
                ),
            )
        })?;

        if is_dir {
            self.reinherit_attrs(cx, ctx, inum)?;
        }
        Ok(())
    }

    /// Read a `bcachefs.` option attribute at `path`.
    pub fn getattr(&self, cx: &Cx, path: &str, attr_name: &str) -> Result<Option<String>> {
        let opt_name = attr_name
            .strip_prefix(XATTR_PREFIX)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown namespace in {attr_name:?}")))?;
        let opt = InodeOpt::parse(opt_name)?;
        let (ctx, inum) = self.resolve_path(cx, path)?;
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        let inode = self
            .inode_get(cx, &rank, inum)?
            .ok_or_else(|| Error::NotFound(path.to_owned()))?;
        Ok(opt.render(&inode))
    }

    /// Recursively propagate a directory's option overrides into
    /// descendants that have not set the option themselves.
    pub fn reinherit_attrs(&self, cx: &Cx, ctx: SubvolCtx, dir_inum: u64) -> Result<u64> {
        self.check_writable()?;
        let rank = self.rank_fn(cx, ctx.snapshot)?;
        let dir = self
            .inode_get(cx, &rank, dir_inum)?
            .ok_or_else(|| Error::NotFound(format!("inode {dir_inum}")))?;

        let all_opts = [
            InodeOpt::Compression,
            InodeOpt::DataChecksum,
            InodeOpt::DataReplicas,
            InodeOpt::ForegroundTarget,
            InodeOpt::BackgroundTarget,
            InodeOpt::PromoteTarget,
        ];

        let mut updated = 0_u64;
        for (_name, target, d_type) in self.readdir(cx, ctx, dir_inum)? {
            if d_type == crate::DT_SUBVOL {
                continue; // subvolume boundaries end propagation
            }
            let Some(mut child) = self.inode_get(cx, &rank, target)? else {
                continue;
            };
            let mut changed = false;
            for opt in all_opts {
                if child.explicit & opt.bit() != 0 {
                    continue;
                }
                let before = child.clone();
                opt.copy(&dir, &mut child);
                if child != before {
                    changed = true;
                }
            }
            if changed {
                child.ctime = now_nanos();
                let snapshot = ctx.snapshot;
                let value = child.clone();
                self.commit(cx, |txn, cx| {
                    txn.update(
                        cx,
                        BtreeId::Inodes,
                        BKey::new(
                            Pos::with_snapshot(target, 0, snapshot),
                            BVal::Inode(value.clone()),
                        ),
                    )
                })?;
                updated += 1;
            }
            if d_type == DT_DIR {
                updated += self.reinherit_attrs(cx, ctx, target)?;
            }
        }
        Ok(updated)
    }
}
