//! Mount-helper support.
//!
//! The mount helper accepts either a block device path or a filesystem
//! UUID. Given a UUID it enumerates candidate block devices, reads each
//! one's superblock, collects the matches, and hands the mount
//! primitive a colon-joined device list.

use asupersync::Cx;
use bch_block::FileByteDevice;
use bch_error::{Error, Result};
use bch_super::read_super;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// What a mount source string names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// One or more explicit device paths, colon-separated.
    Devices(Vec<PathBuf>),
    /// An external UUID to search for.
    Uuid(Uuid),
}

/// Parse a mount source: a UUID if it parses as one, else a (possibly
/// colon-joined) device list.
#[must_use]
pub fn parse_mount_source(source: &str) -> MountSource {
    match Uuid::parse_str(source) {
        Ok(uuid) => MountSource::Uuid(uuid),
        Err(_) => MountSource::Devices(source.split(':').map(PathBuf::from).collect()),
    }
}

/// Candidate block devices in a directory (`/dev` in production; tests
/// point this at a scratch directory).
pub fn enumerate_block_devices(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() || path.metadata().map(|m| !m.is_dir()).unwrap_or(false) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// The member devices of the filesystem with external UUID `uuid`
/// among `candidates`, in member order where readable.
pub fn devices_with_uuid(cx: &Cx, uuid: Uuid, candidates: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut matches: Vec<(u32, PathBuf)> = Vec::new();
    for path in candidates {
        let Ok(dev) = FileByteDevice::open(path) else {
            continue;
        };
        match read_super(cx, &dev) {
            Ok(sb) if sb.user_uuid == uuid => {
                debug!(
                    target: "bch::mount",
                    event = "member_found",
                    path = %path.display(),
                    dev_idx = sb.dev_idx
                );
                matches.push((sb.dev_idx, path.clone()));
            }
            _ => {}
        }
    }
    matches.sort();
    matches.dedup_by(|a, b| a.0 == b.0);
    Ok(matches.into_iter().map(|(_, p)| p).collect())
}

/// Resolve a mount source into the colon-joined device list handed to
/// the mount primitive.
pub fn resolve_mount_source(cx: &Cx, source: &str, search_dir: &Path) -> Result<String> {
    let paths = match parse_mount_source(source) {
        MountSource::Devices(paths) => paths,
        MountSource::Uuid(uuid) => {
            let candidates = enumerate_block_devices(search_dir)?;
            let found = devices_with_uuid(cx, uuid, &candidates)?;
            if found.is_empty() {
                return Err(Error::NotFound(format!("no devices with UUID {uuid}")));
            }
            found
        }
    };
    Ok(paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":"))
}
