//! Target resolution.
//!
//! A target string names either a member device (by path or index) or a
//! disk-group label; callers store the compact `u32` encoding from
//! `bch_types::Target`.

use crate::groups::{disk_path_find, group_and_ancestors};
use bch_error::{Error, Result};
use bch_ondisk::sb::Superblock;
use bch_types::{DeviceIdx, MemberState, Target};
use std::path::Path;

/// Resolve a target string against the member table and group tree.
///
/// Accepted forms: empty/"none" (no target), a bare member index, a
/// device path known to the caller's path table, or a dotted group
/// label.
pub fn parse_target(
    sb: &Superblock,
    dev_paths: &[(DeviceIdx, &Path)],
    s: &str,
) -> Result<Target> {
    if s.is_empty() || s == "none" {
        return Ok(Target::None);
    }

    for (idx, path) in dev_paths {
        if Path::new(s) == *path {
            return Ok(Target::Device(idx.0));
        }
    }

    if let Ok(idx) = s.parse::<u32>() {
        if (idx as usize) < sb.members.len() {
            return Ok(Target::Device(idx));
        }
    }

    if let Some(group) = disk_path_find(sb, s) {
        return Ok(Target::Group(group));
    }

    Err(Error::InvalidArgument(format!("invalid target {s:?}")))
}

/// The member devices a target selects, in member order. Only devices
/// in the given states are returned; `Target::None` selects every
/// candidate.
#[must_use]
pub fn target_devices(sb: &Superblock, target: Target, states: &[MemberState]) -> Vec<DeviceIdx> {
    let member_matches = |idx: usize| -> bool {
        sb.members
            .get(idx)
            .map(|m| states.contains(&m.state) && m.nbuckets > 0)
            .unwrap_or(false)
    };

    match target {
        Target::None => (0..sb.members.len())
            .filter(|&i| member_matches(i))
            .filter_map(|i| u32::try_from(i).ok().map(DeviceIdx))
            .collect(),
        Target::Device(idx) => {
            if member_matches(idx as usize) {
                vec![DeviceIdx(idx)]
            } else {
                vec![]
            }
        }
        Target::Group(group) => (0..sb.members.len())
            .filter(|&i| member_matches(i))
            .filter(|&i| {
                sb.members[i]
                    .group
                    .checked_sub(1)
                    .map(|g| group_and_ancestors(sb, g).contains(&group))
                    .unwrap_or(false)
            })
            .filter_map(|i| u32::try_from(i).ok().map(DeviceIdx))
            .collect(),
    }
}
