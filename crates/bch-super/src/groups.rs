//! Disk-group tree.
//!
//! Groups are nested labels forming a dotted hierarchy: `a.b.c` names a
//! group `c` under `b` under `a`, and creating it creates the parents.
//! Group indices are stable once allocated; `parent` links are
//! one-based with zero meaning top level.

use bch_error::{Error, Result};
use bch_ondisk::sb::{DiskGroup, Superblock};

/// Find a group by its dotted path. Returns the zero-based group index.
#[must_use]
pub fn disk_path_find(sb: &Superblock, path: &str) -> Option<u32> {
    let mut parent = 0_u32; // one-based; 0 = top level
    let mut found = None;
    for part in path.split('.') {
        let idx = sb
            .groups
            .iter()
            .position(|g| !g.deleted && g.parent == parent && g.label == part)?;
        let idx = u32::try_from(idx).ok()?;
        found = Some(idx);
        parent = idx + 1;
    }
    found
}

/// Find a group by its dotted path, creating it (and any missing
/// ancestors) if absent. Returns the zero-based group index.
pub fn disk_path_find_or_create(sb: &mut Superblock, path: &str) -> Result<u32> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(Error::InvalidArgument(format!(
            "invalid disk group path {path:?}"
        )));
    }

    let mut parent = 0_u32;
    let mut found = 0_u32;
    for part in path.split('.') {
        let existing = sb
            .groups
            .iter()
            .position(|g| !g.deleted && g.parent == parent && g.label == part);
        let idx = match existing {
            Some(idx) => u32::try_from(idx)
                .map_err(|_| Error::InvalidArgument("group table overflow".into()))?,
            None => {
                // Reuse a deleted slot when one exists.
                let slot = sb.groups.iter().position(|g| g.deleted);
                let group = DiskGroup {
                    label: part.to_owned(),
                    parent,
                    deleted: false,
                };
                match slot {
                    Some(slot) => {
                        sb.groups[slot] = group;
                        u32::try_from(slot)
                            .map_err(|_| Error::InvalidArgument("group table overflow".into()))?
                    }
                    None => {
                        sb.groups.push(group);
                        u32::try_from(sb.groups.len() - 1)
                            .map_err(|_| Error::InvalidArgument("group table overflow".into()))?
                    }
                }
            }
        };
        found = idx;
        parent = idx + 1;
    }
    Ok(found)
}

/// The full dotted path of a group, walking parent links.
pub fn group_path(sb: &Superblock, idx: u32) -> Result<String> {
    let mut parts = Vec::new();
    let mut cursor = Some(idx);
    let mut hops = 0;
    while let Some(idx) = cursor {
        let group = sb
            .groups
            .get(idx as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("group index {idx} out of range")))?;
        parts.push(group.label.clone());
        cursor = group.parent.checked_sub(1);
        hops += 1;
        if hops > sb.groups.len() {
            return Err(Error::Fsck(format!("disk group cycle at index {idx}")));
        }
    }
    parts.reverse();
    Ok(parts.join("."))
}

/// `group_idx` and every group nested beneath it.
#[must_use]
pub fn group_and_descendants(sb: &Superblock, group_idx: u32) -> Vec<u32> {
    let mut out = vec![group_idx];
    let mut cursor = 0;
    while cursor < out.len() {
        let parent = out[cursor] + 1;
        for (i, g) in sb.groups.iter().enumerate() {
            if !g.deleted && g.parent == parent {
                if let Ok(i) = u32::try_from(i) {
                    out.push(i);
                }
            }
        }
        cursor += 1;
    }
    out
}

/// `group_idx` and every ancestor up to the top level.
#[must_use]
pub fn group_and_ancestors(sb: &Superblock, group_idx: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut cursor = Some(group_idx);
    while let Some(idx) = cursor {
        if out.contains(&idx) {
            break; // cycle guard; fsck reports it
        }
        out.push(idx);
        cursor = sb
            .groups
            .get(idx as usize)
            .and_then(|g| g.parent.checked_sub(1));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bch_ondisk::sb::{SbLayout, SbOpts, Superblock};
    use bch_types::ChecksumType;
    use uuid::Uuid;

    fn empty_sb() -> Superblock {
        Superblock {
            version: bch_ondisk::sb::SB_VERSION,
            csum_type: ChecksumType::Crc32c,
            encryption_type: 0,
            seq: 0,
            uuid: Uuid::nil(),
            user_uuid: Uuid::nil(),
            label: String::new(),
            block_size: 4096,
            dev_idx: 0,
            time_base_lo: 0,
            time_precision: 1,
            features: 0,
            compat_features: 0,
            foreground_target: 0,
            background_target: 0,
            promote_target: 0,
            metadata_target: 0,
            opts: SbOpts::default(),
            layout: SbLayout {
                sb_max_size_bits: 6,
                offsets: vec![8],
            },
            members: vec![],
            groups: vec![],
            crypt: None,
            journal_buckets: vec![],
            blacklist: vec![],
            roots: vec![],
        }
    }

    #[test]
    fn nested_create_makes_parents() {
        let mut sb = empty_sb();
        let idx = disk_path_find_or_create(&mut sb, "a.b.c").unwrap();
        assert_eq!(sb.groups.len(), 3);
        assert_eq!(group_path(&sb, idx).unwrap(), "a.b.c");
        assert_eq!(disk_path_find(&sb, "a.b.c"), Some(idx));
        assert!(disk_path_find(&sb, "a.b").is_some());
        assert!(disk_path_find(&sb, "a").is_some());
        assert_eq!(disk_path_find(&sb, "b"), None);
    }

    #[test]
    fn create_is_idempotent() {
        let mut sb = empty_sb();
        let first = disk_path_find_or_create(&mut sb, "hdd.shelf1").unwrap();
        let second = disk_path_find_or_create(&mut sb, "hdd.shelf1").unwrap();
        assert_eq!(first, second);
        assert_eq!(sb.groups.len(), 2);
    }

    #[test]
    fn sibling_labels_under_different_parents() {
        let mut sb = empty_sb();
        let a = disk_path_find_or_create(&mut sb, "rack1.fast").unwrap();
        let b = disk_path_find_or_create(&mut sb, "rack2.fast").unwrap();
        assert_ne!(a, b);
        assert_eq!(group_path(&sb, a).unwrap(), "rack1.fast");
        assert_eq!(group_path(&sb, b).unwrap(), "rack2.fast");
    }

    #[test]
    fn empty_path_rejected() {
        let mut sb = empty_sb();
        assert!(disk_path_find_or_create(&mut sb, "").is_err());
        assert!(disk_path_find_or_create(&mut sb, "a..b").is_err());
    }

    #[test]
    fn descendants_and_ancestors() {
        let mut sb = empty_sb();
        let root = disk_path_find_or_create(&mut sb, "hdd").unwrap();
        let child = disk_path_find_or_create(&mut sb, "hdd.shelf1").unwrap();
        let grandchild = disk_path_find_or_create(&mut sb, "hdd.shelf1.left").unwrap();
        disk_path_find_or_create(&mut sb, "ssd").unwrap();

        let mut desc = group_and_descendants(&sb, root);
        desc.sort_unstable();
        assert_eq!(desc, vec![root, child, grandchild]);

        assert_eq!(
            group_and_ancestors(&sb, grandchild),
            vec![grandchild, child, root]
        );
    }
}
