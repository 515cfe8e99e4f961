//! In-memory nodes and node I/O.
//!
//! A cached node holds the merged view of its on-disk bsets plus any
//! updates applied since. Flushing either appends the unwritten keys as
//! a new bset at the node's existing location or, when the image is
//! full (or the node has never been written), allocates fresh space and
//! writes a compacted single-bset image — the COW step.

use asupersync::Cx;
use bch_block::DeviceSet;
use bch_error::{Error, Result};
use bch_ondisk::bkey::BkeyFormat;
use bch_ondisk::node::{
    BSET_ALIGN, Bset, NodeHeader, decode_node, encode_bset, encode_node_header,
};
use bch_types::keys::BtreePtrV;
use bch_types::{BKey, BtreeId, ChecksumType, JournalSeq, Pos};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Knobs the btree engine needs from the superblock.
#[derive(Debug, Clone, Copy)]
pub struct BtreeConfig {
    /// Node size in bytes (power of two).
    pub node_size: u32,
    pub csum_type: ChecksumType,
    pub metadata_replicas: u8,
    pub key: Option<[u8; 32]>,
}

impl BtreeConfig {
    #[must_use]
    pub fn node_sectors(&self) -> u64 {
        u64::from(self.node_size) / 512
    }

    /// Usable key bytes in a freshly compacted image.
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.node_size as usize - BSET_ALIGN - bch_ondisk::node::BSET_HEADER_BYTES
    }
}

/// Approximate on-disk size of one key (unpacked encoding).
pub fn encoded_len(key: &BKey) -> usize {
    bch_ondisk::encode_bkey(key, &BkeyFormat::unpacked())
        .map(|v| v.len())
        .unwrap_or(64)
}

/// The mutable contents of one cached node.
#[derive(Debug)]
pub struct NodeData {
    pub btree: BtreeId,
    pub level: u8,
    pub node_seq: u64,
    pub min_pos: Pos,
    pub max_pos: Pos,
    /// Merged live view. Whiteouts are kept as `Deleted` keys until the
    /// next compaction so bset appends can cancel on-disk keys.
    pub keys: BTreeMap<Pos, BKey>,
    /// Approximate encoded bytes of `keys`.
    pub bytes: usize,
    /// Current on-disk location; `None` until first write.
    pub ptr: Option<BtreePtrV>,
    pub dirty: bool,
    /// Journal sequence pinned while dirty.
    pub pin_seq: Option<JournalSeq>,
    pub written_bsets: u32,
    /// Bytes of the on-disk image in use (header + bsets, aligned).
    pub written_bytes: usize,
    /// Keys applied since the last flush, in apply order.
    pub unwritten: Vec<BKey>,
    /// Packing format of the on-disk image; appends must reuse it.
    pub disk_format: Option<BkeyFormat>,
    /// The node was replaced (split or merged away); holders of stale
    /// references restart their walk from the root.
    pub freed: bool,
    /// The next flush must relocate the node even if nothing is
    /// pending (evacuation, old-format rewrite).
    pub force_rewrite: bool,
}

impl NodeData {
    #[must_use]
    pub fn new_empty(btree: BtreeId, level: u8, node_seq: u64, min_pos: Pos, max_pos: Pos) -> Self {
        Self {
            btree,
            level,
            node_seq,
            min_pos,
            max_pos,
            keys: BTreeMap::new(),
            bytes: 0,
            ptr: None,
            dirty: false,
            pin_seq: None,
            written_bsets: 0,
            written_bytes: 0,
            unwritten: Vec::new(),
            disk_format: None,
            freed: false,
            force_rewrite: false,
        }
    }

    /// Build the merged view from a decoded image.
    #[must_use]
    pub fn from_disk(header: NodeHeader, bsets: Vec<Bset>, ptr: BtreePtrV, image_used: usize) -> Self {
        let mut keys = BTreeMap::new();
        for bset in &bsets {
            for key in &bset.keys {
                keys.insert(key.pos, key.clone());
            }
        }
        let bytes = keys.values().map(encoded_len).sum();
        Self {
            btree: header.btree_id,
            level: header.level,
            node_seq: header.node_seq,
            min_pos: header.min_pos,
            max_pos: header.max_pos,
            keys,
            bytes,
            ptr: Some(ptr),
            dirty: false,
            pin_seq: None,
            written_bsets: u32::try_from(bsets.len()).unwrap_or(u32::MAX),
            written_bytes: image_used,
            unwritten: Vec::new(),
            disk_format: Some(header.format),
            freed: false,
            force_rewrite: false,
        }
    }

    #[must_use]
    pub fn covers(&self, pos: Pos) -> bool {
        pos >= self.min_pos && pos <= self.max_pos
    }

    /// Apply one key, tracking size and the unwritten tail.
    pub fn apply_key(&mut self, key: BKey) {
        let len = encoded_len(&key);
        if let Some(old) = self.keys.insert(key.pos, key.clone()) {
            self.bytes = self.bytes.saturating_sub(encoded_len(&old));
        }
        self.bytes += len;
        self.unwritten.push(key);
    }

    /// First live (non-deleted) key with position `>= pos`, within this
    /// node.
    #[must_use]
    pub fn peek_from(&self, pos: Pos) -> Option<&BKey> {
        self.keys
            .range(pos..)
            .map(|(_, k)| k)
            .find(|k| !k.is_deleted())
    }

    /// Last live key with position `< pos`.
    #[must_use]
    pub fn peek_before(&self, pos: Pos) -> Option<&BKey> {
        self.keys
            .range(..pos)
            .rev()
            .map(|(_, k)| k)
            .find(|k| !k.is_deleted())
    }

    /// Raw lookup including whiteouts (the transaction layer's
    /// optimistic re-check needs to see deletions).
    #[must_use]
    pub fn get_raw(&self, pos: Pos) -> Option<&BKey> {
        self.keys.get(&pos)
    }

    /// Interior-node child routing: the first child key whose max
    /// position is `>= pos`.
    #[must_use]
    pub fn child_for(&self, pos: Pos) -> Option<&BKey> {
        debug_assert!(self.level > 0);
        self.keys
            .range(pos..)
            .map(|(_, k)| k)
            .find(|k| !k.is_deleted())
            .or_else(|| self.keys.values().rev().find(|k| !k.is_deleted()))
    }

    /// Live keys in order, whiteouts dropped (what a compaction
    /// writes).
    #[must_use]
    pub fn live_keys(&self) -> Vec<BKey> {
        self.keys
            .values()
            .filter(|k| !k.is_deleted())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.keys.values().filter(|k| !k.is_deleted()).count()
    }
}

// ── Node I/O ────────────────────────────────────────────────────────────────

/// Read a node image, trying each replica in turn; a checksum or
/// decode failure moves to the next replica, and exhaustion reports
/// corrupt metadata with the node's identity.
pub fn read_node(
    cx: &Cx,
    devices: &DeviceSet,
    config: &BtreeConfig,
    expect_btree: BtreeId,
    expect_level: u8,
    ptr: &BtreePtrV,
) -> Result<NodeData> {
    let node_bytes = config.node_size as usize;
    let mut buf = vec![0_u8; node_bytes];
    let mut last_err: Option<Error> = None;

    for replica in &ptr.ptrs {
        let device = match devices.get(replica.dev) {
            Some(d) if d.is_readable() => d,
            _ => continue,
        };
        if let Err(err) = device.read_sectors(cx, replica.offset, &mut buf) {
            last_err = Some(err);
            continue;
        }
        match decode_node(&buf, config.csum_type, config.key.as_ref(), replica.offset) {
            Ok((header, bsets)) => {
                if header.node_seq != ptr.node_seq
                    || header.btree_id != expect_btree
                    || header.level != expect_level
                {
                    warn!(
                        target: "bch::btree",
                        event = "node_identity_mismatch",
                        dev = replica.dev.0,
                        sector = replica.offset,
                        want_seq = ptr.node_seq,
                        got_seq = header.node_seq
                    );
                    last_err = Some(Error::CorruptMetadata {
                        btree: expect_btree,
                        pos: ptr.min_pos,
                        detail: "node identity mismatch".into(),
                    });
                    continue;
                }
                let image_used = image_used_bytes(&bsets);
                return Ok(NodeData::from_disk(header, bsets, ptr.clone(), image_used));
            }
            Err(err) => {
                warn!(
                    target: "bch::btree",
                    event = "node_replica_bad",
                    dev = replica.dev.0,
                    sector = replica.offset,
                    error = %err
                );
                last_err = Some(err);
            }
        }
    }

    Err(match last_err {
        Some(Error::BadChecksum { .. } | Error::BadMagic { .. }) | None => Error::CorruptMetadata {
            btree: expect_btree,
            pos: ptr.min_pos,
            detail: "all replicas failed checksum".into(),
        },
        Some(err) => err,
    })
}

fn image_used_bytes(bsets: &[Bset]) -> usize {
    let mut used = BSET_ALIGN;
    for bset in bsets {
        let body: usize = bset.keys.iter().map(encoded_len).sum();
        used += (bch_ondisk::node::BSET_HEADER_BYTES + body).div_ceil(BSET_ALIGN) * BSET_ALIGN;
    }
    used
}

/// Write a full, compacted image of `data` at `ptr` (which the caller
/// freshly allocated). Clears dirty bookkeeping on success.
pub fn write_node_full(
    cx: &Cx,
    devices: &DeviceSet,
    config: &BtreeConfig,
    data: &mut NodeData,
    ptr: BtreePtrV,
) -> Result<()> {
    // Compaction: whiteouts die here.
    let live = data.live_keys();
    data.keys = live.iter().map(|k| (k.pos, k.clone())).collect();
    data.bytes = live.iter().map(encoded_len).sum();

    let format = BkeyFormat::for_range(data.min_pos, data.max_pos);
    let header = NodeHeader {
        node_seq: data.node_seq,
        btree_id: data.btree,
        level: data.level,
        format,
        min_pos: data.min_pos,
        max_pos: data.max_pos,
    };

    let mut image = Vec::with_capacity(config.node_size as usize);
    let first = ptr
        .ptrs
        .first()
        .ok_or_else(|| Error::InvalidArgument("node write with no replicas".into()))?;
    image.extend_from_slice(&encode_node_header(
        &header,
        config.csum_type,
        config.key.as_ref(),
        first.offset,
    )?);
    image.extend_from_slice(&encode_bset(
        &live,
        &format,
        data.pin_seq.map_or(0, |s| s.0),
        0,
        config.csum_type,
        config.key.as_ref(),
        first.offset,
    )?);
    if image.len() > config.node_size as usize {
        return Err(Error::CorruptMetadata {
            btree: data.btree,
            pos: data.min_pos,
            detail: "node image overflow".into(),
        });
    }
    let used = image.len();
    image.resize(config.node_size as usize, 0);

    let mut wrote = 0;
    for replica in &ptr.ptrs {
        let device = devices.require(replica.dev)?;
        if !device.is_writable() {
            continue;
        }
        device.write_sectors(cx, replica.offset, &image)?;
        wrote += 1;
    }
    if wrote == 0 {
        return Err(Error::ReadOnly);
    }

    trace!(
        target: "bch::btree",
        event = "node_write_full",
        btree = %data.btree,
        level = data.level,
        node_seq = data.node_seq,
        keys = data.keys.len(),
        bytes = used
    );

    data.ptr = Some(ptr);
    data.written_bsets = 1;
    data.written_bytes = used;
    data.unwritten.clear();
    data.dirty = false;
    data.disk_format = Some(format);
    data.force_rewrite = false;
    Ok(())
}

/// Append the unwritten keys as one new bset at the node's current
/// location. Returns `false` (leaving the node dirty) when the image
/// has no room and a COW rewrite is needed instead.
pub fn append_bset_in_place(
    cx: &Cx,
    devices: &DeviceSet,
    config: &BtreeConfig,
    data: &mut NodeData,
) -> Result<bool> {
    let Some(ptr) = data.ptr.clone() else {
        return Ok(false);
    };
    if data.force_rewrite {
        return Ok(false);
    }
    if data.unwritten.is_empty() {
        data.dirty = false;
        return Ok(true);
    }

    // The append must use the format already on disk; out-of-range
    // keys fall back to unpacked encoding inside the codec.
    let stored = data.disk_format.unwrap_or_else(BkeyFormat::unpacked);
    let first = ptr
        .ptrs
        .first()
        .ok_or_else(|| Error::InvalidArgument("node with no replicas".into()))?;
    let image = encode_bset(
        &data.unwritten,
        &stored,
        data.pin_seq.map_or(0, |s| s.0),
        data.written_bsets,
        config.csum_type,
        config.key.as_ref(),
        first.offset,
    )?;

    if data.written_bytes + image.len() > config.node_size as usize {
        return Ok(false);
    }
    let sector_off = (data.written_bytes / 512) as u64;

    for replica in &ptr.ptrs {
        let device = devices.require(replica.dev)?;
        if !device.is_writable() {
            continue;
        }
        device.write_sectors(cx, replica.offset + sector_off, &image)?;
    }

    debug!(
        target: "bch::btree",
        event = "bset_append",
        btree = %data.btree,
        node_seq = data.node_seq,
        bset = data.written_bsets,
        keys = data.unwritten.len()
    );

    data.written_bsets += 1;
    data.written_bytes += image.len();
    data.unwritten.clear();
    data.dirty = false;
    Ok(true)
}
