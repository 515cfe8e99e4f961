//! Node cache.
//!
//! Owns the memory of every in-core btree node. Lookups key on the
//! node's identity sequence; paths hold `Arc` references guarded by
//! each node's six-state lock. Reclaim walks LRU order and only evicts
//! clean nodes nobody references; when memory is tight the cannibalize
//! lock serialises reclaim so concurrent allocators do not stampede.

use crate::node::NodeData;
use crate::six::SixLock;
use asupersync::Cx;
use bch_block::{DeviceSet, cx_checkpoint};
use bch_error::{Error, RestartReason, Result};
use bch_types::BtreeId;
use bch_types::keys::BtreePtrV;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// One in-core node: the six-state lock plus the data it guards.
#[derive(Debug)]
pub struct CachedNode {
    pub six: SixLock,
    pub data: RwLock<NodeData>,
}

impl CachedNode {
    #[must_use]
    pub fn new(data: NodeData) -> Self {
        Self {
            six: SixLock::new(),
            data: RwLock::new(data),
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<u64, Arc<CachedNode>>,
    lru: VecDeque<u64>,
}

/// The cache proper.
pub struct NodeCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    cannibalize: Mutex<()>,
}

impl NodeCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(8),
            cannibalize: Mutex::new(()),
        }
    }

    /// Insert a freshly created node (split child, new root, fresh
    /// tree).
    pub fn insert(&self, cx: &Cx, data: NodeData) -> Result<Arc<CachedNode>> {
        self.make_room(cx)?;
        let node = Arc::new(CachedNode::new(data));
        let seq = node.data.read().node_seq;
        let mut inner = self.inner.lock();
        inner.map.insert(seq, Arc::clone(&node));
        inner.lru.push_back(seq);
        Ok(node)
    }

    /// Look up a node by pointer, reading it from disk on a miss.
    pub fn get_or_read(
        &self,
        cx: &Cx,
        devices: &DeviceSet,
        config: &crate::node::BtreeConfig,
        btree: BtreeId,
        level: u8,
        ptr: &BtreePtrV,
    ) -> Result<Arc<CachedNode>> {
        if let Some(node) = self.touch(ptr.node_seq) {
            return Ok(node);
        }

        let data = crate::node::read_node(cx, devices, config, btree, level, ptr)?;
        self.make_room(cx)?;

        let mut inner = self.inner.lock();
        // Lost a race with a concurrent reader: keep theirs.
        if let Some(existing) = inner.map.get(&ptr.node_seq) {
            return Ok(Arc::clone(existing));
        }
        let node = Arc::new(CachedNode::new(data));
        inner.map.insert(ptr.node_seq, Arc::clone(&node));
        inner.lru.push_back(ptr.node_seq);
        Ok(node)
    }

    /// Drop a node whose on-disk incarnation was freed (merge victim).
    pub fn remove(&self, node_seq: u64) {
        let mut inner = self.inner.lock();
        inner.map.remove(&node_seq);
        inner.lru.retain(|&s| s != node_seq);
    }

    fn touch(&self, node_seq: u64) -> Option<Arc<CachedNode>> {
        let mut inner = self.inner.lock();
        let node = inner.map.get(&node_seq).cloned()?;
        inner.lru.retain(|&s| s != node_seq);
        inner.lru.push_back(node_seq);
        Some(node)
    }

    /// Evict clean, unreferenced nodes until below capacity. When the
    /// first pass frees nothing and the cache is full, reclaim runs
    /// again under the cannibalize lock; failing that, the caller's
    /// transaction restarts so dirty-node writeback can run.
    fn make_room(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.evict_pass() {
            return Ok(());
        }
        let _serialize = self.cannibalize.lock();
        if self.evict_pass() {
            return Ok(());
        }
        debug!(target: "bch::btree", event = "cache_reclaim_stalled");
        Err(Error::restart(RestartReason::CacheReclaim))
    }

    fn evict_pass(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.map.len() < self.capacity {
            return true;
        }
        let mut scanned = 0;
        let limit = inner.lru.len();
        while inner.map.len() >= self.capacity && scanned < limit {
            scanned += 1;
            let Some(seq) = inner.lru.pop_front() else {
                break;
            };
            let evictable = match inner.map.get(&seq) {
                // One reference: the map itself. Clean nodes only.
                Some(node) => Arc::strong_count(node) == 1 && !node.data.read().dirty,
                None => continue,
            };
            if evictable {
                trace!(target: "bch::btree", event = "cache_evict", node_seq = seq);
                inner.map.remove(&seq);
            } else {
                inner.lru.push_back(seq);
            }
        }
        inner.map.len() < self.capacity
    }

    /// Every dirty node currently cached, oldest pin first.
    #[must_use]
    pub fn dirty_nodes(&self) -> Vec<Arc<CachedNode>> {
        let inner = self.inner.lock();
        let mut dirty: Vec<_> = inner
            .map
            .values()
            .filter(|n| n.data.read().dirty)
            .cloned()
            .collect();
        dirty.sort_by_key(|n| n.data.read().pin_seq);
        dirty
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bch_types::Pos;

    fn cx() -> Cx {
        Cx::for_testing()
    }

    fn data(seq: u64) -> NodeData {
        NodeData::new_empty(BtreeId::Extents, 0, seq, Pos::MIN, Pos::MAX)
    }

    #[test]
    fn insert_and_touch() {
        let cache = NodeCache::new(16);
        let cx = cx();
        let node = cache.insert(&cx, data(1)).unwrap();
        drop(node);
        assert_eq!(cache.len(), 1);
        assert!(cache.touch(1).is_some());
        assert!(cache.touch(2).is_none());
    }

    #[test]
    fn eviction_prefers_lru_clean() {
        let cache = NodeCache::new(8);
        let cx = cx();
        for seq in 0..8 {
            drop(cache.insert(&cx, data(seq)).unwrap());
        }
        // Touch node 0 so it is most recently used.
        cache.touch(0);
        drop(cache.insert(&cx, data(100)).unwrap());
        assert!(cache.touch(0).is_some());
        // Node 1 was the LRU victim.
        assert!(cache.touch(1).is_none());
    }

    #[test]
    fn dirty_and_referenced_nodes_are_not_evicted() {
        let cache = NodeCache::new(8);
        let cx = cx();
        let held: Vec<_> = (0..4)
            .map(|seq| cache.insert(&cx, data(seq)).unwrap())
            .collect();
        for seq in 4..8 {
            let node = cache.insert(&cx, data(seq)).unwrap();
            node.data.write().dirty = true;
        }
        // Everything is held or dirty: inserting must restart.
        let err = cache.insert(&cx, data(99)).unwrap_err();
        assert!(err.is_restart());

        // Releasing references (still clean) makes room again.
        drop(held);
        assert!(cache.insert(&cx, data(99)).is_ok());
    }

    #[test]
    fn dirty_nodes_sorted_by_pin() {
        let cache = NodeCache::new(16);
        let cx = cx();
        for (seq, pin) in [(1_u64, 30_u64), (2, 10), (3, 20)] {
            let node = cache.insert(&cx, data(seq)).unwrap();
            let mut d = node.data.write();
            d.dirty = true;
            d.pin_seq = Some(bch_types::JournalSeq(pin));
        }
        let dirty = cache.dirty_nodes();
        let pins: Vec<u64> = dirty
            .iter()
            .map(|n| n.data.read().pin_seq.unwrap().0)
            .collect();
        assert_eq!(pins, vec![10, 20, 30]);
    }
}
