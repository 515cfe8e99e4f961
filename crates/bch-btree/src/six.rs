//! The six-state node lock.
//!
//! Each node carries one lock with three modes — read, intent, write —
//! giving six reachable states. Exclusions: read excludes write; intent
//! excludes intent and write; write excludes everything. Intent is how
//! an updater parks on a node it will later write without starving
//! readers in the meantime.
//!
//! Acquisition order across nodes is `(btree, position, -level)`;
//! callers that would lock against that order must use `try_` forms
//! and convert contention into a transaction restart.

use bch_types::{BtreeId, Pos};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Intent,
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    intent: bool,
    writer: bool,
}

impl LockState {
    fn may(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.writer,
            LockMode::Intent => !self.intent && !self.writer,
            LockMode::Write => self.readers == 0 && !self.intent && !self.writer,
        }
    }

    fn take(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Intent => self.intent = true,
            LockMode::Write => self.writer = true,
        }
    }
}

#[derive(Debug, Default)]
pub struct SixLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl SixLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking acquire.
    #[must_use]
    pub fn try_lock(&self, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        if state.may(mode) {
            state.take(mode);
            true
        } else {
            false
        }
    }

    /// Blocking acquire; only legal when the caller's acquisition
    /// respects the global lock order.
    pub fn lock(&self, mode: LockMode) {
        let mut state = self.state.lock();
        while !state.may(mode) {
            self.cond.wait(&mut state);
        }
        state.take(mode);
    }

    pub fn unlock(&self, mode: LockMode) {
        let mut state = self.state.lock();
        match mode {
            LockMode::Read => {
                debug_assert!(state.readers > 0);
                state.readers = state.readers.saturating_sub(1);
            }
            LockMode::Intent => {
                debug_assert!(state.intent);
                state.intent = false;
            }
            LockMode::Write => {
                debug_assert!(state.writer);
                state.writer = false;
            }
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Upgrade a held intent to write, waiting for readers to drain.
    /// Intent exclusion guarantees no competing upgrader.
    pub fn upgrade_to_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.intent && !state.writer);
        while state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.intent = false;
        state.writer = true;
    }

    /// Downgrade a held write back to intent, letting readers in.
    pub fn downgrade_to_intent(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer && !state.intent);
        state.writer = false;
        state.intent = true;
        drop(state);
        self.cond.notify_all();
    }
}

// ── Lock ordering ───────────────────────────────────────────────────────────

/// Global acquisition ordinal of one node lock:
/// `(btree, cached, position, -level)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockOrd {
    pub btree: u8,
    pub cached: bool,
    pub pos: Pos,
    pub neg_level: u8,
}

impl LockOrd {
    #[must_use]
    pub fn new(btree: BtreeId, pos: Pos, level: u8) -> Self {
        Self {
            btree: btree as u8,
            cached: false,
            pos,
            neg_level: u8::MAX - level,
        }
    }
}

/// Per-transaction record of the highest ordinal acquired so far.
/// Acquiring below it is out of order and must not block.
#[derive(Debug, Default, Clone)]
pub struct LockTracker {
    max_ord: Option<LockOrd>,
}

impl LockTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether acquiring `ord` next respects the global order.
    #[must_use]
    pub fn in_order(&self, ord: LockOrd) -> bool {
        self.max_ord.map_or(true, |max| ord >= max)
    }

    pub fn record(&mut self, ord: LockOrd) {
        if self.max_ord.map_or(true, |max| ord > max) {
            self.max_ord = Some(ord);
        }
    }

    /// Forget ordering history (locks were all released, e.g. on
    /// restart or commit completion).
    pub fn reset(&mut self) {
        self.max_ord = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_excludes_write_only() {
        let lock = SixLock::new();
        assert!(lock.try_lock(LockMode::Read));
        assert!(lock.try_lock(LockMode::Read));
        assert!(lock.try_lock(LockMode::Intent));
        assert!(!lock.try_lock(LockMode::Write));
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Intent);
        assert!(lock.try_lock(LockMode::Write));
    }

    #[test]
    fn intent_excludes_intent_and_write() {
        let lock = SixLock::new();
        assert!(lock.try_lock(LockMode::Intent));
        assert!(!lock.try_lock(LockMode::Intent));
        assert!(!lock.try_lock(LockMode::Write));
        assert!(lock.try_lock(LockMode::Read));
    }

    #[test]
    fn write_excludes_everything() {
        let lock = SixLock::new();
        assert!(lock.try_lock(LockMode::Write));
        assert!(!lock.try_lock(LockMode::Read));
        assert!(!lock.try_lock(LockMode::Intent));
        assert!(!lock.try_lock(LockMode::Write));
    }

    #[test]
    fn upgrade_waits_for_readers() {
        let lock = Arc::new(SixLock::new());
        assert!(lock.try_lock(LockMode::Intent));
        assert!(lock.try_lock(LockMode::Read));

        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            lock2.upgrade_to_write();
            lock2.unlock(LockMode::Write);
        });

        // The upgrader must be parked on the outstanding reader.
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        lock.unlock(LockMode::Read);
        handle.join().unwrap();
    }

    #[test]
    fn downgrade_readmits_readers() {
        let lock = SixLock::new();
        assert!(lock.try_lock(LockMode::Intent));
        lock.upgrade_to_write();
        assert!(!lock.try_lock(LockMode::Read));
        lock.downgrade_to_intent();
        assert!(lock.try_lock(LockMode::Read));
    }

    #[test]
    fn ordering_is_pos_then_inverted_level() {
        // Root (high level) orders before its child at the same pos.
        let root = LockOrd::new(BtreeId::Extents, Pos::MIN, 1);
        let leaf = LockOrd::new(BtreeId::Extents, Pos::MIN, 0);
        assert!(root < leaf);

        // Btree id dominates.
        let other = LockOrd::new(BtreeId::Inodes, Pos::MIN, 0);
        assert!(leaf < other);

        let mut tracker = LockTracker::new();
        assert!(tracker.in_order(root));
        tracker.record(leaf);
        assert!(!tracker.in_order(root));
        tracker.reset();
        assert!(tracker.in_order(root));
    }
}
