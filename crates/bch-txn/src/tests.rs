use super::*;
use bch_block::{Device, DeviceSet, MemDevice};
use bch_btree::{BtreeConfig, BtreeSys, NodeAlloc};
use bch_journal::Journal;
use bch_types::keys::LruV;
use bch_types::{ChecksumType, DeviceIdx, ExtentPtr, Gen, MemberState};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

fn cx() -> Cx {
    Cx::for_testing()
}

struct BumpAlloc {
    next_sector: Mutex<u64>,
    node_sectors: u64,
    limit: u64,
}

impl NodeAlloc for BumpAlloc {
    fn alloc_node(&self, _cx: &Cx) -> Result<Vec<ExtentPtr>> {
        let mut next = self.next_sector.lock();
        if *next + self.node_sectors > self.limit {
            return Err(Error::NoSpace);
        }
        let sector = *next;
        *next += self.node_sectors;
        Ok(vec![ExtentPtr {
            dev: DeviceIdx(0),
            offset: sector,
            gen: Gen(0),
            cached: false,
        }])
    }

    fn free_node(&self, _cx: &Cx, _ptrs: &[ExtentPtr]) {}
}

fn test_sys() -> Arc<BtreeSys> {
    let device = Arc::new(Device::new(
        DeviceIdx(0),
        PathBuf::from("/mem/0"),
        Arc::new(MemDevice::new(16 << 20)),
        MemberState::Rw,
        32,
        1024,
        1,
        1,
        bch_types::data_allowed_default(),
        false,
    ));
    let devices = Arc::new(DeviceSet::new());
    devices.insert(Arc::clone(&device));
    let journal = Arc::new(
        Journal::new(
            vec![(device, (4..64).collect())],
            bch_types::JournalSeq(1),
            ChecksumType::Crc32c,
            None,
        )
        .unwrap(),
    );
    let config = BtreeConfig {
        node_size: 4096,
        csum_type: ChecksumType::Crc32c,
        metadata_replicas: 1,
        key: None,
    };
    let sys = Arc::new(BtreeSys::new(devices, config, journal, 128, 1));
    sys.set_alloc(Arc::new(BumpAlloc {
        next_sector: Mutex::new(2048),
        node_sectors: config.node_sectors(),
        limit: (16 << 20) / 512,
    }));
    sys.create_initial_roots(&cx()).unwrap();
    sys
}

fn peek_at(sys: &BtreeSys, cx: &Cx, btree: BtreeId, pos: Pos) -> Option<BKey> {
    let mut iter = sys.iter(btree, pos);
    sys.iter_peek(cx, &mut iter).unwrap().filter(|k| k.pos == pos)
}

#[test]
fn single_update_commit() {
    let sys = test_sys();
    let cx = cx();
    let key = BKey::new(Pos::new(0, 7), BVal::Lru(LruV { bucket: 7 }));
    commit_one(&sys, &cx, &[], BtreeId::Lru, key.clone()).unwrap();
    assert_eq!(peek_at(&sys, &cx, BtreeId::Lru, Pos::new(0, 7)), Some(key));
}

#[test]
fn multi_key_commit_is_atomic_to_readers() {
    let sys = test_sys();
    let cx = cx();

    // Commit four keys in one transaction, then verify all four are
    // present; a reader can never have seen a strict subset because
    // apply holds write locks on every touched leaf at once.
    commit_do(&sys, &cx, &[], false, |txn, cx| {
        for i in 0..4_u64 {
            txn.update(
                cx,
                BtreeId::Lru,
                BKey::new(Pos::new(0, 100 + i), BVal::Lru(LruV { bucket: i })),
            )?;
        }
        Ok(())
    })
    .unwrap();

    for i in 0..4 {
        assert!(peek_at(&sys, &cx, BtreeId::Lru, Pos::new(0, 100 + i)).is_some());
    }
}

#[test]
fn failed_body_stages_nothing() {
    let sys = test_sys();
    let cx = cx();
    let result: Result<()> = commit_do(&sys, &cx, &[], false, |txn, cx| {
        txn.update(
            cx,
            BtreeId::Lru,
            BKey::new(Pos::new(0, 1), BVal::Lru(LruV { bucket: 1 })),
        )?;
        Err(Error::NoSpace)
    });
    assert!(matches!(result, Err(Error::NoSpace)));
    assert!(peek_at(&sys, &cx, BtreeId::Lru, Pos::new(0, 1)).is_none());
}

#[test]
fn transaction_sees_its_own_stages() {
    let sys = test_sys();
    let cx = cx();
    commit_do(&sys, &cx, &[], false, |txn, cx| {
        let key = BKey::new(Pos::new(0, 9), BVal::Lru(LruV { bucket: 9 }));
        txn.update(cx, BtreeId::Lru, key.clone())?;
        assert_eq!(txn.get(cx, BtreeId::Lru, Pos::new(0, 9))?, Some(key));
        txn.delete(cx, BtreeId::Lru, Pos::new(0, 9))?;
        assert_eq!(txn.get(cx, BtreeId::Lru, Pos::new(0, 9))?, None);
        Ok(())
    })
    .unwrap();
    assert!(peek_at(&sys, &cx, BtreeId::Lru, Pos::new(0, 9)).is_none());
}

#[test]
fn read_conflict_restarts_and_succeeds() {
    let sys = test_sys();
    let cx = cx();
    let pos = Pos::new(0, 55);
    commit_one(
        &sys,
        &cx,
        &[],
        BtreeId::Lru,
        BKey::new(pos, BVal::Lru(LruV { bucket: 1 })),
    )
    .unwrap();

    // Body sneaks a conflicting commit underneath its own first
    // attempt; the wrapper must restart and converge.
    let mut first_attempt = true;
    commit_do(&sys, &cx, &[], false, |txn, cx| {
        let old = txn.get(cx, BtreeId::Lru, pos)?.expect("key present");
        if first_attempt {
            first_attempt = false;
            commit_one(
                txn.sys(),
                cx,
                &[],
                BtreeId::Lru,
                BKey::new(pos, BVal::Lru(LruV { bucket: 2 })),
            )?;
        }
        let BVal::Lru(lru) = &old.val else {
            panic!("wrong value type");
        };
        txn.update(
            cx,
            BtreeId::Lru,
            BKey::new(pos, BVal::Lru(LruV { bucket: lru.bucket + 10 })),
        )
    })
    .unwrap();

    let final_key = peek_at(&sys, &cx, BtreeId::Lru, pos).unwrap();
    let BVal::Lru(lru) = &final_key.val else {
        panic!("wrong value type");
    };
    // Based on the conflicting writer's value, not the stale read.
    assert_eq!(lru.bucket, 12);
}

#[test]
fn triggers_append_accounting_updates() {
    struct CountTrigger;
    impl CommitTrigger for CountTrigger {
        fn on_commit(
            &self,
            _cx: &Cx,
            txn: &mut Transaction<'_>,
            range: std::ops::Range<usize>,
        ) -> Result<()> {
            // Only count user-staged LRU keys outside the counter's own
            // namespace, so the feedback round stages nothing new.
            let staged = txn
                .staged(range)
                .iter()
                .filter(|u| u.key.pos.inode != 99)
                .count() as u64;
            if staged == 0 {
                return Ok(());
            }
            txn.update_unchecked(
                BtreeId::Lru,
                BKey::new(Pos::new(99, 0), BVal::Lru(LruV { bucket: staged })),
            )
        }
    }

    let sys = test_sys();
    let cx = cx();
    let triggers: Vec<Arc<dyn CommitTrigger>> = vec![Arc::new(CountTrigger)];
    commit_do(&sys, &cx, &triggers, false, |txn, cx| {
        for i in 0..3_u64 {
            txn.update(
                cx,
                BtreeId::Lru,
                BKey::new(Pos::new(1, i), BVal::Lru(LruV { bucket: i })),
            )?;
        }
        Ok(())
    })
    .unwrap();

    let counter = peek_at(&sys, &cx, BtreeId::Lru, Pos::new(99, 0)).unwrap();
    assert_eq!(counter.val, BVal::Lru(LruV { bucket: 3 }));
}

#[test]
fn extent_overwrite_trims_neighbours() {
    let sys = test_sys();
    let cx = cx();

    // Base extent [0, 100).
    commit_do(&sys, &cx, &[], false, |txn, cx| {
        txn.stage_extent(
            cx,
            BtreeId::Extents,
            BKey::extent(Pos::new(1, 0), 100, simple_extent(0, 10_000, 100)),
        )
    })
    .unwrap();

    // Overwrite the middle [30, 60).
    commit_do(&sys, &cx, &[], false, |txn, cx| {
        txn.stage_extent(
            cx,
            BtreeId::Extents,
            BKey::extent(Pos::new(1, 30), 30, simple_extent(0, 20_000, 30)),
        )
    })
    .unwrap();

    let extents = extents_overlapping(&sys, &cx, BtreeId::Extents, 1, 0, 0, 200).unwrap();
    assert_eq!(extents.len(), 3);

    // Head [0, 30) keeps the original image window.
    assert_eq!(extents[0].pos.offset, 0);
    assert_eq!(extents[0].size, 30);
    let BVal::Extent(head) = &extents[0].val else {
        panic!()
    };
    assert_eq!(head.crc.offset, 0);
    assert_eq!(head.ptrs[0].offset, 10_000);

    // Middle [30, 60) is the new write.
    assert_eq!(extents[1].pos.offset, 30);
    assert_eq!(extents[1].size, 30);
    let BVal::Extent(mid) = &extents[1].val else {
        panic!()
    };
    assert_eq!(mid.ptrs[0].offset, 20_000);

    // Tail [60, 100) shifts its window into the original image.
    assert_eq!(extents[2].pos.offset, 60);
    assert_eq!(extents[2].size, 40);
    let BVal::Extent(tail) = &extents[2].val else {
        panic!()
    };
    assert_eq!(tail.crc.offset, 60);
    assert_eq!(tail.ptrs[0].offset, 10_000);
}

#[test]
fn extent_overwrite_ignores_other_snapshots() {
    let sys = test_sys();
    let cx = cx();

    let ancestor = BKey::extent(
        Pos::with_snapshot(1, 0, bch_types::SnapshotId(1)),
        50,
        simple_extent(0, 30_000, 50),
    );
    commit_do(&sys, &cx, &[], false, |txn, cx| {
        txn.stage_extent(cx, BtreeId::Extents, ancestor.clone())
    })
    .unwrap();

    // A write in a different snapshot must not disturb the ancestor.
    commit_do(&sys, &cx, &[], false, |txn, cx| {
        txn.stage_extent(
            cx,
            BtreeId::Extents,
            BKey::extent(
                Pos::with_snapshot(1, 10, bch_types::SnapshotId(2)),
                10,
                simple_extent(0, 40_000, 10),
            ),
        )
    })
    .unwrap();

    let extents = extents_overlapping(&sys, &cx, BtreeId::Extents, 1, 1, 0, 100).unwrap();
    assert!(extents.contains(&ancestor), "ancestor extent was modified");
}

#[test]
fn delete_range_trims_straddlers() {
    let sys = test_sys();
    let cx = cx();

    commit_do(&sys, &cx, &[], false, |txn, cx| {
        txn.stage_extent(
            cx,
            BtreeId::Extents,
            BKey::extent(Pos::new(1, 0), 100, simple_extent(0, 10_000, 100)),
        )
    })
    .unwrap();

    commit_do(&sys, &cx, &[], false, |txn, cx| {
        txn.delete_range(cx, BtreeId::Extents, Pos::new(1, 20), Pos::new(1, 80))
    })
    .unwrap();

    let extents = extents_overlapping(&sys, &cx, BtreeId::Extents, 1, 0, 0, 200).unwrap();
    assert_eq!(extents.len(), 2);
    assert_eq!(extents[0].pos.offset, 0);
    assert_eq!(extents[0].size, 20);
    assert_eq!(extents[1].pos.offset, 80);
    assert_eq!(extents[1].size, 20);
    let BVal::Extent(tail) = &extents[1].val else {
        panic!()
    };
    assert_eq!(tail.crc.offset, 80);
}

#[test]
fn concurrent_commits_all_land() {
    let sys = test_sys();
    let threads: Vec<_> = (0..4_u64)
        .map(|t| {
            let sys = Arc::clone(&sys);
            std::thread::spawn(move || {
                let cx = Cx::for_testing();
                for i in 0..50_u64 {
                    commit_one(
                        &sys,
                        &cx,
                        &[],
                        BtreeId::Lru,
                        BKey::new(
                            Pos::new(t, i),
                            BVal::Lru(LruV { bucket: t * 1000 + i }),
                        ),
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    let cx = cx();
    let mut iter = sys.iter(BtreeId::Lru, Pos::MIN);
    let mut count = 0;
    while let Some(key) = sys.iter_peek(&cx, &mut iter).unwrap() {
        iter.advance(&key);
        count += 1;
    }
    assert_eq!(count, 200);
}
