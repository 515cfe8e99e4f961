//! Insert and lookup throughput over an in-memory device.

use asupersync::Cx;
use bch_block::{Device, DeviceSet, MemDevice};
use bch_btree::{
    BtreeConfig, BtreeIter, BtreeSys, LockTracker, NodeAlloc, encoded_len,
};
use bch_error::Result;
use bch_journal::Journal;
use bch_ondisk::journal::JournalUpdate;
use bch_types::keys::LruV;
use bch_types::{
    BKey, BVal, BtreeId, ChecksumType, DeviceIdx, ExtentPtr, Gen, JournalSeq, MemberState, Pos,
};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

struct BumpAlloc {
    next_sector: Mutex<u64>,
    node_sectors: u64,
}

impl NodeAlloc for BumpAlloc {
    fn alloc_node(&self, _cx: &Cx) -> Result<Vec<ExtentPtr>> {
        let mut next = self.next_sector.lock();
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

fn build_sys() -> BtreeSys {
    let device = Arc::new(Device::new(
        DeviceIdx(0),
        PathBuf::from("/mem/bench"),
        Arc::new(MemDevice::new(256 << 20)),
        MemberState::Rw,
        256,
        2048,
        1,
        1,
        bch_types::data_allowed_default(),
        false,
    ));
    let devices = Arc::new(DeviceSet::new());
    devices.insert(Arc::clone(&device));
    let journal = Arc::new(
        Journal::new(
            vec![(device, (4..132).collect())],
            JournalSeq(1),
            ChecksumType::Crc32c,
            None,
        )
        .unwrap(),
    );
    let config = BtreeConfig {
        node_size: 64 << 10,
        csum_type: ChecksumType::Crc32c,
        metadata_replicas: 1,
        key: None,
    };
    let sys = BtreeSys::new(devices, config, journal, 1024, 1);
    sys.set_alloc(Arc::new(BumpAlloc {
        next_sector: Mutex::new(64 << 10),
        node_sectors: config.node_sectors(),
    }));
    sys.create_initial_roots(&Cx::for_testing()).unwrap();
    sys
}

fn insert_one(sys: &BtreeSys, cx: &Cx, offset: u64) {
    let key = BKey::new(Pos::new(0, offset), BVal::Lru(LruV { bucket: offset }));
    let mut tracker = LockTracker::new();
    loop {
        tracker.reset();
        let attempt = (|| -> Result<()> {
            let mut path =
                sys.update_path(cx, &mut tracker, BtreeId::Lru, key.pos, encoded_len(&key))?;
            let reservation = sys.journal().reserve(cx, 128)?;
            let seq = sys.journal().append(
                cx,
                reservation,
                vec![JournalUpdate {
                    btree: BtreeId::Lru,
                    level: 0,
                    key: key.clone(),
                }],
                false,
            )?;
            path.upgrade();
            sys.apply(&path, key.clone(), seq);
            drop(path);
            sys.journal().unpin(seq);
            Ok(())
        })();
        match attempt {
            Ok(()) => return,
            Err(err) if err.is_restart() => {
                let _ = sys.flush_for_reclaim(cx);
            }
            Err(err) => panic!("bench insert failed: {err}"),
        }
    }
}

fn bench_insert(c: &mut Criterion) {
    let cx = Cx::for_testing();
    c.bench_function("btree_insert_sequential", |b| {
        let sys = build_sys();
        let mut offset = 0_u64;
        b.iter(|| {
            insert_one(&sys, &cx, offset);
            offset += 1;
        });
    });
}

fn bench_peek(c: &mut Criterion) {
    let cx = Cx::for_testing();
    let sys = build_sys();
    for offset in 0..10_000 {
        insert_one(&sys, &cx, offset * 3);
    }
    c.bench_function("btree_peek_random", |b| {
        let mut probe = 1_u64;
        b.iter(|| {
            probe = probe.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let pos = Pos::new(0, probe % 30_000);
            let mut iter: BtreeIter = sys.iter(BtreeId::Lru, pos);
            black_box(sys.iter_peek(&cx, &mut iter).unwrap());
        });
    });
}

criterion_group!(benches, bench_insert, bench_peek);
criterion_main!(benches);
