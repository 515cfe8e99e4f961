use super::*;
use bch_block::{Device, MemDevice};
use bch_btree::BtreeConfig;
use bch_journal::Journal;
use bch_types::keys::replicas_pos;
use bch_types::{ChecksumType, JournalSeq, MemberState};
use std::path::PathBuf;

fn cx() -> Cx {
    Cx::for_testing()
}

const BUCKET_SECTORS: u32 = 32;
const NBUCKETS: u64 = 1024;
const JOURNAL_BUCKETS: std::ops::Range<u64> = 4..36;
const BOOT_BUCKETS: std::ops::Range<u64> = 40..80;

struct BootstrapAlloc {
    next_sector: Mutex<u64>,
    node_sectors: u64,
    limit: u64,
}

impl NodeAlloc for BootstrapAlloc {
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

struct Harness {
    sys: Arc<BtreeSys>,
    alloc: Arc<Allocator>,
    devices: Arc<DeviceSet>,
    triggers: Vec<Arc<dyn CommitTrigger>>,
}

fn harness_with_discard(discard: bool) -> Harness {
    let cx = cx();
    let device = Arc::new(Device::new(
        DeviceIdx(0),
        PathBuf::from("/mem/0"),
        Arc::new(MemDevice::new(16 << 20)),
        MemberState::Rw,
        BUCKET_SECTORS,
        NBUCKETS,
        1,
        1,
        bch_types::data_allowed_default() | DataType::Cached.mask_bit(),
        discard,
    ));
    let devices = Arc::new(DeviceSet::new());
    devices.insert(Arc::clone(&device));
    let journal = Arc::new(
        Journal::new(
            vec![(device, JOURNAL_BUCKETS.collect())],
            JournalSeq(1),
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
    let sys = Arc::new(BtreeSys::new(
        Arc::clone(&devices),
        config,
        journal,
        256,
        1,
    ));
    sys.set_alloc(Arc::new(BootstrapAlloc {
        next_sector: Mutex::new(BOOT_BUCKETS.start * u64::from(BUCKET_SECTORS)),
        node_sectors: config.node_sectors(),
        limit: BOOT_BUCKETS.end * u64::from(BUCKET_SECTORS),
    }));
    sys.create_initial_roots(&cx).unwrap();

    // Seed the alloc btree: journal and bootstrap buckets are in use,
    // everything else is free. The index trigger builds the freespace
    // btree as a side effect.
    let triggers: Vec<Arc<dyn CommitTrigger>> = vec![Arc::new(BucketIndexTrigger)];
    for bucket in 1..NBUCKETS {
        let (data_type, dirty) = if JOURNAL_BUCKETS.contains(&bucket) {
            (DataType::Journal, BUCKET_SECTORS)
        } else if BOOT_BUCKETS.contains(&bucket) {
            (DataType::Btree, BUCKET_SECTORS)
        } else {
            (DataType::Free, 0)
        };
        let key = BKey::new(
            Pos::bucket(DeviceIdx(0), BucketIdx(bucket)),
            BVal::Alloc(AllocV {
                data_type: data_type as u8,
                dirty_sectors: dirty,
                ..AllocV::default()
            }),
        );
        commit_do(&sys, &cx, &triggers, false, |txn, cx| {
            txn.update(cx, BtreeId::Alloc, key.clone())
        })
        .unwrap();
    }

    let alloc = Allocator::new(Arc::clone(&sys), Arc::clone(&devices), 8);
    alloc.init_usage(&cx).unwrap();
    sys.set_alloc(Arc::clone(&alloc) as Arc<dyn NodeAlloc>);
    alloc.refill(&cx).unwrap();

    let mut triggers = triggers;
    triggers.insert(
        0,
        Arc::new(ExtentAccountingTrigger::new(Arc::clone(&alloc))) as Arc<dyn CommitTrigger>,
    );
    Harness {
        sys,
        alloc,
        devices,
        triggers,
    }
}

fn harness() -> Harness {
    harness_with_discard(false)
}

/// The §freespace invariant: free buckets and freespace keys are a
/// bijection with matching generation bits.
fn check_freespace_consistency(h: &Harness, cx: &Cx) {
    let mut free_buckets: HashMap<u64, Gen> = HashMap::new();
    let mut iter = h.sys.iter(BtreeId::Alloc, Pos::MIN);
    while let Some(key) = h.sys.iter_peek(cx, &mut iter).unwrap() {
        iter.advance(&key);
        if let BVal::Alloc(a) = &key.val {
            if bucket_is_free(a) {
                free_buckets.insert(key.pos.offset, a.gen);
            }
        }
    }

    let mut freespace_seen: HashMap<u64, u8> = HashMap::new();
    let mut iter = h.sys.iter(BtreeId::Freespace, Pos::MIN);
    while let Some(key) = h.sys.iter_peek(cx, &mut iter).unwrap() {
        iter.advance(&key);
        let (bucket, gen_bits) = freespace_decode(key.pos);
        assert!(
            freespace_seen.insert(bucket.0, gen_bits).is_none(),
            "duplicate freespace key for bucket {}",
            bucket.0
        );
    }

    for (bucket, gen) in &free_buckets {
        let gen_bits = freespace_seen
            .get(bucket)
            .unwrap_or_else(|| panic!("free bucket {bucket} missing freespace key"));
        assert_eq!(*gen_bits, gen.0, "gen bits mismatch for bucket {bucket}");
    }
    for bucket in freespace_seen.keys() {
        assert!(
            free_buckets.contains_key(bucket),
            "freespace key for non-free bucket {bucket}"
        );
    }
}

#[test]
fn seeded_state_is_consistent() {
    let h = harness();
    check_freespace_consistency(&h, &cx());
}

#[test]
fn allocate_hands_out_disjoint_ranges() {
    let h = harness();
    let cx = cx();
    let mut seen = HashSet::new();
    for stream in 0..4_u64 {
        for _ in 0..8 {
            let ptrs = h
                .alloc
                .allocate(
                    &cx,
                    &h.triggers,
                    stream,
                    &[DeviceIdx(0)],
                    1,
                    DataType::User,
                    8,
                )
                .unwrap();
            assert_eq!(ptrs.len(), 1);
            assert!(
                seen.insert((ptrs[0].dev.0, ptrs[0].offset)),
                "duplicate allocation at {:?}",
                ptrs[0]
            );
        }
    }
    check_freespace_consistency(&h, &cx);
}

#[test]
fn independent_streams_use_different_buckets() {
    let h = harness();
    let cx = cx();
    let a = h
        .alloc
        .allocate(&cx, &h.triggers, 1, &[DeviceIdx(0)], 1, DataType::User, 8)
        .unwrap();
    let b = h
        .alloc
        .allocate(&cx, &h.triggers, 2, &[DeviceIdx(0)], 1, DataType::User, 8)
        .unwrap();
    let dev = h.devices.require(DeviceIdx(0)).unwrap();
    assert_ne!(
        dev.sector_to_bucket(a[0].offset),
        dev.sector_to_bucket(b[0].offset),
        "streams on different write points must not share a bucket"
    );
}

#[test]
fn extent_commit_accounts_bucket_sectors() {
    let h = harness();
    let cx = cx();
    let ptrs = h
        .alloc
        .allocate(&cx, &h.triggers, 7, &[DeviceIdx(0)], 1, DataType::User, 16)
        .unwrap();
    let dev = h.devices.require(DeviceIdx(0)).unwrap();
    let bucket = BucketIdx(dev.sector_to_bucket(ptrs[0].offset));

    let extent = BKey::extent(
        Pos::new(10, 0),
        16,
        bch_txn::simple_extent(0, ptrs[0].offset, 16),
    );
    commit_do(&h.sys, &cx, &h.triggers, false, |txn, cx| {
        txn.stage_extent(cx, BtreeId::Extents, extent.clone())
    })
    .unwrap();

    let state = h.alloc.bucket_state(&cx, DeviceIdx(0), bucket).unwrap();
    assert_eq!(state.dirty_sectors, 16);
    assert_eq!(state.data_type, DataType::User as u8);
    let used_before = h.alloc.used_sectors();

    // Deleting the extent returns the bucket to the free pool with a
    // generation bump owed.
    commit_do(&h.sys, &cx, &h.triggers, false, |txn, cx| {
        txn.delete_range(cx, BtreeId::Extents, Pos::new(10, 0), Pos::new(10, 16))
    })
    .unwrap();
    let state = h.alloc.bucket_state(&cx, DeviceIdx(0), bucket).unwrap();
    assert_eq!(state.dirty_sectors, 0);
    assert!(state.need_inc_gen());
    assert_eq!(state.data_type, DataType::Free as u8);
    assert_eq!(h.alloc.used_sectors(), used_before - 16);

    check_freespace_consistency(&h, &cx);
}

#[test]
fn cached_bucket_gets_lru_entry_and_invalidates() {
    let h = harness();
    let cx = cx();
    let ptrs = h
        .alloc
        .allocate(&cx, &h.triggers, 3, &[DeviceIdx(0)], 1, DataType::Cached, 8)
        .unwrap();
    assert!(ptrs[0].cached);
    let dev = h.devices.require(DeviceIdx(0)).unwrap();
    let bucket = BucketIdx(dev.sector_to_bucket(ptrs[0].offset));

    let mut extent = bch_txn::simple_extent(0, ptrs[0].offset, 8);
    extent.ptrs[0].cached = true;
    let key = BKey::extent(Pos::new(20, 0), 8, extent);
    commit_do(&h.sys, &cx, &h.triggers, false, |txn, cx| {
        txn.stage_extent(cx, BtreeId::Extents, key.clone())
    })
    .unwrap();

    // Bucket must be fully closed (write point retired) before the
    // invalidator may touch it; retire by filling it.
    while h
        .alloc
        .allocate(&cx, &h.triggers, 3, &[DeviceIdx(0)], 1, DataType::Cached, 8)
        .map(|p| dev.sector_to_bucket(p[0].offset) == bucket.0)
        .unwrap_or(false)
    {}

    let state = h.alloc.bucket_state(&cx, DeviceIdx(0), bucket).unwrap();
    assert_eq!(state.cached_sectors, 8);
    let old_gen = state.gen;

    // One LRU entry exists for the cached bucket.
    let mut iter = h.sys.iter(BtreeId::Lru, Pos::MIN);
    let mut lru_buckets = Vec::new();
    while let Some(k) = h.sys.iter_peek(&cx, &mut iter).unwrap() {
        iter.advance(&k);
        if let BVal::Lru(l) = &k.val {
            lru_buckets.push(l.bucket);
        }
    }
    assert!(lru_buckets.contains(&bucket.0));

    assert!(h.alloc.invalidate_one(&cx, &h.triggers, DeviceIdx(0)).unwrap());
    let state = h.alloc.bucket_state(&cx, DeviceIdx(0), bucket).unwrap();
    assert_eq!(state.cached_sectors, 0);
    assert_eq!(state.gen, old_gen.next(), "invalidation must bump the gen");
    // Stale cached pointer is now detectable: its gen no longer
    // matches the live bucket.
    assert_ne!(ptrs[0].gen, state.gen);

    check_freespace_consistency(&h, &cx);
}

#[test]
fn discard_queue_drains_to_free() {
    let h = harness_with_discard(true);
    let cx = cx();
    let ptrs = h
        .alloc
        .allocate(&cx, &h.triggers, 5, &[DeviceIdx(0)], 1, DataType::User, 8)
        .unwrap();
    let dev = h.devices.require(DeviceIdx(0)).unwrap();
    let bucket = BucketIdx(dev.sector_to_bucket(ptrs[0].offset));

    let key = BKey::extent(
        Pos::new(30, 0),
        8,
        bch_txn::simple_extent(0, ptrs[0].offset, 8),
    );
    commit_do(&h.sys, &cx, &h.triggers, false, |txn, cx| {
        txn.stage_extent(cx, BtreeId::Extents, key.clone())
    })
    .unwrap();
    commit_do(&h.sys, &cx, &h.triggers, false, |txn, cx| {
        txn.delete_range(cx, BtreeId::Extents, Pos::new(30, 0), Pos::new(30, 8))
    })
    .unwrap();

    let state = h.alloc.bucket_state(&cx, DeviceIdx(0), bucket).unwrap();
    assert!(state.need_discard());

    let processed = h.alloc.discard_pass(&cx, &h.triggers).unwrap();
    assert!(processed >= 1);
    let state = h.alloc.bucket_state(&cx, DeviceIdx(0), bucket).unwrap();
    assert!(!state.need_discard());
    assert!(state.gen > Gen(0), "deferred gen bump applied at discard");

    check_freespace_consistency(&h, &cx);
}

#[test]
fn reservations_enforce_capacity() {
    let h = harness();
    let usable = h.alloc.capacity_sectors() - h.alloc.capacity_sectors() * 8 / 100;
    let used = h.alloc.used_sectors();
    let headroom = usable - used;

    let r = h.alloc.disk_reservation_get(headroom / 2, 1).unwrap();
    assert!(h.alloc.disk_reservation_get(headroom, 1).is_err());
    drop(r);
    let r = h.alloc.disk_reservation_get(headroom / 2, 2).unwrap();
    r.consume();
    // Consuming does not double count: the space is free again until
    // extent commits account it.
    assert!(h.alloc.disk_reservation_get(headroom / 2, 1).is_ok());
}

#[test]
fn node_pool_refills_and_runs_dry() {
    let h = harness();
    let cx = cx();
    // Drain the pool.
    let mut taken = Vec::new();
    loop {
        match h.alloc.alloc_node(&cx) {
            Ok(ptrs) => taken.push(ptrs),
            Err(err) => {
                assert!(err.is_restart(), "dry pool must be a restart, got {err}");
                break;
            }
        }
    }
    assert!(!taken.is_empty());
    h.alloc.refill(&cx).unwrap();
    assert!(h.alloc.alloc_node(&cx).is_ok());
}

#[test]
fn fragmented_bucket_detection() {
    let h = harness();
    let cx = cx();
    let ptrs = h
        .alloc
        .allocate(&cx, &h.triggers, 9, &[DeviceIdx(0)], 1, DataType::User, 4)
        .unwrap();
    let key = BKey::extent(
        Pos::new(40, 0),
        4,
        bch_txn::simple_extent(0, ptrs[0].offset, 4),
    );
    commit_do(&h.sys, &cx, &h.triggers, false, |txn, cx| {
        txn.stage_extent(cx, BtreeId::Extents, key.clone())
    })
    .unwrap();

    let dev = h.devices.require(DeviceIdx(0)).unwrap();
    let bucket = dev.sector_to_bucket(ptrs[0].offset);
    let fragmented = h
        .alloc
        .fragmented_buckets(&cx, DeviceIdx(0), 2)
        .unwrap();
    assert!(fragmented.iter().any(|b| b.0 == bucket));
}

#[test]
fn freespace_init_rebuilds_missing_indices() {
    let h = harness();
    let cx = cx();

    // Damage: remove one freespace key behind the trigger's back.
    let victim = {
        let mut iter = h.sys.iter(BtreeId::Freespace, Pos::MIN);
        h.sys.iter_peek(&cx, &mut iter).unwrap().unwrap()
    };
    commit_do(&h.sys, &cx, &[], false, |txn, cx| {
        txn.delete(cx, BtreeId::Freespace, victim.pos)
    })
    .unwrap();

    let rebuilt = h
        .alloc
        .freespace_init(&cx, &h.triggers, DeviceIdx(0))
        .unwrap();
    assert!(rebuilt >= 1);
    check_freespace_consistency(&h, &cx);
}

#[test]
fn replicas_namespace_helper_is_stable() {
    // Accounting keys live in a reserved namespace of the subvolumes
    // btree; the helper must keep them ordered and disjoint from
    // subvolume ids.
    assert!(replicas_pos(0).inode != bch_types::keys::SUBVOL_INUM);
    assert!(replicas_pos(1) > replicas_pos(0));
}
