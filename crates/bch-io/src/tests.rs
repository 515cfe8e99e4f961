use super::*;
use bch_alloc::{Allocator, BucketIndexTrigger, ExtentAccountingTrigger};
use bch_block::{Device, MemDevice, pattern_bytes};
use bch_btree::{BtreeConfig, NodeAlloc};
use bch_journal::Journal;
use bch_txn::Transaction;
use bch_types::keys::StripePtr;
use bch_types::{AllocV, BucketIdx, Gen, JournalSeq, MemberState};
use parking_lot::Mutex;
use std::path::PathBuf;

fn cx() -> Cx {
    Cx::for_testing()
}

const BUCKET_SECTORS: u32 = 32;
const NBUCKETS: u64 = 2048;
const JOURNAL_BUCKETS: std::ops::Range<u64> = 4..68;
const BOOT_BUCKETS: std::ops::Range<u64> = 70..140;

struct BootstrapAlloc {
    next_sector: Mutex<u64>,
    node_sectors: u64,
    limit: u64,
}

impl NodeAlloc for BootstrapAlloc {
    fn alloc_node(&self, _cx: &Cx) -> bch_error::Result<Vec<ExtentPtr>> {
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
    io: FsIo,
    sys: Arc<BtreeSys>,
    devices: Arc<DeviceSet>,
    raw: Vec<Arc<MemDevice>>,
}

fn harness(nr_devs: u32, key: Option<[u8; 32]>) -> Harness {
    let cx = cx();
    let devices = Arc::new(DeviceSet::new());
    let mut raw = Vec::new();
    let mut journal_slots = Vec::new();
    for idx in 0..nr_devs {
        let mem = Arc::new(MemDevice::new(64 << 20));
        raw.push(Arc::clone(&mem));
        let device = Arc::new(Device::new(
            DeviceIdx(idx),
            PathBuf::from(format!("/mem/{idx}")),
            mem,
            MemberState::Rw,
            BUCKET_SECTORS,
            NBUCKETS,
            1,
            1,
            bch_types::data_allowed_default() | DataType::Cached.mask_bit(),
            false,
        ));
        devices.insert(Arc::clone(&device));
        journal_slots.push((device, JOURNAL_BUCKETS.collect::<Vec<u64>>()));
    }
    let journal = Arc::new(
        Journal::new(journal_slots, JournalSeq(1), ChecksumType::Crc32c, None).unwrap(),
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

    let seed_triggers: Vec<Arc<dyn CommitTrigger>> = vec![Arc::new(BucketIndexTrigger)];
    for dev in 0..nr_devs {
        for bucket in 1..NBUCKETS {
            let in_use = (JOURNAL_BUCKETS.contains(&bucket))
                || (dev == 0 && BOOT_BUCKETS.contains(&bucket));
            let (data_type, dirty) = if in_use {
                (DataType::Journal, BUCKET_SECTORS)
            } else {
                (DataType::Free, 0)
            };
            let pos = Pos::bucket(DeviceIdx(dev), BucketIdx(bucket));
            let key = BKey::new(
                pos,
                BVal::Alloc(AllocV {
                    data_type: data_type as u8,
                    dirty_sectors: dirty,
                    ..AllocV::default()
                }),
            );
            commit_do(&sys, &cx, &seed_triggers, false, |txn: &mut Transaction<'_>, cx| {
                txn.update(cx, BtreeId::Alloc, key.clone())
            })
            .unwrap();
        }
    }

    let alloc = Allocator::new(Arc::clone(&sys), Arc::clone(&devices), 8);
    alloc.init_usage(&cx).unwrap();
    sys.set_alloc(Arc::clone(&alloc) as Arc<dyn NodeAlloc>);
    alloc.refill(&cx).unwrap();

    let triggers: Vec<Arc<dyn CommitTrigger>> = vec![
        Arc::new(ExtentAccountingTrigger::new(Arc::clone(&alloc))),
        Arc::new(BucketIndexTrigger),
    ];
    let io = FsIo::new(
        Arc::clone(&sys),
        alloc,
        Arc::clone(&devices),
        triggers,
        key,
        4096,
    );
    Harness {
        io,
        sys,
        devices,
        raw,
    }
}

fn opts(nr_devs: u32, replicas: u8) -> WriteOpts {
    WriteOpts {
        compression: CompressionType::None,
        csum_type: ChecksumType::Crc32c,
        nr_replicas: replicas,
        nr_required: replicas,
        devs: (0..nr_devs).map(DeviceIdx).collect(),
        stream: 1,
        snapshot: SnapshotId::ROOT,
        cached: false,
        inherit_inode: None,
    }
}

fn root_rank() -> impl Fn(u32) -> Option<u32> {
    |s| (s == SnapshotId::ROOT.0).then_some(0)
}

fn first_extent(h: &Harness, inode: u64) -> BKey {
    let cx = cx();
    let mut iter = h.sys.iter(BtreeId::Extents, Pos::new(inode, 0));
    h.sys
        .iter_peek(&cx, &mut iter)
        .unwrap()
        .filter(|k| k.pos.inode == inode)
        .expect("extent present")
}

#[test]
fn write_read_round_trip_1mib() {
    let h = harness(1, None);
    let cx = cx();
    let data = vec![0xA5_u8; 1 << 20];
    h.io
        .write_file_range(&cx, 10, &root_rank(), 0, &data, &opts(1, 1))
        .unwrap();

    let back = h
        .io
        .read_file_range(&cx, 10, &root_rank(), 0, data.len())
        .unwrap();
    assert_eq!(back, data);

    // Inode size tracks the write.
    let pos = Pos::with_snapshot(10, 0, SnapshotId::ROOT);
    let mut iter = h.sys.iter(BtreeId::Inodes, pos);
    let inode_key = h.sys.iter_peek(&cx, &mut iter).unwrap().unwrap();
    let BVal::Inode(inode) = &inode_key.val else {
        panic!("not an inode");
    };
    assert_eq!(inode.size, 1 << 20);
}

#[test]
fn unaligned_write_preserves_neighbours() {
    let h = harness(1, None);
    let cx = cx();
    let base = pattern_bytes(8192, 3);
    h.io
        .write_file_range(&cx, 11, &root_rank(), 0, &base, &opts(1, 1))
        .unwrap();

    // Overwrite five bytes in the middle of a block.
    h.io
        .write_file_range(&cx, 11, &root_rank(), 100, b"hello", &opts(1, 1))
        .unwrap();

    let back = h
        .io
        .read_file_range(&cx, 11, &root_rank(), 0, 8192)
        .unwrap();
    assert_eq!(&back[..100], &base[..100]);
    assert_eq!(&back[100..105], b"hello");
    assert_eq!(&back[105..], &base[105..]);
}

#[test]
fn compression_round_trips_and_shrinks() {
    let h = harness(1, None);
    let cx = cx();
    let data = vec![0x42_u8; 256 << 10];
    let mut o = opts(1, 1);
    o.compression = CompressionType::Zstd;
    h.io
        .write_file_range(&cx, 12, &root_rank(), 0, &data, &o)
        .unwrap();

    let key = first_extent(&h, 12);
    let BVal::Extent(e) = &key.val else { panic!() };
    assert_eq!(e.crc.compression_type, CompressionType::Zstd as u8);
    assert!(e.crc.compressed_sectors < e.crc.uncompressed_sectors);

    let back = h
        .io
        .read_file_range(&cx, 12, &root_rank(), 0, data.len())
        .unwrap();
    assert_eq!(back, data);
}

#[test]
fn single_bit_flip_fails_single_replica_read() {
    let h = harness(1, None);
    let cx = cx();
    let data = pattern_bytes(64 << 10, 9);
    h.io
        .write_file_range(&cx, 13, &root_rank(), 0, &data, &opts(1, 1))
        .unwrap();

    let key = first_extent(&h, 13);
    let BVal::Extent(e) = &key.val else { panic!() };
    let byte = usize::try_from(e.ptrs[0].offset * 512 + 17).unwrap();
    h.raw[0].corrupt(byte, 0x01);

    let err = h.io.read_one_extent(&cx, &key).unwrap_err();
    assert!(matches!(err, Error::UnrecoverableRead { .. }), "got {err}");
}

#[test]
fn corrupt_replica_retries_to_the_good_one() {
    let h = harness(2, None);
    let cx = cx();
    let data = pattern_bytes(64 << 10, 5);
    h.io
        .write_file_range(&cx, 14, &root_rank(), 0, &data, &opts(2, 2))
        .unwrap();

    let key = first_extent(&h, 14);
    let BVal::Extent(e) = &key.val else { panic!() };
    assert_eq!(e.ptrs.len(), 2);

    // Corrupt every copy on device 0 (any order of ptrs).
    for ptr in e.ptrs.iter().filter(|p| p.dev.0 == 0) {
        let byte = usize::try_from(ptr.offset * 512 + 100).unwrap();
        h.raw[0].corrupt(byte, 0xFF);
    }

    let back = h
        .io
        .read_file_range(&cx, 14, &root_rank(), 0, data.len())
        .unwrap();
    assert_eq!(back, data);
}

#[test]
fn replica_loss_recovery_round_trip() {
    let h = harness(2, None);
    let cx = cx();
    let data = pattern_bytes(64 << 10, 7);
    h.io
        .write_file_range(&cx, 15, &root_rank(), 0, &data, &opts(2, 2))
        .unwrap();

    // Offline one device entirely.
    h.devices
        .require(DeviceIdx(0))
        .unwrap()
        .set_state(MemberState::Failed);

    let back = h
        .io
        .read_file_range(&cx, 15, &root_rank(), 0, data.len())
        .unwrap();
    assert_eq!(back, data);
}

#[test]
fn rereplicate_restores_redundancy() {
    let h = harness(2, None);
    let cx = cx();
    let data = pattern_bytes(32 << 10, 2);
    // Written with one replica only.
    let mut o = opts(2, 1);
    o.devs = vec![DeviceIdx(0)];
    h.io
        .write_file_range(&cx, 16, &root_rank(), 0, &data, &o)
        .unwrap();

    let key = first_extent(&h, 16);
    h.io
        .add_replica(&cx, &key, &[DeviceIdx(0), DeviceIdx(1)], false)
        .unwrap();

    let key = first_extent(&h, 16);
    let BVal::Extent(e) = &key.val else { panic!() };
    assert_eq!(e.ptrs.len(), 2);
    let devs: Vec<u32> = e.ptrs.iter().map(|p| p.dev.0).collect();
    assert!(devs.contains(&0) && devs.contains(&1));

    // The new copy alone must satisfy reads.
    h.devices
        .require(DeviceIdx(0))
        .unwrap()
        .set_state(MemberState::Failed);
    let back = h
        .io
        .read_file_range(&cx, 16, &root_rank(), 0, data.len())
        .unwrap();
    assert_eq!(back, data);
}

#[test]
fn drop_replica_refuses_last_copy() {
    let h = harness(2, None);
    let cx = cx();
    let data = pattern_bytes(16 << 10, 4);
    h.io
        .write_file_range(&cx, 17, &root_rank(), 0, &data, &opts(2, 2))
        .unwrap();

    let key = first_extent(&h, 17);
    h.io.drop_replica(&cx, &key, DeviceIdx(0)).unwrap();
    let key = first_extent(&h, 17);
    let err = h.io.drop_replica(&cx, &key, DeviceIdx(1)).unwrap_err();
    assert!(matches!(err, Error::DataLossRisk(_)));
}

#[test]
fn encrypted_write_read_round_trip() {
    let h = harness(1, Some([0x5C; 32]));
    let cx = cx();
    let data = pattern_bytes(128 << 10, 6);
    h.io
        .write_file_range(&cx, 18, &root_rank(), 0, &data, &opts(1, 1))
        .unwrap();

    let key = first_extent(&h, 18);
    let BVal::Extent(e) = &key.val else { panic!() };
    assert_eq!(e.crc.csum_type, ChecksumType::Poly1305 as u8);

    // Ciphertext on disk differs from plaintext.
    let mut on_disk = vec![0_u8; 4096];
    h.devices
        .require(e.ptrs[0].dev)
        .unwrap()
        .read_sectors(&cx, e.ptrs[0].offset, &mut on_disk)
        .unwrap();
    assert_ne!(&on_disk[..], &data[..4096]);

    let back = h
        .io
        .read_file_range(&cx, 18, &root_rank(), 0, data.len())
        .unwrap();
    assert_eq!(back, data);

    // Tampering breaks the AEAD tag.
    let byte = usize::try_from(e.ptrs[0].offset * 512 + 5).unwrap();
    h.raw[0].corrupt(byte, 0x80);
    assert!(h.io.read_one_extent(&cx, &key).is_err());
}

#[test]
fn stripe_reconstruction_rescues_lost_extent() {
    let h = harness(2, None);
    let cx = cx();

    // Build a 3+1 stripe by hand on raw device sectors.
    let shard_sectors = 8_u32;
    let shard_bytes = shard_sectors as usize * 512;
    let data_shards: Vec<Vec<u8>> = (0..3_u8).map(|i| pattern_bytes(shard_bytes, i + 1)).collect();
    let parity = ec::encode_parity(&data_shards, 1).unwrap();

    // Shard locations: spread over the two devices, in the bootstrap
    // scratch area of device 1 (unused there).
    let base = BOOT_BUCKETS.start * u64::from(BUCKET_SECTORS);
    let mut shards = Vec::new();
    for (i, payload) in data_shards.iter().chain(parity.iter()).enumerate() {
        let dev = DeviceIdx(1);
        let offset = base + (i as u64) * u64::from(shard_sectors);
        h.devices
            .require(dev)
            .unwrap()
            .write_sectors(&cx, offset, payload)
            .unwrap();
        shards.push(ec::StripeShard { dev, offset });
    }
    h.io.register_stripe(ec::Stripe {
        idx: 1,
        data_shards: 3,
        parity_shards: 1,
        shard_sectors,
        shards: shards.clone(),
    });

    // An extent whose only replica points at garbage, but which names
    // stripe block 1.
    let nonce = 0;
    let image = &data_shards[1];
    let csum_val = csum(ChecksumType::Crc32c, None, Nonce::for_extent(30, 0, nonce), image)
        .unwrap();
    let key = BKey::extent(
        Pos::with_snapshot(30, 0, SnapshotId::ROOT),
        shard_sectors,
        ExtentV {
            ptrs: vec![ExtentPtr {
                dev: DeviceIdx(0),
                offset: 9999 * u64::from(BUCKET_SECTORS), // wrong location
                gen: Gen(0),
                cached: false,
            }],
            crc: CrcDescriptor {
                csum_type: ChecksumType::Crc32c as u8,
                compression_type: 0,
                compressed_sectors: shard_sectors,
                uncompressed_sectors: shard_sectors,
                offset: 0,
                nonce,
                csum: csum_val.to_words(),
            },
            stripe: Some(StripePtr { idx: 1, block: 1 }),
            nr_required: 1,
        },
    );

    let bytes = h.io.read_one_extent(&cx, &key).unwrap();
    assert_eq!(&bytes, &data_shards[1]);

    // Losing more shards than parity covers degrades to failure.
    h.devices
        .require(DeviceIdx(1))
        .unwrap()
        .set_state(MemberState::Failed);
    assert!(h.io.read_one_extent(&cx, &key).is_err());
}
