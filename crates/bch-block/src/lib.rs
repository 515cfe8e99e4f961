#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` trait with pread/pwrite semantics, a
//! file-backed implementation, and the multi-device set the rest of the
//! core addresses by member index. All I/O takes a `&Cx` capability
//! context for cooperative cancellation.

use asupersync::Cx;
use bch_error::{Error, Result};
use bch_types::{DeviceIdx, MemberState, SECTOR_SIZE};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Map a cancellation checkpoint into the workspace error type.
#[inline]
pub fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| Error::Cancelled)
}

/// Byte-addressed device for fixed-offset I/O.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;

    /// Hint that `[offset, offset + len)` no longer holds live data.
    /// Devices without trim support ignore this.
    fn discard_range(&self, _cx: &Cx, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}

/// File-backed byte device using `pread`/`pwrite` style I/O via
/// `std::os::unix::fs::FileExt`, which is thread-safe and needs no
/// shared seek position.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path)
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        trace!(
            target: "bch::block",
            event = "device_open",
            path = %path.display(),
            len,
            writable
        );
        Ok(Self {
            file,
            len,
            writable,
        })
    }

    /// Create (or truncate) a file-backed device of `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file,
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory device for unit tests and simulation.
#[derive(Debug)]
pub struct MemDevice {
    data: RwLock<Vec<u8>>,
}

impl MemDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: RwLock::new(vec![0_u8; len]),
        }
    }

    /// Flip one byte, for corruption-injection tests.
    pub fn corrupt(&self, offset: usize, xor: u8) {
        let mut data = self.data.write();
        if let Some(b) = data.get_mut(offset) {
            *b ^= xor;
        }
    }
}

impl ByteDevice for MemDevice {
    fn len_bytes(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let data = self.data.read();
        let offset = usize::try_from(offset)
            .map_err(|_| Error::InvalidArgument("offset overflows usize".into()))?;
        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read past end of device",
                ))
            })?;
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let mut data = self.data.write();
        let offset = usize::try_from(offset)
            .map_err(|_| Error::InvalidArgument("offset overflows usize".into()))?;
        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "write past end of device",
                ))
            })?;
        data[end - buf.len()..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)
    }
}

// ── Member devices ──────────────────────────────────────────────────────────

/// One member device: backing storage plus the geometry and runtime
/// state the allocator and I/O paths consult.
pub struct Device {
    pub idx: DeviceIdx,
    pub path: PathBuf,
    dev: Arc<dyn ByteDevice>,
    state: RwLock<MemberState>,
    /// Bucket size in sectors.
    pub bucket_size: u32,
    pub nbuckets: u64,
    pub first_bucket: u32,
    pub durability: u8,
    pub data_allowed: u8,
    pub discard: bool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("idx", &self.idx)
            .field("path", &self.path)
            .field("state", &*self.state.read())
            .field("nbuckets", &self.nbuckets)
            .finish_non_exhaustive()
    }
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        idx: DeviceIdx,
        path: PathBuf,
        dev: Arc<dyn ByteDevice>,
        state: MemberState,
        bucket_size: u32,
        nbuckets: u64,
        first_bucket: u32,
        durability: u8,
        data_allowed: u8,
        discard: bool,
    ) -> Self {
        Self {
            idx,
            path,
            dev,
            state: RwLock::new(state),
            bucket_size,
            nbuckets,
            first_bucket,
            durability,
            data_allowed,
            discard,
        }
    }

    #[must_use]
    pub fn state(&self) -> MemberState {
        *self.state.read()
    }

    pub fn set_state(&self, state: MemberState) {
        debug!(
            target: "bch::block",
            event = "device_state",
            dev = self.idx.0,
            state = %state
        );
        *self.state.write() = state;
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        matches!(self.state(), MemberState::Rw | MemberState::Ro)
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.state() == MemberState::Rw
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.dev.len_bytes()
    }

    /// First sector of `bucket`.
    #[must_use]
    pub fn bucket_to_sector(&self, bucket: u64) -> u64 {
        bucket * u64::from(self.bucket_size)
    }

    /// Bucket containing `sector`.
    #[must_use]
    pub fn sector_to_bucket(&self, sector: u64) -> u64 {
        sector / u64::from(self.bucket_size)
    }

    pub fn read_sectors(&self, cx: &Cx, sector: u64, buf: &mut [u8]) -> Result<()> {
        if !self.is_readable() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("device {} is {}", self.idx.0, self.state()),
            )));
        }
        self.dev
            .read_exact_at(cx, sector * u64::from(SECTOR_SIZE), buf)
    }

    pub fn write_sectors(&self, cx: &Cx, sector: u64, buf: &[u8]) -> Result<()> {
        if !self.is_writable() {
            return Err(Error::ReadOnly);
        }
        debug_assert_eq!(buf.len() % SECTOR_SIZE as usize, 0);
        self.dev
            .write_all_at(cx, sector * u64::from(SECTOR_SIZE), buf)
    }

    pub fn sync(&self, cx: &Cx) -> Result<()> {
        self.dev.sync(cx)
    }

    pub fn discard_sectors(&self, cx: &Cx, sector: u64, nr: u64) -> Result<()> {
        if !self.discard {
            return Ok(());
        }
        self.dev.discard_range(
            cx,
            sector * u64::from(SECTOR_SIZE),
            nr * u64::from(SECTOR_SIZE),
        )
    }
}

/// The set of member devices, indexed by member slot. Slots of offline
/// or removed members are `None`.
#[derive(Debug, Default)]
pub struct DeviceSet {
    devices: RwLock<Vec<Option<Arc<Device>>>>,
}

impl DeviceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Arc<Device>) {
        let mut devices = self.devices.write();
        let slot = device.idx.0 as usize;
        if devices.len() <= slot {
            devices.resize(slot + 1, None);
        }
        devices[slot] = Some(device);
    }

    pub fn remove(&self, idx: DeviceIdx) -> Option<Arc<Device>> {
        let mut devices = self.devices.write();
        devices.get_mut(idx.0 as usize).and_then(Option::take)
    }

    #[must_use]
    pub fn get(&self, idx: DeviceIdx) -> Option<Arc<Device>> {
        self.devices.read().get(idx.0 as usize).cloned().flatten()
    }

    pub fn require(&self, idx: DeviceIdx) -> Result<Arc<Device>> {
        self.get(idx)
            .ok_or_else(|| Error::NotAMember(format!("device index {}", idx.0)))
    }

    /// Live devices, in slot order.
    #[must_use]
    pub fn iter(&self) -> Vec<Arc<Device>> {
        self.devices.read().iter().flatten().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sync every writable member; failures degrade the failing device
    /// rather than aborting the others.
    pub fn sync_all(&self, cx: &Cx) -> Result<()> {
        let mut first_err = None;
        for device in self.iter() {
            if !device.is_writable() {
                continue;
            }
            if let Err(err) = device.sync(cx) {
                warn!(
                    target: "bch::block",
                    event = "sync_failed",
                    dev = device.idx.0,
                    error = %err
                );
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Fill a buffer with a deterministic pattern; tests across the
/// workspace use this for recognizable payloads.
#[must_use]
pub fn pattern_bytes(len: usize, seed: u8) -> Vec<u8> {
    let mut out = vec![0_u8; len];
    let mut state = seed;
    for b in &mut out {
        *b = state;
        state = state.wrapping_mul(31).wrapping_add(7);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cx() -> Cx {
        Cx::for_testing()
    }

    #[test]
    fn file_device_read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev0");
        let dev = FileByteDevice::create(&path, 1 << 20).unwrap();
        assert_eq!(dev.len_bytes(), 1 << 20);

        let cx = cx();
        let payload = pattern_bytes(4096, 0xA5);
        dev.write_all_at(&cx, 8192, &payload).unwrap();
        let mut back = vec![0_u8; 4096];
        dev.read_exact_at(&cx, 8192, &mut back).unwrap();
        assert_eq!(back, payload);
        dev.sync(&cx).unwrap();
    }

    #[test]
    fn mem_device_bounds() {
        let cx = cx();
        let dev = MemDevice::new(4096);
        let mut buf = vec![0_u8; 512];
        assert!(dev.read_exact_at(&cx, 4096 - 512, &mut buf).is_ok());
        assert!(dev.read_exact_at(&cx, 4096 - 511, &mut buf).is_err());
        assert!(dev.write_all_at(&cx, 4096, &buf[..1]).is_err());
    }

    fn test_device(idx: u32, state: MemberState) -> Arc<Device> {
        Arc::new(Device::new(
            DeviceIdx(idx),
            PathBuf::from(format!("/mem/{idx}")),
            Arc::new(MemDevice::new(1 << 20)),
            state,
            256,
            8,
            1,
            1,
            bch_types::data_allowed_default(),
            false,
        ))
    }

    #[test]
    fn device_state_gates_io() {
        let cx = cx();
        let dev = test_device(0, MemberState::Ro);
        let mut buf = vec![0_u8; 512];
        assert!(dev.read_sectors(&cx, 0, &mut buf).is_ok());
        assert!(matches!(
            dev.write_sectors(&cx, 0, &buf),
            Err(Error::ReadOnly)
        ));

        dev.set_state(MemberState::Failed);
        assert!(dev.read_sectors(&cx, 0, &mut buf).is_err());
    }

    #[test]
    fn bucket_sector_math() {
        let dev = test_device(0, MemberState::Rw);
        assert_eq!(dev.bucket_to_sector(0), 0);
        assert_eq!(dev.bucket_to_sector(3), 768);
        assert_eq!(dev.sector_to_bucket(767), 2);
        assert_eq!(dev.sector_to_bucket(768), 3);
    }

    #[test]
    fn device_set_slots() {
        let set = DeviceSet::new();
        set.insert(test_device(2, MemberState::Rw));
        set.insert(test_device(0, MemberState::Rw));
        assert_eq!(set.len(), 2);
        assert!(set.get(DeviceIdx(1)).is_none());
        assert!(set.require(DeviceIdx(2)).is_ok());
        assert!(set.require(DeviceIdx(3)).is_err());

        let removed = set.remove(DeviceIdx(0)).unwrap();
        assert_eq!(removed.idx, DeviceIdx(0));
        assert_eq!(set.len(), 1);
    }
}
