#![forbid(unsafe_code)]
//! UCache: the block cache behind every file read and write.
//!
//! Provides the block storage collaborator traits ([`ByteDevice`],
//! [`BlockStore`]), a multi-volume store over byte devices, and the
//! [`CacheManager`] façade that orchestrates the slot store, the LRU
//! eviction policy, the readahead engine, and per-volume hit/miss counters.

mod config;
pub mod eviction;
mod manager;
pub mod readahead;
mod slot;
mod stats;

pub use config::CacheConfig;
pub use manager::CacheManager;
pub use readahead::AccessPattern;
pub use slot::{PinnedBlock, SlotKey};
pub use stats::CacheStatsSnapshot;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use uf_error::{Result, UfError};
use uf_types::{BlockNumber, BlockSize, VolumeId};

/// Owned block buffer.
///
/// Invariant: length == block size of the store it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| UfError::InvalidArgument("I/O range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(UfError::InvalidArgument(format!(
            "I/O out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `FileExt` is thread-safe and does not share a seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write if possible, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(UfError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device. Clones share the same backing bytes.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of `len` bytes at `offset`, bypassing any cache above.
    #[must_use]
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        bytes[offset..offset + len].to_vec()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        // check_range proved offset + len <= bytes.len().
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block storage collaborator the cache loads from and writes back to.
///
/// Failures surface to the cache caller as [`UfError::Device`], except for
/// prefetch loads whose failures the cache discards.
pub trait BlockStore: Send + Sync {
    /// Block size shared by every volume of this store.
    fn block_size(&self) -> BlockSize;

    /// Number of blocks on `volume`.
    fn block_count(&self, volume: VolumeId) -> Result<u64>;

    /// Load one block.
    fn load_block(&self, volume: VolumeId, block: BlockNumber) -> Result<BlockBuf>;

    /// Store one block. `data.len()` MUST equal `block_size()`.
    fn store_block(&self, volume: VolumeId, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Flush the volume's pending writes to stable storage.
    fn sync(&self, volume: VolumeId) -> Result<()>;
}

#[derive(Debug)]
struct Volume<D> {
    device: D,
    block_count: u64,
}

/// Multi-volume block store over byte-addressed devices.
#[derive(Debug)]
pub struct VolumeStore<D: ByteDevice> {
    block_size: BlockSize,
    volumes: RwLock<HashMap<VolumeId, Arc<Volume<D>>>>,
}

impl<D: ByteDevice> VolumeStore<D> {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            volumes: RwLock::new(HashMap::new()),
        }
    }

    /// Attach `device` as `volume`. The device length must be block-aligned.
    pub fn attach(&self, volume: VolumeId, device: D) -> Result<()> {
        let len = device.len_bytes();
        let block_size = u64::from(self.block_size.get());
        let remainder = len % block_size;
        if remainder != 0 {
            return Err(UfError::InvalidArgument(format!(
                "device length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let mut volumes = self.volumes.write();
        if volumes.contains_key(&volume) {
            return Err(UfError::Exists);
        }
        volumes.insert(
            volume,
            Arc::new(Volume {
                device,
                block_count: len / block_size,
            }),
        );
        drop(volumes);
        tracing::info!(volume = volume.0, blocks = len / block_size, "volume attached");
        Ok(())
    }

    /// Detach `volume`. Callers unmount it from the cache first.
    pub fn detach(&self, volume: VolumeId) -> Result<()> {
        self.volumes
            .write()
            .remove(&volume)
            .map(|_| ())
            .ok_or(UfError::UnknownVolume(volume.0))
    }

    fn volume(&self, volume: VolumeId) -> Result<Arc<Volume<D>>> {
        self.volumes
            .read()
            .get(&volume)
            .cloned()
            .ok_or(UfError::UnknownVolume(volume.0))
    }

    fn block_offset(&self, vol: &Volume<D>, volume: VolumeId, block: BlockNumber) -> Result<u64> {
        if block.0 >= vol.block_count {
            return Err(UfError::Device {
                volume: volume.0,
                block: block.0,
                detail: format!("block out of range: block_count={}", vol.block_count),
            });
        }
        self.block_size
            .block_to_byte(block)
            .ok_or_else(|| UfError::InvalidArgument("block offset overflow".to_owned()))
    }
}

fn device_error(volume: VolumeId, block: BlockNumber, err: &UfError) -> UfError {
    UfError::Device {
        volume: volume.0,
        block: block.0,
        detail: err.to_string(),
    }
}

impl<D: ByteDevice> BlockStore for VolumeStore<D> {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self, volume: VolumeId) -> Result<u64> {
        Ok(self.volume(volume)?.block_count)
    }

    fn load_block(&self, volume: VolumeId, block: BlockNumber) -> Result<BlockBuf> {
        let vol = self.volume(volume)?;
        let offset = self.block_offset(&vol, volume, block)?;
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        vol.device
            .read_exact_at(offset, &mut buf)
            .map_err(|err| device_error(volume, block, &err))?;
        Ok(BlockBuf::new(buf))
    }

    fn store_block(&self, volume: VolumeId, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.block_size.as_usize();
        if data.len() != expected {
            return Err(UfError::InvalidArgument(format!(
                "store_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let vol = self.volume(volume)?;
        let offset = self.block_offset(&vol, volume, block)?;
        vol.device
            .write_all_at(offset, data)
            .map_err(|err| device_error(volume, block, &err))
    }

    fn sync(&self, volume: VolumeId) -> Result<()> {
        let vol = self.volume(volume)?;
        vol.device.sync().map_err(|err| device_error(volume, BlockNumber(0), &err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u32 = 4096;

    fn store_with(volume: VolumeId, blocks: usize) -> (VolumeStore<MemByteDevice>, MemByteDevice) {
        let store = VolumeStore::new(BlockSize::new(BS).unwrap());
        let dev = MemByteDevice::new(BS as usize * blocks);
        store.attach(volume, dev.clone()).expect("attach");
        (store, dev)
    }

    #[test]
    fn volume_store_round_trips() {
        let (store, dev) = store_with(VolumeId(1), 4);
        store
            .store_block(VolumeId(1), BlockNumber(2), &[7_u8; BS as usize])
            .expect("write");
        let read = store.load_block(VolumeId(1), BlockNumber(2)).expect("read");
        assert_eq!(read.as_slice(), &[7_u8; BS as usize]);
        assert_eq!(dev.snapshot(2 * BS as usize, 4), vec![7, 7, 7, 7]);
        assert_eq!(store.block_count(VolumeId(1)).unwrap(), 4);
    }

    #[test]
    fn volume_store_rejects_bad_requests() {
        let (store, _dev) = store_with(VolumeId(1), 2);
        assert!(matches!(
            store.load_block(VolumeId(9), BlockNumber(0)),
            Err(UfError::UnknownVolume(9))
        ));
        assert!(matches!(
            store.load_block(VolumeId(1), BlockNumber(2)),
            Err(UfError::Device { block: 2, .. })
        ));
        assert!(matches!(
            store.store_block(VolumeId(1), BlockNumber(0), &[1_u8; 10]),
            Err(UfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn attach_rejects_unaligned_and_duplicate_volumes() {
        let store = VolumeStore::new(BlockSize::new(BS).unwrap());
        assert!(store.attach(VolumeId(1), MemByteDevice::new(100)).is_err());
        store
            .attach(VolumeId(1), MemByteDevice::new(BS as usize))
            .expect("attach");
        assert!(matches!(
            store.attach(VolumeId(1), MemByteDevice::new(BS as usize)),
            Err(UfError::Exists)
        ));
        store.detach(VolumeId(1)).expect("detach");
        assert!(store.detach(VolumeId(1)).is_err());
    }

    #[test]
    fn file_byte_device_reads_and_writes() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        file.as_file().set_len(2 * u64::from(BS)).expect("set_len");
        let dev = FileByteDevice::open(file.path()).expect("open");
        assert!(dev.is_writable());
        dev.write_all_at(u64::from(BS), &[9_u8; 16]).expect("write");
        let mut buf = [0_u8; 16];
        dev.read_exact_at(u64::from(BS), &mut buf).expect("read");
        assert_eq!(buf, [9_u8; 16]);
        assert!(dev.read_exact_at(2 * u64::from(BS), &mut buf).is_err());
        dev.sync().expect("sync");
    }
}
