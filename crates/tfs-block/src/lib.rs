#![forbid(unsafe_code)]
//! Block I/O layer for extent data.
//!
//! Extent units point at raw device blocks that live outside the keyed
//! store. This crate provides the `BlockDevice` trait those blocks are read
//! and written through, an in-memory device for tests and crash simulation,
//! a file-backed device, and the data-block allocator.

pub mod alloc;

pub use alloc::{BitmapAllocator, BlockAllocator};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tfs_error::{Result, TfsError};
use tfs_types::BlockNumber;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
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

/// File-backed byte device using `pread`/`pwrite` style I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing image file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) an image file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    fn check_range(&self, offset: u64, len: usize, what: &str) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(len)
                    .map_err(|_| TfsError::Format(format!("{what} length overflows u64")))?,
            )
            .ok_or_else(|| TfsError::Format(format!("{what} range overflows u64")))?;
        if end > self.len {
            return Err(TfsError::Format(format!(
                "{what} out of bounds: offset={offset} len={len} file_len={}",
                self.len
            )));
        }
        Ok(())
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len(), "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_range(offset, buf.len(), "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

fn block_size_usize(block_size: u32) -> Result<usize> {
    usize::try_from(block_size)
        .map_err(|_| TfsError::Format("block_size does not fit usize".to_owned()))
}

fn check_block(block: BlockNumber, block_count: u64) -> Result<()> {
    if block.0 >= block_count {
        return Err(TfsError::Format(format!(
            "block out of range: block={} block_count={block_count}",
            block.0
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(TfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(TfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / block_size_u64,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn byte_offset(&self, block: BlockNumber) -> Result<u64> {
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| TfsError::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_block(block, self.block_count)?;
        let mut buf = vec![0_u8; block_size_usize(self.block_size)?];
        self.inner.read_exact_at(self.byte_offset(block)?, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = block_size_usize(self.block_size)?;
        if data.len() != expected {
            return Err(TfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        check_block(block, self.block_count)?;
        self.inner.write_all_at(self.byte_offset(block)?, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// In-memory block device.
///
/// Unwritten blocks read back as zeros. Contents survive dropping every
/// volume that uses the device, so a test can "crash" a volume and mount
/// the same device again.
#[derive(Debug)]
pub struct MemBlockDevice {
    blocks: RwLock<HashMap<BlockNumber, Vec<u8>>>,
    block_size: u32,
    block_count: u64,
}

impl MemBlockDevice {
    pub fn new(block_size: u32, block_count: u64) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(TfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        Ok(Self {
            blocks: RwLock::new(HashMap::new()),
            block_size,
            block_count,
        })
    }

    /// Number of blocks that have ever been written.
    #[must_use]
    pub fn written_blocks(&self) -> usize {
        self.blocks.read().len()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_block(block, self.block_count)?;
        let bs = block_size_usize(self.block_size)?;
        let data = self
            .blocks
            .read()
            .get(&block)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; bs]);
        Ok(BlockBuf::new(data))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_block(block, self.block_count)?;
        let expected = block_size_usize(self.block_size)?;
        if data.len() != expected {
            return Err(TfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        self.blocks.write().insert(block, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_reads_zeros_for_unwritten_blocks() {
        let dev = MemBlockDevice::new(512, 8).expect("device");
        let buf = dev.read_block(BlockNumber(3)).expect("read");
        assert_eq!(buf.as_slice(), &[0_u8; 512]);
        assert_eq!(dev.written_blocks(), 0);
    }

    #[test]
    fn mem_device_round_trips_and_bounds_checks() {
        let dev = MemBlockDevice::new(512, 8).expect("device");
        dev.write_block(BlockNumber(7), &[0xAB; 512])
            .expect("write last block");
        assert_eq!(
            dev.read_block(BlockNumber(7)).expect("read").as_slice(),
            &[0xAB; 512]
        );
        assert!(dev.read_block(BlockNumber(8)).is_err());
        assert!(dev.write_block(BlockNumber(0), &[0; 100]).is_err());
    }

    #[test]
    fn file_backed_device_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.img");
        let bytes = FileByteDevice::create(&path, 16 * 4096).expect("create image");
        let dev = ByteBlockDevice::new(bytes, 4096).expect("block device");
        assert_eq!(dev.block_count(), 16);

        dev.write_block(BlockNumber(5), &[0x5A; 4096])
            .expect("write block 5");
        dev.sync().expect("sync");

        let reopened =
            ByteBlockDevice::new(FileByteDevice::open(&path).expect("reopen"), 4096)
                .expect("block device");
        assert_eq!(
            reopened.read_block(BlockNumber(5)).expect("read").as_slice(),
            &[0x5A; 4096]
        );
        assert_eq!(
            reopened.read_block(BlockNumber(4)).expect("read").as_slice(),
            &[0_u8; 4096]
        );
        assert!(reopened.read_block(BlockNumber(16)).is_err());
    }

    #[test]
    fn byte_block_device_rejects_unaligned_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("odd.img");
        let bytes = FileByteDevice::create(&path, 4096 + 10).expect("create image");
        assert!(ByteBlockDevice::new(bytes, 4096).is_err());
    }
}
