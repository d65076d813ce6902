//! Data-block allocation for extent units.
//!
//! The allocator is an external collaborator of the body engine: it hands
//! out runs of device blocks for newly written extent data and takes back
//! the runs released when extent units are cut. Its state is not persisted;
//! at mount it is rebuilt from the extent units reachable in the store, so a
//! block written but never referenced by a committed extent (crash between
//! the data write and the commit) simply becomes free again.

use parking_lot::Mutex;
use tfs_error::{Result, TfsError};
use tfs_types::{BlockNumber, BlockRange};
use tracing::{debug, trace};

pub trait BlockAllocator: Send + Sync {
    /// Allocate up to `count` contiguous blocks.
    ///
    /// Returns a run of at least one block; the run is shorter than `count`
    /// when no contiguous run of that length exists. Fails with
    /// `TfsError::NoSpace` only when no block is free at all.
    fn alloc(&self, count: u64) -> Result<BlockRange>;

    /// Return a run of blocks to the free pool.
    fn free(&self, range: BlockRange) -> Result<()>;

    /// Mark a run as in use without allocating it (mount-time rebuild).
    fn mark_used(&self, range: BlockRange) -> Result<()>;

    /// Number of free blocks.
    fn free_count(&self) -> u64;
}

#[derive(Debug)]
struct BitmapState {
    bitmap: Vec<u8>,
    count: u64,
    free: u64,
    /// Next-fit search start.
    goal: u64,
}

impl BitmapState {
    fn get(&self, idx: u64) -> bool {
        let Ok(byte_idx) = usize::try_from(idx / 8) else {
            return true;
        };
        self.bitmap
            .get(byte_idx)
            .is_some_and(|byte| (byte >> (idx % 8)) & 1 == 1)
    }

    fn set(&mut self, idx: u64, used: bool) {
        let Ok(byte_idx) = usize::try_from(idx / 8) else {
            return;
        };
        if let Some(byte) = self.bitmap.get_mut(byte_idx) {
            let mask = 1_u8 << (idx % 8);
            if used {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
    }

    /// First free bit at or after `start`, wrapping around once.
    fn find_free(&self, start: u64) -> Option<u64> {
        (start..self.count)
            .chain(0..start.min(self.count))
            .find(|&idx| !self.get(idx))
    }

    fn check_range(&self, range: BlockRange) -> Result<()> {
        if range.end() > self.count {
            return Err(TfsError::Format(format!(
                "block range out of bounds: start={} count={} device_blocks={}",
                range.start.0, range.count, self.count
            )));
        }
        Ok(())
    }
}

/// Bitmap allocator with next-fit placement.
#[derive(Debug)]
pub struct BitmapAllocator {
    state: Mutex<BitmapState>,
}

impl BitmapAllocator {
    /// Allocator over `count` blocks, the first `reserved` of which are never
    /// handed out.
    pub fn new(count: u64, reserved: u64) -> Result<Self> {
        if reserved > count {
            return Err(TfsError::Format(format!(
                "reserved blocks ({reserved}) exceed device blocks ({count})"
            )));
        }
        let bytes = usize::try_from(count.div_ceil(8))
            .map_err(|_| TfsError::Format("bitmap size does not fit usize".to_owned()))?;
        let mut state = BitmapState {
            bitmap: vec![0_u8; bytes],
            count,
            free: count,
            goal: reserved,
        };
        for idx in 0..reserved {
            state.set(idx, true);
        }
        state.free -= reserved;
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

impl BlockAllocator for BitmapAllocator {
    fn alloc(&self, count: u64) -> Result<BlockRange> {
        if count == 0 {
            return Err(TfsError::Format("cannot allocate zero blocks".to_owned()));
        }
        let mut state = self.state.lock();
        let goal = state.goal;
        let Some(start) = state.find_free(goal) else {
            return Err(TfsError::NoSpace);
        };
        let mut len = 1_u64;
        while len < count && start + len < state.count && !state.get(start + len) {
            len += 1;
        }
        for idx in start..start + len {
            state.set(idx, true);
        }
        state.free -= len;
        state.goal = start + len;
        trace!(
            target: "tfs::alloc",
            event = "alloc",
            start,
            len,
            requested = count,
            free = state.free
        );
        Ok(BlockRange::new(BlockNumber(start), len))
    }

    fn free(&self, range: BlockRange) -> Result<()> {
        let mut state = self.state.lock();
        state.check_range(range)?;
        for idx in range.start.0..range.end() {
            if !state.get(idx) {
                return Err(TfsError::Format(format!("double free of block {idx}")));
            }
        }
        for idx in range.start.0..range.end() {
            state.set(idx, false);
        }
        state.free += range.count;
        trace!(
            target: "tfs::alloc",
            event = "free",
            start = range.start.0,
            len = range.count,
            free = state.free
        );
        Ok(())
    }

    fn mark_used(&self, range: BlockRange) -> Result<()> {
        let mut state = self.state.lock();
        state.check_range(range)?;
        let mut newly_used = 0_u64;
        for idx in range.start.0..range.end() {
            if !state.get(idx) {
                state.set(idx, true);
                newly_used += 1;
            }
        }
        state.free -= newly_used;
        if newly_used != range.count {
            debug!(
                target: "tfs::alloc",
                event = "mark_used_overlap",
                start = range.start.0,
                len = range.count,
                already_used = range.count - newly_used
            );
        }
        Ok(())
    }

    fn free_count(&self) -> u64 {
        self.state.lock().free
    }
}
