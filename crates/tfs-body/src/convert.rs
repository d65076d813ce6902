//! Online tail↔extent conversion.
//!
//! Both directions follow the same discipline:
//!
//! 1. One commit sets `partial_conversion` (with the direction) in the stat
//!    data and records a `Conversion` safe-link.
//! 2. The body is moved in bounded steps, each one commit that cuts the
//!    source items of the step and inserts the same bytes in the target
//!    form at the same offsets. Converted items always form a prefix of the
//!    body, so the first remaining source item is the resume point.
//! 3. One commit clears the marker and the safe-link together; only then
//!    does the in-memory representation change.
//!
//! An error aborts the call with the marker still set; the next open,
//! write, explicit conversion or mount resumes from the first remaining
//! source item. The caller holds exclusive access for the whole run.

use crate::body::FileBody;
use crate::gate::AccessToken;
use crate::hint::Hint;
use crate::safelink::{SafeLinkLog, SafeLinkRecord};
use crate::volume::Volume;
use std::thread;
use tfs_block::BlockAllocator;
use tfs_error::{Result, TfsError};
use tfs_tree::{ExtentUnit, Item, ItemKind, KeyedStore, SearchMode};
use tfs_types::{
    BlockNumber, BlockRange, ConversionTarget, ItemKey, LinkKind, ObjectId, Representation,
    StatData,
};
use tracing::{debug, info, trace};

impl Volume {
    /// Resume a conversion left pending by an error or a crash, in its
    /// recorded direction. No-op without a pending marker.
    pub(crate) fn finish_pending_conversion(
        &self,
        token: &AccessToken,
        body: &FileBody,
    ) -> Result<()> {
        let owner = body.owner();
        Self::require_exclusive(token, owner)?;
        let Some(stat) = self.store.stat_data(owner)? else {
            return Ok(());
        };
        if !stat.partial_conversion {
            return Ok(());
        }
        let target = stat.conversion_target.unwrap_or(ConversionTarget::Extents);
        info!(
            target: "tfs::convert",
            event = "resume",
            object = owner.0,
            target = ?target
        );
        match target {
            ConversionTarget::Extents => self.run_tail_to_extent(token, body),
            ConversionTarget::Tails => self.run_extent_to_tail(token, body),
        }
    }

    /// Move a `Tails` body to extents, `tail_to_extent_batch_pages` pages
    /// per commit.
    pub(crate) fn run_tail_to_extent(&self, token: &AccessToken, body: &FileBody) -> Result<()> {
        let owner = body.owner();
        Self::require_exclusive(token, owner)?;
        let mut stat = self.handle_stat(owner)?;
        if !self.conversion_needed(body, &stat, ConversionTarget::Extents)? {
            return Ok(());
        }
        let resumed = stat.partial_conversion;
        if !resumed {
            self.mark_conversion(owner, &mut stat, ConversionTarget::Extents)?;
        }

        let bs = self.block_size;
        let batch_bytes = self
            .options
            .tail_to_extent_batch_pages
            .checked_mul(bs.as_u64())
            .ok_or_else(|| TfsError::Format("conversion batch overflows offset".to_owned()))?;
        let mut hint = Hint::new();
        let mut batches = 0_u64;
        while let Some(start) = self.first_item_of(owner, ItemKind::Tail)? {
            if bs.offset_in_block(start) != 0 {
                return Err(body.inconsistent(format!(
                    "remaining tails start unaligned at {start}"
                )));
            }
            let window_end = start.saturating_add(batch_bytes);
            let items = self.body_items(&mut hint, owner, start, window_end, SearchMode::Write)?;
            if let Some(view) = items.iter().find(|view| view.kind() != ItemKind::Tail) {
                return Err(body.inconsistent(format!(
                    "{:?} item at {} after the first remaining tail",
                    view.kind(),
                    view.key
                )));
            }
            let data_end = items
                .iter()
                .map(|view| view.end().min(window_end))
                .max()
                .unwrap_or(start);
            let pages = bs.block_index(bs.align_up(data_end).unwrap_or(data_end)) - bs.block_index(start);
            let mut bytes = vec![0_u8; usize::try_from(pages * bs.as_u64()).map_err(|_| {
                TfsError::Format("conversion batch does not fit usize".to_owned())
            })?];
            for view in &items {
                if let Item::Tail(tail) = &view.item {
                    copy_tail(&mut bytes, start, view.key.offset, tail, window_end);
                }
            }
            self.move_to_extents(owner, start, &bytes)?;
            batches += 1;
            trace!(
                target: "tfs::convert",
                event = "t2e_batch",
                object = owner.0,
                offset = start,
                pages
            );
            thread::yield_now();
        }

        self.finish_conversion(owner, stat)?;
        body.convert_to_extents()?;
        info!(
            target: "tfs::convert",
            event = "tail_to_extent",
            object = owner.0,
            size = stat.size,
            batches,
            resumed
        );
        Ok(())
    }

    /// Move a `Extents` body to tails, one page per commit.
    pub(crate) fn run_extent_to_tail(&self, token: &AccessToken, body: &FileBody) -> Result<()> {
        let owner = body.owner();
        Self::require_exclusive(token, owner)?;
        let mut stat = self.handle_stat(owner)?;
        if !self.conversion_needed(body, &stat, ConversionTarget::Tails)? {
            return Ok(());
        }
        let resumed = stat.partial_conversion;
        if !resumed {
            self.mark_conversion(owner, &mut stat, ConversionTarget::Tails)?;
        }

        let bs = self.block_size;
        let mut hint = Hint::new();
        let mut pages = 0_u64;
        while let Some(start) = self.first_item_of(owner, ItemKind::Extent)? {
            if start >= stat.size {
                break;
            }
            let len = bs.as_u64().min(stat.size - start);
            let mut page = vec![0_u8; usize::try_from(len).map_err(|_| {
                TfsError::Format("page does not fit usize".to_owned())
            })?];
            self.read_range(
                &mut hint,
                body,
                Representation::Extents,
                &stat,
                start,
                &mut page,
            )?;
            let mut txn = self.store.begin();
            let at = ItemKey::body(owner, start);
            txn.stage_cut(at, at.with_offset(start.saturating_add(bs.as_u64())));
            txn.stage_insert_flow(at, page);
            let outcome = self.store.commit(txn)?;
            self.release(&outcome.freed);
            pages += 1;
            trace!(target: "tfs::convert", event = "e2t_page", object = owner.0, offset = start);
            thread::yield_now();
        }

        self.finish_conversion(owner, stat)?;
        body.convert_to_tails()?;
        info!(
            target: "tfs::convert",
            event = "extent_to_tail",
            object = owner.0,
            size = stat.size,
            pages,
            resumed
        );
        Ok(())
    }

    /// Whether a run toward `target` has anything to do.
    ///
    /// A body already in `target` form or empty needs nothing. A pending
    /// conversion in the other direction must finish first.
    fn conversion_needed(
        &self,
        body: &FileBody,
        stat: &StatData,
        target: ConversionTarget,
    ) -> Result<bool> {
        if stat.partial_conversion {
            let pending = stat.conversion_target.unwrap_or(ConversionTarget::Extents);
            if pending != target {
                return Err(TfsError::InvalidState(format!(
                    "object {}: conversion to {:?} is still pending",
                    body.owner(),
                    pending
                )));
            }
        }
        let source = match target {
            ConversionTarget::Extents => Representation::Tails,
            ConversionTarget::Tails => Representation::Extents,
        };
        let current = body.resolve_representation(&*self.store, stat)?;
        if current == source {
            return Ok(true);
        }
        if stat.partial_conversion {
            return Err(body.inconsistent(format!(
                "pending conversion to {target:?} but body is {current}"
            )));
        }
        Ok(false)
    }

    /// Persist the conversion marker and its safe-link in one commit.
    fn mark_conversion(
        &self,
        owner: ObjectId,
        stat: &mut StatData,
        target: ConversionTarget,
    ) -> Result<()> {
        stat.partial_conversion = true;
        stat.conversion_target = Some(target);
        let mut txn = self.store.begin();
        SafeLinkLog::stage_record(&mut txn, &SafeLinkRecord::conversion(owner));
        txn.stage_stat_data(owner, *stat);
        self.store.commit(txn)?;
        debug!(
            target: "tfs::convert",
            event = "marked",
            object = owner.0,
            target = ?target
        );
        Ok(())
    }

    /// Clear the marker and the safe-link; drop extent blocks past the end.
    fn finish_conversion(&self, owner: ObjectId, mut stat: StatData) -> Result<()> {
        stat.partial_conversion = false;
        stat.conversion_target = None;
        let tail_from = self
            .block_size
            .align_up(stat.size)
            .ok_or_else(|| TfsError::Format("size overflows block alignment".to_owned()))?;
        let mut txn = self.store.begin();
        txn.stage_cut(
            ItemKey::body(owner, tail_from),
            ItemKey::body(owner, u64::MAX),
        );
        txn.stage_stat_data(owner, stat);
        SafeLinkLog::stage_clear(&mut txn, owner, LinkKind::Conversion);
        let outcome = self.store.commit(txn)?;
        self.release(&outcome.freed);
        Ok(())
    }

    /// Write `bytes` (whole pages) to fresh blocks and swap the tails at
    /// `start` for extent units pointing at them, in one commit.
    fn move_to_extents(&self, owner: ObjectId, start: u64, bytes: &[u8]) -> Result<()> {
        let end = start + bytes.len() as u64;
        let mut fresh = Vec::new();
        let committed = self.write_fresh_blocks(bytes, &mut fresh).and_then(|units| {
            let mut txn = self.store.begin();
            let at = ItemKey::body(owner, start);
            txn.stage_cut(at, at.with_offset(end));
            txn.stage_insert_extent(at, units);
            self.store.commit(txn)
        });
        match committed {
            Ok(outcome) => {
                self.release(&outcome.freed);
                Ok(())
            }
            Err(err) => {
                self.release(&fresh);
                Err(err)
            }
        }
    }

    /// Allocate blocks for `bytes` and write them, recording every range in
    /// `fresh` as soon as it is allocated.
    fn write_fresh_blocks(
        &self,
        bytes: &[u8],
        fresh: &mut Vec<BlockRange>,
    ) -> Result<Vec<ExtentUnit>> {
        let bs = self.block_size.as_usize();
        let mut pages = bytes.chunks_exact(bs);
        let mut left = pages.len() as u64;
        let mut units = Vec::new();
        while left > 0 {
            let range = self.allocator.alloc(left)?;
            fresh.push(range);
            for (i, page) in (0..range.count).zip(pages.by_ref()) {
                self.device.write_block(BlockNumber(range.start.0 + i), page)?;
            }
            units.push(ExtentUnit::Allocated {
                start: range.start,
                width: range.count,
            });
            left -= range.count;
        }
        Ok(units)
    }
}

/// Copy the part of a tail item at `item_offset` below `window_end` into
/// `buf`, which holds the bytes starting at `buf_offset`.
#[allow(clippy::cast_possible_truncation)]
fn copy_tail(buf: &mut [u8], buf_offset: u64, item_offset: u64, tail: &[u8], window_end: u64) {
    let lo = item_offset.max(buf_offset);
    let hi = (item_offset + tail.len() as u64).min(window_end);
    if lo >= hi {
        return;
    }
    let dst = (lo - buf_offset) as usize..(hi - buf_offset) as usize;
    let src = (lo - item_offset) as usize..(hi - item_offset) as usize;
    buf[dst].copy_from_slice(&tail[src]);
}
