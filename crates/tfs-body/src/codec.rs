//! Item-level codecs: body bytes as tail items or as extent units.
//!
//! Reads walk the body items overlapping the requested range and fill gaps
//! with zeros. Writes stage every tree change for one call into a single
//! transaction; extent data blocks are written to the device before that
//! transaction commits, and blocks allocated for it are returned to the
//! allocator if the commit fails.

use crate::body::FileBody;
use crate::hint::Hint;
use crate::volume::Volume;
use tfs_block::BlockAllocator;
use tfs_error::{Result, TfsError};
use tfs_tree::{
    Bias, ExtentUnit, Item, ItemKind, ItemView, KeyedStore, SearchMode, SearchResult, Transaction,
    retry_stale,
};
use tfs_types::{
    BlockNumber, BlockRange, BlockSize, ConversionTarget, ItemKey, ObjectId, Representation,
    StatData,
};
use tracing::{trace, warn};

/// What backs one logical block of an extent body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockMapping {
    Allocated(BlockNumber),
    /// Inside an extent item, but a `Hole` unit.
    Hole,
    /// Not covered by any extent item.
    Unmapped,
}

/// Look up logical block `index` in a snapshot of extent items.
pub(crate) fn map_block(items: &[ItemView], index: u64, block_size: BlockSize) -> BlockMapping {
    let byte = index.saturating_mul(block_size.as_u64());
    for view in items {
        let Item::Extent(units) = &view.item else {
            continue;
        };
        if byte < view.key.offset || byte >= view.end() {
            continue;
        }
        let mut rel = (byte - view.key.offset) / block_size.as_u64();
        for unit in units {
            if rel < unit.width() {
                return unit
                    .block_at(rel)
                    .map_or(BlockMapping::Hole, BlockMapping::Allocated);
            }
            rel -= unit.width();
        }
    }
    BlockMapping::Unmapped
}

fn to_usize(value: u64, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| TfsError::Format(format!("{what} {value} does not fit usize")))
}

impl Volume {
    /// Body items of `owner` intersecting `[from, to)`, in key order.
    ///
    /// The first lookup goes through `hint`; the rest follow `next_item`.
    /// A commit on a neighbouring object can invalidate the walk's
    /// coordinates midway; the walk then starts over.
    pub(crate) fn body_items(
        &self,
        hint: &mut Hint,
        owner: ObjectId,
        from: u64,
        to: u64,
        mode: SearchMode,
    ) -> Result<Vec<ItemView>> {
        retry_stale("body_items", || self.walk_body_items(hint, owner, from, to, mode))
    }

    fn walk_body_items(
        &self,
        hint: &mut Hint,
        owner: ObjectId,
        from: u64,
        to: u64,
        mode: SearchMode,
    ) -> Result<Vec<ItemView>> {
        let start = ItemKey::body(owner, from);
        let mut items = Vec::new();
        let mut cursor = match hint.locate(&*self.store, &start, mode)? {
            Some((coord, view)) => {
                items.push(view);
                self.store.next_item(coord)?
            }
            None => match self.store.search(&start, mode, Bias::MaxNotMore)? {
                SearchResult::Found(coord) => self.store.next_item(coord)?,
                SearchResult::NotFound { next } => next,
            },
        };
        while let Some(coord) = cursor {
            let view = self.store.load_item(coord)?;
            if !view.key.same_prefix(&start) || view.key.offset >= to {
                break;
            }
            if view.item.is_body() {
                items.push(view);
            }
            cursor = self.store.next_item(coord)?;
        }
        Ok(items)
    }

    /// One past the last body byte stored for `owner`, 0 without items.
    pub(crate) fn body_end(&self, owner: ObjectId) -> Result<u64> {
        let last = ItemKey::body(owner, u64::MAX);
        retry_stale("body_end", || {
            match self.store.search(&last, SearchMode::Read, Bias::MaxNotMore)? {
                SearchResult::Found(coord) => {
                    let view = self.store.load_item(coord)?;
                    if view.key.same_prefix(&last) && view.item.is_body() {
                        Ok(view.end())
                    } else {
                        Ok(0)
                    }
                }
                SearchResult::NotFound { .. } => Ok(0),
            }
        })
    }

    /// Offset of the first body item of `kind`, scanning from offset 0.
    pub(crate) fn first_item_of(&self, owner: ObjectId, kind: ItemKind) -> Result<Option<u64>> {
        let start = ItemKey::body(owner, 0);
        retry_stale("first_item_of", || {
            let mut cursor = match self.store.search(&start, SearchMode::Read, Bias::Exact)? {
                SearchResult::Found(coord) => Some(coord),
                SearchResult::NotFound { next } => next,
            };
            while let Some(coord) = cursor {
                let view = self.store.load_item(coord)?;
                if !view.key.same_prefix(&start) {
                    break;
                }
                if view.kind() == kind {
                    return Ok(Some(view.key.offset));
                }
                cursor = self.store.next_item(coord)?;
            }
            Ok(None)
        })
    }

    /// Reject items whose kind contradicts `representation`.
    ///
    /// Skipped while a conversion is pending: both kinds coexist then.
    pub(crate) fn check_kinds(
        body: &FileBody,
        representation: Representation,
        stat: &StatData,
        items: &[ItemView],
    ) -> Result<()> {
        if stat.partial_conversion {
            return Ok(());
        }
        let expected = match representation {
            Representation::Tails => Some(ItemKind::Tail),
            Representation::Extents => Some(ItemKind::Extent),
            Representation::Empty => None,
            Representation::Unknown => {
                return Err(TfsError::InvalidState(format!(
                    "object {}: body accessed before its representation was resolved",
                    body.owner()
                )));
            }
        };
        match items.iter().find(|view| Some(view.kind()) != expected) {
            Some(view) => Err(body.inconsistent(format!(
                "{:?} item at {} in a {representation} body",
                view.kind(),
                view.key
            ))),
            None => Ok(()),
        }
    }

    // ── Read ────────────────────────────────────────────────────────────

    /// Fill `buf` with body bytes starting at `offset`. Gaps and holes read
    /// as zeros. The caller clamps `buf` to the file size.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn read_range(
        &self,
        hint: &mut Hint,
        body: &FileBody,
        representation: Representation,
        stat: &StatData,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        buf.fill(0);
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| TfsError::Format(format!("read at {offset} overflows offset")))?;
        let items = self.body_items(hint, body.owner(), offset, end, SearchMode::Read)?;
        Self::check_kinds(body, representation, stat, &items)?;
        let bs = self.block_size;

        for view in &items {
            match &view.item {
                Item::Tail(bytes) => {
                    let lo = view.key.offset.max(offset);
                    let hi = view.end().min(end);
                    if lo < hi {
                        let src = (lo - view.key.offset) as usize..(hi - view.key.offset) as usize;
                        buf[(lo - offset) as usize..(hi - offset) as usize]
                            .copy_from_slice(&bytes[src]);
                    }
                }
                Item::Extent(units) => {
                    let mut unit_start = view.key.offset;
                    for unit in units {
                        let unit_end = unit_start.saturating_add(unit.width() * bs.as_u64());
                        let lo = unit_start.max(offset);
                        let hi = unit_end.min(end);
                        if let (ExtentUnit::Allocated { start, .. }, true) = (unit, lo < hi) {
                            let mut pos = lo;
                            while pos < hi {
                                let block = BlockNumber(start.0 + (pos - unit_start) / bs.as_u64());
                                let in_block = bs.offset_in_block(pos);
                                let chunk = (bs.as_u64() - in_block as u64).min(hi - pos);
                                let data = self.device.read_block(block)?;
                                let at = (pos - offset) as usize;
                                buf[at..at + chunk as usize].copy_from_slice(
                                    &data.as_slice()[in_block..in_block + chunk as usize],
                                );
                                pos += chunk;
                            }
                        }
                        unit_start = unit_end;
                    }
                }
                Item::StatData(_) | Item::SafeLink(_) => {}
            }
        }
        trace!(
            target: "tfs::body",
            event = "read",
            object = body.owner().0,
            offset,
            len = buf.len(),
            items = items.len()
        );
        Ok(())
    }

    // ── Tail write ──────────────────────────────────────────────────────

    /// Write `data` at `offset` as tail items. A gap past the current size
    /// is filled with zero bytes.
    pub(crate) fn write_tails(
        &self,
        hint: &mut Hint,
        body: &FileBody,
        mut stat: StatData,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let owner = body.owner();
        let new_end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| TfsError::Format(format!("write at {offset} overflows offset")))?;
        let overwrite_end = new_end.min(stat.size);
        if offset < overwrite_end {
            let items = self.body_items(hint, owner, offset, overwrite_end, SearchMode::Write)?;
            Self::check_kinds(body, Representation::Tails, &stat, &items)?;
        }

        if new_end > stat.size {
            self.ensure_tail_room(owner, new_end - stat.size)?;
        }
        if offset > stat.size {
            let from = stat.size;
            self.fill_tail_gap(body, &mut stat, from, offset)?;
        }

        let mut txn = self.store.begin();
        txn.stage_cut(ItemKey::body(owner, offset), ItemKey::body(owner, overwrite_end));
        txn.stage_insert_flow(ItemKey::body(owner, offset), data.to_vec());
        if new_end > stat.size {
            stat.size = new_end;
            txn.stage_stat_data(owner, stat);
        }
        let outcome = self.store.commit(txn)?;
        self.release(&outcome.freed);
        trace!(
            target: "tfs::body",
            event = "write_tails",
            object = owner.0,
            offset,
            len = data.len(),
            size = stat.size
        );
        Ok(())
    }

    /// Fail with `NoSpace` unless the store can take `bytes` more tail
    /// payload.
    pub(crate) fn ensure_tail_room(&self, owner: ObjectId, bytes: u64) -> Result<()> {
        let room = self.store.tail_room();
        if bytes > room {
            warn!(
                target: "tfs::body",
                event = "tail_room_exhausted",
                object = owner.0,
                wanted = bytes,
                room
            );
            return Err(TfsError::NoSpace);
        }
        Ok(())
    }

    /// Append zero bytes to a tail body over `[from, to)`, one bounded
    /// commit per chunk. Each commit persists the grown size, so an error
    /// part way leaves a shorter but consistent file.
    pub(crate) fn fill_tail_gap(
        &self,
        body: &FileBody,
        stat: &mut StatData,
        from: u64,
        to: u64,
    ) -> Result<()> {
        let owner = body.owner();
        let chunk = (self.store.max_tail_item() as u64)
            .saturating_mul(self.options.cut_batch_items as u64)
            .max(1);
        let mut pos = from;
        while pos < to {
            let len = chunk.min(to - pos);
            let mut txn = self.store.begin();
            txn.stage_insert_flow(ItemKey::body(owner, pos), vec![0_u8; to_usize(len, "tail fill")?]);
            pos += len;
            stat.size = stat.size.max(pos);
            txn.stage_stat_data(owner, *stat);
            let outcome = self.store.commit(txn)?;
            self.release(&outcome.freed);
            if body.representation() == Representation::Empty {
                body.initialize_representation(ConversionTarget::Tails)?;
            }
        }
        if from < to {
            trace!(
                target: "tfs::body",
                event = "tail_gap_filled",
                object = owner.0,
                from,
                to
            );
        }
        Ok(())
    }

    // ── Extent write ────────────────────────────────────────────────────

    /// Write `data` at `offset` through extent units.
    ///
    /// Mapped blocks are rewritten in place. Holes and unmapped blocks get
    /// freshly allocated blocks. A gap between the end of the stored body
    /// and the first written block becomes a `Hole` unit.
    pub(crate) fn write_extents(
        &self,
        hint: &mut Hint,
        body: &FileBody,
        mut stat: StatData,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let owner = body.owner();
        let bs = self.block_size;
        let new_end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| TfsError::Format(format!("write at {offset} overflows offset")))?;
        let first = bs.block_index(offset);
        let last = bs.block_index(new_end - 1);
        let window_end = (last + 1)
            .checked_mul(bs.as_u64())
            .ok_or_else(|| TfsError::Format(format!("write at {offset} overflows offset")))?;
        let items = self.body_items(hint, owner, bs.align_down(offset), window_end, SearchMode::Write)?;
        Self::check_kinds(body, Representation::Extents, &stat, &items)?;

        let coverage = self.body_end(owner)?;
        if bs.offset_in_block(coverage) != 0 {
            return Err(body.inconsistent(format!("extent body ends unaligned at {coverage}")));
        }
        let covered_blocks = bs.block_index(coverage);

        let mut txn = self.store.begin();
        if first > covered_blocks {
            txn.stage_insert_extent(
                ItemKey::body(owner, coverage),
                vec![ExtentUnit::Hole {
                    width: first - covered_blocks,
                }],
            );
        }
        let mut fresh = Vec::new();
        let staged = self.stage_block_writes(&items, owner, offset, data, first, last, &mut txn, &mut fresh);
        let committed = staged.and_then(|()| {
            if new_end > stat.size {
                stat.size = new_end;
                txn.stage_stat_data(owner, stat);
            }
            self.store.commit(txn)
        });
        match committed {
            Ok(outcome) => {
                self.release(&outcome.freed);
                trace!(
                    target: "tfs::body",
                    event = "write_extents",
                    object = owner.0,
                    offset,
                    len = data.len(),
                    allocated_runs = fresh.len(),
                    size = stat.size
                );
                Ok(())
            }
            Err(err) => {
                self.release(&fresh);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_block_writes(
        &self,
        items: &[ItemView],
        owner: ObjectId,
        offset: u64,
        data: &[u8],
        first: u64,
        last: u64,
        txn: &mut Transaction,
        fresh: &mut Vec<BlockRange>,
    ) -> Result<()> {
        let bs = self.block_size;
        let mut index = first;
        while index <= last {
            if let BlockMapping::Allocated(block) = map_block(items, index, bs) {
                let image = self.block_image(Some(block), index, offset, data)?;
                self.device.write_block(block, &image)?;
                index += 1;
                continue;
            }
            let run_start = index;
            while index <= last && !matches!(map_block(items, index, bs), BlockMapping::Allocated(_)) {
                index += 1;
            }
            self.fill_run(owner, run_start, index - run_start, offset, data, txn, fresh)?;
        }
        Ok(())
    }

    /// Allocate and write `count` blocks starting at logical block `start`,
    /// staging the extent units that map them.
    #[allow(clippy::too_many_arguments)]
    fn fill_run(
        &self,
        owner: ObjectId,
        start: u64,
        count: u64,
        offset: u64,
        data: &[u8],
        txn: &mut Transaction,
        fresh: &mut Vec<BlockRange>,
    ) -> Result<()> {
        let bs = self.block_size.as_u64();
        let mut done = 0_u64;
        while done < count {
            let range = self.allocator.alloc(count - done)?;
            fresh.push(range);
            for i in 0..range.count {
                let image = self.block_image(None, start + done + i, offset, data)?;
                self.device.write_block(BlockNumber(range.start.0 + i), &image)?;
            }
            let at = ItemKey::body(owner, (start + done) * bs);
            txn.stage_cut(at, at.with_offset((start + done + range.count) * bs));
            txn.stage_insert_extent(
                at,
                vec![ExtentUnit::Allocated {
                    start: range.start,
                    width: range.count,
                }],
            );
            done += range.count;
        }
        Ok(())
    }

    /// Contents of logical block `index` after overlaying the part of
    /// `data` (written at `offset`) that falls into it.
    #[allow(clippy::cast_possible_truncation)]
    fn block_image(
        &self,
        existing: Option<BlockNumber>,
        index: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let bs = self.block_size;
        let block_start = index * bs.as_u64();
        let block_end = block_start + bs.as_u64();
        let data_end = offset + data.len() as u64;
        let lo = block_start.max(offset);
        let hi = block_end.min(data_end);
        let whole = lo == block_start && hi == block_end;
        let mut image = match existing {
            Some(block) if !whole => self.device.read_block(block)?.into_inner(),
            _ => vec![0_u8; bs.as_usize()],
        };
        if lo < hi {
            image[(lo - block_start) as usize..(hi - block_start) as usize]
                .copy_from_slice(&data[(lo - offset) as usize..(hi - offset) as usize]);
        }
        Ok(image)
    }
}
