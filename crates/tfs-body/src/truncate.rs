//! Truncate and delete: the multi-commit operations guarded by safe-links.
//!
//! Truncate records a `Truncate` link in its own commit, cuts the body back
//! in bounded batches (persisting the shrinking size after each incomplete
//! batch), then sets the final size and clears the link in one last commit.
//! Delete does the same under an `UnlinkedOpenFile` link and finishes by
//! removing the stat data. A crash anywhere in between leaves the link in
//! place and mount replays the whole operation.

use crate::body::FileBody;
use crate::codec::{BlockMapping, map_block};
use crate::gate::AccessToken;
use crate::hint::Hint;
use crate::policy::TailPolicy;
use crate::safelink::{SafeLinkLog, SafeLinkRecord};
use crate::volume::Volume;
use tfs_error::{Result, TfsError};
use tfs_tree::{ExtentUnit, KeyedStore, SearchMode, Transaction};
use tfs_types::{ConversionTarget, ItemKey, LinkKind, ObjectId, Representation, StatData};
use tracing::{debug, info, trace};

impl Volume {
    /// Set `body`'s size to `new_size`. Caller holds exclusive access.
    ///
    /// Re-running it on a body already of `new_size` changes nothing but
    /// the safe-link bookkeeping, which is what replay relies on.
    pub(crate) fn truncate_locked(
        &self,
        token: &AccessToken,
        body: &FileBody,
        new_size: u64,
    ) -> Result<()> {
        let owner = body.owner();
        Self::require_exclusive(token, owner)?;
        self.finish_pending_conversion(token, body)?;
        let mut stat = self.handle_stat(owner)?;
        let mut representation = body.resolve_representation(&*self.store, &stat)?;
        let old_size = stat.size;
        let bs = self.block_size;

        let grows_tails = new_size > old_size
            && matches!(
                representation,
                Representation::Empty | Representation::Tails
            )
            && !self.options.formatting.should_use_extents(new_size);
        if grows_tails {
            self.ensure_tail_room(owner, new_size - old_size)?;
        }

        self.links.record(&SafeLinkRecord::truncate(owner, new_size))?;

        // Shrink.
        if representation != Representation::Empty {
            let cut_from = match representation {
                Representation::Extents => bs.align_up(new_size).ok_or_else(|| {
                    TfsError::Format(format!("truncate to {new_size} overflows block alignment"))
                })?,
                _ => new_size,
            };
            self.cut_body(owner, cut_from, new_size, &mut stat)?;
            if representation == Representation::Extents
                && new_size < old_size
                && bs.offset_in_block(new_size) != 0
            {
                self.zero_block_tail(owner, new_size)?;
            }
        }

        // Grow.
        let mut txn = self.store.begin();
        let mut initialized = None;
        if new_size > stat.size {
            let wants_extents = self.options.formatting.should_use_extents(new_size);
            if representation == Representation::Tails && wants_extents {
                self.run_tail_to_extent(token, body)?;
                representation = Representation::Extents;
            }
            match representation {
                Representation::Empty if wants_extents => {
                    self.stage_hole_growth(&mut txn, owner, new_size)?;
                    initialized = Some(ConversionTarget::Extents);
                }
                Representation::Empty | Representation::Tails => {
                    let tail_end = self.body_end(owner)?;
                    self.fill_tail_gap(body, &mut stat, tail_end, new_size)?;
                }
                Representation::Extents => self.stage_hole_growth(&mut txn, owner, new_size)?,
                Representation::Unknown => {
                    return Err(TfsError::InvalidState(format!(
                        "object {owner}: truncate on unresolved body"
                    )));
                }
            }
        }

        stat.size = new_size;
        txn.stage_stat_data(owner, stat);
        SafeLinkLog::stage_clear(&mut txn, owner, LinkKind::Truncate);
        let outcome = self.store.commit(txn)?;
        self.release(&outcome.freed);

        if new_size == 0 && body.representation() != Representation::Empty {
            body.reset_to_empty()?;
        } else if let Some(target) = initialized {
            body.initialize_representation(target)?;
        }
        debug!(
            target: "tfs::volume",
            event = "truncated",
            object = owner.0,
            from = old_size,
            to = new_size,
            representation = %body.representation()
        );
        Ok(())
    }

    /// Delete the body and stat data of `owner`. No-op if already gone.
    pub(crate) fn delete_object(&self, token: &AccessToken, owner: ObjectId) -> Result<()> {
        Self::require_exclusive(token, owner)?;
        let Some(mut stat) = self.store.stat_data(owner)? else {
            return Ok(());
        };
        self.links.record(&SafeLinkRecord::unlinked_open_file(owner))?;
        self.cut_body(owner, 0, 0, &mut stat)?;

        let mut txn = self.store.begin();
        txn.stage_remove(ItemKey::stat_data(owner));
        for kind in [LinkKind::Truncate, LinkKind::Conversion, LinkKind::UnlinkedOpenFile] {
            SafeLinkLog::stage_clear(&mut txn, owner, kind);
        }
        let outcome = self.store.commit(txn)?;
        self.release(&outcome.freed);

        if let Some(body) = self.registered_body(owner) {
            body.mark_unlinked();
            body.forget();
        }
        info!(target: "tfs::volume", event = "deleted", object = owner.0);
        Ok(())
    }

    /// Cut every body byte at or past `from` in batches of
    /// `cut_batch_items`, persisting a shrinking size (never below `floor`)
    /// after each incomplete batch.
    fn cut_body(&self, owner: ObjectId, from: u64, floor: u64, stat: &mut StatData) -> Result<()> {
        let from = ItemKey::body(owner, from);
        let to = ItemKey::body(owner, u64::MAX);
        let mut batches = 0_u64;
        loop {
            let outcome = self
                .store
                .cut_range(&from, &to, self.options.cut_batch_items)?;
            self.release(&outcome.freed);
            batches += 1;
            if outcome.complete {
                break;
            }
            let reached = outcome.smallest_removed.offset.max(floor);
            if reached < stat.size {
                stat.size = reached;
                let mut txn = self.store.begin();
                txn.stage_stat_data(owner, *stat);
                self.store.commit(txn)?;
            }
            trace!(
                target: "tfs::volume",
                event = "cut_batch",
                object = owner.0,
                reached,
                freed_runs = outcome.freed.len()
            );
        }
        if batches > 1 {
            debug!(target: "tfs::volume", event = "cut_done", object = owner.0, batches);
        }
        Ok(())
    }

    /// Zero the bytes of the block holding `size` from `size` onward, so a
    /// later grow reads zeros there.
    fn zero_block_tail(&self, owner: ObjectId, size: u64) -> Result<()> {
        let bs = self.block_size;
        let block_start = bs.align_down(size);
        let mut hint = Hint::new();
        let items = self.body_items(
            &mut hint,
            owner,
            block_start,
            block_start.saturating_add(bs.as_u64()),
            SearchMode::Write,
        )?;
        if let BlockMapping::Allocated(block) = map_block(&items, bs.block_index(size), bs) {
            let mut data = self.device.read_block(block)?.into_inner();
            data[bs.offset_in_block(size)..].fill(0);
            self.device.write_block(block, &data)?;
        }
        Ok(())
    }

    /// Stage a hole extending the extent body to cover `new_size`.
    fn stage_hole_growth(
        &self,
        txn: &mut Transaction,
        owner: ObjectId,
        new_size: u64,
    ) -> Result<()> {
        let bs = self.block_size;
        let coverage = self.body_end(owner)?;
        let needed = bs
            .align_up(new_size)
            .ok_or_else(|| TfsError::Format(format!("truncate to {new_size} overflows block alignment")))?;
        if needed > coverage {
            txn.stage_insert_extent(
                ItemKey::body(owner, coverage),
                vec![ExtentUnit::Hole {
                    width: bs.block_index(needed) - bs.block_index(coverage),
                }],
            );
        }
        Ok(())
    }
}

