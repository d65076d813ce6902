//! Per-handle cache of the last tree position.
//!
//! Sequential I/O touches the item it touched last time, or the one right
//! after it. A [`Hint`] remembers that coordinate together with a seal, so
//! the next positioned operation can skip the descent when the seal still
//! holds. A hint is only ever a shortcut: every coordinate it yields is
//! re-checked against the requested key before use.

use tfs_error::Result;
use tfs_tree::{Bias, Coord, ItemView, KeyedStore, SearchMode, SearchResult, Seal};
use tfs_types::ItemKey;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HintEntry {
    key: ItemKey,
    coord: Coord,
    seal: Seal,
    mode: SearchMode,
}

/// Outcome of [`Hint::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintCheck {
    Valid(Coord),
    Invalid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HintStats {
    pub hits: u64,
    pub misses: u64,
}

/// Cached `(key, coordinate, seal, mode)` of one open handle.
#[derive(Debug, Clone, Default)]
pub struct Hint {
    entry: Option<HintEntry>,
    stats: HintStats,
}

impl Hint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the cached coordinate may be used for `key` in `mode`.
    ///
    /// The key prefix (object and kind, not offset) and the mode must match,
    /// and the seal must still be valid in `store`.
    pub fn validate(&self, store: &dyn KeyedStore, key: &ItemKey, mode: SearchMode) -> HintCheck {
        match &self.entry {
            Some(entry)
                if entry.key.same_prefix(key)
                    && entry.mode == mode
                    && store.seal_valid(&entry.seal) =>
            {
                HintCheck::Valid(entry.coord)
            }
            _ => HintCheck::Invalid,
        }
    }

    /// Remember `coord` as the position of `key`.
    pub fn set(
        &mut self,
        store: &dyn KeyedStore,
        key: ItemKey,
        coord: Coord,
        mode: SearchMode,
    ) -> Result<()> {
        let seal = store.seal(coord)?;
        self.entry = Some(HintEntry {
            key,
            coord,
            seal,
            mode,
        });
        Ok(())
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.entry.is_some()
    }

    #[must_use]
    pub fn stats(&self) -> HintStats {
        self.stats
    }

    /// Find the body item covering `key`, trying the cached coordinate and
    /// its successor before falling back to a full search.
    ///
    /// Returns `None` when no body item covers `key` (a gap or end of body).
    /// A cached coordinate that went stale after its seal was checked counts
    /// as a miss; a stale coordinate from the fresh search is returned to the
    /// caller, which restarts its walk.
    pub fn locate(
        &mut self,
        store: &dyn KeyedStore,
        key: &ItemKey,
        mode: SearchMode,
    ) -> Result<Option<(Coord, ItemView)>> {
        match self.locate_cached(store, key, mode) {
            Ok(Some(hit)) => return Ok(Some(hit)),
            Ok(None) => {}
            Err(err) if err.is_stale_coord() => self.invalidate(),
            Err(err) => return Err(err),
        }

        self.stats.misses += 1;
        trace!(target: "tfs::body", event = "hint_miss", key = %key);
        match store.search(key, mode, Bias::MaxNotMore)? {
            SearchResult::Found(coord) => {
                let view = store.load_item(coord)?;
                if view.covers(key) {
                    self.set(store, view.key, coord, mode)?;
                    Ok(Some((coord, view)))
                } else {
                    Ok(None)
                }
            }
            SearchResult::NotFound { .. } => Ok(None),
        }
    }

    fn locate_cached(
        &mut self,
        store: &dyn KeyedStore,
        key: &ItemKey,
        mode: SearchMode,
    ) -> Result<Option<(Coord, ItemView)>> {
        let HintCheck::Valid(coord) = self.validate(store, key, mode) else {
            return Ok(None);
        };
        let view = store.load_item(coord)?;
        if view.covers(key) {
            self.stats.hits += 1;
            trace!(target: "tfs::body", event = "hint_hit", key = %key);
            return Ok(Some((coord, view)));
        }
        if view.key.same_prefix(key) && view.end() <= key.offset {
            if let Some(next) = store.next_item(coord)? {
                let next_view = store.load_item(next)?;
                if next_view.covers(key) {
                    self.stats.hits += 1;
                    self.set(store, next_view.key, next, mode)?;
                    trace!(target: "tfs::body", event = "hint_hit_next", key = %key);
                    return Ok(Some((next, next_view)));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfs_tree::{MemTreeStore, TreeOptions};
    use tfs_types::ObjectId;

    fn store() -> MemTreeStore {
        MemTreeStore::new(TreeOptions {
            node_capacity: 8,
            max_tail_item: 100,
            block_size: 512,
        })
        .expect("store")
    }

    #[test]
    fn sequential_reads_hit_after_first_miss() {
        let store = store();
        let obj = ObjectId(1);
        store
            .insert_flow(ItemKey::body(obj, 0), &[9; 400])
            .expect("flow");
        let mut hint = Hint::new();
        for offset in [0, 50, 100, 150, 200, 300] {
            let (_, view) = hint
                .locate(&store, &ItemKey::body(obj, offset), SearchMode::Read)
                .expect("locate")
                .expect("covered");
            assert!(view.covers(&ItemKey::body(obj, offset)));
        }
        assert_eq!(hint.stats(), HintStats { hits: 5, misses: 1 });
    }

    #[test]
    fn mode_or_prefix_mismatch_invalidates() {
        let store = store();
        let obj = ObjectId(2);
        store.insert_flow(ItemKey::body(obj, 0), &[1; 10]).expect("flow");
        let mut hint = Hint::new();
        hint.locate(&store, &ItemKey::body(obj, 0), SearchMode::Read)
            .expect("locate");
        assert!(matches!(
            hint.validate(&store, &ItemKey::body(obj, 5), SearchMode::Read),
            HintCheck::Valid(_)
        ));
        assert_eq!(
            hint.validate(&store, &ItemKey::body(obj, 5), SearchMode::Write),
            HintCheck::Invalid
        );
        assert_eq!(
            hint.validate(&store, &ItemKey::body(ObjectId(3), 5), SearchMode::Read),
            HintCheck::Invalid
        );
    }

    #[test]
    fn structural_change_breaks_the_seal() {
        let store = store();
        let obj = ObjectId(4);
        store.insert_flow(ItemKey::body(obj, 0), &[1; 50]).expect("flow");
        let mut hint = Hint::new();
        hint.locate(&store, &ItemKey::body(obj, 0), SearchMode::Read)
            .expect("locate");
        store.insert_flow(ItemKey::body(obj, 50), &[2; 10]).expect("append");
        assert_eq!(
            hint.validate(&store, &ItemKey::body(obj, 55), SearchMode::Read),
            HintCheck::Invalid
        );
        let (_, view) = hint
            .locate(&store, &ItemKey::body(obj, 55), SearchMode::Read)
            .expect("locate")
            .expect("covered");
        assert_eq!(view.item, tfs_tree::Item::Tail([vec![1; 50], vec![2; 10]].concat()));
        assert_eq!(hint.stats().misses, 2);
    }

    #[test]
    fn gap_yields_none() {
        let store = store();
        let obj = ObjectId(5);
        let mut hint = Hint::new();
        assert!(
            hint.locate(&store, &ItemKey::body(obj, 0), SearchMode::Read)
                .expect("locate")
                .is_none()
        );
        assert!(!hint.is_set());
        hint.invalidate();
    }
}
