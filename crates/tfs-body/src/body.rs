//! In-memory file body and its representation state machine.
//!
//! ```text
//!            probe
//! Unknown ───────────► Empty | Tails | Extents
//!
//! Empty ──first write / grow──► Tails | Extents     (policy)
//! Tails ──convert_to_extents──► Extents
//! Extents ──convert_to_tails──► Tails
//! Tails | Extents ──reset_to_empty──► Empty         (truncate to 0)
//! ```
//!
//! Each arrow is one named method on [`FileBody`]; nothing else writes the
//! representation field. Callers hold the object's access grant from the
//! gate while they drive a transition.

use crate::gate::AccessMode;
use parking_lot::Mutex;
use tfs_error::{Result, TfsError};
use tfs_tree::{Bias, ItemKind, KeyedStore, SearchMode, SearchResult, retry_stale};
use tfs_types::{ConversionTarget, ItemKey, ObjectId, Representation, StatData};
use tracing::{debug, error};

/// Internal outcome of one attempt at an operation.
///
/// `Restart` asks the nearest retry loop to run the operation again holding
/// the given access mode. It never leaves the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step<T> {
    Done(T),
    Restart(AccessMode),
}

#[derive(Debug)]
struct BodyState {
    representation: Representation,
    open_count: usize,
    unlinked: bool,
}

/// In-memory state of one regular file's body.
///
/// Persistent state (size, conversion marker) lives in the stat data; this
/// only caches the resolved representation and tracks open handles.
#[derive(Debug)]
pub struct FileBody {
    owner: ObjectId,
    state: Mutex<BodyState>,
    /// Serializes writers that only hold shared access.
    pub(crate) write_lock: Mutex<()>,
}

impl FileBody {
    #[must_use]
    pub fn new(owner: ObjectId) -> Self {
        Self {
            owner,
            state: Mutex::new(BodyState {
                representation: Representation::Unknown,
                open_count: 0,
                unlinked: false,
            }),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    #[must_use]
    pub fn representation(&self) -> Representation {
        self.state.lock().representation
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    #[must_use]
    pub fn is_unlinked(&self) -> bool {
        self.state.lock().unlinked
    }

    pub(crate) fn opened(&self) -> usize {
        let mut state = self.state.lock();
        state.open_count += 1;
        state.open_count
    }

    /// Drop one open reference, returning how many remain.
    pub(crate) fn closed(&self) -> usize {
        let mut state = self.state.lock();
        state.open_count = state.open_count.saturating_sub(1);
        state.open_count
    }

    pub(crate) fn mark_unlinked(&self) {
        self.state.lock().unlinked = true;
    }

    // ── Transitions ─────────────────────────────────────────────────────

    /// `Unknown → {Empty, Tails, Extents}`.
    ///
    /// While a conversion is in flight the body holds items of both kinds;
    /// it then resolves to the conversion's source representation. Otherwise
    /// the first body item decides: a leaf-level item means tails, a
    /// twig-level item means extents, no item means empty.
    pub fn resolve_representation(
        &self,
        store: &dyn KeyedStore,
        stat: &StatData,
    ) -> Result<Representation> {
        let current = self.representation();
        if current != Representation::Unknown {
            return Ok(current);
        }
        let resolved = if stat.partial_conversion {
            match stat.conversion_target {
                Some(ConversionTarget::Tails) => Representation::Extents,
                Some(ConversionTarget::Extents) | None => Representation::Tails,
            }
        } else {
            match first_body_kind(store, self.owner)? {
                Some(ItemKind::Tail) => Representation::Tails,
                Some(ItemKind::Extent) => Representation::Extents,
                Some(other) => {
                    return Err(self.inconsistent(format!("{other:?} item in body key range")));
                }
                None => Representation::Empty,
            }
        };
        if resolved == Representation::Empty && stat.size > 0 {
            return Err(self.inconsistent(format!(
                "size {} but no body items",
                stat.size
            )));
        }
        self.set(Representation::Unknown, resolved);
        Ok(resolved)
    }

    /// `Empty → Tails | Extents` once the first bytes have been committed.
    pub fn initialize_representation(&self, target: ConversionTarget) -> Result<()> {
        self.transition(&[Representation::Empty], target.representation())
    }

    /// `Tails → Extents` at the end of a tail→extent conversion.
    pub fn convert_to_extents(&self) -> Result<()> {
        self.transition(&[Representation::Tails], Representation::Extents)
    }

    /// `Extents → Tails` at the end of an extent→tail conversion.
    pub fn convert_to_tails(&self) -> Result<()> {
        self.transition(&[Representation::Extents], Representation::Tails)
    }

    /// `{Tails, Extents} → Empty` after the body was cut to zero length.
    pub fn reset_to_empty(&self) -> Result<()> {
        self.transition(
            &[Representation::Tails, Representation::Extents],
            Representation::Empty,
        )
    }

    /// Forget the cached representation so the next access probes again.
    pub(crate) fn forget(&self) {
        self.state.lock().representation = Representation::Unknown;
    }

    fn transition(&self, from: &[Representation], to: Representation) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.representation;
        if !from.contains(&current) {
            return Err(TfsError::InvalidState(format!(
                "object {}: illegal representation transition {current} -> {to}",
                self.owner
            )));
        }
        state.representation = to;
        drop(state);
        if current != to {
            debug!(
                target: "tfs::body",
                event = "representation",
                object = self.owner.0,
                from = %current,
                to = %to
            );
        }
        Ok(())
    }

    fn set(&self, from: Representation, to: Representation) {
        let mut state = self.state.lock();
        if state.representation == from {
            state.representation = to;
            debug!(
                target: "tfs::body",
                event = "resolved",
                object = self.owner.0,
                representation = %to
            );
        }
    }

    /// Build (and log) a `RepresentationInconsistent` error for this body.
    pub(crate) fn inconsistent(&self, detail: String) -> TfsError {
        error!(
            target: "tfs::body",
            event = "representation_inconsistent",
            object = self.owner.0,
            representation = %self.representation(),
            detail = %detail
        );
        TfsError::RepresentationInconsistent {
            object: self.owner.0,
            detail,
        }
    }
}

/// Kind of the first body item of `owner`, if any.
pub(crate) fn first_body_kind(store: &dyn KeyedStore, owner: ObjectId) -> Result<Option<ItemKind>> {
    let start = ItemKey::body(owner, 0);
    retry_stale("first_body_kind", || {
        let coord = match store.search(&start, SearchMode::Read, Bias::Exact)? {
            SearchResult::Found(coord) | SearchResult::NotFound { next: Some(coord) } => coord,
            SearchResult::NotFound { next: None } => return Ok(None),
        };
        let view = store.load_item(coord)?;
        Ok(view.key.same_prefix(&start).then(|| view.kind()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfs_tree::{ExtentUnit, Item, MemTreeStore};
    use tfs_types::BlockNumber;

    #[test]
    fn probe_resolves_each_representation() {
        let store = MemTreeStore::default();
        let tails = FileBody::new(ObjectId(1));
        let extents = FileBody::new(ObjectId(2));
        let empty = FileBody::new(ObjectId(3));
        store
            .insert_flow(ItemKey::body(ObjectId(1), 0), b"hello")
            .expect("tail");
        let mut txn = store.begin();
        txn.stage_insert_extent(
            ItemKey::body(ObjectId(2), 0),
            vec![ExtentUnit::Allocated {
                start: BlockNumber(9),
                width: 1,
            }],
        );
        store.commit(txn).expect("extent");

        let sized = StatData {
            size: 5,
            ..StatData::new()
        };
        assert_eq!(
            tails.resolve_representation(&store, &sized).expect("resolve"),
            Representation::Tails
        );
        assert_eq!(
            extents.resolve_representation(&store, &sized).expect("resolve"),
            Representation::Extents
        );
        assert_eq!(
            empty
                .resolve_representation(&store, &StatData::new())
                .expect("resolve"),
            Representation::Empty
        );
    }

    #[test]
    fn partial_conversion_resolves_to_source() {
        let store = MemTreeStore::default();
        store
            .insert_flow(ItemKey::body(ObjectId(1), 0), b"x")
            .expect("tail");
        let body = FileBody::new(ObjectId(1));
        let stat = StatData {
            size: 1,
            partial_conversion: true,
            conversion_target: Some(ConversionTarget::Tails),
            ..StatData::new()
        };
        assert_eq!(
            body.resolve_representation(&store, &stat).expect("resolve"),
            Representation::Extents
        );
    }

    #[test]
    fn only_legal_transitions_are_accepted() {
        let body = FileBody::new(ObjectId(4));
        assert!(matches!(
            body.convert_to_extents(),
            Err(TfsError::InvalidState(_))
        ));
        body.set(Representation::Unknown, Representation::Empty);
        body.initialize_representation(ConversionTarget::Tails)
            .expect("first write");
        assert!(body.initialize_representation(ConversionTarget::Extents).is_err());
        body.convert_to_extents().expect("t2e");
        assert!(body.convert_to_extents().is_err());
        body.convert_to_tails().expect("e2t");
        body.reset_to_empty().expect("truncate to zero");
        assert_eq!(body.representation(), Representation::Empty);
        assert!(body.reset_to_empty().is_err());
        body.forget();
        assert_eq!(body.representation(), Representation::Unknown);
        assert!(body.reset_to_empty().is_err());
    }

    #[test]
    fn stat_data_item_in_body_range_is_ignored_by_probe() {
        let store = MemTreeStore::default();
        store
            .insert_item(ItemKey::stat_data(ObjectId(8)), Item::StatData(StatData::new()))
            .expect("sd");
        assert_eq!(first_body_kind(&store, ObjectId(7)).expect("probe"), None);
        assert_eq!(first_body_kind(&store, ObjectId(8)).expect("probe"), None);
    }

    #[test]
    fn open_counts_track_handles() {
        let body = FileBody::new(ObjectId(5));
        assert_eq!(body.opened(), 1);
        assert_eq!(body.opened(), 2);
        assert_eq!(body.closed(), 1);
        assert_eq!(body.closed(), 0);
        assert_eq!(body.closed(), 0);
        assert!(!body.is_unlinked());
        body.mark_unlinked();
        assert!(body.is_unlinked());
    }
}
