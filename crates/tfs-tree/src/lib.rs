#![forbid(unsafe_code)]
//! Keyed item store used by the body engine.
//!
//! The body engine never touches tree nodes directly. It talks to a
//! [`KeyedStore`]: point and range lookups, item loads, ordered iteration,
//! and all-or-nothing [`Transaction`]s of insert/cut operations. Node
//! splitting and rebalancing stay behind this trait.
//!
//! # Seals
//!
//! Every coordinate handed out by a store can be sealed. A [`Seal`] records
//! the node and the node's generation at the time of sealing; any structural
//! change to the node (item insert, removal, split, merge) assigns it a fresh
//! generation, so `seal_valid` answers "may this coordinate still be trusted"
//! without walking the tree again.
//!
//! Coordinates carry the same generation. Each store call is atomic on its
//! own, but a walk of several calls is not: a commit on another object can
//! reshape the node in between. Loads through such a coordinate fail with
//! `TfsError::StaleCoord`, and [`retry_stale`] restarts the walk.
//!
//! [`MemTreeStore`] is the in-memory reference implementation.

pub mod item;
pub mod mem;

pub use item::{ExtentUnit, Item, ItemKind, TreeLevel, append_units, split_units, units_width};
pub use mem::{DEFAULT_TAIL_CAPACITY, MemTreeStore, TreeImage, TreeOptions};

use serde::{Deserialize, Serialize};
use tfs_error::{Result, TfsError};
use tfs_types::{BlockRange, CommitSeq, ItemKey, ObjectId, StatData};
use tracing::trace;

/// Times a coordinate walk restarts after a stale coordinate before the
/// error is handed to the caller.
pub const STALE_RETRIES: usize = 64;

/// Run a coordinate walk, restarting it from scratch while it trips over a
/// coordinate invalidated by a concurrent commit.
pub fn retry_stale<T>(what: &str, mut walk: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match walk() {
            Err(err) if err.is_stale_coord() && attempt < STALE_RETRIES => {
                attempt += 1;
                trace!(target: "tfs::tree", event = "stale_retry", walk = what, attempt);
            }
            other => return other,
        }
    }
}

/// Error for a load through `coord` after its node changed or vanished.
pub(crate) fn stale(coord: Coord) -> TfsError {
    TfsError::StaleCoord(format!(
        "node {} pos {} generation {}",
        coord.node.0, coord.pos, coord.generation
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Position of an item: node plus index within the node.
///
/// `generation` is the node's generation when the coordinate was handed
/// out. Loads through a coordinate whose node has since changed fail with
/// [`TfsError::StaleCoord`] instead of returning a neighbour's item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coord {
    pub node: NodeId,
    pub pos: usize,
    pub generation: u64,
}

/// Validity token for a [`Coord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Seal {
    pub node: NodeId,
    pub generation: u64,
}

/// Lock intent of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchMode {
    Read,
    Write,
}

/// How `search` treats a key that is not present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// Only an item with exactly this key matches.
    Exact,
    /// The item with the greatest key `<=` the target matches.
    MaxNotMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(Coord),
    /// Nothing matched; `next` is the first item with a greater key.
    NotFound { next: Option<Coord> },
}

/// Read-only view of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemView {
    pub key: ItemKey,
    pub item: Item,
    pub level: TreeLevel,
    /// Body bytes covered: `[key.offset, key.offset + byte_len)`.
    pub byte_len: u64,
}

impl ItemView {
    #[must_use]
    pub fn kind(&self) -> ItemKind {
        self.item.kind()
    }

    /// One past the last body byte covered by the item.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.key.offset.saturating_add(self.byte_len)
    }

    /// Whether this is a body item of the same object as `key` covering
    /// `key.offset`.
    #[must_use]
    pub fn covers(&self, key: &ItemKey) -> bool {
        self.item.is_body()
            && self.key.same_prefix(key)
            && self.key.offset <= key.offset
            && key.offset < self.end()
    }
}

/// One staged tree mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeOp {
    /// Insert or replace the item at exactly `key`.
    PutItem { key: ItemKey, item: Item },
    /// Remove the item at exactly `key`; no-op if absent.
    RemoveItem { key: ItemKey },
    /// Insert raw bytes as tail items starting at `key`. Must not overlap
    /// existing body items.
    InsertFlow { key: ItemKey, bytes: Vec<u8> },
    /// Insert extent units starting at the block-aligned `key`. Must not
    /// overlap existing body items.
    InsertExtent { key: ItemKey, units: Vec<ExtentUnit> },
    /// Remove body bytes in `[from.offset, to.offset)` of one object. Tail
    /// items are trimmed byte-exactly; extent items lose only the blocks
    /// that lie entirely inside the range.
    Cut { from: ItemKey, to: ItemKey },
}

/// Staged mutations applied all-or-nothing by [`KeyedStore::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<TreeOp>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn stage(&mut self, op: TreeOp) {
        self.ops.push(op);
    }

    pub fn stage_put(&mut self, key: ItemKey, item: Item) {
        self.stage(TreeOp::PutItem { key, item });
    }

    pub fn stage_remove(&mut self, key: ItemKey) {
        self.stage(TreeOp::RemoveItem { key });
    }

    pub fn stage_stat_data(&mut self, object: ObjectId, stat: StatData) {
        self.stage_put(ItemKey::stat_data(object), Item::StatData(stat));
    }

    pub fn stage_insert_flow(&mut self, key: ItemKey, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.stage(TreeOp::InsertFlow { key, bytes });
        }
    }

    pub fn stage_insert_extent(&mut self, key: ItemKey, units: Vec<ExtentUnit>) {
        if units_width(&units) > 0 {
            self.stage(TreeOp::InsertExtent { key, units });
        }
    }

    pub fn stage_cut(&mut self, from: ItemKey, to: ItemKey) {
        if from.offset < to.offset {
            self.stage(TreeOp::Cut { from, to });
        }
    }

    #[must_use]
    pub fn ops(&self) -> &[TreeOp] {
        &self.ops
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn into_ops(self) -> Vec<TreeOp> {
        self.ops
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub seq: CommitSeq,
    /// Device blocks released by cut extent units. The caller owns returning
    /// them to the allocator.
    pub freed: Vec<BlockRange>,
}

/// Result of a bounded [`KeyedStore::cut_range`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutOutcome {
    /// Everything in `[smallest_removed.offset, to.offset)` is gone.
    pub smallest_removed: ItemKey,
    /// Whether the whole requested range has been cut.
    pub complete: bool,
    pub freed: Vec<BlockRange>,
}

/// Ordered key→item store.
pub trait KeyedStore: Send + Sync {
    /// Block size extent units are measured in.
    fn block_size(&self) -> u32;

    /// Largest payload of a single tail item.
    fn max_tail_item(&self) -> usize;

    /// Tail payload bytes the store can still take. Commits that would go
    /// past it fail with `TfsError::NoSpace`.
    fn tail_room(&self) -> u64 {
        u64::MAX
    }

    fn search(&self, key: &ItemKey, mode: SearchMode, bias: Bias) -> Result<SearchResult>;

    /// Fails with [`TfsError::StaleCoord`] once `coord`'s node has changed.
    fn load_item(&self, coord: Coord) -> Result<ItemView>;

    /// Coordinate of the item following `coord`, `None` at the end of the
    /// tree. Stale coordinates fail like in [`KeyedStore::load_item`].
    fn next_item(&self, coord: Coord) -> Result<Option<Coord>>;

    fn seal(&self, coord: Coord) -> Result<Seal>;

    fn seal_valid(&self, seal: &Seal) -> bool;

    /// Snapshot of all items with `from <= key < to`.
    fn range(&self, from: &ItemKey, to: &ItemKey) -> Result<Vec<(ItemKey, Item)>>;

    fn begin(&self) -> Transaction {
        Transaction::new()
    }

    fn commit(&self, txn: Transaction) -> Result<CommitOutcome>;

    /// Remove body bytes in `[from, to)` working backwards from `to`,
    /// touching at most `max_items` items in one atomic step.
    fn cut_range(&self, from: &ItemKey, to: &ItemKey, max_items: usize) -> Result<CutOutcome>;

    fn insert_item(&self, key: ItemKey, item: Item) -> Result<CommitOutcome> {
        let mut txn = self.begin();
        txn.stage_put(key, item);
        self.commit(txn)
    }

    fn insert_flow(&self, key: ItemKey, bytes: &[u8]) -> Result<CommitOutcome> {
        let mut txn = self.begin();
        txn.stage_insert_flow(key, bytes.to_vec());
        self.commit(txn)
    }

    /// Point lookup returning the item at exactly `key`.
    fn get(&self, key: &ItemKey) -> Result<Option<Item>> {
        retry_stale("get", || match self.search(key, SearchMode::Read, Bias::Exact)? {
            SearchResult::Found(coord) => Ok(Some(self.load_item(coord)?.item)),
            SearchResult::NotFound { .. } => Ok(None),
        })
    }

    fn stat_data(&self, object: ObjectId) -> Result<Option<StatData>> {
        match self.get(&ItemKey::stat_data(object))? {
            Some(Item::StatData(stat)) => Ok(Some(stat)),
            _ => Ok(None),
        }
    }
}

impl<T: KeyedStore + ?Sized> KeyedStore for std::sync::Arc<T> {
    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn max_tail_item(&self) -> usize {
        (**self).max_tail_item()
    }

    fn tail_room(&self) -> u64 {
        (**self).tail_room()
    }

    fn search(&self, key: &ItemKey, mode: SearchMode, bias: Bias) -> Result<SearchResult> {
        (**self).search(key, mode, bias)
    }

    fn load_item(&self, coord: Coord) -> Result<ItemView> {
        (**self).load_item(coord)
    }

    fn next_item(&self, coord: Coord) -> Result<Option<Coord>> {
        (**self).next_item(coord)
    }

    fn seal(&self, coord: Coord) -> Result<Seal> {
        (**self).seal(coord)
    }

    fn seal_valid(&self, seal: &Seal) -> bool {
        (**self).seal_valid(seal)
    }

    fn range(&self, from: &ItemKey, to: &ItemKey) -> Result<Vec<(ItemKey, Item)>> {
        (**self).range(from, to)
    }

    fn get(&self, key: &ItemKey) -> Result<Option<Item>> {
        (**self).get(key)
    }

    fn commit(&self, txn: Transaction) -> Result<CommitOutcome> {
        (**self).commit(txn)
    }

    fn cut_range(&self, from: &ItemKey, to: &ItemKey, max_items: usize) -> Result<CutOutcome> {
        (**self).cut_range(from, to, max_items)
    }
}
