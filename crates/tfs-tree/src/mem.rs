//! In-memory reference [`KeyedStore`].
//!
//! Items live in bounded leaf nodes kept in key order. A node that grows
//! past `node_capacity` splits in half; a node that drains below a quarter
//! of capacity merges into a neighbour, and an empty node disappears unless
//! it is the only one. Every node touched by a commit gets a fresh
//! generation number, which is what seals are checked against.
//!
//! Commits are copy-on-write: the staged operations run against a clone of
//! the tree and the clone replaces the live tree only if every operation
//! succeeded. An injected fault fails the commit before anything is applied,
//! which models a crash at a transaction boundary.

use crate::item::{ExtentUnit, Item, append_units, split_units, units_width};
use crate::{
    Bias, CommitOutcome, Coord, CutOutcome, ItemView, KeyedStore, NodeId, SearchMode,
    SearchResult, Seal, Transaction, TreeOp,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tfs_error::{Result, TfsError};
use tfs_types::{BlockRange, BlockSize, CommitSeq, DEFAULT_BLOCK_SIZE, ItemKey, KeyKind};
use tracing::{debug, trace, warn};

/// Geometry of a [`MemTreeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Items per leaf node before it splits.
    pub node_capacity: usize,
    /// Largest payload of one tail item.
    pub max_tail_item: usize,
    /// Block size extent widths are measured in.
    pub block_size: u32,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            node_capacity: 32,
            max_tail_item: 2048,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl TreeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.node_capacity < 2 {
            return Err(TfsError::Format(format!(
                "node_capacity must be >= 2, got {}",
                self.node_capacity
            )));
        }
        if self.max_tail_item == 0 {
            return Err(TfsError::Format("max_tail_item must be > 0".to_owned()));
        }
        BlockSize::new(self.block_size)
            .map_err(|e| TfsError::Format(format!("tree block_size: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    id: NodeId,
    generation: u64,
    items: Vec<(ItemKey, Item)>,
}

impl Node {
    fn first_key(&self) -> Option<&ItemKey> {
        self.items.first().map(|(key, _)| key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeState {
    /// Never empty; ordered by key.
    nodes: Vec<Node>,
    next_node: u64,
    next_generation: u64,
    seq: u64,
}

impl TreeState {
    fn new() -> Self {
        Self {
            nodes: vec![Node {
                id: NodeId(0),
                generation: 1,
                items: Vec::new(),
            }],
            next_node: 1,
            next_generation: 2,
            seq: 0,
        }
    }

    fn fresh_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn touch(&mut self, idx: usize) {
        let generation = self.fresh_generation();
        if let Some(node) = self.nodes.get_mut(idx) {
            node.generation = generation;
        }
    }

    /// Index of the node whose key range should hold `key`.
    fn node_for(&self, key: &ItemKey) -> usize {
        self.nodes
            .partition_point(|node| node.first_key().is_some_and(|first| first <= key))
            .saturating_sub(1)
    }

    fn node_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == id)
    }

    fn locate(&self, key: &ItemKey) -> (usize, std::result::Result<usize, usize>) {
        let idx = self.node_for(key);
        let pos = self.nodes[idx]
            .items
            .binary_search_by(|(probe, _)| probe.cmp(key));
        (idx, pos)
    }

    fn coord_at(&self, idx: usize, pos: usize) -> Option<Coord> {
        let node = self.nodes.get(idx)?;
        if pos < node.items.len() {
            return Some(Coord {
                node: node.id,
                pos,
                generation: node.generation,
            });
        }
        self.nodes
            .iter()
            .skip(idx + 1)
            .find(|next| !next.items.is_empty())
            .map(|next| Coord {
                node: next.id,
                pos: 0,
                generation: next.generation,
            })
    }

    /// Index of `coord`'s node, provided it still has the generation the
    /// coordinate was taken at.
    fn current_node(&self, coord: Coord) -> Result<usize> {
        self.node_index(coord.node)
            .filter(|&idx| self.nodes[idx].generation == coord.generation)
            .ok_or_else(|| crate::stale(coord))
    }

    fn entry(&self, coord: Coord) -> Result<&(ItemKey, Item)> {
        let idx = self.current_node(coord)?;
        self.nodes[idx].items.get(coord.pos).ok_or_else(|| crate::stale(coord))
    }

    fn tail_bytes(&self) -> u64 {
        self.nodes
            .iter()
            .flat_map(|node| node.items.iter())
            .map(|(_, item)| match item {
                Item::Tail(bytes) => bytes.len() as u64,
                _ => 0,
            })
            .sum()
    }

    fn get(&self, key: &ItemKey) -> Option<&Item> {
        let (idx, pos) = self.locate(key);
        pos.ok().map(|pos| &self.nodes[idx].items[pos].1)
    }

    /// Greatest entry with a key strictly below `key`.
    fn predecessor(&self, key: &ItemKey) -> Option<&(ItemKey, Item)> {
        let (idx, pos) = self.locate(key);
        let pos = match pos {
            Ok(pos) | Err(pos) => pos,
        };
        if pos > 0 {
            return self.nodes[idx].items.get(pos - 1);
        }
        self.nodes[..idx]
            .iter()
            .rev()
            .find_map(|node| node.items.last())
    }

    /// Entries with key `>= from`, in order.
    fn scan(&self, from: ItemKey) -> impl Iterator<Item = &(ItemKey, Item)> + '_ {
        let idx = self.node_for(&from);
        self.nodes[idx..]
            .iter()
            .flat_map(|node| node.items.iter())
            .skip_while(move |(key, _)| *key < from)
    }

    /// Body items of `prefix`'s object intersecting `[from, to)`.
    fn overlapping(
        &self,
        prefix: &ItemKey,
        from: u64,
        to: u64,
        block_size: u32,
    ) -> Vec<(ItemKey, Item)> {
        let start = prefix.with_offset(from);
        let mut found = Vec::new();
        if let Some((key, item)) = self.predecessor(&start) {
            if key.same_prefix(prefix)
                && item.is_body()
                && key.offset.saturating_add(item.byte_len(block_size)) > from
            {
                found.push((*key, item.clone()));
            }
        }
        found.extend(
            self.scan(start)
                .take_while(|(key, _)| key.same_prefix(prefix) && key.offset < to)
                .filter(|(_, item)| item.is_body())
                .map(|(key, item)| (*key, item.clone())),
        );
        found
    }

    fn put(&mut self, key: ItemKey, item: Item, options: &TreeOptions) {
        let (idx, pos) = self.locate(&key);
        match pos {
            Ok(pos) => self.nodes[idx].items[pos].1 = item,
            Err(pos) => self.nodes[idx].items.insert(pos, (key, item)),
        }
        self.touch(idx);
        if self.nodes[idx].items.len() > options.node_capacity {
            self.split(idx);
        }
    }

    fn remove(&mut self, key: &ItemKey, options: &TreeOptions) -> Option<Item> {
        let (idx, pos) = self.locate(key);
        let pos = pos.ok()?;
        let (_, item) = self.nodes[idx].items.remove(pos);
        self.touch(idx);
        self.rebalance(idx, options);
        Some(item)
    }

    fn split(&mut self, idx: usize) {
        let mid = self.nodes[idx].items.len() / 2;
        let right_items = self.nodes[idx].items.split_off(mid);
        let id = NodeId(self.next_node);
        self.next_node += 1;
        let generation = self.fresh_generation();
        self.nodes.insert(
            idx + 1,
            Node {
                id,
                generation,
                items: right_items,
            },
        );
        self.touch(idx);
        trace!(
            target: "tfs::tree",
            event = "node_split",
            left = self.nodes[idx].id.0,
            right = id.0
        );
    }

    fn rebalance(&mut self, idx: usize, options: &TreeOptions) {
        if self.nodes.len() == 1 {
            return;
        }
        let len = self.nodes[idx].items.len();
        if len == 0 {
            let gone = self.nodes.remove(idx);
            trace!(target: "tfs::tree", event = "node_removed", node = gone.id.0);
            return;
        }
        if len >= (options.node_capacity / 4).max(1) {
            return;
        }
        let (left, right) = if idx + 1 < self.nodes.len()
            && len + self.nodes[idx + 1].items.len() <= options.node_capacity
        {
            (idx, idx + 1)
        } else if idx > 0 && len + self.nodes[idx - 1].items.len() <= options.node_capacity {
            (idx - 1, idx)
        } else {
            return;
        };
        let absorbed = self.nodes.remove(right);
        self.nodes[left].items.extend(absorbed.items);
        self.touch(left);
        trace!(
            target: "tfs::tree",
            event = "node_merged",
            into = self.nodes[left].id.0,
            from = absorbed.id.0
        );
    }

    fn ensure_free(&self, key: &ItemKey, len: u64, block_size: u32) -> Result<u64> {
        let end = key
            .offset
            .checked_add(len)
            .ok_or_else(|| TfsError::Format(format!("insert at {key} overflows offset")))?;
        if let Some((existing, _)) = self.overlapping(key, key.offset, end, block_size).first() {
            return Err(TfsError::InvalidState(format!(
                "insert of [{}, {end}) at {key} overlaps item {existing}",
                key.offset
            )));
        }
        Ok(end)
    }

    fn apply(
        &mut self,
        op: TreeOp,
        options: &TreeOptions,
        freed: &mut Vec<BlockRange>,
    ) -> Result<()> {
        match op {
            TreeOp::PutItem { key, item } => {
                self.put(key, item, options);
                Ok(())
            }
            TreeOp::RemoveItem { key } => {
                self.remove(&key, options);
                Ok(())
            }
            TreeOp::InsertFlow { key, bytes } => self.insert_flow(key, &bytes, options),
            TreeOp::InsertExtent { key, units } => self.insert_extent(key, units, options),
            TreeOp::Cut { from, to } => self.cut(from, to, options, freed),
        }
    }

    fn insert_flow(&mut self, key: ItemKey, bytes: &[u8], options: &TreeOptions) -> Result<()> {
        require_body_key(&key)?;
        self.ensure_free(&key, bytes.len() as u64, options.block_size)?;
        let mut rest = bytes;
        let mut offset = key.offset;

        // Append into a preceding tail item that ends exactly here.
        let appendable = match self.predecessor(&key) {
            Some((prev_key, Item::Tail(prev)))
                if prev_key.same_prefix(&key)
                    && prev_key.offset + prev.len() as u64 == key.offset
                    && prev.len() < options.max_tail_item =>
            {
                Some((*prev_key, prev.clone()))
            }
            _ => None,
        };
        if let Some((prev_key, mut prev)) = appendable {
            let take = rest.len().min(options.max_tail_item - prev.len());
            prev.extend_from_slice(&rest[..take]);
            self.put(prev_key, Item::Tail(prev), options);
            rest = &rest[take..];
            offset += take as u64;
        }

        for chunk in rest.chunks(options.max_tail_item) {
            self.put(key.with_offset(offset), Item::Tail(chunk.to_vec()), options);
            offset += chunk.len() as u64;
        }
        Ok(())
    }

    fn insert_extent(
        &mut self,
        key: ItemKey,
        units: Vec<ExtentUnit>,
        options: &TreeOptions,
    ) -> Result<()> {
        require_body_key(&key)?;
        let block_size = u64::from(options.block_size);
        if key.offset % block_size != 0 {
            return Err(TfsError::Format(format!(
                "extent key {key} is not aligned to block size {block_size}"
            )));
        }
        let len = units_width(&units)
            .checked_mul(block_size)
            .ok_or_else(|| TfsError::Format(format!("extent at {key} overflows offset")))?;
        let end = self.ensure_free(&key, len, options.block_size)?;

        let mut start = key;
        let mut merged = Vec::new();
        let prev = match self.predecessor(&key) {
            Some((prev_key, Item::Extent(prev)))
                if prev_key.same_prefix(&key)
                    && prev_key.offset + units_width(prev) * block_size == key.offset =>
            {
                Some((*prev_key, prev.clone()))
            }
            _ => None,
        };
        if let Some((prev_key, prev)) = prev {
            start = prev_key;
            merged = prev;
        }
        append_units(&mut merged, units);
        let next_key = key.with_offset(end);
        if let Some(Item::Extent(next)) = self.get(&next_key) {
            let next = next.clone();
            self.remove(&next_key, options);
            append_units(&mut merged, next);
        }
        self.put(start, Item::Extent(merged), options);
        Ok(())
    }

    fn cut(
        &mut self,
        from: ItemKey,
        to: ItemKey,
        options: &TreeOptions,
        freed: &mut Vec<BlockRange>,
    ) -> Result<()> {
        require_body_key(&from)?;
        if !from.same_prefix(&to) {
            return Err(TfsError::Format(format!(
                "cut bounds {from} and {to} belong to different objects"
            )));
        }
        let (lo, hi) = (from.offset, to.offset);
        if lo >= hi {
            return Ok(());
        }
        let block_size = u64::from(options.block_size);
        for (key, item) in self.overlapping(&from, lo, hi, options.block_size) {
            match item {
                Item::Tail(bytes) => {
                    let start = key.offset;
                    let end = start + bytes.len() as u64;
                    let head = lo.saturating_sub(start).min(bytes.len() as u64) as usize;
                    let keep_from = hi.clamp(start, end);
                    let tail_at = (keep_from - start) as usize;
                    self.remove(&key, options);
                    if head > 0 {
                        self.put(key, Item::Tail(bytes[..head].to_vec()), options);
                    }
                    if tail_at < bytes.len() {
                        self.put(
                            key.with_offset(keep_from),
                            Item::Tail(bytes[tail_at..].to_vec()),
                            options,
                        );
                    }
                }
                Item::Extent(units) => {
                    let start = key.offset;
                    let width = units_width(&units);
                    let first = if lo <= start {
                        0
                    } else {
                        (lo - start).div_ceil(block_size)
                    };
                    let last = ((hi.saturating_sub(start)) / block_size).min(width);
                    if first >= last {
                        continue;
                    }
                    let (before, inside, after) = split_units(&units, first, last);
                    freed.extend(inside.iter().filter_map(ExtentUnit::owned_range));
                    self.remove(&key, options);
                    if !before.is_empty() {
                        self.put(key, Item::Extent(before), options);
                    }
                    if !after.is_empty() {
                        self.put(
                            key.with_offset(start + last * block_size),
                            Item::Extent(after),
                            options,
                        );
                    }
                }
                Item::StatData(_) | Item::SafeLink(_) => {}
            }
        }
        Ok(())
    }
}

fn require_body_key(key: &ItemKey) -> Result<()> {
    if key.kind != KeyKind::Body {
        return Err(TfsError::Format(format!("{key} is not a body key")));
    }
    Ok(())
}

/// Serializable point-in-time copy of a [`MemTreeStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeImage {
    options: TreeOptions,
    state: TreeState,
}

#[derive(Debug, Default)]
struct FaultPlan {
    /// Commits left to succeed before the next one fails.
    fail_after: Option<u64>,
}

/// In-memory keyed store with seals, copy-on-write commits and fault
/// injection.
#[derive(Debug)]
pub struct MemTreeStore {
    options: TreeOptions,
    /// Upper bound on the tail payload held in memory.
    tail_capacity: u64,
    state: RwLock<TreeState>,
    faults: Mutex<FaultPlan>,
}

/// Default tail payload limit of a [`MemTreeStore`]: 1 GiB.
pub const DEFAULT_TAIL_CAPACITY: u64 = 1 << 30;

impl Default for MemTreeStore {
    fn default() -> Self {
        Self {
            options: TreeOptions::default(),
            tail_capacity: DEFAULT_TAIL_CAPACITY,
            state: RwLock::new(TreeState::new()),
            faults: Mutex::new(FaultPlan::default()),
        }
    }
}

impl MemTreeStore {
    pub fn new(options: TreeOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            tail_capacity: DEFAULT_TAIL_CAPACITY,
            state: RwLock::new(TreeState::new()),
            faults: Mutex::new(FaultPlan::default()),
        })
    }

    /// Replace the tail payload limit.
    #[must_use]
    pub fn with_tail_capacity(mut self, bytes: u64) -> Self {
        self.tail_capacity = bytes;
        self
    }

    /// Tail payload bytes currently stored.
    #[must_use]
    pub fn tail_bytes(&self) -> u64 {
        self.state.read().tail_bytes()
    }

    #[must_use]
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Let `n` more commits succeed, then fail the next one with
    /// `TfsError::FaultInjected` without applying it. One-shot.
    pub fn fail_commit_after(&self, n: u64) {
        self.faults.lock().fail_after = Some(n);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().fail_after = None;
    }

    /// Number of successful commits since the store was created.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.state.read().seq
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.state.read().nodes.iter().map(|node| node.items.len()).sum()
    }

    #[must_use]
    pub fn image(&self) -> TreeImage {
        TreeImage {
            options: self.options,
            state: self.state.read().clone(),
        }
    }

    pub fn from_image(image: TreeImage) -> Result<Self> {
        image.options.validate()?;
        let state = image.state;
        if state.nodes.is_empty() {
            return Err(TfsError::Format("tree image has no nodes".to_owned()));
        }
        let mut prev: Option<&ItemKey> = None;
        for (key, _) in state.nodes.iter().flat_map(|node| node.items.iter()) {
            if prev.is_some_and(|prev| prev >= key) {
                return Err(TfsError::Format(format!(
                    "tree image keys out of order at {key}"
                )));
            }
            prev = Some(key);
        }
        Ok(Self {
            options: image.options,
            tail_capacity: DEFAULT_TAIL_CAPACITY,
            state: RwLock::new(state),
            faults: Mutex::new(FaultPlan::default()),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.image())
            .map_err(|e| TfsError::Format(format!("encode tree image: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let image: TreeImage = serde_json::from_str(json)
            .map_err(|e| TfsError::Format(format!("decode tree image: {e}")))?;
        Self::from_image(image)
    }

    fn check_fault(&self, what: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        match faults.fail_after {
            Some(0) => {
                faults.fail_after = None;
                warn!(target: "tfs::tree", event = "fault_injected", op = what);
                Err(TfsError::FaultInjected(format!("{what} commit")))
            }
            Some(n) => {
                faults.fail_after = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Run `f` against a copy of the tree and publish the copy on success.
    fn mutate<R>(
        &self,
        what: &str,
        f: impl FnOnce(&mut TreeState, &TreeOptions, &mut Vec<BlockRange>) -> Result<R>,
    ) -> Result<(R, CommitOutcome)> {
        self.check_fault(what)?;
        let mut live = self.state.write();
        let mut work = live.clone();
        let mut freed = Vec::new();
        let value = f(&mut work, &self.options, &mut freed)?;
        work.seq += 1;
        let seq = CommitSeq(work.seq);
        *live = work;
        debug!(
            target: "tfs::tree",
            event = "commit",
            op = what,
            seq = seq.0,
            freed_runs = freed.len()
        );
        Ok((value, CommitOutcome { seq, freed }))
    }
}

impl KeyedStore for MemTreeStore {
    fn block_size(&self) -> u32 {
        self.options.block_size
    }

    fn max_tail_item(&self) -> usize {
        self.options.max_tail_item
    }

    fn search(&self, key: &ItemKey, mode: SearchMode, bias: Bias) -> Result<SearchResult> {
        let state = self.state.read();
        let (idx, pos) = state.locate(key);
        let node = &state.nodes[idx];
        let at = |pos| Coord {
            node: node.id,
            pos,
            generation: node.generation,
        };
        let result = match (pos, bias) {
            (Ok(pos), _) => SearchResult::Found(at(pos)),
            (Err(pos), Bias::MaxNotMore) if pos > 0 => SearchResult::Found(at(pos - 1)),
            (Err(pos), _) => SearchResult::NotFound {
                next: state.coord_at(idx, pos),
            },
        };
        trace!(
            target: "tfs::tree",
            event = "search",
            key = %key,
            mode = ?mode,
            found = matches!(result, SearchResult::Found(_))
        );
        Ok(result)
    }

    fn load_item(&self, coord: Coord) -> Result<ItemView> {
        let state = self.state.read();
        let (key, item) = state.entry(coord)?;
        Ok(ItemView {
            key: *key,
            level: item.level(),
            byte_len: item.byte_len(self.options.block_size),
            item: item.clone(),
        })
    }

    fn next_item(&self, coord: Coord) -> Result<Option<Coord>> {
        let state = self.state.read();
        let idx = state.current_node(coord)?;
        Ok(state.coord_at(idx, coord.pos + 1))
    }

    fn seal(&self, coord: Coord) -> Result<Seal> {
        let state = self.state.read();
        let idx = state.current_node(coord)?;
        Ok(Seal {
            node: coord.node,
            generation: state.nodes[idx].generation,
        })
    }

    fn get(&self, key: &ItemKey) -> Result<Option<Item>> {
        Ok(self.state.read().get(key).cloned())
    }

    fn seal_valid(&self, seal: &Seal) -> bool {
        let state = self.state.read();
        state
            .node_index(seal.node)
            .is_some_and(|idx| state.nodes[idx].generation == seal.generation)
    }

    fn range(&self, from: &ItemKey, to: &ItemKey) -> Result<Vec<(ItemKey, Item)>> {
        let state = self.state.read();
        Ok(state
            .scan(*from)
            .take_while(|(key, _)| key < to)
            .cloned()
            .collect())
    }

    fn tail_room(&self) -> u64 {
        self.tail_capacity.saturating_sub(self.state.read().tail_bytes())
    }

    fn commit(&self, txn: Transaction) -> Result<CommitOutcome> {
        let ops = txn.into_ops();
        let count = ops.len();
        let capacity = self.tail_capacity;
        let ((), outcome) = self.mutate("txn", |state, options, freed| {
            let grows = ops.iter().any(|op| matches!(op, TreeOp::InsertFlow { .. }));
            for op in ops {
                state.apply(op, options, freed)?;
            }
            if grows && state.tail_bytes() > capacity {
                warn!(target: "tfs::tree", event = "tail_capacity", capacity);
                return Err(TfsError::NoSpace);
            }
            Ok(())
        })?;
        trace!(target: "tfs::tree", event = "txn_applied", ops = count, seq = outcome.seq.0);
        Ok(outcome)
    }

    fn cut_range(&self, from: &ItemKey, to: &ItemKey, max_items: usize) -> Result<CutOutcome> {
        let max_items = max_items.max(1);
        let ((smallest_removed, complete), outcome) =
            self.mutate("cut_range", |state, options, freed| {
                let hits = state.overlapping(from, from.offset, to.offset, options.block_size);
                let selected = &hits[hits.len().saturating_sub(max_items)..];
                let start = selected
                    .first()
                    .map_or(from.offset, |(key, _)| key.offset.max(from.offset));
                let smallest = from.with_offset(start);
                state.cut(smallest, *to, options, freed)?;
                Ok((smallest, hits.len() <= max_items))
            })?;
        Ok(CutOutcome {
            smallest_removed,
            complete,
            freed: outcome.freed,
        })
    }
}
