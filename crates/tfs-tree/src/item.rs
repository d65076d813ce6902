//! Item payloads stored in the tree.
//!
//! A file body is encoded either as `Tail` items (raw bytes kept in leaf
//! nodes next to the metadata) or as `Extent` items (runs of block pointers
//! kept at the twig level, data stored in device blocks). Extent item keys
//! are always block aligned.

use serde::{Deserialize, Serialize};
use tfs_types::{BlockNumber, BlockRange, StatData};

/// One run inside an extent item. Width is in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentUnit {
    Allocated { start: BlockNumber, width: u64 },
    /// Logical hole: reads as zeros, owns no blocks.
    Hole { width: u64 },
}

impl ExtentUnit {
    #[must_use]
    pub fn width(&self) -> u64 {
        match *self {
            Self::Allocated { width, .. } | Self::Hole { width } => width,
        }
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        matches!(self, Self::Hole { .. })
    }

    /// Device block backing the `index`-th block of this unit.
    #[must_use]
    pub fn block_at(&self, index: u64) -> Option<BlockNumber> {
        match *self {
            Self::Allocated { start, width } if index < width => {
                Some(BlockNumber(start.0 + index))
            }
            _ => None,
        }
    }

    /// Sub-run `[from, to)` in blocks relative to the unit start.
    #[must_use]
    pub fn slice(&self, from: u64, to: u64) -> Self {
        let to = to.min(self.width());
        let from = from.min(to);
        match *self {
            Self::Allocated { start, .. } => Self::Allocated {
                start: BlockNumber(start.0 + from),
                width: to - from,
            },
            Self::Hole { .. } => Self::Hole { width: to - from },
        }
    }

    /// Blocks owned by this unit, if any.
    #[must_use]
    pub fn owned_range(&self) -> Option<BlockRange> {
        match *self {
            Self::Allocated { start, width } if width > 0 => Some(BlockRange::new(start, width)),
            _ => None,
        }
    }

    /// Try to extend `self` with `next` in place.
    fn absorb(&mut self, next: Self) -> bool {
        match (self, next) {
            (Self::Hole { width }, Self::Hole { width: more }) => {
                *width += more;
                true
            }
            (
                Self::Allocated { start, width },
                Self::Allocated {
                    start: next_start,
                    width: more,
                },
            ) if start.0 + *width == next_start.0 => {
                *width += more;
                true
            }
            _ => false,
        }
    }
}

/// Total width in blocks of a unit list.
#[must_use]
pub fn units_width(units: &[ExtentUnit]) -> u64 {
    units.iter().map(ExtentUnit::width).sum()
}

/// Append `more` to `units`, coalescing adjacent compatible runs.
pub fn append_units(units: &mut Vec<ExtentUnit>, more: impl IntoIterator<Item = ExtentUnit>) {
    for unit in more {
        if unit.width() == 0 {
            continue;
        }
        if let Some(last) = units.last_mut() {
            if last.absorb(unit) {
                continue;
            }
        }
        units.push(unit);
    }
}

/// Split a unit list into `(before, inside, after)` around the block window
/// `[from, to)` relative to the list start.
#[must_use]
pub fn split_units(
    units: &[ExtentUnit],
    from: u64,
    to: u64,
) -> (Vec<ExtentUnit>, Vec<ExtentUnit>, Vec<ExtentUnit>) {
    let mut before = Vec::new();
    let mut inside = Vec::new();
    let mut after = Vec::new();
    let mut pos = 0_u64;
    for unit in units {
        let width = unit.width();
        let (start, end) = (pos, pos + width);
        let head = from.clamp(start, end) - start;
        let tail = to.clamp(start, end) - start;
        append_units(&mut before, [unit.slice(0, head)]);
        append_units(&mut inside, [unit.slice(head, tail.max(head))]);
        append_units(&mut after, [unit.slice(tail.max(head), width)]);
        pos = end;
    }
    (before, inside, after)
}

/// Discriminant of [`Item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    StatData,
    Tail,
    Extent,
    SafeLink,
}

/// Tree level an item lives at. Extent pointers sit one level above the
/// formatted leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeLevel {
    Leaf,
    Twig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Item {
    StatData(StatData),
    Tail(Vec<u8>),
    Extent(Vec<ExtentUnit>),
    /// Encoded safe-link record.
    SafeLink(Vec<u8>),
}

impl Item {
    #[must_use]
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::StatData(_) => ItemKind::StatData,
            Self::Tail(_) => ItemKind::Tail,
            Self::Extent(_) => ItemKind::Extent,
            Self::SafeLink(_) => ItemKind::SafeLink,
        }
    }

    #[must_use]
    pub fn level(&self) -> TreeLevel {
        match self {
            Self::Extent(_) => TreeLevel::Twig,
            Self::StatData(_) | Self::Tail(_) | Self::SafeLink(_) => TreeLevel::Leaf,
        }
    }

    /// Number of file-body bytes the item covers (0 for non-body items).
    #[must_use]
    pub fn byte_len(&self, block_size: u32) -> u64 {
        match self {
            Self::Tail(bytes) => bytes.len() as u64,
            Self::Extent(units) => units_width(units).saturating_mul(u64::from(block_size)),
            Self::StatData(_) | Self::SafeLink(_) => 0,
        }
    }

    #[must_use]
    pub fn is_body(&self) -> bool {
        matches!(self, Self::Tail(_) | Self::Extent(_))
    }
}
