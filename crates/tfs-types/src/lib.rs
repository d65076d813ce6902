#![forbid(unsafe_code)]
//! Shared identifiers, keys and persisted metadata for TwigFS.
//!
//! Every item in the keyed store is addressed by an [`ItemKey`]. Keys order
//! lexicographically by `(locality, object, kind, offset)`, so all body items
//! of one object are adjacent and sorted by the offset of their first byte,
//! and safe-link records occupy a reserved locality at the end of the key
//! space.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default page/block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Locality shared by regular file objects.
pub const FILE_LOCALITY: u64 = 1;

/// Reserved locality holding safe-link records.
pub const SAFE_LINK_LOCALITY: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitSeq(pub u64);

/// A contiguous run of device blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: BlockNumber,
    pub count: u64,
}

impl BlockRange {
    #[must_use]
    pub fn new(start: BlockNumber, count: u64) -> Self {
        Self { start, count }
    }

    /// One past the last block, saturating.
    #[must_use]
    pub fn end(self) -> u64 {
        self.start.0.saturating_add(self.count)
    }

    #[must_use]
    pub fn contains(self, block: BlockNumber) -> bool {
        block.0 >= self.start.0 && block.0 < self.end()
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.count == 0
    }
}

/// Validated block size (power of two in `MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        // u32 always fits in usize on supported targets.
        self.0 as usize
    }

    /// Index of the block containing `byte_offset`.
    #[must_use]
    pub fn block_index(self, byte_offset: u64) -> u64 {
        byte_offset >> self.0.trailing_zeros()
    }

    /// Round `byte_offset` down to a block boundary.
    #[must_use]
    pub fn align_down(self, byte_offset: u64) -> u64 {
        byte_offset & !(self.as_u64() - 1)
    }

    /// Round `byte_offset` up to a block boundary, `None` on overflow.
    #[must_use]
    pub fn align_up(self, byte_offset: u64) -> Option<u64> {
        let mask = self.as_u64() - 1;
        byte_offset.checked_add(mask).map(|v| v & !mask)
    }

    /// Offset of `byte_offset` within its block.
    #[must_use]
    pub fn offset_in_block(self, byte_offset: u64) -> usize {
        // Bounded by the block size, which fits in usize.
        (byte_offset & (self.as_u64() - 1)) as usize
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

/// Key component selecting the item family within one object.
///
/// Declaration order is the on-tree sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    StatData,
    Body,
    SafeLink,
}

/// Address of an item in the keyed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub locality: u64,
    pub object: ObjectId,
    pub kind: KeyKind,
    pub offset: u64,
}

impl ItemKey {
    /// Key of an object's metadata item.
    #[must_use]
    pub fn stat_data(object: ObjectId) -> Self {
        Self {
            locality: FILE_LOCALITY,
            object,
            kind: KeyKind::StatData,
            offset: 0,
        }
    }

    /// Key of the body byte at `offset`.
    #[must_use]
    pub fn body(object: ObjectId, offset: u64) -> Self {
        Self {
            locality: FILE_LOCALITY,
            object,
            kind: KeyKind::Body,
            offset,
        }
    }

    /// Key of the safe-link record `(object, kind)` in the reserved locality.
    #[must_use]
    pub fn safe_link(object: ObjectId, kind: LinkKind) -> Self {
        Self {
            locality: SAFE_LINK_LOCALITY,
            object,
            kind: KeyKind::SafeLink,
            offset: u64::from(kind.as_u8()),
        }
    }

    /// First key of the safe-link locality.
    #[must_use]
    pub fn safe_link_min() -> Self {
        Self {
            locality: SAFE_LINK_LOCALITY,
            object: ObjectId(0),
            kind: KeyKind::StatData,
            offset: 0,
        }
    }

    /// Last key of the safe-link locality.
    #[must_use]
    pub fn safe_link_max() -> Self {
        Self {
            locality: SAFE_LINK_LOCALITY,
            object: ObjectId(u64::MAX),
            kind: KeyKind::SafeLink,
            offset: u64::MAX,
        }
    }

    /// Same key with a different offset.
    #[must_use]
    pub fn with_offset(self, offset: u64) -> Self {
        Self { offset, ..self }
    }

    /// Whether both keys share `(locality, object, kind)`, ignoring the offset.
    #[must_use]
    pub fn same_prefix(&self, other: &Self) -> bool {
        self.locality == other.locality && self.object == other.object && self.kind == other.kind
    }
}

/// Which item kind currently encodes a file body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Representation {
    /// Not yet probed since the object was instantiated in memory.
    Unknown,
    Empty,
    Tails,
    Extents,
}

/// Direction of an in-progress conversion, persisted with the
/// `partial_conversion` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversionTarget {
    Tails,
    Extents,
}

impl ConversionTarget {
    #[must_use]
    pub fn representation(self) -> Representation {
        match self {
            Self::Tails => Representation::Tails,
            Self::Extents => Representation::Extents,
        }
    }
}

/// Kind of a crash-recoverable intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    Truncate,
    UnlinkedOpenFile,
    /// A tail/extent conversion; the direction is in the stat data.
    Conversion,
}

impl LinkKind {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Truncate => 1,
            Self::UnlinkedOpenFile => 2,
            Self::Conversion => 3,
        }
    }

    pub fn from_u8(raw: u8) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(Self::Truncate),
            2 => Ok(Self::UnlinkedOpenFile),
            3 => Ok(Self::Conversion),
            _ => Err(ParseError::InvalidField {
                field: "link_kind",
                reason: "unknown safe-link kind",
            }),
        }
    }
}

/// Per-object metadata item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatData {
    pub size: u64,
    pub nlink: u32,
    /// Set for the duration of a tail/extent conversion.
    pub partial_conversion: bool,
    pub conversion_target: Option<ConversionTarget>,
}

impl StatData {
    #[must_use]
    pub fn new() -> Self {
        Self {
            size: 0,
            nlink: 1,
            partial_conversion: false,
            conversion_target: None,
        }
    }
}

impl Default for StatData {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}:{}:{:?}:{}",
            self.locality, self.object, self.kind, self.offset
        )
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Empty => "empty",
            Self::Tails => "tails",
            Self::Extents => "extents",
        };
        f.write_str(name)
    }
}
