//! Tail vs extent formatting policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Decides which representation a body of a given size should use.
pub trait TailPolicy: Send + Sync {
    /// Whether a body of `size` bytes should be stored as extents.
    fn should_use_extents(&self, size: u64) -> bool;
}

/// Built-in formatting policies plus an injection point.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormattingPolicy {
    /// Never store tails.
    Never,
    /// Always store tails, whatever the size.
    Always,
    /// Tails while the body is at most `max_tail_bytes` long.
    SmallFile { max_tail_bytes: u64 },
    #[serde(skip)]
    Custom(Arc<dyn TailPolicy>),
}

impl FormattingPolicy {
    #[must_use]
    pub fn small_file(max_tail_bytes: u64) -> Self {
        Self::SmallFile { max_tail_bytes }
    }

    #[must_use]
    pub fn custom(policy: impl TailPolicy + 'static) -> Self {
        Self::Custom(Arc::new(policy))
    }
}

impl TailPolicy for FormattingPolicy {
    fn should_use_extents(&self, size: u64) -> bool {
        match self {
            Self::Never => true,
            Self::Always => false,
            Self::SmallFile { max_tail_bytes } => size > *max_tail_bytes,
            Self::Custom(policy) => policy.should_use_extents(size),
        }
    }
}

impl Default for FormattingPolicy {
    fn default() -> Self {
        Self::SmallFile {
            max_tail_bytes: 16 * 1024,
        }
    }
}

impl fmt::Debug for FormattingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::SmallFile { max_tail_bytes } => f
                .debug_struct("SmallFile")
                .field("max_tail_bytes", max_tail_bytes)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl<F> TailPolicy for F
where
    F: Fn(u64) -> bool + Send + Sync,
{
    fn should_use_extents(&self, size: u64) -> bool {
        self(size)
    }
}
