#![forbid(unsafe_code)]
//! Tail/extent file-body engine for TwigFS.
//!
//! A regular file's bytes live either in **tail** items, stored in the
//! keyed tree next to the file's metadata, or in **extent** units pointing
//! at raw device blocks. This crate decides which one a file uses, routes
//! reads, writes and truncates to the matching codec, and migrates bodies
//! between the two forms online.
//!
//! # Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`gate`] | Per-object shared/exclusive access table |
//! | [`hint`] | Per-handle cached tree coordinate with seal check |
//! | [`safelink`] | Durable intents replayed at mount |
//! | [`body`] | In-memory `FileBody` and its representation state machine |
//! | `codec` | Tail and extent read/write paths |
//! | `convert` | Tail→extent and extent→tail converters |
//! | `truncate` | Truncate and delete under safe-links |
//! | [`policy`] | Which representation a size should use |
//! | [`volume`] | The upward interface: mount, open, read, write, close |
//!
//! # Crash safety
//!
//! Every multi-commit operation is bracketed by a safe-link recorded in
//! the same commit as (or a commit before) its first destructive step and
//! cleared in the same commit as its last. Conversions additionally persist
//! `partial_conversion` in the stat data. [`Volume::mount`] replays whatever
//! is still pending.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tfs_block::MemBlockDevice;
//! use tfs_body::{FormattingPolicy, Volume, VolumeOptions};
//! use tfs_tree::MemTreeStore;
//! use tfs_types::{ObjectId, Representation};
//!
//! let store = Arc::new(MemTreeStore::default());
//! let device = Arc::new(MemBlockDevice::new(4096, 64).unwrap());
//! let options = VolumeOptions {
//!     formatting: FormattingPolicy::small_file(8192),
//!     ..VolumeOptions::default()
//! };
//! let (volume, _report) = Volume::mount(store, device, options).unwrap();
//!
//! volume.create(ObjectId(7)).unwrap();
//! let mut file = volume.open(ObjectId(7)).unwrap();
//! volume.write(&mut file, 0, b"hello").unwrap();
//! assert_eq!(volume.representation(ObjectId(7)).unwrap(), Representation::Tails);
//!
//! volume.write(&mut file, 10_000, b"world").unwrap();
//! assert_eq!(volume.representation(ObjectId(7)).unwrap(), Representation::Extents);
//!
//! let mut buf = [0_u8; 5];
//! volume.read(&mut file, 10_000, &mut buf).unwrap();
//! assert_eq!(&buf, b"world");
//! volume.close(file).unwrap();
//! ```

pub mod body;
mod codec;
mod convert;
pub mod gate;
pub mod hint;
pub mod options;
pub mod policy;
pub mod safelink;
mod truncate;
pub mod volume;

pub use body::FileBody;
pub use gate::{AccessGate, AccessMode, AccessToken};
pub use hint::{Hint, HintCheck, HintStats};
pub use options::VolumeOptions;
pub use policy::{FormattingPolicy, TailPolicy};
pub use safelink::{LinkReplayer, RecoveryReport, SafeLinkLog, SafeLinkRecord};
pub use volume::{FileHandle, Volume};
