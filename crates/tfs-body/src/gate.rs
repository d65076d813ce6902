//! Per-object exclusive/shared access coordination.
//!
//! The gate is a lock table keyed by [`ObjectId`], not a lock embedded in
//! the file object. Any number of shared holders may coexist; an exclusive
//! holder excludes everyone else. A waiting exclusive request blocks new
//! shared grants so a steady stream of readers cannot starve it. Waiters
//! block on one condition variable shared by the whole table.
//!
//! Re-entrant acquisition is a logic error. Debug builds track which
//! threads hold grants and assert that a thread never asks for a second
//! grant on an object it already holds.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tfs_types::ObjectId;
use tracing::trace;

/// Lock mode of an access grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessMode {
    Shared,
    Exclusive,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Exclusive => f.write_str("exclusive"),
        }
    }
}

#[derive(Debug, Default)]
struct GateEntry {
    shared: usize,
    exclusive: bool,
    /// Exclusive requests blocked on this entry.
    waiting_exclusive: usize,
    holders: Vec<ThreadId>,
}

impl GateEntry {
    fn is_held(&self) -> bool {
        self.shared > 0 || self.exclusive
    }

    fn is_idle(&self) -> bool {
        !self.is_held() && self.waiting_exclusive == 0
    }
}

#[derive(Debug, Default)]
struct GateTable {
    entries: HashMap<ObjectId, GateEntry>,
}

/// Lock table handing out [`AccessToken`]s.
#[derive(Debug, Default)]
pub struct AccessGate {
    table: Mutex<GateTable>,
    released: Condvar,
}

impl AccessGate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until no holder remains, then grant exclusive access.
    pub fn acquire_exclusive(self: &Arc<Self>, owner: ObjectId) -> AccessToken {
        self.acquire(owner, AccessMode::Exclusive)
    }

    /// Block while an exclusive holder exists, then grant shared access.
    pub fn acquire_shared(self: &Arc<Self>, owner: ObjectId) -> AccessToken {
        self.acquire(owner, AccessMode::Shared)
    }

    pub fn acquire(self: &Arc<Self>, owner: ObjectId, mode: AccessMode) -> AccessToken {
        let me = thread::current().id();
        let mut table = self.table.lock();
        debug_assert!(
            !table
                .entries
                .get(&owner)
                .is_some_and(|entry| entry.holders.contains(&me)),
            "thread already holds an access grant on object {owner}"
        );
        let mut waiting = false;
        loop {
            let entry = table.entries.entry(owner).or_default();
            let free = match mode {
                AccessMode::Shared => !entry.exclusive && entry.waiting_exclusive == 0,
                AccessMode::Exclusive => !entry.is_held(),
            };
            if free {
                match mode {
                    AccessMode::Shared => entry.shared += 1,
                    AccessMode::Exclusive => entry.exclusive = true,
                }
                if waiting {
                    entry.waiting_exclusive -= 1;
                }
                if cfg!(debug_assertions) {
                    entry.holders.push(me);
                }
                break;
            }
            if mode == AccessMode::Exclusive && !waiting {
                entry.waiting_exclusive += 1;
                waiting = true;
            }
            self.released.wait(&mut table);
        }
        trace!(target: "tfs::gate", event = "acquired", object = owner.0, mode = %mode);
        AccessToken {
            gate: Arc::clone(self),
            owner,
            mode,
            holder: me,
            released: false,
        }
    }

    fn release_grant(&self, owner: ObjectId, mode: AccessMode, holder: ThreadId) {
        let mut table = self.table.lock();
        if let Some(entry) = table.entries.get_mut(&owner) {
            match mode {
                AccessMode::Shared => entry.shared = entry.shared.saturating_sub(1),
                AccessMode::Exclusive => entry.exclusive = false,
            }
            if let Some(pos) = entry.holders.iter().position(|id| *id == holder) {
                entry.holders.swap_remove(pos);
            }
            if entry.is_idle() {
                table.entries.remove(&owner);
            }
        }
        drop(table);
        self.released.notify_all();
        trace!(target: "tfs::gate", event = "released", object = owner.0, mode = %mode);
    }

    /// Current `(shared, exclusive)` holder counts for `owner`.
    #[must_use]
    pub fn holders(&self, owner: ObjectId) -> (usize, bool) {
        self.table
            .lock()
            .entries
            .get(&owner)
            .map_or((0, false), |entry| (entry.shared, entry.exclusive))
    }
}

/// One granted access. Released explicitly with [`AccessToken::release`] or
/// on drop.
#[must_use = "dropping the token releases the grant immediately"]
pub struct AccessToken {
    gate: Arc<AccessGate>,
    owner: ObjectId,
    mode: AccessMode,
    holder: ThreadId,
    released: bool,
}

impl AccessToken {
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    #[must_use]
    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.release_grant(self.owner, self.mode, self.holder);
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("owner", &self.owner)
            .field("mode", &self.mode)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        self.release_inner();
    }
}
