//! The upward interface: a mounted volume of regular-file bodies.

use crate::body::{FileBody, Step};
use crate::gate::{AccessGate, AccessMode, AccessToken};
use crate::hint::{Hint, HintStats};
use crate::options::VolumeOptions;
use crate::policy::TailPolicy;
use crate::safelink::{LinkReplayer, RecoveryReport, SafeLinkLog, SafeLinkRecord};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tfs_block::{BitmapAllocator, BlockAllocator, BlockDevice};
use tfs_error::{Result, TfsError};
use tfs_tree::{Item, KeyedStore};
use tfs_types::{
    BlockRange, BlockSize, ConversionTarget, ItemKey, KeyKind, ObjectId, Representation, StatData,
};
use tracing::{debug, info, trace, warn};

/// An open regular file.
///
/// Carries the per-handle [`Hint`]. Must be handed back to
/// [`Volume::close`]; dropping it leaks one open reference until the volume
/// is remounted.
#[derive(Debug)]
#[must_use = "file handles must be passed to Volume::close"]
pub struct FileHandle {
    pub(crate) owner: ObjectId,
    pub(crate) body: Arc<FileBody>,
    pub(crate) hint: Hint,
}

impl FileHandle {
    #[must_use]
    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    /// Cached representation; `Unknown` until the first access.
    #[must_use]
    pub fn representation(&self) -> Representation {
        self.body.representation()
    }

    #[must_use]
    pub fn hint_stats(&self) -> HintStats {
        self.hint.stats()
    }
}

/// Mounted volume: keyed store + data device + in-memory body registry.
pub struct Volume {
    pub(crate) store: Arc<dyn KeyedStore>,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) allocator: BitmapAllocator,
    pub(crate) gate: Arc<AccessGate>,
    pub(crate) links: SafeLinkLog,
    pub(crate) options: VolumeOptions,
    pub(crate) block_size: BlockSize,
    bodies: Mutex<HashMap<ObjectId, Arc<FileBody>>>,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("block_size", &self.block_size)
            .field("options", &self.options)
            .field("free_blocks", &self.allocator.free_count())
            .field("open_bodies", &self.bodies.lock().len())
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Mount a volume over `store` and `device`.
    ///
    /// Rebuilds the block allocator from the extent units reachable in the
    /// store, then replays every pending safe-link before returning.
    pub fn mount(
        store: Arc<dyn KeyedStore>,
        device: Arc<dyn BlockDevice>,
        options: VolumeOptions,
    ) -> Result<(Self, RecoveryReport)> {
        options.validate()?;
        let block_size = options.block_size()?;
        if store.block_size() != block_size.get() || device.block_size() != block_size.get() {
            return Err(TfsError::Format(format!(
                "block size mismatch: options={} store={} device={}",
                block_size,
                store.block_size(),
                device.block_size()
            )));
        }
        let allocator = BitmapAllocator::new(device.block_count(), 0)?;
        let mut referenced = 0_u64;
        for (key, item) in store.range(&first_key(), &ItemKey::safe_link_min())? {
            let Item::Extent(units) = item else { continue };
            for range in units.iter().filter_map(tfs_tree::ExtentUnit::owned_range) {
                allocator
                    .mark_used(range)
                    .map_err(|err| TfsError::Corruption {
                        object: key.object.0,
                        detail: format!("extent at {key} references blocks outside device: {err}"),
                    })?;
                referenced += range.count;
            }
        }

        let volume = Self {
            links: SafeLinkLog::new(Arc::clone(&store)),
            store,
            device,
            allocator,
            gate: AccessGate::new(),
            options,
            block_size,
            bodies: Mutex::new(HashMap::new()),
        };
        let report = volume.mount_time_recover()?;
        info!(
            target: "tfs::volume",
            event = "mounted",
            block_size = volume.block_size.get(),
            referenced_blocks = referenced,
            free_blocks = volume.allocator.free_count(),
            replayed = report.replayed,
            dropped = report.dropped,
            failed = report.failed
        );
        Ok((volume, report))
    }

    /// Replay every pending safe-link. Runs during [`Volume::mount`]; safe
    /// to call again, a second run finds nothing to do.
    pub fn mount_time_recover(&self) -> Result<RecoveryReport> {
        self.links.replay_all(self)
    }

    #[must_use]
    pub fn options(&self) -> &VolumeOptions {
        &self.options
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.allocator.free_count()
    }

    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }

    // ── Objects ─────────────────────────────────────────────────────────

    /// Create an empty regular file.
    pub fn create(&self, owner: ObjectId) -> Result<()> {
        let token = self.gate.acquire_exclusive(owner);
        if self.store.stat_data(owner)?.is_some() {
            return Err(TfsError::Exists);
        }
        let mut txn = self.store.begin();
        txn.stage_stat_data(owner, StatData::new());
        self.store.commit(txn)?;
        token.release();
        debug!(target: "tfs::volume", event = "created", object = owner.0);
        Ok(())
    }

    /// Open a regular file, finishing an interrupted conversion first.
    ///
    /// The name check and the open count bump happen under one shared
    /// grant, so `unlink` sees either no open handle and no name left to
    /// open, or this handle.
    pub fn open(&self, owner: ObjectId) -> Result<FileHandle> {
        let shared = self.gate.acquire_shared(owner);
        let stat = self
            .store
            .stat_data(owner)?
            .filter(|stat| stat.nlink > 0)
            .ok_or_else(|| TfsError::NotFound(format!("object {owner}")))?;
        let body = self.body_for(owner);
        let open_count = body.opened();
        shared.release();
        if stat.partial_conversion {
            let token = self.gate.acquire_exclusive(owner);
            if let Err(err) = self.finish_pending_conversion(&token, &body) {
                drop(token);
                body.closed();
                drop(body);
                self.maybe_evict(owner);
                return Err(err);
            }
        }
        debug!(target: "tfs::volume", event = "opened", object = owner.0, open_count);
        Ok(FileHandle {
            owner,
            body,
            hint: Hint::new(),
        })
    }

    /// Read into `buf` from `offset`; short only at end of file.
    pub fn read(&self, handle: &mut FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let token = self.gate.acquire_shared(handle.owner);
        let stat = self.handle_stat(handle.owner)?;
        let representation = handle
            .body
            .resolve_representation(&*self.store, &stat)?;
        if offset >= stat.size || buf.is_empty() {
            return Ok(0);
        }
        let len = usize::try_from(stat.size - offset).map_or(buf.len(), |left| left.min(buf.len()));
        self.read_range(
            &mut handle.hint,
            &handle.body,
            representation,
            &stat,
            offset,
            &mut buf[..len],
        )?;
        token.release();
        Ok(len)
    }

    /// Write `data` at `offset`.
    ///
    /// Overwrites inside the current size run with shared access. Growing
    /// the file, writing into an empty file, or crossing the policy
    /// threshold restarts the attempt with exclusive access.
    pub fn write(&self, handle: &mut FileHandle, offset: u64, data: &[u8]) -> Result<usize> {
        let mut mode = AccessMode::Shared;
        loop {
            let token = self.gate.acquire(handle.owner, mode);
            match self.write_step(&token, handle, offset, data)? {
                Step::Done(written) => return Ok(written),
                Step::Restart(next) => {
                    trace!(
                        target: "tfs::volume",
                        event = "write_restart",
                        object = handle.owner.0,
                        from = %mode,
                        to = %next
                    );
                    token.release();
                    mode = next;
                }
            }
        }
    }

    fn write_step(
        &self,
        token: &AccessToken,
        handle: &mut FileHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<Step<usize>> {
        if data.is_empty() {
            return Ok(Step::Done(0));
        }
        let new_end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| TfsError::Format(format!("write at {offset} overflows offset")))?;
        let exclusive = token.mode() == AccessMode::Exclusive;
        let body = Arc::clone(&handle.body);
        let _writer = body.write_lock.lock();

        let mut stat = self.handle_stat(handle.owner)?;
        if stat.partial_conversion {
            if !exclusive {
                return Ok(Step::Restart(AccessMode::Exclusive));
            }
            self.finish_pending_conversion(token, &body)?;
            stat = self.handle_stat(handle.owner)?;
        }
        let representation = body.resolve_representation(&*self.store, &stat)?;
        let wants_extents = self
            .options
            .formatting
            .should_use_extents(new_end.max(stat.size));
        let needs_exclusive = representation == Representation::Empty
            || new_end > stat.size
            || (representation == Representation::Tails && wants_extents);
        if needs_exclusive && !exclusive {
            return Ok(Step::Restart(AccessMode::Exclusive));
        }

        match representation {
            Representation::Empty => {
                let target = if wants_extents {
                    ConversionTarget::Extents
                } else {
                    ConversionTarget::Tails
                };
                self.write_as(target, &mut handle.hint, &body, stat, offset, data)?;
                // A zero fill ahead of the data may already have done this.
                if body.representation() == Representation::Empty {
                    body.initialize_representation(target)?;
                }
            }
            Representation::Tails if wants_extents => {
                self.run_tail_to_extent(token, &body)?;
                let stat = self.handle_stat(handle.owner)?;
                self.write_as(
                    ConversionTarget::Extents,
                    &mut handle.hint,
                    &body,
                    stat,
                    offset,
                    data,
                )?;
            }
            Representation::Tails => {
                self.write_as(ConversionTarget::Tails, &mut handle.hint, &body, stat, offset, data)?;
            }
            Representation::Extents => {
                self.write_as(
                    ConversionTarget::Extents,
                    &mut handle.hint,
                    &body,
                    stat,
                    offset,
                    data,
                )?;
            }
            Representation::Unknown => {
                return Err(TfsError::InvalidState(format!(
                    "object {}: write on unresolved body",
                    handle.owner
                )));
            }
        }
        Ok(Step::Done(data.len()))
    }

    fn write_as(
        &self,
        target: ConversionTarget,
        hint: &mut Hint,
        body: &FileBody,
        stat: StatData,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        match target {
            ConversionTarget::Tails => self.write_tails(hint, body, stat, offset, data),
            ConversionTarget::Extents => self.write_extents(hint, body, stat, offset, data),
        }
    }

    /// Set the file size to `new_size` through the safe-link protocol.
    pub fn truncate(&self, handle: &FileHandle, new_size: u64) -> Result<()> {
        let token = self.gate.acquire_exclusive(handle.owner);
        self.handle_stat(handle.owner)?;
        self.truncate_locked(&token, &handle.body, new_size)
    }

    /// Release a handle.
    ///
    /// The last close deletes an unlinked file, or moves a small extent file
    /// back to tails when `convert_on_close` is set.
    pub fn close(&self, handle: FileHandle) -> Result<()> {
        let FileHandle { owner, body, hint } = handle;
        let stats = hint.stats();
        let remaining = body.closed();
        let result = if remaining == 0 {
            self.last_close(&body)
        } else {
            Ok(())
        };
        drop(body);
        self.maybe_evict(owner);
        debug!(
            target: "tfs::volume",
            event = "closed",
            object = owner.0,
            remaining,
            hint_hits = stats.hits,
            hint_misses = stats.misses
        );
        result
    }

    fn last_close(&self, body: &FileBody) -> Result<()> {
        let owner = body.owner();
        let token = self.gate.acquire_exclusive(owner);
        if body.open_count() > 0 {
            return Ok(());
        }
        if body.is_unlinked() {
            return self.delete_object(&token, owner);
        }
        if !self.options.convert_on_close || self.store.stat_data(owner)?.is_none() {
            return Ok(());
        }
        self.finish_pending_conversion(&token, body)?;
        let stat = self.handle_stat(owner)?;
        let representation = body.resolve_representation(&*self.store, &stat)?;
        if representation == Representation::Extents
            && !self.options.formatting.should_use_extents(stat.size)
        {
            self.run_extent_to_tail(&token, body)?;
        }
        Ok(())
    }

    /// Remove a file's name. An open file is deleted at its last close.
    pub fn unlink(&self, owner: ObjectId) -> Result<()> {
        let token = self.gate.acquire_exclusive(owner);
        let mut stat = self
            .store
            .stat_data(owner)?
            .filter(|stat| stat.nlink > 0)
            .ok_or_else(|| TfsError::NotFound(format!("object {owner}")))?;
        let open_body = self
            .bodies
            .lock()
            .get(&owner)
            .filter(|body| body.open_count() > 0)
            .cloned();
        let Some(body) = open_body else {
            return self.delete_object(&token, owner);
        };
        stat.nlink = 0;
        let mut txn = self.store.begin();
        SafeLinkLog::stage_record(&mut txn, &SafeLinkRecord::unlinked_open_file(owner));
        txn.stage_stat_data(owner, stat);
        self.store.commit(txn)?;
        body.mark_unlinked();
        info!(
            target: "tfs::volume",
            event = "unlinked_open",
            object = owner.0,
            open_count = body.open_count()
        );
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn stat(&self, owner: ObjectId) -> Result<StatData> {
        self.store
            .stat_data(owner)?
            .ok_or_else(|| TfsError::NotFound(format!("object {owner}")))
    }

    pub fn size(&self, owner: ObjectId) -> Result<u64> {
        Ok(self.stat(owner)?.size)
    }

    /// Resolved representation of `owner`'s body.
    pub fn representation(&self, owner: ObjectId) -> Result<Representation> {
        self.with_body(owner, |body| {
            let _token = self.gate.acquire_shared(owner);
            let stat = self.stat(owner)?;
            body.resolve_representation(&*self.store, &stat)
        })
    }

    // ── Explicit conversions ────────────────────────────────────────────

    /// Move the body to extents. No-op if it already is, or is empty.
    pub fn tail_to_extent(&self, handle: &FileHandle) -> Result<()> {
        let token = self.gate.acquire_exclusive(handle.owner);
        self.handle_stat(handle.owner)?;
        self.finish_pending_conversion(&token, &handle.body)?;
        self.run_tail_to_extent(&token, &handle.body)
    }

    /// Move the body to tails. No-op if it already is, or is empty.
    pub fn extent_to_tail(&self, handle: &FileHandle) -> Result<()> {
        let token = self.gate.acquire_exclusive(handle.owner);
        self.handle_stat(handle.owner)?;
        self.finish_pending_conversion(&token, &handle.body)?;
        self.run_extent_to_tail(&token, &handle.body)
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Stat data of an object reached through a handle.
    pub(crate) fn handle_stat(&self, owner: ObjectId) -> Result<StatData> {
        self.store.stat_data(owner)?.ok_or(TfsError::StaleHandle)
    }

    fn body_for(&self, owner: ObjectId) -> Arc<FileBody> {
        let mut bodies = self.bodies.lock();
        Arc::clone(
            bodies
                .entry(owner)
                .or_insert_with(|| Arc::new(FileBody::new(owner))),
        )
    }

    pub(crate) fn registered_body(&self, owner: ObjectId) -> Option<Arc<FileBody>> {
        self.bodies.lock().get(&owner).cloned()
    }

    /// Drop the in-memory body once nothing references it.
    fn maybe_evict(&self, owner: ObjectId) {
        let mut bodies = self.bodies.lock();
        let idle = bodies
            .get(&owner)
            .is_some_and(|body| body.open_count() == 0 && Arc::strong_count(body) == 1);
        if idle {
            bodies.remove(&owner);
            trace!(target: "tfs::volume", event = "evicted", object = owner.0);
        }
    }

    fn with_body<T>(&self, owner: ObjectId, f: impl FnOnce(&FileBody) -> Result<T>) -> Result<T> {
        let body = self.body_for(owner);
        let result = f(&body);
        drop(body);
        self.maybe_evict(owner);
        result
    }

    /// Return blocks released by a commit to the allocator.
    pub(crate) fn release(&self, ranges: &[BlockRange]) {
        for range in ranges.iter().filter(|range| !range.is_empty()) {
            if let Err(err) = self.allocator.free(*range) {
                warn!(
                    target: "tfs::volume",
                    event = "free_failed",
                    start = range.start.0,
                    count = range.count,
                    error = %err
                );
            }
        }
    }

    pub(crate) fn require_exclusive(token: &AccessToken, owner: ObjectId) -> Result<()> {
        if token.owner() != owner || token.mode() != AccessMode::Exclusive {
            return Err(TfsError::InvalidState(format!(
                "object {owner}: operation requires exclusive access, token is {} on {}",
                token.mode(),
                token.owner()
            )));
        }
        Ok(())
    }
}

impl LinkReplayer for Volume {
    fn replay_truncate(&self, owner: ObjectId, final_size: u64) -> Result<()> {
        self.with_body(owner, |body| {
            let token = self.gate.acquire_exclusive(owner);
            self.truncate_locked(&token, body, final_size)
        })
    }

    fn replay_unlink(&self, owner: ObjectId) -> Result<()> {
        let token = self.gate.acquire_exclusive(owner);
        self.delete_object(&token, owner)
    }

    fn replay_conversion(&self, owner: ObjectId) -> Result<()> {
        self.with_body(owner, |body| {
            let token = self.gate.acquire_exclusive(owner);
            self.finish_pending_conversion(&token, body)
        })
    }
}

/// Smallest possible key.
fn first_key() -> ItemKey {
    ItemKey {
        locality: 0,
        object: ObjectId(0),
        kind: KeyKind::StatData,
        offset: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FormattingPolicy;
    use tfs_block::MemBlockDevice;
    use tfs_tree::{MemTreeStore, TreeOptions};

    const BS: u32 = 512;

    fn mount(formatting: FormattingPolicy) -> Volume {
        let store = MemTreeStore::new(TreeOptions {
            node_capacity: 8,
            max_tail_item: 200,
            block_size: BS,
        })
        .expect("store");
        let device = MemBlockDevice::new(BS, 256).expect("device");
        let options = VolumeOptions {
            block_size: BS,
            formatting,
            ..VolumeOptions::default()
        };
        let (volume, report) =
            Volume::mount(Arc::new(store), Arc::new(device), options).expect("mount");
        assert!(report.is_clean());
        volume
    }

    #[test]
    fn mount_rejects_mismatched_geometry() {
        let store = MemTreeStore::default();
        let device = MemBlockDevice::new(BS, 16).expect("device");
        let err = Volume::mount(
            Arc::new(store),
            Arc::new(device),
            VolumeOptions::default(),
        )
        .expect_err("4096 store over 512 device");
        assert!(matches!(err, TfsError::Format(_)));
    }

    #[test]
    fn create_open_and_query() {
        let volume = mount(FormattingPolicy::default());
        volume.create(ObjectId(1)).expect("create");
        assert!(matches!(volume.create(ObjectId(1)), Err(TfsError::Exists)));
        assert!(matches!(volume.open(ObjectId(2)), Err(TfsError::NotFound(_))));
        let handle = volume.open(ObjectId(1)).expect("open");
        assert_eq!(handle.owner(), ObjectId(1));
        assert_eq!(volume.size(ObjectId(1)).expect("size"), 0);
        assert_eq!(
            volume.representation(ObjectId(1)).expect("representation"),
            Representation::Empty
        );
        volume.close(handle).expect("close");
        assert!(volume.registered_body(ObjectId(1)).is_none());
    }

    #[test]
    fn small_write_lands_in_tails_and_large_in_extents() {
        let volume = mount(FormattingPolicy::small_file(1000));
        volume.create(ObjectId(1)).expect("create");
        volume.create(ObjectId(2)).expect("create");
        let mut small = volume.open(ObjectId(1)).expect("open");
        let mut large = volume.open(ObjectId(2)).expect("open");
        volume.write(&mut small, 0, &[7; 300]).expect("write");
        volume.write(&mut large, 0, &[8; 3000]).expect("write");
        assert_eq!(small.representation(), Representation::Tails);
        assert_eq!(large.representation(), Representation::Extents);

        let mut buf = vec![0_u8; 4000];
        assert_eq!(volume.read(&mut large, 0, &mut buf).expect("read"), 3000);
        assert!(buf[..3000].iter().all(|&b| b == 8));
        assert_eq!(volume.read(&mut small, 299, &mut buf).expect("read"), 1);
        assert_eq!(volume.read(&mut small, 300, &mut buf).expect("read"), 0);
        volume.close(small).expect("close");
        volume.close(large).expect("close");
    }

    #[test]
    fn unlinked_file_lives_until_last_close() {
        let volume = mount(FormattingPolicy::Always);
        volume.create(ObjectId(3)).expect("create");
        let mut first = volume.open(ObjectId(3)).expect("open");
        let mut second = volume.open(ObjectId(3)).expect("open");
        volume.write(&mut first, 0, b"abc").expect("write");
        volume.unlink(ObjectId(3)).expect("unlink");
        assert!(matches!(volume.open(ObjectId(3)), Err(TfsError::NotFound(_))));
        assert!(matches!(volume.unlink(ObjectId(3)), Err(TfsError::NotFound(_))));

        volume.close(first).expect("close first");
        let mut buf = [0_u8; 3];
        assert_eq!(volume.read(&mut second, 0, &mut buf).expect("still readable"), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(volume.stat(ObjectId(3)).expect("stat").nlink, 0);

        volume.close(second).expect("last close deletes");
        assert!(matches!(volume.stat(ObjectId(3)), Err(TfsError::NotFound(_))));
    }

    #[test]
    fn truncating_an_empty_file_to_zero_keeps_it_empty() {
        let volume = mount(FormattingPolicy::Always);
        volume.create(ObjectId(4)).expect("create");
        let handle = volume.open(ObjectId(4)).expect("open");
        assert_eq!(volume.gate.holders(ObjectId(4)), (0, false));
        for _ in 0..2 {
            volume.truncate(&handle, 0).expect("truncate to zero");
            assert_eq!(handle.representation(), Representation::Empty);
        }
        assert!(volume.links.pending().expect("pending").is_empty());
        volume.close(handle).expect("close");
    }

    #[test]
    fn shared_token_is_rejected_where_exclusive_is_required() {
        let volume = mount(FormattingPolicy::Always);
        let token = volume.gate.acquire_shared(ObjectId(9));
        assert!(matches!(
            Volume::require_exclusive(&token, ObjectId(9)),
            Err(TfsError::InvalidState(_))
        ));
        drop(token);
        let token = volume.gate.acquire_exclusive(ObjectId(9));
        assert!(Volume::require_exclusive(&token, ObjectId(8)).is_err());
        Volume::require_exclusive(&token, ObjectId(9)).expect("matching token");
    }
}
