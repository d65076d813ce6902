#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
//! Crash recovery through safe-links and the conversion marker.
//!
//! A crash is simulated by failing one store commit, dropping the volume
//! (and every handle) without closing anything, and mounting a fresh volume
//! over the same store and device.
//!
//! Scenarios:
//! 1. Tail→extent interrupted after every batch resumes at mount.
//! 2. Extent→tail interrupted mid-way resumes on open.
//! 3. A recorded truncate link is replayed at mount.
//! 4. A truncate interrupted between cut batches finishes at mount.
//! 5. An unlinked open file is deleted at mount.
//! 6. Replay is idempotent and drops links whose object is gone.

use std::sync::Arc;
use tfs_block::{BlockDevice, MemBlockDevice};
use tfs_body::{
    FileHandle, FormattingPolicy, RecoveryReport, SafeLinkLog, SafeLinkRecord, Volume,
    VolumeOptions,
};
use tfs_error::TfsError;
use tfs_tree::{KeyedStore, MemTreeStore, TreeOptions};
use tfs_types::{LinkKind, ObjectId, Representation};

const BS: u32 = 512;
const DEVICE_BLOCKS: u64 = 512;

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    store: Arc<MemTreeStore>,
    device: Arc<MemBlockDevice>,
}

impl Fixture {
    fn new() -> Self {
        let store = MemTreeStore::new(TreeOptions {
            node_capacity: 8,
            max_tail_item: 200,
            block_size: BS,
        })
        .expect("store");
        Self {
            store: Arc::new(store),
            device: Arc::new(MemBlockDevice::new(BS, DEVICE_BLOCKS).expect("device")),
        }
    }

    fn options(formatting: FormattingPolicy) -> VolumeOptions {
        VolumeOptions {
            block_size: BS,
            formatting,
            convert_on_close: false,
            cut_batch_items: 4,
            ..VolumeOptions::default()
        }
    }

    fn mount_with(&self, options: VolumeOptions) -> (Volume, RecoveryReport) {
        let store: Arc<dyn KeyedStore> = self.store.clone();
        let device: Arc<dyn BlockDevice> = self.device.clone();
        Volume::mount(store, device, options).expect("mount")
    }

    fn mount(&self, formatting: FormattingPolicy) -> (Volume, RecoveryReport) {
        self.mount_with(Self::options(formatting))
    }

    fn links(&self) -> SafeLinkLog {
        let store: Arc<dyn KeyedStore> = self.store.clone();
        SafeLinkLog::new(store)
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
        .collect()
}

fn read_all(volume: &Volume, handle: &mut FileHandle) -> Vec<u8> {
    let size = volume.size(handle.owner()).expect("size");
    let mut buf = vec![0_u8; size as usize];
    assert_eq!(volume.read(handle, 0, &mut buf).expect("read") as u64, size);
    buf
}

/// Simulated crash: the handle and the volume vanish without a close.
fn crash(volume: Volume, handle: FileHandle) {
    drop(handle);
    drop(volume);
}

// ---------------------------------------------------------------------------
// Scenario 1: interrupted tail→extent
// ---------------------------------------------------------------------------

#[test]
fn interrupted_tail_to_extent_resumes_at_mount() {
    // 5000 bytes = 10 pages = 4 batches of up to 3 pages. Commit 0 is the
    // marker, commits 1..=4 the batches, commit 5 the final clear.
    let data = pattern(5000, 1);
    let owner = ObjectId(5);
    for completed_batches in 0..=4_u64 {
        let fx = Fixture::new();
        let (volume, _) = fx.mount(FormattingPolicy::Always);
        volume.create(owner).expect("create");
        let mut file = volume.open(owner).expect("open");
        volume.write(&mut file, 0, &data).expect("write");

        fx.store.fail_commit_after(completed_batches + 1);
        let err = volume
            .tail_to_extent(&file)
            .expect_err("conversion must be interrupted");
        assert!(matches!(err, TfsError::FaultInjected(_)), "{err:?}");
        let stat = volume.stat(owner).expect("stat");
        assert!(stat.partial_conversion, "after {completed_batches} batches");
        assert!(fx.links().get(owner, LinkKind::Conversion).expect("get").is_some());
        // Reads stay correct while both kinds coexist.
        assert_eq!(read_all(&volume, &mut file), data);
        crash(volume, file);

        let (volume, report) = fx.mount(FormattingPolicy::Always);
        assert_eq!(report.replayed, 1, "after {completed_batches} batches");
        assert!(report.is_clean());
        let stat = volume.stat(owner).expect("stat");
        assert!(!stat.partial_conversion);
        assert_eq!(stat.size, 5000);
        assert_eq!(volume.representation(owner).expect("rep"), Representation::Extents);
        assert!(fx.links().pending().expect("pending").is_empty());
        assert_eq!(volume.free_blocks(), DEVICE_BLOCKS - 10);

        let mut file = volume.open(owner).expect("reopen");
        assert_eq!(read_all(&volume, &mut file), data);
        volume.close(file).expect("close");
    }
}

// ---------------------------------------------------------------------------
// Scenario 2: interrupted extent→tail
// ---------------------------------------------------------------------------

#[test]
fn interrupted_extent_to_tail_resumes_on_open() {
    let data = pattern(2100, 7);
    let owner = ObjectId(6);
    let fx = Fixture::new();
    let (volume, _) = fx.mount(FormattingPolicy::Never);
    volume.create(owner).expect("create");
    let mut file = volume.open(owner).expect("open");
    volume.write(&mut file, 0, &data).expect("write");
    assert_eq!(file.representation(), Representation::Extents);

    // Marker plus two of five pages.
    fx.store.fail_commit_after(3);
    assert!(volume.extent_to_tail(&file).is_err());
    assert!(volume.stat(owner).expect("stat").partial_conversion);
    crash(volume, file);

    // Drop the link so mount leaves the marker for open to find.
    fx.links()
        .clear(owner, LinkKind::Conversion)
        .expect("clear link");
    let (volume, report) = fx.mount(FormattingPolicy::Never);
    assert_eq!(report.total(), 0);
    assert!(volume.stat(owner).expect("stat").partial_conversion);

    let mut file = volume.open(owner).expect("open finishes conversion");
    let stat = volume.stat(owner).expect("stat");
    assert!(!stat.partial_conversion);
    assert_eq!(stat.conversion_target, None);
    assert_eq!(file.representation(), Representation::Tails);
    assert_eq!(read_all(&volume, &mut file), data);
    assert_eq!(volume.free_blocks(), DEVICE_BLOCKS);
    volume.close(file).expect("close");
}

#[test]
fn opposite_conversion_waits_for_pending_one() {
    let data = pattern(2100, 8);
    let owner = ObjectId(7);
    let fx = Fixture::new();
    let (volume, _) = fx.mount(FormattingPolicy::Always);
    volume.create(owner).expect("create");
    let mut file = volume.open(owner).expect("open");
    volume.write(&mut file, 0, &data).expect("write");

    fx.store.fail_commit_after(2);
    assert!(volume.tail_to_extent(&file).is_err());
    // Asking for the reverse first finishes the pending run, then reverses it.
    volume.extent_to_tail(&file).expect("extent_to_tail");
    assert_eq!(file.representation(), Representation::Tails);
    assert!(!volume.stat(owner).expect("stat").partial_conversion);
    assert_eq!(read_all(&volume, &mut file), data);
    volume.close(file).expect("close");
}

// ---------------------------------------------------------------------------
// Scenario 3: recorded truncate
// ---------------------------------------------------------------------------

#[test]
fn recorded_truncate_is_replayed_at_mount() {
    let owner = ObjectId(42);
    let data = pattern(1000, 3);
    let fx = Fixture::new();
    {
        let (volume, _) = fx.mount(FormattingPolicy::Always);
        volume.create(owner).expect("create");
        let mut file = volume.open(owner).expect("open");
        volume.write(&mut file, 0, &data).expect("write");
        volume.close(file).expect("close");
    }
    fx.links()
        .record(&SafeLinkRecord::truncate(owner, 100))
        .expect("record");

    let (volume, report) = fx.mount(FormattingPolicy::Always);
    assert_eq!(report.replayed, 1);
    assert_eq!(volume.size(owner).expect("size"), 100);
    assert!(fx.links().get(owner, LinkKind::Truncate).expect("get").is_none());
    let mut file = volume.open(owner).expect("open");
    assert_eq!(read_all(&volume, &mut file), data[..100].to_vec());
    volume.close(file).expect("close");
}

// ---------------------------------------------------------------------------
// Scenario 4: truncate interrupted between cut batches
// ---------------------------------------------------------------------------

#[test]
fn interrupted_truncate_finishes_at_mount() {
    let owner = ObjectId(8);
    let data = pattern(3000, 4);
    let fx = Fixture::new();
    let (volume, _) = fx.mount(FormattingPolicy::Always);
    volume.create(owner).expect("create");
    let mut file = volume.open(owner).expect("open");
    volume.write(&mut file, 0, &data).expect("write");

    // Link, first cut batch and its size update succeed; the second batch fails.
    fx.store.fail_commit_after(3);
    assert!(matches!(
        volume.truncate(&file, 100),
        Err(TfsError::FaultInjected(_))
    ));
    let partial = volume.size(owner).expect("size");
    assert!(partial < 3000 && partial >= 100, "size after one batch: {partial}");
    assert!(fx.links().get(owner, LinkKind::Truncate).expect("get").is_some());
    crash(volume, file);

    let (volume, report) = fx.mount(FormattingPolicy::Always);
    assert_eq!(report.replayed, 1);
    assert_eq!(volume.size(owner).expect("size"), 100);
    let mut file = volume.open(owner).expect("open");
    assert_eq!(read_all(&volume, &mut file), data[..100].to_vec());
    volume.close(file).expect("close");
}

// ---------------------------------------------------------------------------
// Scenario 5: unlinked open file
// ---------------------------------------------------------------------------

#[test]
fn unlinked_open_file_is_deleted_at_mount() {
    let owner = ObjectId(9);
    let fx = Fixture::new();
    let (volume, _) = fx.mount(FormattingPolicy::Never);
    volume.create(owner).expect("create");
    let mut file = volume.open(owner).expect("open");
    volume.write(&mut file, 0, &pattern(4096, 5)).expect("write");
    volume.unlink(owner).expect("unlink");
    assert_eq!(volume.stat(owner).expect("stat").nlink, 0);
    assert_eq!(volume.free_blocks(), DEVICE_BLOCKS - 8);
    crash(volume, file);

    let (volume, report) = fx.mount(FormattingPolicy::Never);
    assert_eq!(report.replayed, 1);
    assert!(matches!(volume.stat(owner), Err(TfsError::NotFound(_))));
    assert_eq!(volume.free_blocks(), DEVICE_BLOCKS);
    assert!(fx.links().pending().expect("pending").is_empty());
}

// ---------------------------------------------------------------------------
// Scenario 6: idempotence
// ---------------------------------------------------------------------------

#[test]
fn replay_twice_finds_nothing_the_second_time() {
    let owner = ObjectId(11);
    let fx = Fixture::new();
    let (volume, _) = fx.mount(FormattingPolicy::Always);
    volume.create(owner).expect("create");
    let mut file = volume.open(owner).expect("open");
    volume.write(&mut file, 0, &pattern(700, 6)).expect("write");
    volume.close(file).expect("close");

    fx.links()
        .record(&SafeLinkRecord::truncate(owner, 300))
        .expect("record");
    let first = volume.mount_time_recover().expect("first replay");
    assert_eq!(first.replayed, 1);
    let commits = fx.store.commit_count();
    let second = volume.mount_time_recover().expect("second replay");
    assert_eq!(second.total(), 0);
    assert_eq!(fx.store.commit_count(), commits);
    assert_eq!(volume.size(owner).expect("size"), 300);
}

#[test]
fn cleared_link_is_not_replayed() {
    let owner = ObjectId(12);
    let fx = Fixture::new();
    let (volume, _) = fx.mount(FormattingPolicy::Always);
    volume.create(owner).expect("create");
    let links = fx.links();
    links
        .record(&SafeLinkRecord::truncate(owner, 0))
        .expect("record");
    links.clear(owner, LinkKind::Truncate).expect("clear");
    let report = volume.mount_time_recover().expect("replay");
    assert_eq!(report.total(), 0);
}

#[test]
fn link_for_missing_object_is_dropped() {
    let fx = Fixture::new();
    fx.links()
        .record(&SafeLinkRecord::truncate(ObjectId(77), 10))
        .expect("record");
    fx.links()
        .record(&SafeLinkRecord::unlinked_open_file(ObjectId(78)))
        .expect("record");
    let (_volume, report) = fx.mount(FormattingPolicy::Always);
    assert_eq!(report.dropped, 2);
    assert_eq!(report.replayed, 0);
    assert!(fx.links().pending().expect("pending").is_empty());
}
