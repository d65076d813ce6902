#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
//! A volume over a file-backed image, persisted and reopened.
//!
//! The tree is saved as its JSON image next to the block image; reopening
//! both must give back the same files, including one whose conversion was
//! cut short before the "power loss".

use std::fs;
use std::sync::Arc;
use tfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use tfs_body::{FormattingPolicy, Volume, VolumeOptions};
use tfs_tree::{KeyedStore, MemTreeStore, TreeOptions};
use tfs_types::{ObjectId, Representation};

const BS: u32 = 1024;
const BLOCKS: u64 = 128;

fn options() -> VolumeOptions {
    VolumeOptions {
        block_size: BS,
        formatting: FormattingPolicy::small_file(2048),
        convert_on_close: false,
        ..VolumeOptions::default()
    }
}

fn tree_options() -> TreeOptions {
    TreeOptions {
        node_capacity: 16,
        max_tail_item: 512,
        block_size: BS,
    }
}

#[test]
fn image_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let image = dir.path().join("volume.img");
    let tree_path = dir.path().join("tree.json");
    let small = b"a small file kept inline".to_vec();
    let large: Vec<u8> = (0..9000_u32).map(|i| (i % 199) as u8).collect();
    let converting: Vec<u8> = (0..4000_u32).map(|i| (i % 17) as u8 + 1).collect();

    {
        let store = Arc::new(MemTreeStore::new(tree_options()).expect("store"));
        let file = FileByteDevice::create(&image, u64::from(BS) * BLOCKS).expect("create image");
        let device: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(file, BS).expect("block device"));
        let dyn_store: Arc<dyn KeyedStore> = store.clone();
        let (volume, _) = Volume::mount(dyn_store, device, options()).expect("mount");

        for (owner, data) in [(1, &small), (2, &large)] {
            volume.create(ObjectId(owner)).expect("create");
            let mut handle = volume.open(ObjectId(owner)).expect("open");
            volume.write(&mut handle, 0, data).expect("write");
            volume.close(handle).expect("close");
        }

        // Starts below the threshold as tails; the append that crosses it
        // is cut short after the conversion moved every page but before the
        // marker was cleared.
        volume.create(ObjectId(3)).expect("create");
        let mut handle = volume.open(ObjectId(3)).expect("open");
        volume.write(&mut handle, 0, &converting[..2000]).expect("write head");
        store.fail_commit_after(2);
        assert!(volume.write(&mut handle, 2000, &converting[2000..]).is_err());
        assert!(volume.stat(ObjectId(3)).expect("stat").partial_conversion);
        volume.sync().expect("sync");
        fs::write(&tree_path, store.to_json().expect("tree image")).expect("save tree");
        drop(handle);
    }

    let store: Arc<dyn KeyedStore> = Arc::new(
        MemTreeStore::from_json(&fs::read_to_string(&tree_path).expect("load tree"))
            .expect("decode tree"),
    );
    let file = FileByteDevice::open(&image).expect("open image");
    let device: Arc<dyn BlockDevice> = Arc::new(ByteBlockDevice::new(file, BS).expect("device"));
    let (volume, report) = Volume::mount(store, device, options()).expect("remount");
    assert_eq!(report.replayed, 1);

    assert_eq!(volume.representation(ObjectId(1)).expect("rep"), Representation::Tails);
    assert_eq!(volume.representation(ObjectId(2)).expect("rep"), Representation::Extents);
    assert_eq!(volume.representation(ObjectId(3)).expect("rep"), Representation::Extents);
    // The interrupted write never committed; only its conversion finished.
    assert_eq!(volume.size(ObjectId(3)).expect("size"), 2000);

    for (owner, data) in [(1, &small[..]), (2, &large[..]), (3, &converting[..2000])] {
        let mut handle = volume.open(ObjectId(owner)).expect("reopen");
        let mut buf = vec![0_u8; data.len() + 10];
        let n = volume.read(&mut handle, 0, &mut buf).expect("read");
        assert_eq!(&buf[..n], data, "object {owner}");
        volume.close(handle).expect("close");
    }
}
