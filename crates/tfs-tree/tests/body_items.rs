use proptest::prelude::*;
use tfs_tree::{ExtentUnit, Item, KeyedStore, MemTreeStore, TreeOptions, units_width};
use tfs_types::{BlockNumber, BlockRange, ItemKey, ObjectId};

const BLOCK: u64 = 512;

fn store() -> MemTreeStore {
    MemTreeStore::new(TreeOptions {
        node_capacity: 6,
        max_tail_item: 64,
        block_size: 512,
    })
    .expect("store")
}

fn body(store: &MemTreeStore, obj: ObjectId) -> Vec<(ItemKey, Item)> {
    store
        .range(&ItemKey::body(obj, 0), &ItemKey::body(obj, u64::MAX))
        .expect("range")
}

fn tail_bytes(store: &MemTreeStore, obj: ObjectId) -> Vec<u8> {
    body(store, obj)
        .into_iter()
        .flat_map(|(_, item)| match item {
            Item::Tail(bytes) => bytes,
            other => panic!("unexpected item {other:?}"),
        })
        .collect()
}

/// Body items must be sorted, contiguous from zero and bounded in size.
fn assert_contiguous_tails(store: &MemTreeStore, obj: ObjectId) {
    let mut expected = 0_u64;
    for (key, item) in body(store, obj) {
        assert_eq!(key.offset, expected, "gap or overlap at {key}");
        let Item::Tail(bytes) = item else {
            panic!("non-tail item at {key}");
        };
        assert!(!bytes.is_empty() && bytes.len() <= 64, "tail item size {}", bytes.len());
        expected += bytes.len() as u64;
    }
}

#[test]
fn unrelated_objects_do_not_interfere() {
    let store = store();
    let a = ObjectId(1);
    let b = ObjectId(2);
    store.insert_flow(ItemKey::body(a, 0), &[0xAA; 200]).expect("a");
    store.insert_flow(ItemKey::body(b, 0), &[0xBB; 150]).expect("b");
    let mut txn = store.begin();
    txn.stage_cut(ItemKey::body(a, 10), ItemKey::body(a, u64::MAX));
    store.commit(txn).expect("cut a");
    assert_eq!(tail_bytes(&store, a), vec![0xAA; 10]);
    assert_eq!(tail_bytes(&store, b), vec![0xBB; 150]);
}

#[test]
fn extent_cut_returns_every_owned_run() {
    let store = store();
    let obj = ObjectId(3);
    let units = vec![
        ExtentUnit::Allocated {
            start: BlockNumber(100),
            width: 2,
        },
        ExtentUnit::Hole { width: 3 },
        ExtentUnit::Allocated {
            start: BlockNumber(300),
            width: 1,
        },
    ];
    let mut txn = store.begin();
    txn.stage_insert_extent(ItemKey::body(obj, 0), units);
    store.commit(txn).expect("insert");

    let outcome = store
        .cut_range(&ItemKey::body(obj, BLOCK), &ItemKey::body(obj, u64::MAX), 16)
        .expect("cut");
    assert!(outcome.complete);
    assert_eq!(
        outcome.freed,
        vec![
            BlockRange::new(BlockNumber(101), 1),
            BlockRange::new(BlockNumber(300), 1)
        ]
    );
    let remaining = body(&store, obj);
    assert_eq!(remaining.len(), 1);
    let Item::Extent(units) = &remaining[0].1 else {
        panic!("extent expected");
    };
    assert_eq!(units_width(units), 1);
}

#[derive(Debug, Clone)]
enum Op {
    Append(Vec<u8>),
    CutFrom(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 1..150).prop_map(Op::Append),
        (0_u16..600).prop_map(Op::CutFrom),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn flow_and_cut_sequences_match_byte_model(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let store = store();
        let obj = ObjectId(7);
        let mut model: Vec<u8> = Vec::new();
        for op in ops {
            match op {
                Op::Append(bytes) => {
                    store
                        .insert_flow(ItemKey::body(obj, model.len() as u64), &bytes)
                        .expect("append");
                    model.extend_from_slice(&bytes);
                }
                Op::CutFrom(at) => {
                    let at = u64::from(at);
                    let mut to = ItemKey::body(obj, u64::MAX);
                    loop {
                        let outcome = store
                            .cut_range(&ItemKey::body(obj, at), &to, 3)
                            .expect("cut");
                        to = outcome.smallest_removed;
                        if outcome.complete {
                            break;
                        }
                    }
                    model.truncate(usize::try_from(at).expect("small").min(model.len()));
                }
            }
            assert_contiguous_tails(&store, obj);
            prop_assert_eq!(tail_bytes(&store, obj), model.clone());
        }
    }
}
