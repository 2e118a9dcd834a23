//! End-to-end scenarios for the modify walk: root lifecycle, splits,
//! merges, leveling, expiry, and CAS discipline.

use burrow::node::{self, InternalNode, LeafNode};
use burrow::storage::{BlockId, Superblock, Transaction};
use burrow::{Decision, ModifyOperator, SliceOptions, TreeSlice};
use eyre::Result;
use tempfile::tempdir;

fn fresh_slice() -> (tempfile::TempDir, TreeSlice) {
    let dir = tempdir().unwrap();
    let slice = TreeSlice::create(dir.path().join("slice.bt"), SliceOptions::default()).unwrap();
    (dir, slice)
}

/// 180-byte payloads make a leaf overflow on the 21st insert.
const FILL_VALUE: [u8; 180] = [b'v'; 180];

fn fill_key(i: usize) -> Vec<u8> {
    format!("k{:02}", i).into_bytes()
}

/// Operator that records what it saw and changes nothing.
#[derive(Default)]
struct Probe {
    seen: Option<burrow::Value>,
}

impl ModifyOperator for Probe {
    fn operate(
        &mut self,
        _txn: &Transaction,
        old: Option<&burrow::Value>,
        _old_large: &burrow::LargeValueHandle,
    ) -> Result<Decision> {
        self.seen = old.cloned();
        Ok(Decision::Keep)
    }
}

/// Walks the whole tree checking what a committed modify must leave
/// behind: root id in the superblock, uniform leaf depth, sorted keys,
/// and no underfull non-root node.
fn check_invariants(slice: &TreeSlice) {
    fn visit(
        txn: &Transaction,
        id: BlockId,
        is_root: bool,
        depth: u32,
        leaf_depths: &mut Vec<u32>,
    ) {
        let buf = txn.buf(id).unwrap();
        let data = buf.data();
        node::validate(&data).unwrap();

        if !is_root {
            assert!(
                !node::is_underfull(&data).unwrap(),
                "non-root block {} is underfull",
                id
            );
        }

        if node::is_leaf(&data).unwrap() {
            leaf_depths.push(depth);
            return;
        }

        let internal = InternalNode::from_block(&data).unwrap();
        let count = internal.cell_count() as usize;
        let children: Vec<BlockId> = (0..=count).map(|i| internal.child_at(i).unwrap()).collect();
        drop(data);
        drop(buf);

        for child in children {
            visit(txn, child, false, depth + 1, leaf_depths);
        }
    }

    let txn = Transaction::begin_read(slice.cache_handle());
    let root_id = {
        let sb_buf = txn.buf(BlockId::SUPERBLOCK).unwrap();
        let data = sb_buf.data();
        Superblock::from_bytes(&data).unwrap().root_block()
    };

    if root_id.is_none() {
        assert_eq!(slice.depth(), 0);
        return;
    }

    let mut leaf_depths = Vec::new();
    visit(&txn, root_id, true, 1, &mut leaf_depths);

    assert!(!leaf_depths.is_empty());
    assert!(
        leaf_depths.iter().all(|&d| d == leaf_depths[0]),
        "leaves at mixed depths: {:?}",
        leaf_depths
    );
    assert_eq!(
        slice.depth(),
        leaf_depths[0],
        "depth counter disagrees with the actual root-to-leaf path"
    );
    drop(txn);

    assert_eq!(slice.held_count(), 0, "buffer locks leaked");
}

#[test]
fn empty_insert_creates_leaf_root() {
    let (_dir, slice) = fresh_slice();
    assert_eq!(slice.depth(), 0);

    slice.put(b"k", b"a").unwrap();

    assert_eq!(slice.get(b"k").unwrap(), Some(b"a".to_vec()));
    assert_eq!(slice.depth(), 1);
    check_invariants(&slice);
}

#[test]
fn insert_then_lookup_roundtrip() {
    let (_dir, slice) = fresh_slice();

    slice.put(b"alpha", b"1").unwrap();
    slice.put(b"bravo", b"2").unwrap();
    slice.put(b"alpha", b"replaced").unwrap();

    assert_eq!(slice.get(b"alpha").unwrap(), Some(b"replaced".to_vec()));
    assert_eq!(slice.get(b"bravo").unwrap(), Some(b"2".to_vec()));
    assert_eq!(slice.get(b"charlie").unwrap(), None);
    check_invariants(&slice);
}

#[test]
fn delete_then_lookup_returns_none() {
    let (_dir, slice) = fresh_slice();

    slice.put(b"k", b"v").unwrap();
    assert!(slice.delete(b"k").unwrap());
    assert_eq!(slice.get(b"k").unwrap(), None);
    check_invariants(&slice);
}

#[test]
fn idempotent_delete_of_absent_key() {
    let (_dir, slice) = fresh_slice();
    slice.put(b"other", b"v").unwrap();

    assert!(!slice.delete(b"ghost").unwrap());
    assert_eq!(slice.get(b"other").unwrap(), Some(b"v".to_vec()));
    check_invariants(&slice);
}

#[test]
fn leaf_split_grows_tree_to_depth_two() {
    let (_dir, slice) = fresh_slice();

    for i in 1..=20 {
        slice.put(&fill_key(i), &FILL_VALUE).unwrap();
    }
    assert_eq!(slice.depth(), 1, "twenty fill entries share one leaf");

    slice.put(&fill_key(21), &FILL_VALUE).unwrap();

    assert_eq!(slice.depth(), 2);
    assert_eq!(slice.metrics().splits, 1);
    for i in 1..=21 {
        assert_eq!(
            slice.get(&fill_key(i)).unwrap(),
            Some(FILL_VALUE.to_vec()),
            "key {} lost across the split",
            i
        );
    }
    check_invariants(&slice);
}

#[test]
fn root_split_creates_internal_parent() {
    let (_dir, slice) = fresh_slice();

    for i in 1..=21 {
        slice.put(&fill_key(i), &FILL_VALUE).unwrap();
    }

    // The superblock now points at an internal node with two leaf children.
    let txn = Transaction::begin_read(slice.cache_handle());
    let root_id = {
        let sb_buf = txn.buf(BlockId::SUPERBLOCK).unwrap();
        let data = sb_buf.data();
        Superblock::from_bytes(&data).unwrap().root_block()
    };
    let buf = txn.buf(root_id).unwrap();
    let data = buf.data();
    let root = InternalNode::from_block(&data).unwrap();
    assert_eq!(root.cell_count(), 1, "fresh root has a single separator");

    let left = root.child_at(0).unwrap();
    let right = root.child_at(1).unwrap();
    drop(data);
    drop(buf);

    for child in [left, right] {
        let buf = txn.buf(child).unwrap();
        let data = buf.data();
        assert!(LeafNode::from_block(&data).is_ok());
    }
}

#[test]
fn merge_collapses_singleton_root() {
    let (_dir, slice) = fresh_slice();

    for i in 1..=21 {
        slice.put(&fill_key(i), &FILL_VALUE).unwrap();
    }
    assert_eq!(slice.depth(), 2);

    for i in (6..=21).rev() {
        slice.delete(&fill_key(i)).unwrap();
    }

    assert_eq!(slice.depth(), 1, "root should retire after the merge");
    assert!(slice.metrics().merges >= 1);
    for i in 1..=5 {
        assert_eq!(slice.get(&fill_key(i)).unwrap(), Some(FILL_VALUE.to_vec()));
    }
    for i in 6..=21 {
        assert_eq!(slice.get(&fill_key(i)).unwrap(), None);
    }
    check_invariants(&slice);
}

#[test]
fn level_rebalances_without_merging() {
    let (_dir, slice) = fresh_slice();

    // Split once, then fatten the right leaf so its underfull neighbor
    // cannot merge with it.
    for i in 1..=21 {
        slice.put(&fill_key(i), &FILL_VALUE).unwrap();
    }
    for i in 22..=29 {
        slice.put(&fill_key(i), &FILL_VALUE).unwrap();
    }
    assert_eq!(slice.depth(), 2);
    let splits_before = slice.metrics().splits;

    let mut deleted = Vec::new();
    for i in 1..=8 {
        slice.delete(&fill_key(i)).unwrap();
        deleted.push(i);
        if slice.metrics().levels >= 1 {
            break;
        }
    }

    let metrics = slice.metrics();
    assert!(metrics.levels >= 1, "deletions never triggered a level");
    assert_eq!(metrics.merges, 0, "siblings must not have merged");
    assert_eq!(metrics.splits, splits_before);
    assert_eq!(slice.depth(), 2, "structural count unchanged by leveling");

    for i in 1..=29 {
        let expected = if deleted.contains(&i) {
            None
        } else {
            Some(FILL_VALUE.to_vec())
        };
        assert_eq!(slice.get(&fill_key(i)).unwrap(), expected, "key {}", i);
    }
    check_invariants(&slice);
}

#[test]
fn expired_key_is_silently_deleted() {
    let (_dir, slice) = fresh_slice();

    slice.put(b"keep", b"fresh").unwrap();
    // Expiration second 1 is long past.
    slice.put_with(b"k", b"stale", Some(1), false).unwrap();
    assert_eq!(slice.depth(), 1);

    // Expired values read as absent without being touched.
    assert_eq!(slice.get(b"k").unwrap(), None);

    // A refusing operator sees nothing, yet the walk removes the corpse.
    let mut probe = Probe::default();
    let updated = slice.modify(b"k", &mut probe).unwrap();
    assert!(updated, "silent deletion counts as an update");
    assert!(probe.seen.is_none(), "expired value must read as absent");

    let mut probe = Probe::default();
    let updated = slice.modify(b"k", &mut probe).unwrap();
    assert!(!updated, "nothing left to delete");

    assert_eq!(slice.depth(), 1);
    assert_eq!(slice.get(b"keep").unwrap(), Some(b"fresh".to_vec()));
    check_invariants(&slice);
}

#[test]
fn operator_refusal_commits_read_only() {
    let (_dir, slice) = fresh_slice();
    slice.put(b"k", b"v").unwrap();

    let mut probe = Probe::default();
    let updated = slice.modify(b"k", &mut probe).unwrap();

    assert!(!updated);
    assert_eq!(
        probe.seen.as_ref().and_then(|v| v.inline_bytes()),
        Some(b"v".as_slice())
    );
    assert_eq!(slice.get(b"k").unwrap(), Some(b"v".to_vec()));
    check_invariants(&slice);
}

#[test]
fn cas_assigned_from_slice_generator() {
    let (_dir, slice) = fresh_slice();

    slice.put_with(b"k", b"v", None, true).unwrap();
    let first_cas = slice.last_cas();

    let mut probe = Probe::default();
    slice.modify(b"k", &mut probe).unwrap();
    assert_eq!(probe.seen.unwrap().cas(), Some(first_cas));

    // A second CAS-carrying insert gets a strictly newer tag.
    slice.put_with(b"k", b"v2", None, true).unwrap();
    let second_cas = slice.last_cas();
    assert!(second_cas > first_cas);

    let mut probe = Probe::default();
    slice.modify(b"k", &mut probe).unwrap();
    assert_eq!(probe.seen.unwrap().cas(), Some(second_cas));
}

#[test]
fn cas_already_set_is_respected() {
    struct PresetCas;

    impl ModifyOperator for PresetCas {
        fn operate(
            &mut self,
            _txn: &Transaction,
            _old: Option<&burrow::Value>,
            _old_large: &burrow::LargeValueHandle,
        ) -> Result<Decision> {
            let mut value = burrow::Value::inline(b"v".to_vec())?;
            value.set_cas(42);
            Ok(Decision::Write { value, large: None })
        }

        fn cas_already_set(&self) -> bool {
            true
        }
    }

    let (_dir, slice) = fresh_slice();
    slice.modify(b"k", &mut PresetCas).unwrap();

    let mut probe = Probe::default();
    slice.modify(b"k", &mut probe).unwrap();
    assert_eq!(probe.seen.unwrap().cas(), Some(42));
}

#[test]
fn no_buffer_lock_survives_any_modify() {
    let (_dir, slice) = fresh_slice();

    for i in 1..=25 {
        slice.put(&fill_key(i), &FILL_VALUE).unwrap();
        assert_eq!(slice.held_count(), 0, "locks leaked after insert {}", i);
    }
    for i in 1..=25 {
        slice.delete(&fill_key(i)).unwrap();
        assert_eq!(slice.held_count(), 0, "locks leaked after delete {}", i);
    }
}

#[test]
fn reopen_recovers_tree_and_depth() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("slice.bt");

    {
        let slice = TreeSlice::create(&path, SliceOptions::default()).unwrap();
        for i in 1..=21 {
            slice.put(&fill_key(i), &FILL_VALUE).unwrap();
        }
        assert_eq!(slice.depth(), 2);
    }

    let slice = TreeSlice::open(&path, SliceOptions::default()).unwrap();
    assert_eq!(slice.depth(), 2, "depth re-measured on open");
    for i in 1..=21 {
        assert_eq!(slice.get(&fill_key(i)).unwrap(), Some(FILL_VALUE.to_vec()));
    }
    check_invariants(&slice);
}

#[test]
fn mixed_churn_keeps_tree_consistent() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let (_dir, slice) = fresh_slice();
    let mut rng = StdRng::seed_from_u64(0xB122);

    let mut live: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for i in 0..300usize {
        let key = format!("key{:05}", rng.gen_range(0..1000usize)).into_bytes();
        let value = vec![b'a' + (i % 26) as u8; rng.gen_range(50..400)];
        slice.put(&key, &value).unwrap();
        live.retain(|(k, _)| k != &key);
        live.push((key, value));
    }

    assert!(slice.depth() >= 2, "300 inserts should split at least once");
    check_invariants(&slice);

    for (key, value) in &live {
        assert_eq!(slice.get(key).unwrap(), Some(value.clone()), "key {:?}", key);
    }

    for (key, _) in &live {
        assert!(slice.delete(key).unwrap());
    }
    for (key, _) in &live {
        assert_eq!(slice.get(key).unwrap(), None);
    }
    assert!(slice.depth() <= 2, "empty tree should have collapsed");
    check_invariants(&slice);
}
