//! Large-value lifecycle: overflow chains written by operators, loaded on
//! read, and retired when the value they back is replaced or deleted.

use burrow::largeval;
use burrow::storage::Transaction;
use burrow::{
    Decision, LargeValueHandle, ModifyOperator, SliceOptions, TreeSlice, Value,
};
use eyre::Result;
use tempfile::tempdir;

fn fresh_slice() -> (tempfile::TempDir, TreeSlice) {
    let dir = tempdir().unwrap();
    let slice = TreeSlice::create(dir.path().join("slice.bt"), SliceOptions::default()).unwrap();
    (dir, slice)
}

/// Three overflow blocks worth of payload.
fn big_payload(tag: u8) -> Vec<u8> {
    vec![tag; 10_000]
}

#[test]
fn large_put_and_get_roundtrip() {
    let (_dir, slice) = fresh_slice();

    let payload = big_payload(0x11);
    slice.put(b"big", &payload).unwrap();

    assert_eq!(slice.get(b"big").unwrap(), Some(payload));
    assert_eq!(slice.held_count(), 0);
}

#[test]
fn inline_boundary_values_stay_inline() {
    let (_dir, slice) = fresh_slice();

    // At the cap the value is inline; one byte over goes out of line.
    let at_cap = vec![1u8; 768];
    let over_cap = vec![2u8; 769];
    slice.put(b"at", &at_cap).unwrap();
    slice.put(b"over", &over_cap).unwrap();

    assert_eq!(slice.get(b"at").unwrap(), Some(at_cap));
    assert_eq!(slice.get(b"over").unwrap(), Some(over_cap));
}

#[test]
fn replacing_large_value_frees_old_chain() {
    let (_dir, slice) = fresh_slice();

    slice.put(b"big", &big_payload(0xAA)).unwrap();
    slice.put(b"big", &big_payload(0xBB)).unwrap();
    let blocks_after_swap = slice.block_count();

    assert_eq!(slice.get(b"big").unwrap(), Some(big_payload(0xBB)));

    // The first chain's blocks went back on the free chain; an equally
    // sized chain under another key must reuse them.
    slice.put(b"other", &big_payload(0xCC)).unwrap();
    assert_eq!(slice.block_count(), blocks_after_swap);
}

#[test]
fn large_to_inline_replacement_frees_chain() {
    let (_dir, slice) = fresh_slice();

    slice.put(b"k", &big_payload(0xAA)).unwrap();
    slice.put(b"k", b"now small").unwrap();
    let blocks_after = slice.block_count();

    assert_eq!(slice.get(b"k").unwrap(), Some(b"now small".to_vec()));

    slice.put(b"k2", &big_payload(0xDD)).unwrap();
    assert_eq!(slice.block_count(), blocks_after, "freed chain not reused");
}

#[test]
fn deleting_large_value_frees_chain() {
    let (_dir, slice) = fresh_slice();

    slice.put(b"big", &big_payload(0xEE)).unwrap();
    assert!(slice.delete(b"big").unwrap());
    let blocks_after = slice.block_count();

    assert_eq!(slice.get(b"big").unwrap(), None);

    slice.put(b"big2", &big_payload(0xEF)).unwrap();
    assert_eq!(slice.block_count(), blocks_after);
}

/// The swap scenario: an operator reads the old large value and writes a
/// fresh chain for its replacement within the same transaction.
struct SwapLarge {
    replacement: Vec<u8>,
    old_seen: Option<Vec<u8>>,
}

impl ModifyOperator for SwapLarge {
    fn operate(
        &mut self,
        txn: &Transaction,
        old: Option<&Value>,
        old_large: &LargeValueHandle,
    ) -> Result<Decision> {
        assert!(old.is_some_and(|v| v.is_large()));
        assert!(old_large.is_loaded());
        self.old_seen = Some(old_large.bytes().to_vec());

        let lref = largeval::write_chain(txn, &self.replacement)?;
        Ok(Decision::Write {
            value: Value::large(lref)?,
            large: Some(LargeValueHandle::written(lref)),
        })
    }
}

#[test]
fn operator_swaps_large_value_for_another() {
    let (_dir, slice) = fresh_slice();

    let old_payload = big_payload(0xA1);
    let new_payload = big_payload(0xB2);
    slice.put(b"k", &old_payload).unwrap();

    let mut swap = SwapLarge {
        replacement: new_payload.clone(),
        old_seen: None,
    };
    let updated = slice.modify(b"k", &mut swap).unwrap();
    assert!(updated);
    assert_eq!(swap.old_seen, Some(old_payload));

    // The leaf references the new chain.
    assert_eq!(slice.get(b"k").unwrap(), Some(new_payload));
    assert_eq!(slice.held_count(), 0, "no large handles leaked");

    // The old chain was retired: a same-sized chain reuses its blocks.
    let blocks_after_swap = slice.block_count();
    slice.put(b"k2", &big_payload(0xC3)).unwrap();
    assert_eq!(slice.block_count(), blocks_after_swap);
}

/// An operator that keeps the existing chain but rewrites the value's
/// metadata must not lose the chain.
struct TouchMetadata;

impl ModifyOperator for TouchMetadata {
    fn operate(
        &mut self,
        _txn: &Transaction,
        old: Option<&Value>,
        _old_large: &LargeValueHandle,
    ) -> Result<Decision> {
        let old = old.expect("key must exist");
        let lref = *old.large_ref().expect("value must be large");
        let mut value = Value::large(lref)?;
        value.set_exptime(0);

        Ok(Decision::Write {
            value,
            large: Some(LargeValueHandle::written(lref)),
        })
    }
}

#[test]
fn keeping_the_old_chain_does_not_retire_it() {
    let (_dir, slice) = fresh_slice();

    let payload = big_payload(0x77);
    slice.put(b"k", &payload).unwrap();

    let updated = slice.modify(b"k", &mut TouchMetadata).unwrap();
    assert!(updated);
    assert_eq!(slice.get(b"k").unwrap(), Some(payload));
}

#[test]
fn expired_large_value_retires_its_chain() {
    struct Refuse;
    impl ModifyOperator for Refuse {
        fn operate(
            &mut self,
            _txn: &Transaction,
            old: Option<&Value>,
            _old_large: &LargeValueHandle,
        ) -> Result<Decision> {
            assert!(old.is_none(), "expired value must read as absent");
            Ok(Decision::Keep)
        }
    }

    let (_dir, slice) = fresh_slice();
    slice
        .put_with(b"stale", &big_payload(0x99), Some(1), false)
        .unwrap();

    let updated = slice.modify(b"stale", &mut Refuse).unwrap();
    assert!(updated, "silent deletion of the expired key");
    assert_eq!(slice.get(b"stale").unwrap(), None);

    // The chain went with it.
    let blocks_after = slice.block_count();
    slice.put(b"fresh", &big_payload(0x9A)).unwrap();
    assert_eq!(slice.block_count(), blocks_after);
}

#[test]
fn large_values_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("slice.bt");
    let payload = big_payload(0x42);

    {
        let slice = TreeSlice::create(&path, SliceOptions::default()).unwrap();
        slice.put(b"big", &payload).unwrap();
    }

    let slice = TreeSlice::open(&path, SliceOptions::default()).unwrap();
    assert_eq!(slice.get(b"big").unwrap(), Some(payload));
}
