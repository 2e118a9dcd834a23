//! The modify walk.
//!
//! One write transaction descends from the superblock to the leaf owning
//! the key, runs the operator, applies the result, and commits. Structure
//! maintenance happens on the way down:
//!
//! - internal nodes split proactively, so a parent always has room for a
//!   child's split separator and the descent never retries;
//! - underfull nodes merge with a sibling or level entries across, which
//!   may retire a singleton root;
//! - leaves split reactively, only when the incoming value would not fit.
//!
//! Locking is hand-over-hand through the cursor triple `(sb_buf, last_buf,
//! buf)`: a node is touched only while it or its parent is held, and the
//! superblock stays held exactly while the walk is at the root or one of
//! its direct children, the only region where the root can still change.
//! Parenthood lives in which lock is held, never in the nodes themselves.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use tracing::{debug, trace};

use crate::config::MAX_KEY_SIZE;
use crate::largeval::LargeValueHandle;
use crate::node::{self, InternalNode, InternalNodeMut, KeyBuf, LeafNode, LeafNodeMut, NodeKind};
use crate::storage::{BlockId, BufLock, Superblock, Transaction};
use crate::value::Value;

use super::operator::{check_decision, Decision, ModifyOperator};
use super::{wall_clock_secs, TreeSlice};

/// Points the superblock at a new root and lets the superblock go; the
/// walk must not touch `sb_buf` afterwards.
fn install_root(new_root: BlockId, sb_buf: &mut BufLock<'_>) -> Result<()> {
    assert!(
        sb_buf.is_acquired(),
        "superblock released before a root change"
    );
    {
        let mut data = sb_buf.data_mut();
        Superblock::from_bytes_mut(&mut data)?.set_root_block(new_root);
    }
    sb_buf.release();
    debug!(root = %new_root, "btree.root.install");
    Ok(())
}

/// Acquires the root, creating an empty leaf root on a virgin tree.
fn obtain_root<'t>(
    txn: &'t Transaction,
    sb_buf: &mut BufLock<'t>,
    slice: &TreeSlice,
) -> Result<BufLock<'t>> {
    let root_id = {
        let data = sb_buf.data();
        Superblock::from_bytes(&data)?.root_block()
    };

    if !root_id.is_none() {
        txn.buf(root_id)
    } else {
        let buf = txn.allocate_buf()?;
        {
            let mut data = buf.data_mut();
            LeafNodeMut::init(&mut data, wall_clock_secs())?;
        }
        install_root(buf.block_id(), sb_buf)?;
        slice.metrics.depth_inc();
        Ok(buf)
    }
}

/// Splits `buf` if it cannot take the pending insert. Leaves split against
/// the incoming value; internal nodes split proactively, so `new_value` is
/// `None` for them. On return the cursor follows the key into whichever
/// half owns it.
fn check_and_handle_split<'t>(
    txn: &'t Transaction,
    buf: &mut BufLock<'t>,
    last_buf: &mut BufLock<'t>,
    sb_buf: &mut BufLock<'t>,
    key: &[u8],
    new_value: Option<&Value>,
    slice: &TreeSlice,
) -> Result<()> {
    let full = {
        let data = buf.data();
        match node::kind(&data)? {
            NodeKind::Leaf => {
                let value = new_value.expect("leaf split check requires the incoming value");
                LeafNode::from_block(&data)?.is_full(key, value)
            }
            NodeKind::Internal => {
                assert!(new_value.is_none(), "proactive internal split takes no value");
                InternalNode::from_block(&data)?.is_full()
            }
            other => bail!("descended into a {:?} block", other),
        }
    };
    if !full {
        return Ok(());
    }

    let mut rbuf = txn.allocate_buf()?;
    let median: KeyBuf = {
        let mut src = buf.data_mut();
        let mut dst = rbuf.data_mut();
        node::split(&mut src, &mut dst)?
    };

    if !last_buf.is_acquired() {
        // The split subject was the root: make a new empty parent and
        // install it before inserting the separator.
        let mut parent = txn.allocate_buf()?;
        {
            let mut data = parent.data_mut();
            InternalNodeMut::init(&mut data)?;
        }
        last_buf.swap(&mut parent);
        install_root(last_buf.block_id(), sb_buf)?;
        slice.metrics.depth_inc();
    }

    let inserted = {
        let mut data = last_buf.data_mut();
        InternalNodeMut::from_block(&mut data)?.insert(&median, buf.block_id(), rbuf.block_id())?
    };
    assert!(
        inserted,
        "parent rejected a split separator despite proactive splitting"
    );

    // Keys equal to the median stay left.
    if key > &median[..] {
        buf.swap(&mut rbuf);
    }

    slice.metrics.splits_inc();
    trace!(node = %buf.block_id(), sibling = %rbuf.block_id(), "btree.split");
    Ok(())
}

/// Merges or levels `buf` with a sibling when it is underfull. A merge
/// that leaves the parent a singleton root retires that root.
fn check_and_handle_underfull<'t>(
    txn: &'t Transaction,
    buf: &mut BufLock<'t>,
    last_buf: &mut BufLock<'t>,
    sb_buf: &mut BufLock<'t>,
    key: &[u8],
    slice: &TreeSlice,
) -> Result<()> {
    if !last_buf.is_acquired() {
        // The root is never underfull.
        return Ok(());
    }
    {
        let data = buf.data();
        if !node::is_underfull(&data)? {
            return Ok(());
        }
    }

    let (sib_id, cmp) = {
        let parent = last_buf.data();
        InternalNode::from_block(&parent)?.sibling(key)?
    };
    let mut sib_buf = txn.buf(sib_id)?;

    #[cfg(debug_assertions)]
    {
        let data = sib_buf.data();
        node::validate(&data)?;
    }

    let left_id = match cmp {
        Ordering::Less => buf.block_id(),
        _ => sib_id,
    };
    let mergable = {
        let node_data = buf.data();
        let sib_data = sib_buf.data();
        let parent = last_buf.data();
        node::is_mergable(&node_data, &sib_data, &parent, left_id)?
    };

    if mergable {
        // Nodes merge in ascending key order, into the right one.
        let removed_sep: KeyBuf = if cmp == Ordering::Less {
            let sep = {
                let mut left = buf.data_mut();
                let mut right = sib_buf.data_mut();
                let parent = last_buf.data();
                node::merge(&mut left, &mut right, &parent, left_id)?
            };
            buf.mark_deleted();
            buf.swap(&mut sib_buf);
            sep
        } else {
            let sep = {
                let mut left = sib_buf.data_mut();
                let mut right = buf.data_mut();
                let parent = last_buf.data();
                node::merge(&mut left, &mut right, &parent, left_id)?
            };
            sib_buf.mark_deleted();
            sep
        };
        sib_buf.release();

        let singleton = {
            let parent = last_buf.data();
            InternalNode::from_block(&parent)?.is_singleton()
        };
        if !singleton {
            let mut parent = last_buf.data_mut();
            InternalNodeMut::from_block(&mut parent)?.remove(&removed_sep)?;
        } else {
            // The parent kept a single child: it is a useless root. The
            // merged node takes its place.
            last_buf.mark_deleted();
            install_root(buf.block_id(), sb_buf)?;
            slice.metrics.depth_dec();
            debug!(root = %buf.block_id(), "btree.root.collapse");
        }
        slice.metrics.merges_inc();
        trace!(node = %buf.block_id(), "btree.merge");
    } else {
        let leveled = {
            let mut node_data = buf.data_mut();
            let mut sib_data = sib_buf.data_mut();
            let parent = last_buf.data();
            node::level(
                &mut node_data,
                &mut sib_data,
                &parent,
                buf.block_id(),
                sib_id,
                cmp,
            )?
        };
        if let Some((to_replace, replacement)) = leveled {
            let mut parent = last_buf.data_mut();
            InternalNodeMut::from_block(&mut parent)?.update_key(&to_replace, &replacement)?;
            slice.metrics.levels_inc();
            trace!(node = %buf.block_id(), "btree.level");
        }
    }
    Ok(())
}

/// Runs one modify operation against the slice's tree.
pub(crate) fn run_modify<O: ModifyOperator>(
    slice: &TreeSlice,
    key: &[u8],
    oper: &mut O,
) -> Result<bool> {
    ensure!(!key.is_empty(), "empty key");
    ensure!(
        key.len() <= MAX_KEY_SIZE,
        "key of {} bytes exceeds the {} byte cap",
        key.len(),
        MAX_KEY_SIZE
    );

    // All slice operations are serialized; between suspension points the
    // walk has exclusive logical access to the tree.
    let _serial = slice.writer.lock();
    let txn = Transaction::begin_write(Arc::clone(&slice.cache));

    let update_needed = {
        let mut sb_buf = txn.buf(BlockId::SUPERBLOCK)?;
        let mut last_buf = txn.unacquired();
        let mut buf = obtain_root(&txn, &mut sb_buf, slice)?;

        // Descend to the leaf, maintaining structure on the way.
        loop {
            let at_internal = {
                let data = buf.data();
                node::is_internal(&data)?
            };
            if !at_internal {
                break;
            }

            check_and_handle_split(&txn, &mut buf, &mut last_buf, &mut sb_buf, key, None, slice)?;
            check_and_handle_underfull(&txn, &mut buf, &mut last_buf, &mut sb_buf, key, slice)?;

            // Past the root's children the root can no longer change, so
            // the superblock must not stay serialized on this walk.
            if sb_buf.is_acquired() && last_buf.is_acquired() {
                sb_buf.release();
            }

            let child_id = {
                let data = buf.data();
                InternalNode::from_block(&data)?.lookup(key)?
            };
            assert!(
                child_id != BlockId::NONE && child_id != BlockId::SUPERBLOCK,
                "internal lookup produced invalid child {}",
                child_id
            );

            let mut tmp = txn.buf(child_id)?;
            last_buf.swap(&mut tmp);
            buf.swap(&mut last_buf);
            // tmp now holds the former grandparent; dropping it releases.
        }

        let old_value = {
            let data = buf.data();
            LeafNode::from_block(&data)?.lookup(key)?
        };
        let mut key_found = old_value.is_some();

        // The operator decides how much of an old large value to load.
        let mut old_large = LargeValueHandle::unloaded();
        if let Some(value) = &old_value {
            if let Some(lref) = value.large_ref() {
                oper.acquire_large_value(&txn, &mut old_large, *lref)?;
                assert!(
                    old_large.is_loaded(),
                    "operator left the large-value handle unloaded"
                );
            }
        }

        let now = wall_clock_secs();
        let expired = key_found && old_value.as_ref().is_some_and(|v| v.expired(now));
        if expired {
            key_found = false;
        }

        let decision = oper.operate(
            &txn,
            if key_found { old_value.as_ref() } else { None },
            &old_large,
        )?;
        check_decision(&decision);

        // An expired value the operator left alone is silently deleted.
        let decision = if matches!(decision, Decision::Keep) && expired {
            Decision::Remove
        } else {
            decision
        };

        let update_needed = !matches!(decision, Decision::Keep);
        let new_large_root = match &decision {
            Decision::Write { value, .. } => value.large_ref().map(|lref| lref.root),
            _ => None,
        };

        match decision {
            Decision::Keep => {}
            Decision::Write { mut value, large } => {
                // Make room first; a delete never grows the leaf, so only
                // this path needs the split handler.
                check_and_handle_split(
                    &txn,
                    &mut buf,
                    &mut last_buf,
                    &mut sb_buf,
                    key,
                    Some(&value),
                    slice,
                )?;

                if value.has_cas() && !oper.cas_already_set() {
                    value.set_cas(slice.gen_cas());
                }

                let inserted = {
                    let mut data = buf.data_mut();
                    LeafNodeMut::from_block(&mut data)?.insert(key, &value, now)?
                };
                assert!(
                    inserted,
                    "leaf rejected an insert after the split handler ran"
                );
                // The leaf now references the new chain; the handle's work
                // is done.
                drop(large);
            }
            Decision::Remove => {
                if key_found || expired {
                    let mut data = buf.data_mut();
                    LeafNodeMut::from_block(&mut data)?.remove(key)?;
                }
                // Deleting an absent key touches nothing but still commits.
            }
        }

        if update_needed {
            check_and_handle_underfull(&txn, &mut buf, &mut last_buf, &mut sb_buf, key, slice)?;
        }

        sb_buf.release_if_acquired();
        assert!(buf.is_acquired(), "walk lost its leaf hold");
        buf.release();
        last_buf.release_if_acquired();

        // A replaced or deleted large value retires its chain; a kept one
        // (same root in the new value) survives.
        if update_needed && old_large.is_loaded() {
            let old_root = old_large.root_ref().map(|lref| lref.root);
            if new_large_root != old_root {
                old_large.mark_deleted(&txn)?;
            }
        }

        update_needed
    };

    slice.metrics.modifies_inc();
    trace!(update = update_needed, "btree.modify");
    txn.commit()?;
    Ok(update_needed)
}
