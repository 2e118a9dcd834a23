//! # Tree Slice
//!
//! A [`TreeSlice`] is one shard of the key space: a block file, its buffer
//! cache, a CAS generator, and structural metrics. All operations on a
//! slice execute serially under its writer lock, which stands in for the
//! home-thread pinning of a cooperative scheduler: taking the lock is the
//! migration in, releasing it on scope exit is the migration back, and
//! between those points a modify has exclusive logical access to the
//! slice's tree.
//!
//! The write path is the modify walk in [`modify`]; the decision seam is
//! the [`operator::ModifyOperator`] trait. `put`/`delete` are thin
//! conveniences over built-in operators, and `get` is a read-only descent.

pub mod modify;
pub mod operator;

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::config::{DEFAULT_CACHE_CAPACITY, MAX_KEY_SIZE};
use crate::largeval;
use crate::node::{self, InternalNode, LeafNode};
use crate::storage::{BlockId, BufferCache, Superblock, Transaction};

use operator::{DeleteOperator, ModifyOperator, SetOperator};

/// Wall-clock seconds; leaf timestamps and expiry checks share this clock.
pub(crate) fn wall_clock_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[derive(Default)]
pub(crate) struct TreeMetrics {
    depth: AtomicU32,
    splits: AtomicU64,
    merges: AtomicU64,
    levels: AtomicU64,
    modifies: AtomicU64,
}

impl TreeMetrics {
    pub(crate) fn depth_inc(&self) {
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn depth_dec(&self) {
        let prev = self.depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "tree depth went negative");
    }

    fn set_depth(&self, depth: u32) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    pub(crate) fn splits_inc(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn merges_inc(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn levels_inc(&self) {
        self.levels.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn modifies_inc(&self) {
        self.modifies.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TreeMetricsSnapshot {
        TreeMetricsSnapshot {
            depth: self.depth.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            levels: self.levels.load(Ordering::Relaxed),
            modifies: self.modifies.load(Ordering::Relaxed),
        }
    }
}

/// Structural counters of one slice.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeMetricsSnapshot {
    pub depth: u32,
    pub splits: u64,
    pub merges: u64,
    pub levels: u64,
    pub modifies: u64,
}

#[derive(Debug, Clone)]
pub struct SliceOptions {
    pub cache_capacity: usize,
}

impl Default for SliceOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

pub struct TreeSlice {
    pub(crate) cache: Arc<BufferCache>,
    pub(crate) writer: Mutex<()>,
    pub(crate) metrics: TreeMetrics,
    cas_source: AtomicU64,
}

impl TreeSlice {
    /// Creates a fresh slice file holding an empty tree.
    pub fn create<P: AsRef<Path>>(path: P, options: SliceOptions) -> Result<Self> {
        let cache = Arc::new(BufferCache::create(path, options.cache_capacity)?);
        Ok(Self {
            cache,
            writer: Mutex::new(()),
            metrics: TreeMetrics::default(),
            cas_source: AtomicU64::new((wall_clock_secs() as u64) << 32),
        })
    }

    /// Opens an existing slice file and re-measures the tree depth.
    pub fn open<P: AsRef<Path>>(path: P, options: SliceOptions) -> Result<Self> {
        let cache = Arc::new(BufferCache::open(path, options.cache_capacity)?);
        let slice = Self {
            cache,
            writer: Mutex::new(()),
            metrics: TreeMetrics::default(),
            cas_source: AtomicU64::new((wall_clock_secs() as u64) << 32),
        };
        let depth = slice.measure_depth()?;
        slice.metrics.set_depth(depth);
        Ok(slice)
    }

    /// Runs one modify for `key` through `operator`. Returns whether the
    /// tree changed (the operator's refusal of an expired value still
    /// counts: the key is silently deleted).
    pub fn modify<O: ModifyOperator>(&self, key: &[u8], operator: &mut O) -> Result<bool> {
        modify::run_modify(self, key, operator)
    }

    /// Unconditional upsert.
    pub fn put(&self, key: &[u8], bytes: &[u8]) -> Result<()> {
        let mut operator = SetOperator::new(bytes);
        self.modify(key, &mut operator)?;
        Ok(())
    }

    /// Upsert with an expiration time (wall-clock seconds, zero = never)
    /// and optionally a CAS tag assigned by the slice.
    pub fn put_with(
        &self,
        key: &[u8],
        bytes: &[u8],
        exptime: Option<u32>,
        request_cas: bool,
    ) -> Result<()> {
        let mut operator = SetOperator::new(bytes);
        if let Some(exptime) = exptime {
            operator = operator.with_exptime(exptime);
        }
        if request_cas {
            operator = operator.with_cas();
        }
        self.modify(key, &mut operator)?;
        Ok(())
    }

    /// Deletes `key`; returns whether it was present (an expired value
    /// counts as absent, though it is removed either way).
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut operator = DeleteOperator::default();
        self.modify(key, &mut operator)?;
        Ok(operator.found)
    }

    /// Point read. Expired values read as absent; large values are loaded
    /// and their checksum verified.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        ensure!(!key.is_empty(), "empty key");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key of {} bytes exceeds the {} byte cap",
            key.len(),
            MAX_KEY_SIZE
        );

        let _serial = self.writer.lock();
        let txn = Transaction::begin_read(Arc::clone(&self.cache));

        let root_id = {
            let sb_buf = txn.buf(BlockId::SUPERBLOCK)?;
            let data = sb_buf.data();
            Superblock::from_bytes(&data)?.root_block()
        };
        if root_id.is_none() {
            return Ok(None);
        }

        let mut buf = txn.buf(root_id)?;
        loop {
            let child_id = {
                let data = buf.data();
                if node::is_leaf(&data)? {
                    None
                } else {
                    Some(InternalNode::from_block(&data)?.lookup(key)?)
                }
            };
            match child_id {
                Some(id) => buf = txn.buf(id)?,
                None => break,
            }
        }

        let value = {
            let data = buf.data();
            LeafNode::from_block(&data)?.lookup(key)?
        };
        drop(buf);

        match value {
            None => Ok(None),
            Some(value) if value.expired(wall_clock_secs()) => Ok(None),
            Some(value) => match value.large_ref() {
                Some(lref) => Ok(Some(largeval::load_chain(&txn, lref)?)),
                None => Ok(Some(
                    value
                        .inline_bytes()
                        .expect("non-large value is inline") // INVARIANT: payload matches the large flag
                        .to_vec(),
                )),
            },
        }
    }

    /// Next CAS tag; strictly increasing for the life of the slice.
    pub fn gen_cas(&self) -> u64 {
        self.cas_source.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The most recently generated CAS tag.
    pub fn last_cas(&self) -> u64 {
        self.cas_source.load(Ordering::Relaxed)
    }

    /// Node levels from root to leaf inclusive; zero for an empty tree.
    pub fn depth(&self) -> u32 {
        self.metrics.snapshot().depth
    }

    pub fn metrics(&self) -> TreeMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Buffer locks currently held on the slice's cache.
    pub fn held_count(&self) -> usize {
        self.cache.held_count()
    }

    pub fn block_count(&self) -> u32 {
        self.cache.block_count()
    }

    /// The slice's buffer cache, for running transactions outside the
    /// built-in walks (inspection, tooling, tests).
    pub fn cache_handle(&self) -> Arc<BufferCache> {
        Arc::clone(&self.cache)
    }

    /// Walks the leftmost path counting node levels.
    fn measure_depth(&self) -> Result<u32> {
        let txn = Transaction::begin_read(Arc::clone(&self.cache));

        let root_id = {
            let sb_buf = txn.buf(BlockId::SUPERBLOCK)?;
            let data = sb_buf.data();
            Superblock::from_bytes(&data)?.root_block()
        };
        if root_id.is_none() {
            return Ok(0);
        }

        let mut depth = 1u32;
        let mut buf = txn.buf(root_id)?;
        loop {
            let child_id = {
                let data = buf.data();
                if node::is_leaf(&data)? {
                    None
                } else {
                    Some(InternalNode::from_block(&data)?.child_at(0)?)
                }
            };
            match child_id {
                Some(id) => {
                    depth += 1;
                    buf = txn.buf(id)?;
                }
                None => break,
            }
        }
        Ok(depth)
    }
}
