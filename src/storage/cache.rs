//! # Buffer Cache
//!
//! Block buffers for one slice, adapted around a single-writer discipline:
//! every modify on a slice is serialized, so the cache keeps one shard and
//! spends its complexity on transactional behavior instead of lock
//! sharding.
//!
//! ## Eviction
//!
//! SIEVE replacement: each entry carries a `visited` flag set on access; a
//! hand scans for an unvisited entry to evict, clearing flags as it passes.
//! Frequently-touched blocks (the root, upper internal nodes) survive
//! scans of the leaf level. Only clean, unpinned, undeleted entries are
//! evictable; an over-capacity cache full of dirty or pinned buffers grows
//! past its target rather than flushing uncommitted data.
//!
//! ## Pin Protocol
//!
//! A [`super::BufLock`] pins its entry for as long as it is acquired, which
//! keeps the buffer resident while the walk holds it. `held_count` exposes
//! the total pin count; after a modify finishes it must be zero.
//!
//! ## Free Chain
//!
//! Deleted blocks are threaded onto a free chain at commit: each free block
//! stores the next free id in its header, and the superblock stores the
//! head. Allocation pops the chain before growing the file. The in-memory
//! head is only persisted at commit, so an aborted transaction's pops are
//! undone by re-reading the superblock.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::BLOCK_SIZE;
use crate::node::{BlockHeader, NodeKind};

use super::superblock::Superblock;
use super::{BlockId, MmapStorage};

pub(crate) struct BlockEntry {
    id: BlockId,
    pub(crate) data: RwLock<Box<[u8]>>,
    visited: AtomicBool,
    dirty: AtomicBool,
    deleted: AtomicBool,
    pins: AtomicU32,
}

impl BlockEntry {
    fn new(id: BlockId, data: Box<[u8]>) -> Self {
        Self {
            id,
            data: RwLock::new(data),
            visited: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    pub(crate) fn id(&self) -> BlockId {
        self.id
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned block");
    }

    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    fn clear_visited(&self) -> bool {
        self.visited.swap(false, Ordering::AcqRel)
    }
}

struct CacheShard {
    entries: Vec<Arc<BlockEntry>>,
    index: HashMap<BlockId, usize>,
    hand: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
        }
    }

    fn get(&self, id: BlockId) -> Option<&Arc<BlockEntry>> {
        self.index.get(&id).map(|&idx| &self.entries[idx])
    }

    fn insert(&mut self, entry: Arc<BlockEntry>) {
        let id = entry.id;
        let idx = self.entries.len();
        self.entries.push(entry);
        self.index.insert(id, idx);
    }

    fn remove_at(&mut self, idx: usize) -> Arc<BlockEntry> {
        let entry = self.entries.swap_remove(idx);
        self.index.remove(&entry.id);

        if idx < self.entries.len() {
            let moved_id = self.entries[idx].id;
            self.index.insert(moved_id, idx);
        }

        if self.hand >= self.entries.len() {
            self.hand = 0;
        }

        entry
    }

    /// SIEVE scan for a victim: clean, unpinned, undeleted, unvisited.
    fn evict_one(&mut self) -> Option<Arc<BlockEntry>> {
        if self.entries.is_empty() {
            return None;
        }

        let mut scanned = 0;
        // Two passes over the ring: the first may only clear visited flags.
        while scanned < self.entries.len() * 2 {
            let idx = self.hand;
            let entry = &self.entries[idx];
            self.hand = (self.hand + 1) % self.entries.len();
            scanned += 1;

            if entry.is_pinned() || entry.is_dirty() || entry.is_deleted() {
                continue;
            }
            if entry.clear_visited() {
                continue;
            }
            return Some(self.remove_at(idx));
        }

        None
    }
}

pub struct BufferCache {
    storage: Mutex<MmapStorage>,
    shard: RwLock<CacheShard>,
    free_head: Mutex<BlockId>,
    capacity: usize,
}

impl BufferCache {
    /// Creates a fresh slice file whose superblock records an empty tree.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "cache capacity must be at least 1");

        let mut storage = MmapStorage::create(path, 1)?;
        let sb = Superblock::new(BLOCK_SIZE as u32);
        {
            use zerocopy::IntoBytes;
            let block = storage.block_mut(0)?;
            block.fill(0);
            block[..std::mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
        }
        storage.sync()?;

        Ok(Self {
            storage: Mutex::new(storage),
            shard: RwLock::new(CacheShard::new(capacity)),
            free_head: Mutex::new(BlockId::NONE),
            capacity,
        })
    }

    /// Opens an existing slice file, validating the superblock.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "cache capacity must be at least 1");

        let storage = MmapStorage::open(path)?;
        let free_head = {
            let block = storage.block(0)?;
            let sb = Superblock::from_bytes(block)?;
            ensure!(
                sb.block_size() == BLOCK_SIZE as u32,
                "slice file block size {} does not match configured {}",
                sb.block_size(),
                BLOCK_SIZE
            );
            sb.free_head()
        };

        Ok(Self {
            storage: Mutex::new(storage),
            shard: RwLock::new(CacheShard::new(capacity)),
            free_head: Mutex::new(free_head),
            capacity,
        })
    }

    /// Get-or-load without pinning. Internal callers pin explicitly.
    fn entry(&self, id: BlockId) -> Result<Arc<BlockEntry>> {
        ensure!(!id.is_none(), "cannot load the none block");

        {
            let shard = self.shard.read();
            if let Some(entry) = shard.get(id) {
                entry.mark_visited();
                return Ok(Arc::clone(entry));
            }
        }

        let mut shard = self.shard.write();
        if let Some(entry) = shard.get(id) {
            entry.mark_visited();
            return Ok(Arc::clone(entry));
        }

        if shard.entries.len() >= self.capacity {
            shard.evict_one();
        }

        let mut buf = vec![0u8; BLOCK_SIZE].into_boxed_slice();
        {
            let storage = self.storage.lock();
            buf.copy_from_slice(storage.block(id.0)?);
        }

        let entry = Arc::new(BlockEntry::new(id, buf));
        entry.mark_visited();
        shard.insert(Arc::clone(&entry));
        Ok(entry)
    }

    /// Acquires the block for a transaction: loaded, resident, and pinned.
    pub(crate) fn acquire(&self, id: BlockId) -> Result<Arc<BlockEntry>> {
        let entry = self.entry(id)?;
        entry.pin();
        Ok(entry)
    }

    /// Allocates a fresh zeroed block, preferring the free chain over file
    /// growth. The returned entry is pinned and dirty.
    pub(crate) fn allocate(&self) -> Result<Arc<BlockEntry>> {
        let mut head = self.free_head.lock();

        let entry = if !head.is_none() {
            let entry = self.acquire(*head)?;
            let next = {
                let data = entry.data.read();
                let header = BlockHeader::from_bytes(&data)?;
                debug_assert_eq!(header.kind(), NodeKind::Free);
                header.right_child()
            };
            *head = next;
            entry.data.write().fill(0);
            entry
        } else {
            let id = {
                let mut storage = self.storage.lock();
                let id = BlockId(storage.block_count());
                storage.grow(id.0 + 1)?;
                id
            };

            let mut shard = self.shard.write();
            if shard.entries.len() >= self.capacity {
                shard.evict_one();
            }
            let entry = Arc::new(BlockEntry::new(id, vec![0u8; BLOCK_SIZE].into_boxed_slice()));
            entry.mark_visited();
            entry.pin();
            shard.insert(Arc::clone(&entry));
            entry
        };

        entry.mark_dirty();
        Ok(entry)
    }

    /// Commits one write transaction: threads deleted blocks onto the free
    /// chain, persists the chain head, flushes every dirty buffer, and
    /// syncs the file.
    pub(crate) fn commit(&self) -> Result<()> {
        let deleted: Vec<Arc<BlockEntry>> = {
            let shard = self.shard.read();
            shard
                .entries
                .iter()
                .filter(|e| e.is_deleted())
                .cloned()
                .collect()
        };

        {
            let mut head = self.free_head.lock();
            for entry in &deleted {
                assert!(!entry.is_pinned(), "deleted block {} still held at commit", entry.id);
                {
                    let mut data = entry.data.write();
                    data.fill(0);
                    BlockHeader::init_free(&mut data, *head)?;
                }
                entry.deleted.store(false, Ordering::Release);
                entry.mark_dirty();
                *head = entry.id;
            }
        }

        let head = *self.free_head.lock();
        let sb = self.entry(BlockId::SUPERBLOCK)?;
        {
            let mut data = sb.data.write();
            let parsed = Superblock::from_bytes_mut(&mut data)?;
            if parsed.free_head() != head {
                parsed.set_free_head(head);
                sb.mark_dirty();
            }
        }

        let entries: Vec<Arc<BlockEntry>> = {
            let shard = self.shard.read();
            shard.entries.clone()
        };

        let mut storage = self.storage.lock();
        for entry in entries {
            if entry.is_dirty() {
                let data = entry.data.read();
                storage.block_mut(entry.id.0)?.copy_from_slice(&data);
                entry.dirty.store(false, Ordering::Release);
            }
        }
        storage.sync()?;

        Ok(())
    }

    /// Discards an uncommitted write transaction: every dirtied or deleted
    /// buffer is dropped so the next acquisition re-reads the committed
    /// bytes, and the free chain head is re-read from disk.
    pub(crate) fn discard(&self) {
        let mut shard = self.shard.write();

        let mut idx = 0;
        while idx < shard.entries.len() {
            let entry = &shard.entries[idx];
            if entry.is_dirty() || entry.is_deleted() {
                assert!(
                    !entry.is_pinned(),
                    "block {} still held while discarding its transaction",
                    entry.id
                );
                shard.remove_at(idx);
            } else {
                idx += 1;
            }
        }
        drop(shard);

        let storage = self.storage.lock();
        let head = storage
            .block(0)
            .ok()
            .and_then(|block| Superblock::from_bytes(block).ok().map(|sb| sb.free_head()))
            .unwrap_or(BlockId::NONE);
        *self.free_head.lock() = head;
    }

    /// Total pins across all resident buffers.
    pub fn held_count(&self) -> usize {
        let shard = self.shard.read();
        shard
            .entries
            .iter()
            .map(|e| e.pins.load(Ordering::Acquire) as usize)
            .sum()
    }

    pub fn block_count(&self) -> u32 {
        self.storage.lock().block_count()
    }

    pub fn resident(&self) -> usize {
        self.shard.read().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh_cache(capacity: usize) -> (tempfile::TempDir, BufferCache) {
        let dir = tempdir().unwrap();
        let cache = BufferCache::create(dir.path().join("slice.bt"), capacity).unwrap();
        (dir, cache)
    }

    #[test]
    fn create_initializes_superblock() {
        let (_dir, cache) = fresh_cache(16);
        let entry = cache.acquire(BlockId::SUPERBLOCK).unwrap();
        {
            let data = entry.data.read();
            let sb = Superblock::from_bytes(&data).unwrap();
            assert!(sb.root_block().is_none());
        }
        entry.unpin();
    }

    #[test]
    fn allocate_grows_file() {
        let (_dir, cache) = fresh_cache(16);
        assert_eq!(cache.block_count(), 1);

        let entry = cache.allocate().unwrap();
        assert_eq!(entry.id(), BlockId(1));
        assert_eq!(cache.block_count(), 2);
        entry.unpin();
    }

    #[test]
    fn dirty_block_persists_across_commit_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slice.bt");
        {
            let cache = BufferCache::create(&path, 16).unwrap();
            let entry = cache.allocate().unwrap();
            entry.data.write()[100] = 42;
            entry.unpin();
            cache.commit().unwrap();
        }

        let cache = BufferCache::open(&path, 16).unwrap();
        let entry = cache.acquire(BlockId(1)).unwrap();
        assert_eq!(entry.data.read()[100], 42);
        entry.unpin();
    }

    #[test]
    fn discard_drops_uncommitted_writes() {
        let (_dir, cache) = fresh_cache(16);
        let entry = cache.allocate().unwrap();
        let id = entry.id();
        entry.data.write()[0] = 0xFF;
        entry.unpin();
        cache.commit().unwrap();

        let entry = cache.acquire(id).unwrap();
        entry.data.write()[0] = 0xAA;
        entry.mark_dirty();
        entry.unpin();
        cache.discard();

        let entry = cache.acquire(id).unwrap();
        assert_eq!(entry.data.read()[0], 0xFF);
        entry.unpin();
    }

    #[test]
    fn deleted_block_is_reused_after_commit() {
        let (_dir, cache) = fresh_cache(16);
        let entry = cache.allocate().unwrap();
        let freed = entry.id();
        entry.unpin();
        cache.commit().unwrap();

        let entry = cache.acquire(freed).unwrap();
        entry.mark_deleted();
        entry.unpin();
        cache.commit().unwrap();

        let entry = cache.allocate().unwrap();
        assert_eq!(entry.id(), freed, "allocation should pop the free chain");
        assert_eq!(cache.block_count(), 2);
        entry.unpin();
    }

    #[test]
    fn held_count_tracks_pins() {
        let (_dir, cache) = fresh_cache(16);
        assert_eq!(cache.held_count(), 0);

        let a = cache.allocate().unwrap();
        let b = cache.acquire(BlockId::SUPERBLOCK).unwrap();
        assert_eq!(cache.held_count(), 2);

        a.unpin();
        b.unpin();
        assert_eq!(cache.held_count(), 0);
    }

    #[test]
    fn eviction_respects_capacity_for_clean_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slice.bt");

        let mut ids = Vec::new();
        {
            let cache = BufferCache::create(&path, 16).unwrap();
            for _ in 0..8 {
                let entry = cache.allocate().unwrap();
                ids.push(entry.id());
                entry.unpin();
            }
            cache.commit().unwrap();
        }

        // Re-read every block through a small cache; misses must evict
        // rather than grow the shard.
        let cache = BufferCache::open(&path, 4).unwrap();
        for id in ids {
            let entry = cache.acquire(id).unwrap();
            entry.unpin();
        }
        assert!(cache.resident() <= 4);
    }
}
