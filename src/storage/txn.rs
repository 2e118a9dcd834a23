//! Transactions and buffer locks.
//!
//! A [`Transaction`] is the unit of atomic commit for one modify: every
//! block it touches is dirtied in the cache only, and `commit` flushes them
//! together. Dropping a write transaction without committing discards all
//! of its buffered writes.
//!
//! A [`BufLock`] is a scoped exclusive hold on one cached block. It is
//! either unacquired or acquired; the hold drops on `release` or scope
//! exit. The walk moves holds between its cursor slots with `swap`, which
//! preserves the exactly-one-owner invariant on every lock.

use std::cell::Cell;
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLockReadGuard, RwLockWriteGuard};

use super::cache::{BlockEntry, BufferCache};
use super::BlockId;

pub struct Transaction {
    cache: Arc<BufferCache>,
    write: bool,
    committed: Cell<bool>,
}

impl Transaction {
    /// Begins a write transaction; the caller must either `commit` it or
    /// accept that dropping it abandons every buffered write.
    pub fn begin_write(cache: Arc<BufferCache>) -> Self {
        Self {
            cache,
            write: true,
            committed: Cell::new(false),
        }
    }

    /// Begins a read transaction. Nothing to commit, nothing to discard.
    pub fn begin_read(cache: Arc<BufferCache>) -> Self {
        Self {
            cache,
            write: false,
            committed: Cell::new(true),
        }
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Acquires block `id` into a new buffer lock.
    pub fn buf(&self, id: BlockId) -> Result<BufLock<'_>> {
        let entry = self.cache.acquire(id)?;
        Ok(BufLock {
            txn: self,
            entry: Some(entry),
        })
    }

    /// Allocates a fresh zeroed block, acquired for writing.
    pub fn allocate_buf(&self) -> Result<BufLock<'_>> {
        ensure!(self.write, "cannot allocate blocks in a read transaction");
        let entry = self.cache.allocate()?;
        Ok(BufLock {
            txn: self,
            entry: Some(entry),
        })
    }

    /// An empty cursor slot, ready to be swapped with an acquired lock.
    pub fn unacquired(&self) -> BufLock<'_> {
        BufLock {
            txn: self,
            entry: None,
        }
    }

    /// Commits the transaction: flushes dirty buffers, frees deleted
    /// blocks, and syncs the file. All buffer locks must be dropped first
    /// (the borrow on `self` enforces it).
    pub fn commit(self) -> Result<()> {
        if self.write {
            self.cache.commit()?;
        }
        self.committed.set(true);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.write && !self.committed.get() {
            self.cache.discard();
        }
    }
}

pub struct BufLock<'t> {
    txn: &'t Transaction,
    entry: Option<Arc<BlockEntry>>,
}

impl<'t> BufLock<'t> {
    pub fn is_acquired(&self) -> bool {
        self.entry.is_some()
    }

    pub fn block_id(&self) -> BlockId {
        self.entry
            .as_ref()
            .expect("buffer lock not acquired") // INVARIANT: callers check is_acquired first
            .id()
    }

    /// Read view of the block bytes.
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        let entry = self.entry.as_ref().expect("buffer lock not acquired");
        RwLockReadGuard::map(entry.data.read(), |b| &b[..])
    }

    /// Write view of the block bytes; obtaining it dirties the block.
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        assert!(
            self.txn.is_write(),
            "write view requires a write transaction"
        );
        let entry = self.entry.as_ref().expect("buffer lock not acquired");
        entry.mark_dirty();
        RwLockWriteGuard::map(entry.data.write(), |b| &mut b[..])
    }

    /// Marks the block for deletion at commit. The hold stays acquired.
    pub fn mark_deleted(&self) {
        assert!(
            self.txn.is_write(),
            "deletion requires a write transaction"
        );
        let entry = self.entry.as_ref().expect("buffer lock not acquired");
        entry.mark_deleted();
    }

    pub fn release(&mut self) {
        let entry = self.entry.take().expect("releasing an unacquired buffer lock");
        entry.unpin();
    }

    pub fn release_if_acquired(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.unpin();
        }
    }

    /// Exchanges the holds of two cursor slots.
    pub fn swap(&mut self, other: &mut BufLock<'t>) {
        std::mem::swap(&mut self.entry, &mut other.entry);
    }
}

impl Drop for BufLock<'_> {
    fn drop(&mut self) {
        self.release_if_acquired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh_cache() -> (tempfile::TempDir, Arc<BufferCache>) {
        let dir = tempdir().unwrap();
        let cache = BufferCache::create(dir.path().join("slice.bt"), 16).unwrap();
        (dir, Arc::new(cache))
    }

    #[test]
    fn buf_lock_lifecycle() {
        let (_dir, cache) = fresh_cache();
        let txn = Transaction::begin_write(Arc::clone(&cache));

        let mut buf = txn.buf(BlockId::SUPERBLOCK).unwrap();
        assert!(buf.is_acquired());
        assert_eq!(buf.block_id(), BlockId::SUPERBLOCK);
        assert_eq!(cache.held_count(), 1);

        buf.release();
        assert!(!buf.is_acquired());
        assert_eq!(cache.held_count(), 0);
    }

    #[test]
    fn swap_transfers_the_hold() {
        let (_dir, cache) = fresh_cache();
        let txn = Transaction::begin_write(Arc::clone(&cache));

        let mut a = txn.buf(BlockId::SUPERBLOCK).unwrap();
        let mut b = txn.unacquired();

        a.swap(&mut b);
        assert!(!a.is_acquired());
        assert!(b.is_acquired());
        assert_eq!(cache.held_count(), 1);

        drop(a);
        drop(b);
        assert_eq!(cache.held_count(), 0);
    }

    #[test]
    fn commit_persists_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slice.bt");
        let cache = Arc::new(BufferCache::create(&path, 16).unwrap());

        let allocated = {
            let txn = Transaction::begin_write(Arc::clone(&cache));
            let buf = txn.allocate_buf().unwrap();
            let id = buf.block_id();
            buf.data_mut()[99] = 5;
            drop(buf);
            txn.commit().unwrap();
            id
        };

        let reopened = Arc::new(BufferCache::open(&path, 16).unwrap());
        let txn = Transaction::begin_read(reopened);
        let buf = txn.buf(allocated).unwrap();
        assert_eq!(buf.data()[99], 5);
    }

    #[test]
    fn dropping_uncommitted_transaction_discards_writes() {
        let (_dir, cache) = fresh_cache();

        let id = {
            let txn = Transaction::begin_write(Arc::clone(&cache));
            let buf = txn.allocate_buf().unwrap();
            let id = buf.block_id();
            drop(buf);
            txn.commit().unwrap();
            id
        };

        {
            let txn = Transaction::begin_write(Arc::clone(&cache));
            let buf = txn.buf(id).unwrap();
            buf.data_mut()[0] = 0xEE;
            drop(buf);
            // no commit
        }

        let txn = Transaction::begin_read(Arc::clone(&cache));
        let buf = txn.buf(id).unwrap();
        assert_eq!(buf.data()[0], 0);
    }

    #[test]
    fn read_transaction_cannot_allocate() {
        let (_dir, cache) = fresh_cache();
        let txn = Transaction::begin_read(cache);
        assert!(txn.allocate_buf().is_err());
    }

    #[test]
    #[should_panic(expected = "write view requires a write transaction")]
    fn read_transaction_cannot_take_write_view() {
        let (_dir, cache) = fresh_cache();
        let txn = Transaction::begin_read(cache);
        let buf = txn.buf(BlockId::SUPERBLOCK).unwrap();
        let _ = buf.data_mut();
    }
}
