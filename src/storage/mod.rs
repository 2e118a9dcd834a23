//! # Storage Module
//!
//! The block layer under the tree: a memory-mapped block file, a superblock
//! describing the slice, a pinned-buffer block cache with SIEVE eviction,
//! and the write transaction whose buffer locks the modify walk holds while
//! it descends.
//!
//! ## Architecture
//!
//! ```text
//! Transaction ──> BufLock (scoped exclusive hold on one block)
//!      │               │
//!      └──────> BufferCache (pinned buffers, free chain, eviction)
//!                       │
//!               MmapStorage (block file, flushed at commit)
//! ```
//!
//! All mutation flows through write views on acquired buffer locks; the
//! backing file only changes when a transaction commits, which flushes the
//! dirty buffers and syncs the map. Dropping a write transaction without
//! committing discards every dirtied buffer, so an aborted modify leaves
//! the on-disk tree exactly as it found it.
//!
//! ## Module Organization
//!
//! - `mmap`: low-level memory-mapped block file (`MmapStorage`)
//! - `superblock`: the fixed-id block recording the root and free chain
//! - `cache`: `BufferCache` with pin counts and free-chain allocation
//! - `txn`: `Transaction` and `BufLock`

mod cache;
mod mmap;
mod superblock;
mod txn;

pub use cache::BufferCache;
pub use mmap::MmapStorage;
pub use superblock::{Superblock, SUPERBLOCK_MAGIC};
pub use txn::{BufLock, Transaction};

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Identifier of a persistent block within a slice's block file.
///
/// Two values are distinguished: [`BlockId::SUPERBLOCK`] names the fixed
/// block holding the slice metadata, and [`BlockId::NONE`] is the absent
/// reference (an empty tree's root, the end of a chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const SUPERBLOCK: BlockId = BlockId(0);
    pub const NONE: BlockId = BlockId(u32::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Little-endian on-disk form of a block id, for zerocopy headers.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct RawBlockId(U32);

impl RawBlockId {
    pub fn get(self) -> BlockId {
        BlockId(self.0.get())
    }

    pub fn set(&mut self, id: BlockId) {
        self.0 = U32::new(id.0);
    }
}

impl From<BlockId> for RawBlockId {
    fn from(id: BlockId) -> Self {
        RawBlockId(U32::new(id.0))
    }
}
