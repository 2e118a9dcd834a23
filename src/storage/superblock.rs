//! Superblock layout.
//!
//! Block 0 of every slice file starts with this 64-byte header. It records
//! the tree's root block id and the head of the free-block chain; the rest
//! of the block is reserved. The walk rewrites `root_block` through a write
//! view while a root may still be replaced, and the cache persists the free
//! chain head at commit.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{BlockId, RawBlockId};

pub const SUPERBLOCK_MAGIC: &[u8; 16] = b"burrow slice\x00\x00\x00\x00";

pub const SUPERBLOCK_HEADER_SIZE: usize = 64;

pub const CURRENT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Superblock {
    magic: [u8; 16],
    version: U32,
    block_size: U32,
    root_block: RawBlockId,
    free_head: RawBlockId,
    reserved: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<Superblock>() == SUPERBLOCK_HEADER_SIZE);

impl Superblock {
    pub fn new(block_size: u32) -> Self {
        Self {
            magic: *SUPERBLOCK_MAGIC,
            version: U32::new(CURRENT_VERSION),
            block_size: U32::new(block_size),
            root_block: BlockId::NONE.into(),
            free_head: BlockId::NONE.into(),
            reserved: [0u8; 32],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= SUPERBLOCK_HEADER_SIZE,
            "buffer too small for Superblock: {} < {}",
            bytes.len(),
            SUPERBLOCK_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..SUPERBLOCK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse Superblock: {:?}", e))?;

        ensure!(
            &header.magic == SUPERBLOCK_MAGIC,
            "invalid magic bytes in superblock"
        );

        ensure!(
            header.version.get() == CURRENT_VERSION,
            "unsupported slice version: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );

        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= SUPERBLOCK_HEADER_SIZE,
            "buffer too small for Superblock: {} < {}",
            bytes.len(),
            SUPERBLOCK_HEADER_SIZE
        );

        let header = Self::mut_from_bytes(&mut bytes[..SUPERBLOCK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse Superblock: {:?}", e))?;

        ensure!(
            &header.magic == SUPERBLOCK_MAGIC,
            "invalid magic bytes in superblock"
        );

        Ok(header)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    pub fn root_block(&self) -> BlockId {
        self.root_block.get()
    }

    pub fn set_root_block(&mut self, id: BlockId) {
        self.root_block.set(id);
    }

    pub fn free_head(&self) -> BlockId {
        self.free_head.get()
    }

    pub fn set_free_head(&mut self, id: BlockId) {
        self.free_head.set(id);
    }
}
