//! Leaf node layout.
//!
//! Leaves store the key/value cells. Each 8-byte slot carries a 4-byte key
//! prefix for early rejection plus the cell offset and key length; the cell
//! itself holds the key bytes, the insert timestamp, and the encoded value.
//!
//! ```text
//! Slot (8 bytes):
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |      prefix (4 bytes)             | offset (2B LE)  | key_len (2B LE) |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//!
//! Cell:
//! +------------------+----------------+------------------+
//! | key (key_len B)  | timestamp (4B) | encoded value    |
//! +------------------+----------------+------------------+
//! ```
//!
//! Deleted cells leave their bytes behind as fragmentation; inserts compact
//! the cell area when the contiguous window is too small but the total
//! (window plus fragments) suffices.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BLOCK_HEADER_SIZE, BLOCK_SIZE, LEAF_HEADER_SIZE, MAX_KEY_SIZE};
use crate::value::Value;

use super::{BlockHeader, NodeKind};

pub const LEAF_SLOT_SIZE: usize = 8;
pub const LEAF_CONTENT_START: usize = BLOCK_HEADER_SIZE + LEAF_HEADER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct LeafSlot {
    prefix: [u8; 4],
    offset: U16,
    key_len: U16,
}

impl LeafSlot {
    fn new(key: &[u8], offset: u16) -> Self {
        Self {
            prefix: extract_prefix(key),
            offset: U16::new(offset),
            key_len: U16::new(key.len() as u16),
        }
    }

    pub fn prefix_as_u32(&self) -> u32 {
        u32::from_be_bytes(self.prefix)
    }

    pub fn offset(&self) -> u16 {
        self.offset.get()
    }

    pub fn key_len(&self) -> u16 {
        self.key_len.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct LeafHeader {
    created_at: U32,
    reserved: U32,
}

const _: () = assert!(std::mem::size_of::<LeafHeader>() == LEAF_HEADER_SIZE);

pub fn extract_prefix(key: &[u8]) -> [u8; 4] {
    let mut prefix = [0u8; 4];
    let len = key.len().min(4);
    prefix[..len].copy_from_slice(&key[..len]);
    prefix
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

#[derive(Debug)]
pub struct LeafNode<'a> {
    data: &'a [u8],
}

pub struct LeafNodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> LeafNode<'a> {
    pub fn from_block(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == BLOCK_SIZE,
            "invalid block size: {} != {}",
            data.len(),
            BLOCK_SIZE
        );
        let header = BlockHeader::from_bytes(data)?;
        ensure!(
            header.kind() == NodeKind::Leaf,
            "expected leaf block, got {:?}",
            header.kind()
        );
        Ok(Self { data })
    }

    fn header(&self) -> &BlockHeader {
        BlockHeader::from_bytes(self.data).unwrap() // INVARIANT: block validated in from_block
    }

    pub fn cell_count(&self) -> u16 {
        self.header().cell_count()
    }

    pub fn free_space(&self) -> u16 {
        self.header().free_space()
    }

    pub fn frag_bytes(&self) -> u16 {
        self.header().frag_bytes()
    }

    pub fn created_at(&self) -> u32 {
        let offset = BLOCK_HEADER_SIZE;
        let header = LeafHeader::ref_from_bytes(&self.data[offset..offset + LEAF_HEADER_SIZE])
            .unwrap(); // INVARIANT: block validated in from_block
        header.created_at.get()
    }

    /// Slot bytes plus live cell bytes.
    pub fn used_space(&self) -> usize {
        let header = self.header();
        let slots = header.free_start() as usize - LEAF_CONTENT_START;
        let cells = BLOCK_SIZE - header.free_end() as usize - header.frag_bytes() as usize;
        slots + cells
    }

    fn slot_offset(index: usize) -> usize {
        LEAF_CONTENT_START + index * LEAF_SLOT_SIZE
    }

    pub fn slot_at(&self, index: usize) -> Result<LeafSlot> {
        ensure!(
            index < self.cell_count() as usize,
            "slot index {} out of bounds (cell_count={})",
            index,
            self.cell_count()
        );
        let offset = Self::slot_offset(index);
        LeafSlot::read_from_bytes(&self.data[offset..offset + LEAF_SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read leaf slot at index {}: {:?}", index, e))
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let cell_offset = slot.offset() as usize;
        let key_len = slot.key_len() as usize;

        ensure!(
            cell_offset + key_len <= BLOCK_SIZE,
            "key extends beyond block boundary: offset={}, key_len={}",
            cell_offset,
            key_len
        );

        Ok(&self.data[cell_offset..cell_offset + key_len])
    }

    pub fn timestamp_at(&self, index: usize) -> Result<u32> {
        let slot = self.slot_at(index)?;
        let ts_start = slot.offset() as usize + slot.key_len() as usize;
        ensure!(
            ts_start + 4 <= BLOCK_SIZE,
            "timestamp extends beyond block boundary"
        );
        Ok(u32::from_le_bytes(
            self.data[ts_start..ts_start + 4].try_into().unwrap(), // INVARIANT: bounds checked above
        ))
    }

    /// Encoded value bytes of the cell, exactly sized.
    pub fn value_bytes_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let value_start = slot.offset() as usize + slot.key_len() as usize + 4;
        ensure!(
            value_start < BLOCK_SIZE,
            "value offset beyond block: {}",
            value_start
        );
        let len = Value::measure(&self.data[value_start..])?;
        Ok(&self.data[value_start..value_start + len])
    }

    pub fn cell_len_at(&self, index: usize) -> Result<usize> {
        let slot = self.slot_at(index)?;
        Ok(slot.key_len() as usize + 4 + self.value_bytes_at(index)?.len())
    }

    pub fn find_key(&self, key: &[u8]) -> SearchResult {
        let target_prefix = u32::from_be_bytes(extract_prefix(key));
        let count = self.cell_count() as usize;

        for i in 0..count {
            let slot = match self.slot_at(i) {
                Ok(s) => s,
                Err(_) => return SearchResult::NotFound(i),
            };

            let slot_prefix = slot.prefix_as_u32();

            if slot_prefix > target_prefix {
                return SearchResult::NotFound(i);
            }

            if slot_prefix == target_prefix {
                let full_key = match self.key_at(i) {
                    Ok(k) => k,
                    Err(_) => return SearchResult::NotFound(i),
                };

                match full_key.cmp(key) {
                    std::cmp::Ordering::Equal => return SearchResult::Found(i),
                    std::cmp::Ordering::Greater => return SearchResult::NotFound(i),
                    std::cmp::Ordering::Less => continue,
                }
            }
        }

        SearchResult::NotFound(count)
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Value>> {
        match self.find_key(key) {
            SearchResult::Found(i) => {
                let (value, _) = Value::decode(self.value_bytes_at(i)?)?;
                Ok(Some(value))
            }
            SearchResult::NotFound(_) => Ok(None),
        }
    }

    /// Whether inserting (or replacing) `key` with `value` would not fit,
    /// even after compaction. The walk splits the leaf when this is true.
    pub fn is_full(&self, key: &[u8], value: &Value) -> bool {
        let cell_size = key.len() + 4 + value.encoded_len();
        let needed = cell_size + LEAF_SLOT_SIZE;

        let reclaim = match self.find_key(key) {
            SearchResult::Found(i) => match self.cell_len_at(i) {
                Ok(len) => len + LEAF_SLOT_SIZE,
                Err(_) => 0,
            },
            SearchResult::NotFound(_) => 0,
        };

        (self.free_space() as usize + self.frag_bytes() as usize + reclaim) < needed
    }
}

impl<'a> LeafNodeMut<'a> {
    pub fn from_block(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == BLOCK_SIZE,
            "invalid block size: {} != {}",
            data.len(),
            BLOCK_SIZE
        );
        let header = BlockHeader::from_bytes(data)?;
        ensure!(
            header.kind() == NodeKind::Leaf,
            "expected leaf block, got {:?}",
            header.kind()
        );
        Ok(Self { data })
    }

    /// Initializes an empty leaf stamped with its creation time.
    pub fn init(data: &'a mut [u8], created_at: u32) -> Result<Self> {
        ensure!(
            data.len() == BLOCK_SIZE,
            "invalid block size: {} != {}",
            data.len(),
            BLOCK_SIZE
        );

        {
            let header = BlockHeader::from_bytes_mut(data)?;
            header.set_kind(NodeKind::Leaf);
            header.set_cell_count(0);
            header.set_free_start(LEAF_CONTENT_START as u16);
            header.set_free_end(BLOCK_SIZE as u16);
            header.set_frag_bytes(0);
        }
        {
            let offset = BLOCK_HEADER_SIZE;
            let sub = LeafHeader::mut_from_bytes(&mut data[offset..offset + LEAF_HEADER_SIZE])
                .map_err(|e| eyre::eyre!("failed to write leaf header: {:?}", e))?;
            sub.created_at = U32::new(created_at);
            sub.reserved = U32::new(0);
        }

        Ok(Self { data })
    }

    pub fn as_read(&self) -> LeafNode<'_> {
        LeafNode { data: self.data }
    }

    pub fn cell_count(&self) -> u16 {
        self.as_read().cell_count()
    }

    fn header_mut(&mut self) -> &mut BlockHeader {
        BlockHeader::from_bytes_mut(self.data).unwrap() // INVARIANT: block validated in constructor
    }

    /// Inserts or replaces `key`. Returns false (leaving the leaf
    /// untouched) when the cell cannot fit even after compaction.
    pub fn insert(&mut self, key: &[u8], value: &Value, timestamp: u32) -> Result<bool> {
        let mut encoded = vec![0u8; value.encoded_len()];
        value.encode_into(&mut encoded);
        self.insert_raw(key, timestamp, &encoded)
    }

    /// Insert with a pre-encoded value; the staging path for split, merge,
    /// and level.
    pub(crate) fn insert_raw(
        &mut self,
        key: &[u8],
        timestamp: u32,
        value_bytes: &[u8],
    ) -> Result<bool> {
        ensure!(!key.is_empty(), "empty key");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key of {} bytes exceeds the {} byte cap",
            key.len(),
            MAX_KEY_SIZE
        );

        let cell_size = key.len() + 4 + value_bytes.len();
        let needed = cell_size + LEAF_SLOT_SIZE;

        let (pos, reclaim) = match self.as_read().find_key(key) {
            SearchResult::Found(i) => {
                let reclaim = self.as_read().cell_len_at(i)? + LEAF_SLOT_SIZE;
                (i, reclaim)
            }
            SearchResult::NotFound(i) => (i, 0),
        };

        let read = self.as_read();
        let avail = read.free_space() as usize + read.frag_bytes() as usize + reclaim;
        if avail < needed {
            return Ok(false);
        }

        if reclaim > 0 {
            self.delete_cell(pos)?;
        }

        if (self.as_read().free_space() as usize) < needed {
            self.compact()?;
        }

        let (free_start, free_end) = {
            let header = self.header_mut();
            (header.free_start() as usize, header.free_end() as usize)
        };
        debug_assert!(free_end - free_start >= needed);

        let cell_offset = free_end - cell_size;
        self.data[cell_offset..cell_offset + key.len()].copy_from_slice(key);
        let ts_start = cell_offset + key.len();
        self.data[ts_start..ts_start + 4].copy_from_slice(&timestamp.to_le_bytes());
        self.data[ts_start + 4..ts_start + 4 + value_bytes.len()].copy_from_slice(value_bytes);

        let count = self.cell_count() as usize;
        let slot_start = LeafNode::slot_offset(pos);
        let slot_end = LeafNode::slot_offset(count);
        self.data
            .copy_within(slot_start..slot_end, slot_start + LEAF_SLOT_SIZE);
        let slot = LeafSlot::new(key, cell_offset as u16);
        self.data[slot_start..slot_start + LEAF_SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_cell_count(count as u16 + 1);
        header.set_free_start((slot_end + LEAF_SLOT_SIZE) as u16);
        header.set_free_end(cell_offset as u16);

        Ok(true)
    }

    /// Removes `key`; the key must be present.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        match self.as_read().find_key(key) {
            SearchResult::Found(i) => self.delete_cell(i),
            SearchResult::NotFound(_) => bail!("key not found in leaf"),
        }
    }

    fn delete_cell(&mut self, index: usize) -> Result<()> {
        let cell_len = self.as_read().cell_len_at(index)?;
        let count = self.cell_count() as usize;

        let slot_start = LeafNode::slot_offset(index);
        let slot_end = LeafNode::slot_offset(count);
        self.data
            .copy_within(slot_start + LEAF_SLOT_SIZE..slot_end, slot_start);

        let header = self.header_mut();
        header.set_cell_count(count as u16 - 1);
        header.set_free_start((slot_end - LEAF_SLOT_SIZE) as u16);
        header.set_frag_bytes(header.frag_bytes() + cell_len as u16);

        Ok(())
    }

    /// Rewrites the cell area contiguously, reclaiming fragmentation.
    fn compact(&mut self) -> Result<()> {
        let count = self.cell_count() as usize;

        let mut cells: Vec<Vec<u8>> = Vec::with_capacity(count);
        for i in 0..count {
            let read = self.as_read();
            let slot = read.slot_at(i)?;
            let start = slot.offset() as usize;
            let len = read.cell_len_at(i)?;
            cells.push(self.data[start..start + len].to_vec());
        }

        let mut pos = BLOCK_SIZE;
        for (i, cell) in cells.iter().enumerate() {
            pos -= cell.len();
            self.data[pos..pos + cell.len()].copy_from_slice(cell);

            let slot_offset = LeafNode::slot_offset(i);
            let old = LeafSlot::read_from_bytes(
                &self.data[slot_offset..slot_offset + LEAF_SLOT_SIZE],
            )
            .map_err(|e| eyre::eyre!("failed to read leaf slot during compaction: {:?}", e))?;
            let updated = LeafSlot {
                prefix: old.prefix,
                offset: U16::new(pos as u16),
                key_len: old.key_len,
            };
            self.data[slot_offset..slot_offset + LEAF_SLOT_SIZE]
                .copy_from_slice(updated.as_bytes());
        }

        let header = self.header_mut();
        header.set_free_end(pos as u16);
        header.set_frag_bytes(0);

        Ok(())
    }
}
