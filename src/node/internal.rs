//! Internal node layout.
//!
//! Internal nodes hold separator keys and child block ids. Each 12-byte
//! slot stores a 4-byte key prefix, the left child of its separator, and
//! the offset/length of the full key in the cell area; the rightmost child
//! lives in the block header.
//!
//! ```text
//! InternalSlot (12 bytes):
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |      prefix (4 bytes)             |        child (4 bytes LE)         |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |  offset (2B LE) | key_len (2B LE) |
//! +--------+--------+--------+--------+
//! ```
//!
//! Navigation: a key routes to the first slot whose separator is greater
//! than or equal to it; keys greater than every separator route to the
//! header's right child. Equality descends left, which is also the split
//! handler's tie-break.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BLOCK_HEADER_SIZE, BLOCK_SIZE, MAX_KEY_SIZE};
use crate::storage::{BlockId, RawBlockId};

use super::leaf::extract_prefix;
use super::{BlockHeader, NodeKind};

pub const INTERNAL_SLOT_SIZE: usize = 12;
pub const INTERNAL_CONTENT_START: usize = BLOCK_HEADER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct InternalSlot {
    prefix: [u8; 4],
    child: RawBlockId,
    offset: U16,
    key_len: U16,
}

impl InternalSlot {
    fn new(key: &[u8], child: BlockId, offset: u16) -> Self {
        Self {
            prefix: extract_prefix(key),
            child: child.into(),
            offset: U16::new(offset),
            key_len: U16::new(key.len() as u16),
        }
    }

    pub fn prefix_as_u32(&self) -> u32 {
        u32::from_be_bytes(self.prefix)
    }

    pub fn child(&self) -> BlockId {
        self.child.get()
    }

    pub fn offset(&self) -> u16 {
        self.offset.get()
    }

    pub fn key_len(&self) -> u16 {
        self.key_len.get()
    }
}

#[derive(Debug)]
pub struct InternalNode<'a> {
    data: &'a [u8],
}

pub struct InternalNodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> InternalNode<'a> {
    pub fn from_block(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == BLOCK_SIZE,
            "invalid block size: {} != {}",
            data.len(),
            BLOCK_SIZE
        );
        let header = BlockHeader::from_bytes(data)?;
        ensure!(
            header.kind() == NodeKind::Internal,
            "expected internal block, got {:?}",
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

    pub fn right_child(&self) -> BlockId {
        self.header().right_child()
    }

    pub fn free_space(&self) -> u16 {
        self.header().free_space()
    }

    pub fn frag_bytes(&self) -> u16 {
        self.header().frag_bytes()
    }

    pub fn used_space(&self) -> usize {
        let header = self.header();
        let slots = header.free_start() as usize - INTERNAL_CONTENT_START;
        let cells = BLOCK_SIZE - header.free_end() as usize - header.frag_bytes() as usize;
        slots + cells
    }

    fn slot_offset(index: usize) -> usize {
        INTERNAL_CONTENT_START + index * INTERNAL_SLOT_SIZE
    }

    pub fn slot_at(&self, index: usize) -> Result<InternalSlot> {
        ensure!(
            index < self.cell_count() as usize,
            "slot index {} out of bounds (cell_count={})",
            index,
            self.cell_count()
        );
        let offset = Self::slot_offset(index);
        InternalSlot::read_from_bytes(&self.data[offset..offset + INTERNAL_SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read internal slot at index {}: {:?}", index, e))
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let cell_offset = slot.offset() as usize;
        let key_len = slot.key_len() as usize;

        ensure!(
            cell_offset + key_len <= BLOCK_SIZE,
            "separator extends beyond block boundary: offset={}, key_len={}",
            cell_offset,
            key_len
        );

        Ok(&self.data[cell_offset..cell_offset + key_len])
    }

    /// Child at position `index`, where position `cell_count` is the
    /// rightmost child.
    pub fn child_at(&self, index: usize) -> Result<BlockId> {
        let count = self.cell_count() as usize;
        if index < count {
            Ok(self.slot_at(index)?.child())
        } else if index == count {
            Ok(self.right_child())
        } else {
            bail!("child index {} out of bounds (cell_count={})", index, count)
        }
    }

    /// Index of the child a descent for `key` follows. Equality with a
    /// separator routes to its left child.
    fn child_index(&self, key: &[u8]) -> Result<usize> {
        let count = self.cell_count() as usize;
        let key_prefix = u32::from_be_bytes(extract_prefix(key));

        let mut left = 0usize;
        let mut right = count;
        while left < right {
            let mid = left + (right - left) / 2;
            let slot = self.slot_at(mid)?;

            let go_left = match key_prefix.cmp(&slot.prefix_as_u32()) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => key <= self.key_at(mid)?,
            };

            if go_left {
                right = mid;
            } else {
                left = mid + 1;
            }
        }
        Ok(left)
    }

    pub fn lookup(&self, key: &[u8]) -> Result<BlockId> {
        ensure!(
            self.cell_count() > 0,
            "lookup in internal node without separators"
        );
        let idx = self.child_index(key)?;
        self.child_at(idx)
    }

    /// Sibling of the child holding `key`, preferring the right neighbor.
    /// `Less` means the key's child precedes the sibling in key order.
    pub fn sibling(&self, key: &[u8]) -> Result<(BlockId, Ordering)> {
        let count = self.cell_count() as usize;
        ensure!(count > 0, "sibling in internal node without separators");

        let idx = self.child_index(key)?;
        if idx < count {
            Ok((self.child_at(idx + 1)?, Ordering::Less))
        } else {
            Ok((self.child_at(idx - 1)?, Ordering::Greater))
        }
    }

    /// The separator whose left child is `child_id`, if any. The rightmost
    /// child has no separator of its own.
    pub fn separator_for_child(&self, child_id: BlockId) -> Result<Option<(usize, &'a [u8])>> {
        for i in 0..self.cell_count() as usize {
            if self.slot_at(i)?.child() == child_id {
                return Ok(Some((i, self.key_at(i)?)));
            }
        }
        Ok(None)
    }

    fn separator_index(&self, key: &[u8]) -> Result<Option<usize>> {
        let count = self.cell_count() as usize;
        let mut left = 0usize;
        let mut right = count;
        while left < right {
            let mid = left + (right - left) / 2;
            if self.key_at(mid)? < key {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        if left < count && self.key_at(left)? == key {
            Ok(Some(left))
        } else {
            Ok(None)
        }
    }

    /// A singleton parent has one separator, which means exactly two
    /// children; removing the separator after a merge of those children
    /// would leave a useless root.
    pub fn is_singleton(&self) -> bool {
        self.cell_count() == 1
    }

    /// Internal nodes are full when they can no longer promise room for
    /// one maximum-size separator; the walk splits them proactively on the
    /// way down.
    pub fn is_full(&self) -> bool {
        (self.free_space() as usize + self.frag_bytes() as usize)
            < INTERNAL_SLOT_SIZE + MAX_KEY_SIZE
    }
}

impl<'a> InternalNodeMut<'a> {
    pub fn from_block(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == BLOCK_SIZE,
            "invalid block size: {} != {}",
            data.len(),
            BLOCK_SIZE
        );
        let header = BlockHeader::from_bytes(data)?;
        ensure!(
            header.kind() == NodeKind::Internal,
            "expected internal block, got {:?}",
            header.kind()
        );
        Ok(Self { data })
    }

    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == BLOCK_SIZE,
            "invalid block size: {} != {}",
            data.len(),
            BLOCK_SIZE
        );

        let header = BlockHeader::from_bytes_mut(data)?;
        header.set_kind(NodeKind::Internal);
        header.set_cell_count(0);
        header.set_free_start(INTERNAL_CONTENT_START as u16);
        header.set_free_end(BLOCK_SIZE as u16);
        header.set_frag_bytes(0);
        header.set_right_child(BlockId::NONE);

        Ok(Self { data })
    }

    pub fn as_read(&self) -> InternalNode<'_> {
        InternalNode { data: self.data }
    }

    pub fn cell_count(&self) -> u16 {
        self.as_read().cell_count()
    }

    fn header_mut(&mut self) -> &mut BlockHeader {
        BlockHeader::from_bytes_mut(self.data).unwrap() // INVARIANT: block validated in constructor
    }

    pub fn set_right_child(&mut self, id: BlockId) {
        self.header_mut().set_right_child(id);
    }

    /// Inserts `sep` between the split halves `left_id` and `right_id`.
    /// `left_id` must already be referenced by this node (or the node must
    /// be a fresh root); its reference is repointed to `right_id` past the
    /// new separator.
    pub fn insert(&mut self, sep: &[u8], left_id: BlockId, right_id: BlockId) -> Result<bool> {
        {
            let read = self.as_read();
            let avail = read.free_space() as usize + read.frag_bytes() as usize;
            if avail < INTERNAL_SLOT_SIZE + sep.len() {
                return Ok(false);
            }
        }

        let (count, right_child) = {
            let read = self.as_read();
            (read.cell_count() as usize, read.right_child())
        };

        if count == 0 && right_child.is_none() {
            // Fresh root created by a root split.
            let inserted = self.insert_separator(sep, left_id)?;
            assert!(inserted, "fresh root rejected its first separator");
            self.set_right_child(right_id);
            return Ok(true);
        }

        if right_child == left_id {
            let inserted = self.insert_separator(sep, left_id)?;
            assert!(inserted, "internal node rejected separator despite space check");
            self.set_right_child(right_id);
            return Ok(true);
        }

        let idx = {
            let read = self.as_read();
            let mut found = None;
            for i in 0..count {
                if read.slot_at(i)?.child() == left_id {
                    found = Some(i);
                    break;
                }
            }
            found.ok_or_else(|| eyre::eyre!("split child {} not referenced by parent", left_id))?
        };

        let inserted = self.insert_separator(sep, left_id)?;
        assert!(inserted, "internal node rejected separator despite space check");
        // The old slot moved one position right; its keys now sit past the
        // new separator, in the right half.
        debug_assert_eq!(self.as_read().slot_at(idx + 1)?.child(), left_id);
        self.set_slot_child(idx + 1, right_id)?;

        Ok(true)
    }

    /// Sorted insert of one separator with its left child.
    pub fn insert_separator(&mut self, key: &[u8], child: BlockId) -> Result<bool> {
        ensure!(!key.is_empty(), "empty separator");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "separator of {} bytes exceeds the {} byte cap",
            key.len(),
            MAX_KEY_SIZE
        );

        let needed = INTERNAL_SLOT_SIZE + key.len();
        let (pos, count) = {
            let read = self.as_read();
            let avail = read.free_space() as usize + read.frag_bytes() as usize;
            if avail < needed {
                return Ok(false);
            }

            let count = read.cell_count() as usize;
            let mut left = 0usize;
            let mut right = count;
            while left < right {
                let mid = left + (right - left) / 2;
                if read.key_at(mid)? < key {
                    left = mid + 1;
                } else {
                    right = mid;
                }
            }
            ensure!(
                left >= count || read.key_at(left)? != key,
                "duplicate separator"
            );
            (left, count)
        };

        if (self.as_read().free_space() as usize) < needed {
            self.compact()?;
        }

        let free_end = self.as_read().header().free_end() as usize;
        let cell_offset = free_end - key.len();
        self.data[cell_offset..cell_offset + key.len()].copy_from_slice(key);

        let slot_start = InternalNode::slot_offset(pos);
        let slot_end = InternalNode::slot_offset(count);
        self.data
            .copy_within(slot_start..slot_end, slot_start + INTERNAL_SLOT_SIZE);
        let slot = InternalSlot::new(key, child, cell_offset as u16);
        self.data[slot_start..slot_start + INTERNAL_SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_cell_count(count as u16 + 1);
        header.set_free_start((slot_end + INTERNAL_SLOT_SIZE) as u16);
        header.set_free_end(cell_offset as u16);

        Ok(true)
    }

    /// Removes the separator `key` and its left-child reference.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let idx = self
            .as_read()
            .separator_index(key)?
            .ok_or_else(|| eyre::eyre!("separator not found in internal node"))?;
        self.delete_slot(idx)
    }

    /// Replaces separator `old` with `new`, keeping its child. Used after
    /// a level to track the moved boundary.
    pub fn update_key(&mut self, old: &[u8], new: &[u8]) -> Result<()> {
        let (idx, child) = {
            let read = self.as_read();
            let idx = read
                .separator_index(old)?
                .ok_or_else(|| eyre::eyre!("separator not found in internal node"))?;
            (idx, read.slot_at(idx)?.child())
        };

        self.delete_slot(idx)?;
        let inserted = self.insert_separator(new, child)?;
        ensure!(inserted, "no room to update separator");
        Ok(())
    }

    fn set_slot_child(&mut self, index: usize, child: BlockId) -> Result<()> {
        let mut slot = self.as_read().slot_at(index)?;
        slot.child = child.into();
        let offset = InternalNode::slot_offset(index);
        self.data[offset..offset + INTERNAL_SLOT_SIZE].copy_from_slice(slot.as_bytes());
        Ok(())
    }

    fn delete_slot(&mut self, index: usize) -> Result<()> {
        let key_len = self.as_read().slot_at(index)?.key_len() as usize;
        let count = self.cell_count() as usize;

        let slot_start = InternalNode::slot_offset(index);
        let slot_end = InternalNode::slot_offset(count);
        self.data
            .copy_within(slot_start + INTERNAL_SLOT_SIZE..slot_end, slot_start);

        let header = self.header_mut();
        header.set_cell_count(count as u16 - 1);
        header.set_free_start((slot_end - INTERNAL_SLOT_SIZE) as u16);
        header.set_frag_bytes(header.frag_bytes() + key_len as u16);

        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let count = self.cell_count() as usize;

        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(count);
        for i in 0..count {
            keys.push(self.as_read().key_at(i)?.to_vec());
        }

        let mut pos = BLOCK_SIZE;
        for (i, key) in keys.iter().enumerate() {
            pos -= key.len();
            self.data[pos..pos + key.len()].copy_from_slice(key);

            let mut slot = self.as_read().slot_at(i)?;
            slot.offset = U16::new(pos as u16);
            let slot_offset = InternalNode::slot_offset(i);
            self.data[slot_offset..slot_offset + INTERNAL_SLOT_SIZE]
                .copy_from_slice(slot.as_bytes());
        }

        let header = self.header_mut();
        header.set_free_end(pos as u16);
        header.set_frag_bytes(0);

        Ok(())
    }
}
