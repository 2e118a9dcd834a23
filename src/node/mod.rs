//! # Node Layouts and Structural Operations
//!
//! Every tree block starts with a 16-byte [`BlockHeader`]; the kind byte
//! discriminates leaves, internal nodes, large-value overflow blocks, and
//! free blocks. Cell storage follows the slot-array convention: fixed-size
//! slots grow downward from the header, cell content grows upward from the
//! block end, and the header tracks the free window plus fragmented bytes
//! reclaimed lazily by compaction.
//!
//! ```text
//! +------------------+
//! | BlockHeader (16) |
//! +------------------+
//! | sub-header       |  <- leaf/overflow only
//! +------------------+
//! | slot array       |  <- grows downward (free_start)
//! +------------------+
//! | free window      |
//! +------------------+
//! | cell content     |  <- grows upward (free_end)
//! +------------------+
//! ```
//!
//! The generic operations here ([`split`], [`merge`], [`level`]) stage the
//! affected entries in memory, re-initialize the blocks, and write the
//! redistributed entries back. Blocks are 4KB and rebalancing is rare
//! relative to descent, so the staging copy buys simplicity at no
//! measurable cost.
//!
//! Separator conventions: a key equal to a separator belongs to the left
//! child; `merge` always folds the left node into the right one and returns
//! the parent separator that must disappear.

mod internal;
mod leaf;

pub use internal::{InternalNode, InternalNodeMut, InternalSlot, INTERNAL_SLOT_SIZE};
pub use leaf::{LeafNode, LeafNodeMut, LeafSlot, SearchResult, LEAF_SLOT_SIZE};

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE, INTERNAL_MERGE_SLACK, INTERNAL_USABLE_SIZE, LEAF_MERGE_SLACK,
    LEAF_USABLE_SIZE, UNDERFULL_DIVISOR,
};
use crate::storage::{BlockId, RawBlockId};

/// Key bytes staged off-block during structural operations.
pub type KeyBuf = SmallVec<[u8; 64]>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Unknown = 0x00,
    Internal = 0x01,
    Leaf = 0x02,
    Overflow = 0x20,
    Free = 0x30,
}

impl NodeKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => NodeKind::Internal,
            0x02 => NodeKind::Leaf,
            0x20 => NodeKind::Overflow,
            0x30 => NodeKind::Free,
            _ => NodeKind::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BlockHeader {
    kind: u8,
    flags: u8,
    cell_count: U16,
    free_start: U16,
    free_end: U16,
    frag_bytes: U16,
    reserved: [u8; 2],
    right_child: RawBlockId,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

impl BlockHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= BLOCK_HEADER_SIZE,
            "buffer too small for BlockHeader: {} < {}",
            data.len(),
            BLOCK_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..BLOCK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read BlockHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= BLOCK_HEADER_SIZE,
            "buffer too small for BlockHeader: {} < {}",
            data.len(),
            BLOCK_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..BLOCK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read BlockHeader: {:?}", e))
    }

    /// Stamps a freed block: kind byte plus the next link of the free chain.
    pub fn init_free(data: &mut [u8], next: BlockId) -> Result<()> {
        let header = Self::from_bytes_mut(data)?;
        header.set_kind(NodeKind::Free);
        header.set_right_child(next);
        Ok(())
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_byte(self.kind)
    }

    pub fn set_kind(&mut self, kind: NodeKind) {
        self.kind = kind as u8;
    }

    pub fn cell_count(&self) -> u16 {
        self.cell_count.get()
    }

    pub fn set_cell_count(&mut self, count: u16) {
        self.cell_count = U16::new(count);
    }

    pub fn free_start(&self) -> u16 {
        self.free_start.get()
    }

    pub fn set_free_start(&mut self, offset: u16) {
        self.free_start = U16::new(offset);
    }

    pub fn free_end(&self) -> u16 {
        self.free_end.get()
    }

    pub fn set_free_end(&mut self, offset: u16) {
        self.free_end = U16::new(offset);
    }

    pub fn free_space(&self) -> u16 {
        self.free_end.get().saturating_sub(self.free_start.get())
    }

    pub fn frag_bytes(&self) -> u16 {
        self.frag_bytes.get()
    }

    pub fn set_frag_bytes(&mut self, bytes: u16) {
        self.frag_bytes = U16::new(bytes);
    }

    pub fn right_child(&self) -> BlockId {
        self.right_child.get()
    }

    pub fn set_right_child(&mut self, id: BlockId) {
        self.right_child.set(id);
    }
}

pub fn kind(data: &[u8]) -> Result<NodeKind> {
    Ok(BlockHeader::from_bytes(data)?.kind())
}

pub fn is_internal(data: &[u8]) -> Result<bool> {
    Ok(kind(data)? == NodeKind::Internal)
}

pub fn is_leaf(data: &[u8]) -> Result<bool> {
    Ok(kind(data)? == NodeKind::Leaf)
}

/// A non-root node is underfull when its payload drops below a quarter of
/// the usable space. The walk never asks this of a root.
pub fn is_underfull(data: &[u8]) -> Result<bool> {
    match kind(data)? {
        NodeKind::Leaf => {
            let node = LeafNode::from_block(data)?;
            Ok(node.used_space() < LEAF_USABLE_SIZE / UNDERFULL_DIVISOR)
        }
        NodeKind::Internal => {
            let node = InternalNode::from_block(data)?;
            Ok(node.used_space() < INTERNAL_USABLE_SIZE / UNDERFULL_DIVISOR)
        }
        other => bail!("is_underfull on non-tree block: {:?}", other),
    }
}

/// Whether `node` and `sib` fit into one block with enough headroom that
/// the merged node is not an immediate split candidate. `left_id` names
/// whichever of the two sits first in key order; internal merges also pull
/// the parent separator down, so its cost counts too.
pub fn is_mergable(node: &[u8], sib: &[u8], parent: &[u8], left_id: BlockId) -> Result<bool> {
    let node_kind = kind(node)?;
    ensure!(
        node_kind == kind(sib)?,
        "cannot merge nodes of different kinds"
    );

    match node_kind {
        NodeKind::Leaf => {
            let a = LeafNode::from_block(node)?;
            let b = LeafNode::from_block(sib)?;
            Ok(a.used_space() + b.used_space() + LEAF_MERGE_SLACK <= LEAF_USABLE_SIZE)
        }
        NodeKind::Internal => {
            let a = InternalNode::from_block(node)?;
            let b = InternalNode::from_block(sib)?;
            let parent = InternalNode::from_block(parent)?;
            let (_, sep) = parent
                .separator_for_child(left_id)?
                .ok_or_else(|| eyre::eyre!("merge left node {} not found in parent", left_id))?;
            let pulled = INTERNAL_SLOT_SIZE + sep.len();
            Ok(a.used_space() + b.used_space() + pulled + INTERNAL_MERGE_SLACK
                <= INTERNAL_USABLE_SIZE)
        }
        other => bail!("is_mergable on non-tree block: {:?}", other),
    }
}

/// Splits `src` in half, moving the upper entries into the freshly
/// initialized `dst`. Returns the median separator: keys less than or
/// equal to it stay in `src`.
pub fn split(src: &mut [u8], dst: &mut [u8]) -> Result<KeyBuf> {
    match kind(src)? {
        NodeKind::Leaf => split_leaf(src, dst),
        NodeKind::Internal => split_internal(src, dst),
        other => bail!("split on non-tree block: {:?}", other),
    }
}

fn split_leaf(src: &mut [u8], dst: &mut [u8]) -> Result<KeyBuf> {
    let (cells, created_at) = {
        let node = LeafNode::from_block(src)?;
        (stage_leaf_cells(&node)?, node.created_at())
    };
    ensure!(cells.len() >= 2, "cannot split a leaf with {} cells", cells.len());

    let total: usize = cells.iter().map(leaf_cell_cost).sum();
    let median_idx = balance_point(cells.iter().map(leaf_cell_cost), total, cells.len());
    let median: KeyBuf = cells[median_idx].0.clone();

    let mut left = LeafNodeMut::init(src, created_at)?;
    for (key, ts, value) in &cells[..=median_idx] {
        let inserted = left.insert_raw(key, *ts, value)?;
        assert!(inserted, "leaf split half rejected its own cell");
    }

    let mut right = LeafNodeMut::init(dst, created_at)?;
    for (key, ts, value) in &cells[median_idx + 1..] {
        let inserted = right.insert_raw(key, *ts, value)?;
        assert!(inserted, "leaf split half rejected its own cell");
    }

    Ok(median)
}

fn split_internal(src: &mut [u8], dst: &mut [u8]) -> Result<KeyBuf> {
    let (entries, right_child) = {
        let node = InternalNode::from_block(src)?;
        (stage_internal_entries(&node)?, node.right_child())
    };
    ensure!(
        entries.len() >= 3,
        "cannot split an internal node with {} separators",
        entries.len()
    );

    let total: usize = entries.iter().map(internal_entry_cost).sum();
    // The median is promoted, not copied: it must not land in either half.
    let mut median_idx = balance_point(entries.iter().map(internal_entry_cost), total, entries.len());
    median_idx = median_idx.clamp(1, entries.len() - 2);
    let median: KeyBuf = entries[median_idx].0.clone();

    let mut left = InternalNodeMut::init(src)?;
    for (key, child) in &entries[..median_idx] {
        let inserted = left.insert_separator(key, *child)?;
        assert!(inserted, "internal split half rejected its own separator");
    }
    left.set_right_child(entries[median_idx].1);

    let mut right = InternalNodeMut::init(dst)?;
    for (key, child) in &entries[median_idx + 1..] {
        let inserted = right.insert_separator(key, *child)?;
        assert!(inserted, "internal split half rejected its own separator");
    }
    right.set_right_child(right_child);

    Ok(median)
}

/// Folds `left` into `right` (key order ascending). The caller marks `left`
/// deleted and removes the returned separator from the parent, or retires
/// the parent if it was a singleton root.
pub fn merge(left: &mut [u8], right: &mut [u8], parent: &[u8], left_id: BlockId) -> Result<KeyBuf> {
    let parent = InternalNode::from_block(parent)?;
    let (_, sep) = parent
        .separator_for_child(left_id)?
        .ok_or_else(|| eyre::eyre!("merge left node {} not found in parent", left_id))?;
    let sep: KeyBuf = KeyBuf::from_slice(sep);

    match kind(left)? {
        NodeKind::Leaf => {
            let left_cells = stage_leaf_cells(&LeafNode::from_block(left)?)?;
            let (right_cells, created_at) = {
                let node = LeafNode::from_block(right)?;
                (stage_leaf_cells(&node)?, node.created_at())
            };

            let mut merged = LeafNodeMut::init(right, created_at)?;
            for (key, ts, value) in left_cells.iter().chain(right_cells.iter()) {
                let inserted = merged.insert_raw(key, *ts, value)?;
                assert!(inserted, "merged leaf rejected a cell despite is_mergable");
            }
        }
        NodeKind::Internal => {
            let (left_entries, left_right_child) = {
                let node = InternalNode::from_block(left)?;
                (stage_internal_entries(&node)?, node.right_child())
            };
            let (right_entries, right_right_child) = {
                let node = InternalNode::from_block(right)?;
                (stage_internal_entries(&node)?, node.right_child())
            };

            let mut merged = InternalNodeMut::init(right)?;
            for (key, child) in &left_entries {
                let inserted = merged.insert_separator(key, *child)?;
                assert!(inserted, "merged internal node rejected a separator");
            }
            // The parent separator comes down between the two halves.
            let inserted = merged.insert_separator(&sep, left_right_child)?;
            assert!(inserted, "merged internal node rejected the pulled separator");
            for (key, child) in &right_entries {
                let inserted = merged.insert_separator(key, *child)?;
                assert!(inserted, "merged internal node rejected a separator");
            }
            merged.set_right_child(right_right_child);
        }
        other => bail!("merge on non-tree block: {:?}", other),
    }

    Ok(sep)
}

/// Redistributes entries between `node` and its sibling so neither side is
/// underfull. `cmp` is `Less` when `node` precedes `sib` in key order.
/// Returns the parent separator to replace and its replacement, or `None`
/// if no rebalance was possible.
pub fn level(
    node: &mut [u8],
    sib: &mut [u8],
    parent: &[u8],
    node_id: BlockId,
    sib_id: BlockId,
    cmp: Ordering,
) -> Result<Option<(KeyBuf, KeyBuf)>> {
    let (left, right, left_id) = match cmp {
        Ordering::Less => (node, sib, node_id),
        Ordering::Greater => (sib, node, sib_id),
        Ordering::Equal => bail!("a node cannot be its own sibling"),
    };

    let parent = InternalNode::from_block(parent)?;
    let (_, sep) = parent
        .separator_for_child(left_id)?
        .ok_or_else(|| eyre::eyre!("level left node {} not found in parent", left_id))?;
    let sep: KeyBuf = KeyBuf::from_slice(sep);

    match kind(left)? {
        NodeKind::Leaf => level_leaf(left, right, sep),
        NodeKind::Internal => level_internal(left, right, sep),
        other => bail!("level on non-tree block: {:?}", other),
    }
}

fn level_leaf(left: &mut [u8], right: &mut [u8], sep: KeyBuf) -> Result<Option<(KeyBuf, KeyBuf)>> {
    let (left_cells, left_created) = {
        let node = LeafNode::from_block(left)?;
        (stage_leaf_cells(&node)?, node.created_at())
    };
    let (right_cells, right_created) = {
        let node = LeafNode::from_block(right)?;
        (stage_leaf_cells(&node)?, node.created_at())
    };

    let split_now = left_cells.len();
    let cells: Vec<_> = left_cells.into_iter().chain(right_cells).collect();
    if cells.len() < 2 {
        return Ok(None);
    }

    let total: usize = cells.iter().map(leaf_cell_cost).sum();
    let balanced = balance_point(cells.iter().map(leaf_cell_cost), total, cells.len());
    // balance_point yields the last index of the left half.
    let split_new = balanced + 1;
    if split_new == split_now {
        return Ok(None);
    }

    let mut new_left = LeafNodeMut::init(left, left_created)?;
    for (key, ts, value) in &cells[..split_new] {
        let inserted = new_left.insert_raw(key, *ts, value)?;
        assert!(inserted, "leveled leaf rejected a cell");
    }
    let mut new_right = LeafNodeMut::init(right, right_created)?;
    for (key, ts, value) in &cells[split_new..] {
        let inserted = new_right.insert_raw(key, *ts, value)?;
        assert!(inserted, "leveled leaf rejected a cell");
    }

    let replacement = KeyBuf::from_slice(&cells[split_new - 1].0);
    Ok(Some((sep, replacement)))
}

fn level_internal(
    left: &mut [u8],
    right: &mut [u8],
    sep: KeyBuf,
) -> Result<Option<(KeyBuf, KeyBuf)>> {
    let (left_entries, left_rc) = {
        let node = InternalNode::from_block(left)?;
        (stage_internal_entries(&node)?, node.right_child())
    };
    let (right_entries, right_rc) = {
        let node = InternalNode::from_block(right)?;
        (stage_internal_entries(&node)?, node.right_child())
    };

    // Combined sequence: the parent separator sits between the halves and
    // owns the left node's rightmost child.
    let sep_now = left_entries.len();
    let mut keys: Vec<KeyBuf> = Vec::with_capacity(left_entries.len() + 1 + right_entries.len());
    let mut children: Vec<BlockId> = Vec::with_capacity(keys.capacity() + 1);
    for (key, child) in &left_entries {
        keys.push(key.clone());
        children.push(*child);
    }
    keys.push(sep.clone());
    children.push(left_rc);
    for (key, child) in &right_entries {
        keys.push(key.clone());
        children.push(*child);
    }
    children.push(right_rc);

    if keys.len() < 3 {
        return Ok(None);
    }

    let total: usize = keys.iter().map(|k| INTERNAL_SLOT_SIZE + k.len()).sum();
    let mut sep_new = balance_point(
        keys.iter().map(|k| INTERNAL_SLOT_SIZE + k.len()),
        total,
        keys.len(),
    );
    sep_new = sep_new.clamp(1, keys.len() - 2);
    if sep_new == sep_now {
        return Ok(None);
    }

    let mut new_left = InternalNodeMut::init(left)?;
    for i in 0..sep_new {
        let inserted = new_left.insert_separator(&keys[i], children[i])?;
        assert!(inserted, "leveled internal node rejected a separator");
    }
    new_left.set_right_child(children[sep_new]);

    let mut new_right = InternalNodeMut::init(right)?;
    for i in sep_new + 1..keys.len() {
        let inserted = new_right.insert_separator(&keys[i], children[i])?;
        assert!(inserted, "leveled internal node rejected a separator");
    }
    new_right.set_right_child(*children.last().unwrap()); // INVARIANT: children is non-empty, one longer than keys

    let replacement = keys[sep_new].clone();
    Ok(Some((sep, replacement)))
}

/// Structural sanity check: header window consistent, keys strictly
/// ascending, children well-formed. Run on siblings in debug builds.
pub fn validate(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == BLOCK_SIZE,
        "invalid block size: {} != {}",
        data.len(),
        BLOCK_SIZE
    );

    let header = BlockHeader::from_bytes(data)?;
    ensure!(
        header.free_start() <= header.free_end(),
        "free_start {} > free_end {}",
        header.free_start(),
        header.free_end()
    );
    ensure!(
        header.free_end() as usize <= BLOCK_SIZE,
        "free_end {} > block size",
        header.free_end()
    );

    match header.kind() {
        NodeKind::Leaf => {
            let node = LeafNode::from_block(data)?;
            let mut prev: Option<&[u8]> = None;
            for i in 0..node.cell_count() as usize {
                let key = node.key_at(i)?;
                if let Some(p) = prev {
                    ensure!(p < key, "leaf keys out of order at cell {}", i);
                }
                prev = Some(key);
            }
        }
        NodeKind::Internal => {
            let node = InternalNode::from_block(data)?;
            ensure!(node.cell_count() > 0, "internal node without separators");
            let mut prev: Option<&[u8]> = None;
            for i in 0..node.cell_count() as usize {
                let key = node.key_at(i)?;
                if let Some(p) = prev {
                    ensure!(p < key, "internal separators out of order at slot {}", i);
                }
                prev = Some(key);
                let child = node.slot_at(i)?.child();
                ensure!(
                    !child.is_none() && child != BlockId::SUPERBLOCK,
                    "internal slot {} has invalid child {}",
                    i,
                    child
                );
            }
            let rc = node.right_child();
            ensure!(
                !rc.is_none() && rc != BlockId::SUPERBLOCK,
                "internal node has invalid right child {}",
                rc
            );
        }
        other => bail!("validate on non-tree block: {:?}", other),
    }

    Ok(())
}

type StagedLeafCell = (KeyBuf, u32, Vec<u8>);

fn stage_leaf_cells(node: &LeafNode<'_>) -> Result<Vec<StagedLeafCell>> {
    let count = node.cell_count() as usize;
    let mut cells = Vec::with_capacity(count);
    for i in 0..count {
        cells.push((
            KeyBuf::from_slice(node.key_at(i)?),
            node.timestamp_at(i)?,
            node.value_bytes_at(i)?.to_vec(),
        ));
    }
    Ok(cells)
}

fn stage_internal_entries(node: &InternalNode<'_>) -> Result<Vec<(KeyBuf, BlockId)>> {
    let count = node.cell_count() as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let slot = node.slot_at(i)?;
        entries.push((KeyBuf::from_slice(node.key_at(i)?), slot.child()));
    }
    Ok(entries)
}

fn leaf_cell_cost(cell: &StagedLeafCell) -> usize {
    LEAF_SLOT_SIZE + cell.0.len() + 4 + cell.2.len()
}

fn internal_entry_cost(entry: &(KeyBuf, BlockId)) -> usize {
    INTERNAL_SLOT_SIZE + entry.0.len()
}

/// Index of the last entry of the left half when splitting a sequence of
/// weighted entries as evenly as possible. Both halves stay non-empty.
fn balance_point(costs: impl Iterator<Item = usize>, total: usize, len: usize) -> usize {
    debug_assert!(len >= 2);
    let mut acc = 0usize;
    for (i, cost) in costs.enumerate() {
        acc += cost;
        if acc * 2 >= total {
            return i.min(len - 2);
        }
    }
    len - 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_KEY_SIZE;
    use crate::value::Value;

    fn leaf_block_with(keys: &[(&[u8], usize)]) -> Vec<u8> {
        let mut data = vec![0u8; BLOCK_SIZE];
        {
            let mut leaf = LeafNodeMut::init(&mut data, 7).unwrap();
            for (key, value_len) in keys {
                let value = Value::inline(vec![0xAB; *value_len]).unwrap();
                assert!(leaf.insert(key, &value, 7).unwrap());
            }
        }
        data
    }

    fn internal_block_with(seps: &[(&[u8], u32)], right: u32) -> Vec<u8> {
        let mut data = vec![0u8; BLOCK_SIZE];
        {
            let mut node = InternalNodeMut::init(&mut data).unwrap();
            for (key, child) in seps {
                assert!(node.insert_separator(key, BlockId(*child)).unwrap());
            }
            node.set_right_child(BlockId(right));
        }
        data
    }

    #[test]
    fn kind_discrimination() {
        let leaf = leaf_block_with(&[]);
        assert!(is_leaf(&leaf).unwrap());
        assert!(!is_internal(&leaf).unwrap());

        let node = internal_block_with(&[(b"m", 1)], 2);
        assert!(is_internal(&node).unwrap());
    }

    #[test]
    fn fresh_leaf_is_underfull() {
        let leaf = leaf_block_with(&[(b"a", 10)]);
        assert!(is_underfull(&leaf).unwrap());
    }

    #[test]
    fn split_leaf_routes_median_left() {
        let mut src = leaf_block_with(&[
            (b"a", 600),
            (b"b", 600),
            (b"c", 600),
            (b"d", 600),
        ]);
        let mut dst = vec![0u8; BLOCK_SIZE];

        let median = split(&mut src, &mut dst).unwrap();

        let left = LeafNode::from_block(&src).unwrap();
        let right = LeafNode::from_block(&dst).unwrap();
        assert!(left.cell_count() >= 1 && right.cell_count() >= 1);

        // Everything in the left half is <= median, everything right is >.
        for i in 0..left.cell_count() as usize {
            assert!(left.key_at(i).unwrap() <= &median[..]);
        }
        for i in 0..right.cell_count() as usize {
            assert!(right.key_at(i).unwrap() > &median[..]);
        }
    }

    #[test]
    fn split_internal_promotes_median() {
        let mut src = internal_block_with(
            &[(b"b", 1), (b"d", 2), (b"f", 3), (b"h", 4)],
            5,
        );
        let mut dst = vec![0u8; BLOCK_SIZE];

        let median = split(&mut src, &mut dst).unwrap();

        let left = InternalNode::from_block(&src).unwrap();
        let right = InternalNode::from_block(&dst).unwrap();

        // The median separator was promoted, not kept in either half.
        for i in 0..left.cell_count() as usize {
            assert!(left.key_at(i).unwrap() < &median[..]);
        }
        for i in 0..right.cell_count() as usize {
            assert!(right.key_at(i).unwrap() > &median[..]);
        }
        assert_eq!(
            left.cell_count() as usize + right.cell_count() as usize + 1,
            4
        );
        assert_eq!(right.right_child(), BlockId(5));
    }

    #[test]
    fn merge_leaves_returns_parent_separator() {
        let mut left = leaf_block_with(&[(b"a", 20), (b"b", 20)]);
        let mut right = leaf_block_with(&[(b"x", 20), (b"y", 20)]);
        let parent = internal_block_with(&[(b"b", 10), (b"y", 11)], 12);

        let sep = merge(&mut left, &mut right, &parent, BlockId(10)).unwrap();
        assert_eq!(&sep[..], b"b");

        let merged = LeafNode::from_block(&right).unwrap();
        assert_eq!(merged.cell_count(), 4);
        assert_eq!(merged.key_at(0).unwrap(), b"a");
        assert_eq!(merged.key_at(3).unwrap(), b"y");
    }

    #[test]
    fn merge_internal_pulls_separator_down() {
        let mut left = internal_block_with(&[(b"b", 1)], 2);
        let mut right = internal_block_with(&[(b"x", 3)], 4);
        let parent = internal_block_with(&[(b"m", 10), (b"z", 11)], 12);

        let sep = merge(&mut left, &mut right, &parent, BlockId(10)).unwrap();
        assert_eq!(&sep[..], b"m");

        let merged = InternalNode::from_block(&right).unwrap();
        assert_eq!(merged.cell_count(), 3);
        assert_eq!(merged.key_at(0).unwrap(), b"b");
        assert_eq!(merged.key_at(1).unwrap(), b"m");
        assert_eq!(merged.key_at(2).unwrap(), b"x");
        // The pulled separator owns the left node's rightmost child.
        assert_eq!(merged.slot_at(1).unwrap().child(), BlockId(2));
        assert_eq!(merged.right_child(), BlockId(4));
    }

    #[test]
    fn level_leaf_moves_cells_toward_underfull_side() {
        let mut node = leaf_block_with(&[(b"a", 30)]);
        let mut sib = leaf_block_with(&[
            (b"m", 600),
            (b"n", 600),
            (b"o", 600),
            (b"p", 600),
        ]);
        let parent = internal_block_with(&[(b"a", 10)], 11);

        let result = level(
            &mut node,
            &mut sib,
            &parent,
            BlockId(10),
            BlockId(11),
            Ordering::Less,
        )
        .unwrap();

        let (to_replace, replacement) = result.expect("level should rebalance");
        assert_eq!(&to_replace[..], b"a");

        let left = LeafNode::from_block(&node).unwrap();
        let right = LeafNode::from_block(&sib).unwrap();
        assert!(left.cell_count() > 1, "left side should have gained cells");
        assert_eq!(
            left.key_at(left.cell_count() as usize - 1).unwrap(),
            &replacement[..]
        );
        assert!(right.key_at(0).unwrap() > &replacement[..]);
    }

    #[test]
    fn level_internal_rotates_through_separator() {
        let mut node = internal_block_with(&[(b"b", 1)], 2);
        let mut sib = internal_block_with(
            &[(b"m", 3), (b"o", 4), (b"q", 5), (b"s", 6)],
            7,
        );
        let parent = internal_block_with(&[(b"g", 10)], 11);

        let result = level(
            &mut node,
            &mut sib,
            &parent,
            BlockId(10),
            BlockId(11),
            Ordering::Less,
        )
        .unwrap();

        let (to_replace, replacement) = result.expect("level should rebalance");
        assert_eq!(&to_replace[..], b"g");
        assert!(&replacement[..] > b"g".as_slice());

        // The old parent separator now lives inside the left node.
        let left = InternalNode::from_block(&node).unwrap();
        let mut found = false;
        for i in 0..left.cell_count() as usize {
            if left.key_at(i).unwrap() == b"g" {
                found = true;
            }
        }
        assert!(found, "parent separator should rotate into the left node");
    }

    #[test]
    fn level_returns_none_when_balanced() {
        let mut node = leaf_block_with(&[(b"a", 100), (b"b", 100)]);
        let mut sib = leaf_block_with(&[(b"x", 100), (b"y", 100)]);
        let parent = internal_block_with(&[(b"b", 10)], 11);

        let result = level(
            &mut node,
            &mut sib,
            &parent,
            BlockId(10),
            BlockId(11),
            Ordering::Less,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn validate_accepts_consistent_nodes() {
        let leaf = leaf_block_with(&[(b"a", 10), (b"b", 10)]);
        validate(&leaf).unwrap();

        let node = internal_block_with(&[(b"m", 1)], 2);
        validate(&node).unwrap();
    }

    #[test]
    fn validate_rejects_invalid_children() {
        let node = internal_block_with(&[(b"m", 0)], 2);
        assert!(validate(&node).is_err());
    }

    #[test]
    fn max_key_fits_after_proactive_split() {
        // A split internal node must accept one maximum-size separator.
        let big_key = vec![0xEE; MAX_KEY_SIZE];
        let mut src = internal_block_with(
            &[(b"b", 1), (b"d", 2), (b"f", 3), (b"h", 4), (b"j", 5)],
            6,
        );
        let mut dst = vec![0u8; BLOCK_SIZE];
        split(&mut src, &mut dst).unwrap();

        let mut left = InternalNodeMut::from_block(&mut src).unwrap();
        assert!(left.insert_separator(&big_key, BlockId(9)).unwrap());
    }
}
