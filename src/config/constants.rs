//! # Configuration Constants
//!
//! This module centralizes the crate's configuration constants. Values that
//! depend on each other are co-located and guarded by compile-time
//! assertions so a change to one cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> BLOCK_HEADER_SIZE (16 bytes, fixed)
//!       │
//!       ├─> LEAF_USABLE_SIZE / INTERNAL_USABLE_SIZE (derived)
//!       │
//!       └─> OVERFLOW_CAPACITY (derived, large-value chunk payload)
//!
//! MAX_KEY_SIZE (250)
//!       │
//!       └─> internal::is_full reserves room for one separator of this
//!           size, which is what lets the split handler insert a median
//!           into a pre-split parent without a space check.
//!
//! MAX_INLINE_VALUE_SIZE (768)
//!       │
//!       └─> bounds the largest leaf cell. Two maximum-size cells must fit
//!           in one leaf or a split could produce an overfull half.
//! ```

use crate::node::{INTERNAL_SLOT_SIZE, LEAF_SLOT_SIZE};

// ============================================================================
// BLOCK LAYOUT
// The fundamental unit of I/O, caching, and tree nodes
// ============================================================================

/// Size of each storage block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Size of the generic block header at the start of every block.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Size of the leaf sub-header (creation timestamp) after the block header.
pub const LEAF_HEADER_SIZE: usize = 8;

/// Size of the overflow sub-header (used-byte count) after the block header.
pub const OVERFLOW_HEADER_SIZE: usize = 8;

/// Payload bytes available in a leaf block.
pub const LEAF_USABLE_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE - LEAF_HEADER_SIZE;

/// Payload bytes available in an internal block.
pub const INTERNAL_USABLE_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Payload bytes available in one large-value chain block.
pub const OVERFLOW_CAPACITY: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE - OVERFLOW_HEADER_SIZE;

// ============================================================================
// KEY AND VALUE BOUNDS
// ============================================================================

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// Largest value payload stored inline in a leaf cell. Anything bigger is
/// written to an overflow chain and referenced from the leaf.
pub const MAX_INLINE_VALUE_SIZE: usize = 768;

/// Maximum value payload overall, including large values.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Worst-case encoded size of a value in a leaf cell: flag byte, CAS,
/// expiration time, two-byte length varint, and the inline payload.
pub const MAX_ENCODED_VALUE_SIZE: usize = 1 + 8 + 4 + 2 + MAX_INLINE_VALUE_SIZE;

/// Worst-case leaf cell: key, insert timestamp, encoded value.
pub const MAX_LEAF_CELL_SIZE: usize = MAX_KEY_SIZE + 4 + MAX_ENCODED_VALUE_SIZE;

const _: () = assert!(
    2 * (MAX_LEAF_CELL_SIZE + LEAF_SLOT_SIZE) <= LEAF_USABLE_SIZE,
    "a split leaf half must be able to hold at least one maximum-size cell"
);

const _: () = assert!(
    4 * (MAX_KEY_SIZE + INTERNAL_SLOT_SIZE) <= INTERNAL_USABLE_SIZE,
    "internal nodes must fan out even with maximum-size separators"
);

// ============================================================================
// REBALANCING THRESHOLDS
// ============================================================================

/// A non-root node whose payload drops below `usable / UNDERFULL_DIVISOR`
/// is underfull and becomes a merge/level candidate.
pub const UNDERFULL_DIVISOR: usize = 4;

/// Headroom a merged leaf must keep, so a merge is never immediately
/// followed by a split.
pub const LEAF_MERGE_SLACK: usize = MAX_LEAF_CELL_SIZE + LEAF_SLOT_SIZE;

/// Headroom kept by a merged internal node; one separator of maximum size.
pub const INTERNAL_MERGE_SLACK: usize = MAX_KEY_SIZE + INTERNAL_SLOT_SIZE;

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Default number of block buffers held by a slice's cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;
