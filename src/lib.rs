//! # burrow: a disk-backed B-tree key/value slice engine
//!
//! burrow stores one shard ("slice") of a key space as an on-disk B-tree
//! of 4KB blocks behind a transactional buffer cache. The write path is a
//! single root-to-leaf **modify walk** that locates the key, asks a
//! user-supplied operator what to write, and applies the answer, keeping
//! the tree balanced with proactive splits on the way down and reactive
//! merges/levels of underfull nodes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrow::{SliceOptions, TreeSlice};
//!
//! let slice = TreeSlice::create("./data/slice.bt", SliceOptions::default())?;
//!
//! slice.put(b"user:1", b"alice")?;
//! assert_eq!(slice.get(b"user:1")?, Some(b"alice".to_vec()));
//! slice.delete(b"user:1")?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   TreeSlice (put / get / delete)     │
//! ├──────────────────────────────────────┤
//! │ Modify walk │ ModifyOperator (yours) │
//! ├──────────────────────────────────────┤
//! │  Node layouts (leaf / internal)      │──┐
//! ├──────────────────────────────────────┤  │ large values
//! │  Transaction + BufLock               │◄─┘ (overflow chains)
//! ├──────────────────────────────────────┤
//! │  BufferCache (pins, SIEVE, freelist) │
//! ├──────────────────────────────────────┤
//! │  Memory-mapped block file            │
//! └──────────────────────────────────────┘
//! ```
//!
//! Each slice is single-writer: every operation takes the slice's writer
//! lock, so no two walks on one tree ever interleave. One modify is one
//! write transaction; its buffered writes hit the file only at commit.
//!
//! ## Module Overview
//!
//! - [`tree`]: the slice handle, modify walk, and operator seam
//! - [`node`]: leaf/internal block layouts and split/merge/level
//! - [`storage`]: block file, superblock, buffer cache, transactions
//! - [`largeval`]: out-of-line value chains and their handles
//! - [`value`]: the value model (flags, CAS, expiry, large references)

pub mod config;
pub mod encoding;
pub mod largeval;
pub mod node;
pub mod storage;
pub mod tree;
pub mod value;

pub use largeval::{HandleState, LargeValueHandle};
pub use storage::{BlockId, BufLock, BufferCache, Transaction};
pub use tree::operator::{Decision, DeleteOperator, ModifyOperator, SetOperator};
pub use tree::{SliceOptions, TreeMetricsSnapshot, TreeSlice};
pub use value::{LargeRef, Value};
