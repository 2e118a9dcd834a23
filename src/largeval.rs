//! Large values.
//!
//! Payloads over the inline cap live in a chain of overflow blocks; the
//! leaf cell stores a [`LargeRef`] naming the chain's root, the payload
//! length, and a CRC-32 over the payload, verified on load. Each chain
//! block links to the next through its header.
//!
//! ```text
//! +------------------+-----------+----------------------------------+
//! | BlockHeader (16) | used (4B) | payload (up to OVERFLOW_CAPACITY)|
//! |  kind = Overflow |  + pad 4B |                                  |
//! |  right_child=next|           |                                  |
//! +------------------+-----------+----------------------------------+
//! ```
//!
//! The modify walk owns a [`LargeValueHandle`] for the old value from
//! lookup until commit and receives one from the operator for a new large
//! value. A handle is `Unloaded` until the operator's loader populates it,
//! `Loaded` afterwards, and `Deleted` once the walk retires the chain.

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result};
use tracing::trace;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    BLOCK_HEADER_SIZE, MAX_VALUE_SIZE, OVERFLOW_CAPACITY, OVERFLOW_HEADER_SIZE,
};
use crate::node::{BlockHeader, NodeKind};
use crate::storage::{BlockId, Transaction};
use crate::value::LargeRef;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const OVERFLOW_DATA_START: usize = BLOCK_HEADER_SIZE + OVERFLOW_HEADER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct OverflowHeader {
    used: U32,
    reserved: U32,
}

const _: () = assert!(std::mem::size_of::<OverflowHeader>() == OVERFLOW_HEADER_SIZE);

fn overflow_header(data: &[u8]) -> Result<&OverflowHeader> {
    OverflowHeader::ref_from_bytes(&data[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + OVERFLOW_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to read overflow header: {:?}", e))
}

pub fn checksum(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Writes `bytes` into a fresh overflow chain inside `txn` and returns the
/// reference the leaf will store.
pub fn write_chain(txn: &Transaction, bytes: &[u8]) -> Result<LargeRef> {
    ensure!(!bytes.is_empty(), "large value payload cannot be empty");
    ensure!(
        bytes.len() <= MAX_VALUE_SIZE,
        "large value of {} bytes exceeds the {} byte cap",
        bytes.len(),
        MAX_VALUE_SIZE
    );

    let chunk_count = bytes.len().div_ceil(OVERFLOW_CAPACITY);
    let mut bufs = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        bufs.push(txn.allocate_buf()?);
    }

    let mut offset = 0usize;
    for (i, buf) in bufs.iter().enumerate() {
        let next = if i + 1 < chunk_count {
            bufs[i + 1].block_id()
        } else {
            BlockId::NONE
        };
        let chunk_len = (bytes.len() - offset).min(OVERFLOW_CAPACITY);

        let mut data = buf.data_mut();
        {
            let header = BlockHeader::from_bytes_mut(&mut data)?;
            header.set_kind(NodeKind::Overflow);
            header.set_right_child(next);
        }
        {
            let sub = OverflowHeader::mut_from_bytes(
                &mut data[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + OVERFLOW_HEADER_SIZE],
            )
            .map_err(|e| eyre::eyre!("failed to write overflow header: {:?}", e))?;
            sub.used = U32::new(chunk_len as u32);
            sub.reserved = U32::new(0);
        }
        data[OVERFLOW_DATA_START..OVERFLOW_DATA_START + chunk_len]
            .copy_from_slice(&bytes[offset..offset + chunk_len]);
        offset += chunk_len;
    }
    debug_assert_eq!(offset, bytes.len());

    trace!(blocks = chunk_count, len = bytes.len(), "largeval.write");
    Ok(LargeRef {
        root: bufs[0].block_id(),
        total_len: bytes.len() as u32,
        checksum: checksum(bytes),
    })
}

/// Loads a whole chain, verifying length and checksum.
pub fn load_chain(txn: &Transaction, lref: &LargeRef) -> Result<Vec<u8>> {
    let total = lref.total_len as usize;
    ensure!(
        total <= MAX_VALUE_SIZE,
        "large value reference claims {} bytes, over the {} byte cap",
        total,
        MAX_VALUE_SIZE
    );

    let mut out = Vec::with_capacity(total);
    let mut current = lref.root;
    let mut remaining = total;

    while remaining > 0 {
        ensure!(!current.is_none(), "overflow chain terminated early");

        let buf = txn.buf(current)?;
        let data = buf.data();
        let header = BlockHeader::from_bytes(&data)?;
        ensure!(
            header.kind() == NodeKind::Overflow,
            "overflow chain reached a {:?} block",
            header.kind()
        );

        let used = overflow_header(&data)?.used.get() as usize;
        ensure!(
            used > 0 && used <= OVERFLOW_CAPACITY && used <= remaining,
            "overflow block {} reports {} used bytes with {} remaining",
            current,
            used,
            remaining
        );

        out.extend_from_slice(&data[OVERFLOW_DATA_START..OVERFLOW_DATA_START + used]);
        remaining -= used;
        current = header.right_child();
    }

    ensure!(
        current.is_none(),
        "overflow chain longer than its reported length"
    );
    ensure!(
        checksum(&out) == lref.checksum,
        "overflow chain checksum mismatch"
    );

    trace!(len = out.len(), "largeval.load");
    Ok(out)
}

/// Marks every block of the chain deleted; the blocks return to the free
/// chain when the transaction commits.
pub fn delete_chain(txn: &Transaction, lref: &LargeRef) -> Result<()> {
    let expected = (lref.total_len as usize).div_ceil(OVERFLOW_CAPACITY);
    let mut current = lref.root;
    let mut visited = 0usize;

    while !current.is_none() {
        ensure!(
            visited < expected,
            "overflow chain longer than its reported length"
        );
        let buf = txn.buf(current)?;
        let next = {
            let data = buf.data();
            let header = BlockHeader::from_bytes(&data)?;
            ensure!(
                header.kind() == NodeKind::Overflow,
                "overflow chain reached a {:?} block",
                header.kind()
            );
            header.right_child()
        };
        buf.mark_deleted();
        visited += 1;
        current = next;
    }

    ensure!(
        visited == expected,
        "overflow chain shorter than its reported length"
    );

    trace!(blocks = visited, "largeval.delete");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Unloaded,
    Loaded,
    Deleted,
}

/// A large value held during one modify.
#[derive(Debug)]
pub struct LargeValueHandle {
    state: HandleState,
    lref: Option<LargeRef>,
    bytes: Vec<u8>,
}

impl LargeValueHandle {
    pub fn unloaded() -> Self {
        Self {
            state: HandleState::Unloaded,
            lref: None,
            bytes: Vec::new(),
        }
    }

    /// Handle over a chain this transaction just wrote; the payload is
    /// already on its way to disk, so nothing needs loading.
    pub fn written(lref: LargeRef) -> Self {
        Self {
            state: HandleState::Loaded,
            lref: Some(lref),
            bytes: Vec::new(),
        }
    }

    /// Populates the handle from a reference. Loads the whole chain;
    /// operators that need less can override the loader seam.
    pub fn load(&mut self, txn: &Transaction, lref: LargeRef) -> Result<()> {
        ensure!(
            self.state == HandleState::Unloaded,
            "loading an already {:?} large-value handle",
            self.state
        );
        self.bytes = load_chain(txn, &lref)?;
        self.lref = Some(lref);
        self.state = HandleState::Loaded;
        Ok(())
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == HandleState::Loaded
    }

    pub fn root_ref(&self) -> Option<&LargeRef> {
        self.lref.as_ref()
    }

    /// Loaded payload bytes. Empty for handles created by `written`.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Retires the chain behind this handle.
    pub fn mark_deleted(&mut self, txn: &Transaction) -> Result<()> {
        let lref = self
            .lref
            .ok_or_else(|| eyre::eyre!("deleting a large-value handle with no reference"))?;
        ensure!(
            self.state == HandleState::Loaded,
            "deleting a {:?} large-value handle",
            self.state
        );
        delete_chain(txn, &lref)?;
        self.state = HandleState::Deleted;
        self.bytes.clear();
        Ok(())
    }
}
