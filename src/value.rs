//! Values stored under keys.
//!
//! A value carries optional metadata selected by flag bits: a CAS tag, a
//! wall-clock expiration time, and the large bit. Small payloads live
//! inline in the leaf cell; payloads over [`MAX_INLINE_VALUE_SIZE`] live in
//! an overflow chain and the leaf stores a [`LargeRef`] instead.
//!
//! ## Cell encoding
//!
//! ```text
//! +-------+---------+-----------+-----------------------------------+
//! | flags | cas? 8B | exptime?  | inline: varint len + bytes        |
//! | 1B    | (LE)    | 4B (LE)   | large:  root 4B + len 4B + crc 4B |
//! +-------+---------+-----------+-----------------------------------+
//! ```
//!
//! An expiration time of zero means "never"; a value is expired once the
//! wall clock reaches its expiration second. Expired values read as absent.

use eyre::{ensure, Result};

use crate::config::{MAX_INLINE_VALUE_SIZE, MAX_VALUE_SIZE};
use crate::encoding::varint::{decode_varint, encode_varint, varint_len};
use crate::storage::BlockId;

const FLAG_HAS_CAS: u8 = 0x01;
const FLAG_HAS_EXPTIME: u8 = 0x02;
const FLAG_LARGE: u8 = 0x04;
const KNOWN_FLAGS: u8 = FLAG_HAS_CAS | FLAG_HAS_EXPTIME | FLAG_LARGE;

/// Reference to a large value's overflow chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeRef {
    pub root: BlockId,
    pub total_len: u32,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Inline(Vec<u8>),
    Large(LargeRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    flags: u8,
    cas: u64,
    exptime: u32,
    payload: Payload,
}

impl Value {
    pub fn inline(bytes: Vec<u8>) -> Result<Self> {
        ensure!(
            bytes.len() <= MAX_INLINE_VALUE_SIZE,
            "inline value of {} bytes exceeds the {} byte cap",
            bytes.len(),
            MAX_INLINE_VALUE_SIZE
        );
        Ok(Self {
            flags: 0,
            cas: 0,
            exptime: 0,
            payload: Payload::Inline(bytes),
        })
    }

    pub fn large(lref: LargeRef) -> Result<Self> {
        ensure!(
            lref.total_len as usize <= MAX_VALUE_SIZE,
            "large value of {} bytes exceeds the {} byte cap",
            lref.total_len,
            MAX_VALUE_SIZE
        );
        ensure!(
            !lref.root.is_none() && lref.root != BlockId::SUPERBLOCK,
            "large value reference has invalid root {}",
            lref.root
        );
        Ok(Self {
            flags: FLAG_LARGE,
            cas: 0,
            exptime: 0,
            payload: Payload::Large(lref),
        })
    }

    /// Flags the value as CAS-carrying; the engine fills the tag on insert.
    pub fn request_cas(&mut self) {
        self.flags |= FLAG_HAS_CAS;
    }

    pub fn has_cas(&self) -> bool {
        self.flags & FLAG_HAS_CAS != 0
    }

    pub fn cas(&self) -> Option<u64> {
        self.has_cas().then_some(self.cas)
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.flags |= FLAG_HAS_CAS;
        self.cas = cas;
    }

    pub fn set_exptime(&mut self, exptime: u32) {
        self.flags |= FLAG_HAS_EXPTIME;
        self.exptime = exptime;
    }

    pub fn exptime(&self) -> Option<u32> {
        (self.flags & FLAG_HAS_EXPTIME != 0).then_some(self.exptime)
    }

    pub fn expired(&self, now: u32) -> bool {
        match self.exptime() {
            Some(0) | None => false,
            Some(t) => t <= now,
        }
    }

    pub fn is_large(&self) -> bool {
        self.flags & FLAG_LARGE != 0
    }

    pub fn large_ref(&self) -> Option<&LargeRef> {
        match &self.payload {
            Payload::Large(lref) => Some(lref),
            Payload::Inline(_) => None,
        }
    }

    pub fn inline_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Inline(bytes) => Some(bytes),
            Payload::Large(_) => None,
        }
    }

    /// Full payload length, wherever the bytes live.
    pub fn total_len(&self) -> usize {
        match &self.payload {
            Payload::Inline(bytes) => bytes.len(),
            Payload::Large(lref) => lref.total_len as usize,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 1;
        if self.has_cas() {
            len += 8;
        }
        if self.exptime().is_some() {
            len += 4;
        }
        match &self.payload {
            Payload::Inline(bytes) => len + varint_len(bytes.len() as u64) + bytes.len(),
            Payload::Large(_) => len + 12,
        }
    }

    /// Writes the encoded form; returns the bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let mut pos = 0;
        buf[pos] = self.flags;
        pos += 1;
        if self.has_cas() {
            buf[pos..pos + 8].copy_from_slice(&self.cas.to_le_bytes());
            pos += 8;
        }
        if self.exptime().is_some() {
            buf[pos..pos + 4].copy_from_slice(&self.exptime.to_le_bytes());
            pos += 4;
        }
        match &self.payload {
            Payload::Inline(bytes) => {
                pos += encode_varint(bytes.len() as u64, &mut buf[pos..]);
                buf[pos..pos + bytes.len()].copy_from_slice(bytes);
                pos += bytes.len();
            }
            Payload::Large(lref) => {
                buf[pos..pos + 4].copy_from_slice(&lref.root.0.to_le_bytes());
                buf[pos + 4..pos + 8].copy_from_slice(&lref.total_len.to_le_bytes());
                buf[pos + 8..pos + 12].copy_from_slice(&lref.checksum.to_le_bytes());
                pos += 12;
            }
        }
        debug_assert_eq!(pos, self.encoded_len());
        pos
    }

    /// Decodes a value from the start of `bytes`; returns it with the
    /// number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        ensure!(!bytes.is_empty(), "empty buffer for value decode");
        let flags = bytes[0];
        ensure!(
            flags & !KNOWN_FLAGS == 0,
            "unknown value flag bits: {:02x}",
            flags
        );

        let mut pos = 1;
        let mut cas = 0u64;
        if flags & FLAG_HAS_CAS != 0 {
            ensure!(bytes.len() >= pos + 8, "truncated CAS field");
            cas = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap()); // INVARIANT: length checked above
            pos += 8;
        }
        let mut exptime = 0u32;
        if flags & FLAG_HAS_EXPTIME != 0 {
            ensure!(bytes.len() >= pos + 4, "truncated expiration field");
            exptime = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()); // INVARIANT: length checked above
            pos += 4;
        }

        let payload = if flags & FLAG_LARGE != 0 {
            ensure!(bytes.len() >= pos + 12, "truncated large-value reference");
            let root = BlockId(u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()));
            let total_len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap());
            let checksum = u32::from_le_bytes(bytes[pos + 8..pos + 12].try_into().unwrap());
            pos += 12;
            Payload::Large(LargeRef {
                root,
                total_len,
                checksum,
            })
        } else {
            let (len, varint_size) = decode_varint(&bytes[pos..])?;
            pos += varint_size;
            let len = len as usize;
            ensure!(
                len <= MAX_INLINE_VALUE_SIZE,
                "inline value length {} exceeds cap",
                len
            );
            ensure!(bytes.len() >= pos + len, "truncated inline value payload");
            let payload = bytes[pos..pos + len].to_vec();
            pos += len;
            Payload::Inline(payload)
        };

        Ok((
            Self {
                flags,
                cas,
                exptime,
                payload,
            },
            pos,
        ))
    }

    /// Encoded length of the value at the start of `bytes`, without
    /// copying the payload out.
    pub fn measure(bytes: &[u8]) -> Result<usize> {
        ensure!(!bytes.is_empty(), "empty buffer for value measure");
        let flags = bytes[0];
        ensure!(
            flags & !KNOWN_FLAGS == 0,
            "unknown value flag bits: {:02x}",
            flags
        );

        let mut pos = 1;
        if flags & FLAG_HAS_CAS != 0 {
            pos += 8;
        }
        if flags & FLAG_HAS_EXPTIME != 0 {
            pos += 4;
        }
        if flags & FLAG_LARGE != 0 {
            pos += 12;
        } else {
            ensure!(bytes.len() > pos, "truncated inline value length");
            let (len, varint_size) = decode_varint(&bytes[pos..])?;
            pos += varint_size + len as usize;
        }
        ensure!(bytes.len() >= pos, "truncated value");
        Ok(pos)
    }
}
