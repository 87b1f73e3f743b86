// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The binary export container.
//!
//! A container is an 8-byte signature, any number of data blocks,
//! and one final index block.  A data block is a zstd-compressed
//! segment of the entry stream, framed by a 4-byte header and an
//! identical 4-byte trailer; its body starts with the big-endian
//! block number.  The index block maps block numbers to
//! `(offset, length)` pairs and carries the root item reference, so
//! a reader can serve random access without touching the data blocks
//! first.
//!
//! Entries are CBOR maps with the integer keys below, written
//! depth-first, children before their parent.  Within a directory
//! the children form a singly linked list walked backwards through
//! `prev`, starting at the directory's `sub`.
//!
//! Item references are 64-bit: block number in the high 40 bits,
//! byte offset into the decompressed block in the low 24.  File
//! offsets in the index are stored shifted by those same 24 bits,
//! which caps the container at 2^40 bytes.

use bitstruct::bitstruct;
use core::fmt;
use static_assertions::const_assert;

pub mod cbor;
pub mod reader;
pub mod writer;

/// Every container starts with these bytes.  The first is the CBOR
/// self-describe tag prefix; the rest identify the format and its
/// revision.
pub const SIGNATURE: [u8; 8] =
    [0xbf, b'n', b'c', b'd', b'u', b'E', b'X', b'1'];

/// Block kinds, stored in the high 4 bits of the framing word.
pub const BLOCK_DATA: u8 = 0;
pub const BLOCK_INDEX: u8 = 1;

/// Bytes of framing around a data block's compressed payload:
/// header, big-endian block number, trailer.
pub const BLOCK_OVERHEAD: usize = 12;

/// Largest decompressed block a reader will accept.  In-block
/// offsets are 24 bits, so this is also the hard format limit.
pub const MAX_BLOCK_SIZE: usize = 16 << 20;

/// File offsets must fit in 40 bits.
pub const MAX_FILE_OFFSET: u64 = 1 << 40;

const_assert!(MAX_BLOCK_SIZE <= 1 << 24);
const_assert!(SIGNATURE.len() == 8);

/// Entry map keys.  Unknown keys are skipped on read; ill-typed
/// values for known keys are fatal.
pub mod key {
    pub const TYPE: u64 = 0;
    pub const NAME: u64 = 1;
    pub const PREV: u64 = 2;
    pub const ASIZE: u64 = 3;
    pub const DSIZE: u64 = 4;
    pub const DEV: u64 = 5;
    pub const RDERR: u64 = 6;
    pub const CUMASIZE: u64 = 7;
    pub const CUMDSIZE: u64 = 8;
    pub const SHRASIZE: u64 = 9;
    pub const SHRDSIZE: u64 = 10;
    pub const ITEMS: u64 = 11;
    pub const SUB: u64 = 12;
    pub const INO: u64 = 13;
    pub const NLINK: u64 = 14;
    pub const UID: u64 = 15;
    pub const GID: u64 = 16;
    pub const MODE: u64 = 17;
    pub const MTIME: u64 = 18;
}

/// Entry type codes; specials are negative.
pub mod etype {
    pub const DIR: i64 = 0;
    pub const REG: i64 = 1;
    pub const NONREG: i64 = 2;
    pub const LINK: i64 = 3;
    pub const ERR: i64 = -1;
    pub const OTHERFS: i64 = -2;
    pub const KERNFS: i64 = -3;
    pub const PATTERN: i64 = -4;
}

bitstruct! {
    /// A 64-bit reference to an entry in the container.
    #[derive(Clone, Copy, Eq, PartialEq)]
    pub struct ItemRef(u64) {
        /// Byte offset into the decompressed block.
        pub offset: u32 = 0..=23;
        /// Block number.
        pub block: u64 = 24..=63;
    }
}

impl fmt::Debug for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block(), self.offset())
    }
}

bitstruct! {
    /// The framing word written before and after each block.
    #[derive(Clone, Copy, Eq, PartialEq)]
    pub struct BlockHead(u32) {
        /// Total block length, header and trailer included.
        pub len: u32 = 0..=27;
        /// Block kind: data or index.
        pub kind: u8 = 28..=31;
    }
}

impl fmt::Debug for BlockHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind {} len {}", self.kind(), self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itemref_packs() {
        let r = ItemRef(0).with_block(0x12345).with_offset(0xabcdef);
        assert_eq!(r.0, 0x12345_abcdef);
        assert_eq!(r.block(), 0x12345);
        assert_eq!(r.offset(), 0xabcdef);
    }

    #[test]
    fn blockhead_packs() {
        let h = BlockHead(0).with_kind(BLOCK_INDEX).with_len(0x123456);
        assert_eq!(h.0, 0x1012_3456);
        assert_eq!(h.kind(), 1);
        assert_eq!(h.len(), 0x123456);
    }
}
