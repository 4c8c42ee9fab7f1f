//! # Logical Pointers
//!
//! A [`Ptr`] is the 64-bit logical address that threads through the whole
//! engine: B+tree nodes store them, the allocators hand them out, and the
//! caches key on them. One pointer type serves two files with different
//! allocation units:
//!
//! - **Node file**: the offset counts 4KB index pages and the length field
//!   is always the index page size (nodes are fixed-size).
//! - **Data file**: the offset counts 64B data pages and the length field
//!   carries the blob's byte length, which is why a pointer alone is enough
//!   to read a value back.
//!
//! The all-ones value is reserved as the null pointer.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{
    CHUNK_BITS, CHUNK_SIZE, DATA_PAGE_SIZE, INDEX_PAGE_SIZE, LENGTH_BITS, OFFSET_BITS,
};
use crate::storage::headers::{DATA_HDR_SIZE, INDEX_HDR_SIZE};

/// Packed `(length, chunk, offset)` address of an index page or data blob.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct Ptr(u64);

impl Ptr {
    /// The reserved "no pointer" value.
    pub const NULL: Ptr = Ptr(u64::MAX);

    /// Packs `(length << 40) | (chunk << 29) | id`.
    pub const fn encode(length: u32, chunk: u32, id: u64) -> Ptr {
        let mut raw = length as u64;
        raw <<= CHUNK_BITS;
        raw |= chunk as u64;
        raw <<= OFFSET_BITS;
        raw |= id;
        Ptr(raw)
    }

    pub const fn from_raw(raw: u64) -> Ptr {
        Ptr(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    /// Byte length of the referenced blob; the index page size for node
    /// pointers.
    pub const fn length(self) -> u32 {
        ((self.0 >> (CHUNK_BITS + OFFSET_BITS)) & ((1 << LENGTH_BITS) - 1)) as u32
    }

    /// Chunk index within the file.
    pub const fn chunk(self) -> u32 {
        ((self.0 >> OFFSET_BITS) & ((1 << CHUNK_BITS) - 1)) as u32
    }

    /// Page offset within the chunk, in the file's allocation units.
    pub const fn id(self) -> u64 {
        self.0 & ((1 << OFFSET_BITS) - 1)
    }

    /// Byte offset of this index page in the node file.
    pub const fn node_file_off(self) -> u64 {
        INDEX_HDR_SIZE as u64 + self.chunk() as u64 * CHUNK_SIZE + self.id() * INDEX_PAGE_SIZE as u64
    }

    /// Byte offset of this blob's first data page in the data file.
    pub const fn data_file_off(self) -> u64 {
        DATA_HDR_SIZE as u64 + self.chunk() as u64 * CHUNK_SIZE + self.id() * DATA_PAGE_SIZE as u64
    }
}

impl Default for Ptr {
    fn default() -> Self {
        Ptr::NULL
    }
}

/// Number of data pages needed to hold `n` bytes.
pub const fn pages_for(n: usize) -> u64 {
    ((n + DATA_PAGE_SIZE - 1) / DATA_PAGE_SIZE) as u64
}

/// Byte offset of a data page within its system page.
pub const fn in_sys_page_off(data_page: u64) -> usize {
    (data_page as usize & (crate::config::DATA_PER_SYS_PAGE - 1)) * DATA_PAGE_SIZE
}
