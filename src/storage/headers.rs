//! # File Header Definitions
//!
//! Each store consists of two files, each starting with a fixed header
//! padded out to a whole system page:
//!
//! - **`<name>.db`** (node file): magic, live kv count, file-size
//!   high-water mark, last-chunk allocation hint, root pointer, and a
//!   per-chunk used-page counter array.
//! - **`<name>.data`** (data file): magic, file-size high-water mark,
//!   last-chunk hint, per-chunk used-page counters.
//!
//! Headers are `repr(C)` zerocopy structs reinterpreted directly over the
//! mapped first page of the file. All fields are host-endian: no
//! conversion is done anywhere, so a store written on one endianness is
//! not readable on the other. Padding is spelled out explicitly so the
//! structs stay zerocopy-transmutable.
//!
//! Chunk `i` begins at `header size + i * CHUNK_SIZE`; its first bytes are
//! the chunk's allocation bitmap (see [`Chunk`](super::chunk::Chunk)).

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::pointer::Ptr;
use crate::config::{DATA_MAGIC, NODE_MAGIC, NR_DATA_CHUNKS, NR_INDEX_CHUNKS, SYS_PAGE_SIZE};

/// Node-file header bytes on disk, rounded up to a system page.
pub const INDEX_HDR_SIZE: usize =
    size_of::<NodeFileHeader>().div_ceil(SYS_PAGE_SIZE) * SYS_PAGE_SIZE;

/// Data-file header bytes on disk, rounded up to a system page.
pub const DATA_HDR_SIZE: usize =
    size_of::<DataFileHeader>().div_ceil(SYS_PAGE_SIZE) * SYS_PAGE_SIZE;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NodeFileHeader {
    pub magic: u64,
    /// Live key-value pairs in the tree.
    pub nr_kv: u64,
    /// High-water mark of allocated file bytes.
    pub file_size: u64,
    /// Allocation sweep hint; scanning starts at the following chunk.
    pub last_chunk: u32,
    /// Keeps `root` 8-aligned; always zero on disk.
    _pad: [u8; 4],
    /// Root node pointer, [`Ptr::NULL`] for an empty tree.
    pub root: Ptr,
    /// Allocated index pages per chunk.
    pub chunk_used: [u32; NR_INDEX_CHUNKS],
}

const _: () = assert!(size_of::<NodeFileHeader>() == 40 + 4 * NR_INDEX_CHUNKS);
const _: () = assert!(INDEX_HDR_SIZE == 2 * SYS_PAGE_SIZE);

impl NodeFileHeader {
    /// Initializes a freshly zeroed header in place.
    pub fn format(&mut self) {
        self.magic = NODE_MAGIC;
        self.file_size = INDEX_HDR_SIZE as u64;
        self.root = Ptr::NULL;
    }

    /// Validates a mapped header after open.
    pub fn validate(bytes: &[u8]) -> Result<&Self> {
        let hdr = Self::ref_from_prefix(bytes)
            .map_err(|e| eyre::eyre!("failed to read node file header: {e:?}"))?
            .0;
        ensure!(hdr.magic == NODE_MAGIC, "invalid magic in node file");
        ensure!(
            hdr.file_size >= INDEX_HDR_SIZE as u64,
            "node file truncated: file_size {} below header size {}",
            hdr.file_size,
            INDEX_HDR_SIZE
        );
        Ok(hdr)
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DataFileHeader {
    pub magic: u64,
    /// High-water mark of allocated file bytes.
    pub file_size: u64,
    /// Allocation sweep hint; scanning starts at this chunk.
    pub last_chunk: u64,
    /// Allocated data pages per chunk.
    pub chunk_used: [u32; NR_DATA_CHUNKS],
}

const _: () = assert!(size_of::<DataFileHeader>() == 24 + 4 * NR_DATA_CHUNKS);
const _: () = assert!(DATA_HDR_SIZE == 3 * SYS_PAGE_SIZE);

impl DataFileHeader {
    /// Initializes a freshly zeroed header in place.
    pub fn format(&mut self) {
        self.magic = DATA_MAGIC;
        self.file_size = DATA_HDR_SIZE as u64;
    }

    /// Validates a mapped header after open.
    pub fn validate(bytes: &[u8]) -> Result<&Self> {
        let hdr = Self::ref_from_prefix(bytes)
            .map_err(|e| eyre::eyre!("failed to read data file header: {e:?}"))?
            .0;
        ensure!(hdr.magic == DATA_MAGIC, "invalid magic in data file");
        ensure!(
            hdr.file_size >= DATA_HDR_SIZE as u64,
            "data file truncated: file_size {} below header size {}",
            hdr.file_size,
            DATA_HDR_SIZE
        );
        Ok(hdr)
    }
}
