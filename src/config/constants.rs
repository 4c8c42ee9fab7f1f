//! # Layout Constants
//!
//! This module centralizes every on-disk layout constant. The values are
//! tightly coupled: the pointer codec, the chunk geometry, and the bitmap
//! sizes are all derived from the same bit budget, so they live together
//! here with their derivations spelled out.
//!
//! ## Logical pointer layout
//!
//! A logical pointer packs a blob length, a chunk index, and a page offset
//! into 64 bits:
//!
//! ```text
//! +----------+---------+------------------------+
//! |  length  | chunk   |  page offset in chunk  |
//! +----------+---------+------------------------+
//! | 24 bits  | 11 bits |        29 bits         |
//! +----------+---------+------------------------+
//! ```
//!
//! - 24 length bits cap keys and values at ~16MB
//! - 11 chunk bits cap a file at 2048 chunks
//! - 29 offset bits address one 512MB chunk at byte granularity
//!
//! ## Dependency graph
//!
//! ```text
//! CHUNK_SIZE (1 << OFFSET_BITS = 512MB)
//!       |
//!       +-> INDEX_BITMAP_BITS = CHUNK_SIZE / INDEX_PAGE_SIZE  (2^17)
//!       |         one bit per 4KB index page
//!       |
//!       +-> DATA_BITMAP_BITS  = CHUNK_SIZE / DATA_PAGE_SIZE   (2^23)
//!                 one bit per 64B data page
//!
//! INDEX_CHUNK_HDR_SIZE / DATA_CHUNK_HDR_SIZE
//!       bitmap bytes rounded up to the chunk's allocation unit; both
//!       must stay 4K aligned so data pages never share a system page
//!       with the bitmap
//! ```
//!
//! Changing any page size requires revisiting the chunk header rounding
//! below; the compile-time assertions will catch a misaligned result.

/// Bits of a logical pointer devoted to the blob byte length.
pub const LENGTH_BITS: u32 = 24;

/// Bits of a logical pointer devoted to the chunk index.
pub const CHUNK_BITS: u32 = 11;

/// Bits of a logical pointer devoted to the page offset within a chunk.
pub const OFFSET_BITS: u32 = 29;

/// Maximum byte length of a single key or value (~16MB).
pub const MAX_KV_SIZE: usize = (1 << LENGTH_BITS) - 1;

/// The mmap granule. The engine assumes 4KB system pages.
pub const SYS_PAGE_SIZE: usize = 4096;

/// Allocation unit of the node file; each B+tree node fills one.
pub const INDEX_PAGE_SIZE: usize = SYS_PAGE_SIZE;

/// Allocation unit of the data file; blobs occupy contiguous runs.
pub const DATA_PAGE_SIZE: usize = 64;

/// Size of one chunk (512MB), the unit of allocator striping.
pub const CHUNK_SIZE: u64 = 1 << OFFSET_BITS;

/// Chunk capacity of the node file.
pub const NR_INDEX_CHUNKS: usize = 1 << 10;

/// Chunk capacity of the data file.
pub const NR_DATA_CHUNKS: usize = 1 << CHUNK_BITS;

/// Data pages per system page (64).
pub const DATA_PER_SYS_PAGE: usize = SYS_PAGE_SIZE / DATA_PAGE_SIZE;

/// Allocation bitmap bits per node-file chunk, one per index page.
pub const INDEX_BITMAP_BITS: usize = (CHUNK_SIZE as usize) / INDEX_PAGE_SIZE;

/// Allocation bitmap bits per data-file chunk, one per data page.
pub const DATA_BITMAP_BITS: usize = (CHUNK_SIZE as usize) / DATA_PAGE_SIZE;

/// Bytes reserved at the head of a node-file chunk for its bitmap,
/// rounded up to whole index pages.
pub const INDEX_CHUNK_HDR_SIZE: usize =
    (INDEX_BITMAP_BITS / 8).div_ceil(INDEX_PAGE_SIZE) * INDEX_PAGE_SIZE;

/// Bytes reserved at the head of a data-file chunk for its bitmap,
/// rounded up to whole data pages.
pub const DATA_CHUNK_HDR_SIZE: usize =
    (DATA_BITMAP_BITS / 8).div_ceil(DATA_PAGE_SIZE) * DATA_PAGE_SIZE;

/// Index pages addressable by one chunk bitmap.
pub const INDEX_PAGES_PER_CHUNK: u32 = INDEX_BITMAP_BITS as u32;

/// Data pages addressable by one chunk bitmap.
pub const DATA_PAGES_PER_CHUNK: u32 = DATA_BITMAP_BITS as u32;

/// Node file magic ("CHAOS-DB").
pub const NODE_MAGIC: u64 = 0x4348414F532D4442;

/// Data file magic ("CHAOS-DA").
pub const DATA_MAGIC: u64 = 0x4348414F532D4441;

/// Default store name when the caller does not supply one.
pub const DEFAULT_STORE_NAME: &str = "chaos";

// ============================================================================
// CACHE LIMITS
// Entry counts, not bytes. A chunk entry maps an entire chunk bitmap
// (16KB for the node file, 1MB for the data file); a page entry maps one
// system page.
// ============================================================================

/// Chunk-bitmap cache capacity, shared sizing for both files.
pub const CHUNK_CACHE_LIMIT: usize = 32;

/// Node-file page cache capacity (4KB index pages).
pub const INDEX_PAGE_CACHE_LIMIT: usize = 256;

/// Data-file page cache capacity (4KB system pages, 64MB ceiling).
pub const DATA_PAGE_CACHE_LIMIT: usize = 16384;

const _: () = assert!(
    INDEX_CHUNK_HDR_SIZE & (SYS_PAGE_SIZE - 1) == 0,
    "node-file chunk header must be 4K aligned"
);

const _: () = assert!(
    DATA_CHUNK_HDR_SIZE & (SYS_PAGE_SIZE - 1) == 0,
    "data-file chunk header must be 4K aligned"
);

const _: () = assert!(
    DATA_PER_SYS_PAGE.is_power_of_two(),
    "the data iterator masks with DATA_PER_SYS_PAGE - 1"
);

const _: () = assert!(
    CHUNK_SIZE % SYS_PAGE_SIZE as u64 == 0,
    "chunks must cover whole system pages"
);
