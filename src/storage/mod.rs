//! # Storage Layer
//!
//! Everything below the B+tree: the two-file on-disk format, chunked
//! bitmap allocation, and LRU-cached memory-mapped pages.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------+   +----------------------------+
//! |   NodeFile (<name>.db)    |   |   DataFile (<name>.data)   |
//! |  4KB index page allocator |   |  64B data page allocator   |
//! |  chunk cache | page cache |   |  chunk cache | page cache  |
//! +------------+--------------+   +-------------+--------------+
//!              |                                |
//!        Cache<Chunk> / Cache<Page>  (LRU, msync+munmap on evict)
//!              |                                |
//!        Chunk (bitmap over a mapped region)    |
//!              |                                |
//!              +----------- map_region ---------+
//!                  (posix_fallocate + mmap MAP_SHARED)
//! ```
//!
//! Both files share one chunk geometry (512MB chunks with an embedded
//! allocation bitmap) but differ in allocation unit: the node file deals
//! in 4KB index pages holding exactly one tree node each, the data file in
//! 64B data pages coalesced into system-page-sized mappings by
//! [`DataIter`](data_file::DataIter). The 64-bit [`Ptr`](pointer::Ptr)
//! codec threads through all of it.
//!
//! ## Resource discipline
//!
//! Every mapped region is owned by exactly one place: a page cache entry,
//! a chunk cache entry, the long-lived header mapping of an open file, or
//! (transiently) the format routine, which unmaps before returning.
//! Eviction always flushes before unmapping.
//!
//! The layer is single-threaded by design; nothing here is `Send` or
//! `Sync`, and the compiler enforces that for free because the handles
//! hold raw pointers into their mappings.

pub mod cache;
pub mod chunk;
pub mod data_file;
pub mod headers;
mod mmap;
pub mod node_file;
pub mod page;
pub mod pointer;

pub use cache::{Cache, CacheItem};
pub use chunk::Chunk;
pub use data_file::{DataFile, DataIter};
pub use headers::{DataFileHeader, NodeFileHeader, DATA_HDR_SIZE, INDEX_HDR_SIZE};
pub use node_file::NodeFile;
pub use page::{Page, SyncMode};
pub use pointer::{in_sys_page_off, pages_for, Ptr};
