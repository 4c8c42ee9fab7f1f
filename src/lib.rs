//! # chaoskv - Embedded On-Disk Ordered Key-Value Store
//!
//! An embedded, single-process key-value store over opaque byte strings,
//! with point operations and ordered range scans under a pluggable
//! comparator. The persistence engine is a disk-resident B+tree whose
//! nodes live in fixed-size index pages, with keys and values stored as
//! blobs in a separately managed data file of 64-byte pages, all accessed
//! through memory-mapped, LRU-cached regions.
//!
//! ## Quick Start
//!
//! ```ignore
//! use chaoskv::Store;
//!
//! let mut store = Store::open("./db")?;
//! store.put(b"alpha", b"one")?;
//! assert_eq!(store.get(b"alpha")?, b"one");
//!
//! let mut it = store.range(b"a", b"z")?;
//! while it.valid() {
//!     println!("{:?} => {:?}", it.key()?, it.val()?);
//!     it.next()?;
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------+
//! |            Store (size checks)           |
//! +------------------------------------------+
//! |      BpTree (search/insert/delete,       |
//! |         range over leaf chain)           |
//! +---------------------+--------------------+
//! |  NodeFile           |  DataFile          |
//! |  4KB tree pages     |  64B blob pages    |
//! +---------------------+--------------------+
//! |  chunk bitmaps, LRU caches, mmap         |
//! +------------------------------------------+
//! ```
//!
//! Two files per store: `<name>.db` holds tree nodes and the root,
//! `<name>.data` holds key/value bytes. Both are carved into 512MB chunks
//! with embedded allocation bitmaps and are addressed by one 64-bit
//! pointer type packing `(length, chunk, offset)`.
//!
//! ## Limits and guarantees
//!
//! - Keys and values: 1 byte to ~16MB, unique keys, no overwrite on put.
//! - Single-threaded: nothing in the crate is `Send` or `Sync`.
//! - Durability is best-effort (`msync` + `fsync` on flush); there is no
//!   journal, and a crash mid-operation can leave the files inconsistent.
//! - On-disk integers are host-endian; files do not port across
//!   endianness.

pub mod btree;
pub mod comparator;
pub mod config;
pub mod storage;
mod store;

pub use btree::{BpTree, RangeIter};
pub use comparator::{BytewiseComparator, Comparator};
pub use store::Store;
