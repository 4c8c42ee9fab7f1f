//! Configuration constants for the storage engine.
//!
//! Import layout constants from here rather than redefining them locally;
//! the pointer codec, chunk geometry, and cache sizing all depend on each
//! other and are derived in one place.

mod constants;

pub use constants::*;
