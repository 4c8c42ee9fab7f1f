//! # B+Tree
//!
//! A disk-resident B+tree whose nodes live in fixed-size index pages of
//! the node file, while every key and value is a blob in the data file
//! addressed by a 64-bit logical pointer. All node mutation happens in
//! place over the mapped pages; the storage layer's caches and dirty
//! tracking decide when anything hits disk.
//!
//! - [`node`]: on-page node layouts and the shift helpers they share
//! - [`tree`]: search, insert with splitting, delete with rebalancing
//! - [`iter`]: the inclusive range cursor over the leaf sibling list
//!
//! The tree stores unique keys in comparator order; an insert of an
//! existing key is rejected rather than overwritten.

pub mod iter;
pub mod node;
pub mod tree;

pub use iter::RangeIter;
pub use node::{IntlNode, KeyChild, KeyVal, LeafNode, NodeHeader, NODE_INTL, NODE_LEAF, ORDER};
pub use tree::BpTree;
