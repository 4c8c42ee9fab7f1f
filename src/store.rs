//! # Store Facade
//!
//! [`Store`] is the public face of the engine: a thin, size-checked
//! wrapper over the B+tree. It enforces the key/value length bounds the
//! pointer encoding can represent and keeps everything else to simple
//! forwarding, so the behavior documented on [`BpTree`] is the behavior
//! of the store.

use std::path::Path;

use eyre::Result;

use crate::btree::{BpTree, RangeIter};
use crate::comparator::{BytewiseComparator, Comparator};
use crate::config::{DEFAULT_STORE_NAME, MAX_KV_SIZE};

/// An embedded, single-process, on-disk ordered key-value store.
///
/// Not thread-safe; all methods take `&mut self` and the engine assumes a
/// single caller.
pub struct Store<C: Comparator = BytewiseComparator> {
    tree: BpTree<C>,
}

impl Store<BytewiseComparator> {
    /// Opens the store named [`DEFAULT_STORE_NAME`] under `root` with the
    /// default byte-order comparator.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_named(root, DEFAULT_STORE_NAME)
    }
}

impl<C: Comparator> Store<C> {
    /// Opens (creating and formatting on first use) the store files
    /// `<root>/<name>.db` and `<root>/<name>.data`.
    pub fn open_named(root: impl AsRef<Path>, name: &str) -> Result<Self> {
        Ok(Self {
            tree: BpTree::open(root.as_ref(), name)?,
        })
    }

    /// Inserts `key -> val`. Returns false without touching the store when
    /// the key is already present, when either length is outside
    /// `[1, MAX_KV_SIZE]`, or when space runs out.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<bool> {
        if !valid_len(key) || !valid_len(val) {
            return Ok(false);
        }
        self.tree.put(key, val)
    }

    /// The value for `key`, or an empty vector when absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.tree.get(key)
    }

    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        self.tree.contains(key)
    }

    /// Removes `key`; absent keys are a no-op.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        self.tree.del(key)
    }

    /// Inclusive ordered scan of `[from, to]`; misordered bounds are
    /// swapped, absent bounds snap inward.
    pub fn range(&mut self, from: &[u8], to: &[u8]) -> Result<RangeIter<'_, C>> {
        self.tree.range(from, to)
    }

    /// Flushes both store files.
    pub fn flush(&mut self) -> Result<()> {
        self.tree.flush()
    }

    /// Live entry count from the header; O(1).
    pub fn items(&self) -> u64 {
        self.tree.items()
    }

    /// Live entry count by walking the leaf chain; O(leaves).
    pub fn count(&mut self) -> Result<u64> {
        self.tree.count()
    }
}

fn valid_len(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.len() <= MAX_KV_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_both_files() {
        let dir = tempdir().unwrap();
        let _store = Store::open(dir.path()).unwrap();

        assert!(dir.path().join("chaos.db").exists());
        assert!(dir.path().join("chaos.data").exists());
    }

    #[test]
    fn named_store_uses_its_own_files() {
        let dir = tempdir().unwrap();
        let _store: Store = Store::open_named(dir.path(), "orders").unwrap();

        assert!(dir.path().join("orders.db").exists());
        assert!(dir.path().join("orders.data").exists());
    }

    #[test]
    fn size_bounds_are_enforced() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();

        assert!(!store.put(b"", b"v").unwrap());
        assert!(!store.put(b"k", b"").unwrap());
        let oversized = vec![0u8; MAX_KV_SIZE + 1];
        assert!(!store.put(&oversized, b"v").unwrap());
        assert!(!store.put(b"k", &oversized).unwrap());
        assert_eq!(store.items(), 0);

        let max = vec![7u8; 4096];
        assert!(store.put(b"k", &max).unwrap());
        assert_eq!(store.get(b"k").unwrap(), max);
    }

    #[test]
    fn basic_operations_forward_to_the_tree() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();

        assert!(store.put(b"a", b"1").unwrap());
        assert!(store.contains(b"a").unwrap());
        assert_eq!(store.get(b"a").unwrap(), b"1");
        assert_eq!(store.items(), 1);
        assert_eq!(store.count().unwrap(), 1);

        store.del(b"a").unwrap();
        assert!(!store.contains(b"a").unwrap());
        store.flush().unwrap();
    }
}
