//! Bulk workloads: growth through many leaf splits, interior splits with
//! reopen, and full teardown back to an empty tree.

use chaoskv::Store;
use tempfile::tempdir;

/// Insert 20,000 keys where key i is a run of i+1 'a' bytes (value =
/// key), then delete them all with periodic flushes. Exercises blob runs
/// from 1 byte to ~20KB and every leaf rebalancing path.
#[test]
fn grow_then_shrink_20k_variable_length_keys() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path()).unwrap();

    let n = 20_000usize;
    let blob = vec![b'a'; n];

    for i in 0..n {
        let v = &blob[..i + 1];
        assert!(store.put(v, v).unwrap(), "put {} failed", i + 1);
        if i % 1000 == 0 {
            store.flush().unwrap();
        }
    }

    assert_eq!(store.items(), n as u64);
    assert_eq!(store.count().unwrap(), n as u64);

    for i in 0..n {
        let v = &blob[..i + 1];
        assert_eq!(store.get(v).unwrap(), v, "length {}", i + 1);
    }

    for i in 0..n {
        let v = &blob[..i + 1];
        store.del(v).unwrap();
        if i % 1000 == 0 {
            store.flush().unwrap();
        }
    }

    assert_eq!(store.items(), 0);
    assert_eq!(store.count().unwrap(), 0);
    for i in (0..n).step_by(997) {
        let v = &blob[..i + 1];
        assert!(!store.contains(v).unwrap(), "length {}", i + 1);
    }

    // A dead tree must accept new life.
    assert!(store.put(b"phoenix", b"rises").unwrap());
    assert_eq!(store.items(), 1);
}

/// Enough sequential keys to split interior nodes (several hundred
/// leaves), then a close/reopen and a full verification pass. Stresses
/// child reparenting during interior splits: a stale parent pointer
/// surfaces as a corrupted walk after reopen.
#[test]
fn interior_splits_survive_reopen() {
    let dir = tempdir().unwrap();
    let n = 64_000usize;

    {
        let mut store = Store::open(dir.path()).unwrap();
        for i in 0..n {
            let key = format!("key{i:06}");
            assert!(store.put(key.as_bytes(), key.as_bytes()).unwrap(), "{key}");
        }
        assert_eq!(store.items(), n as u64);
        store.flush().unwrap();
    }

    let mut store = Store::open(dir.path()).unwrap();
    assert_eq!(store.items(), n as u64);
    assert_eq!(store.count().unwrap(), n as u64);

    for i in (0..n).step_by(7) {
        let key = format!("key{i:06}");
        assert_eq!(store.get(key.as_bytes()).unwrap(), key.clone().into_bytes());
    }

    // The full scan must visit every key exactly once, in order.
    let mut it = store.range(b"key000000", b"key063999").unwrap();
    let mut i = 0usize;
    while it.valid() {
        let expect = format!("key{i:06}");
        assert_eq!(it.key().unwrap(), expect.into_bytes());
        it.next().unwrap();
        i += 1;
    }
    assert_eq!(i, n);
}

/// Reverse-order inserts drive the borrow-left/merge-left paths on
/// deletion the same way forward order drives the right-hand ones.
#[test]
fn reverse_insert_interleaved_delete() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path()).unwrap();

    let n = 3_000usize;
    for i in (0..n).rev() {
        let key = format!("key{i:05}");
        store.put(key.as_bytes(), key.as_bytes()).unwrap();
    }

    for i in (0..n).step_by(3) {
        let key = format!("key{i:05}");
        store.del(key.as_bytes()).unwrap();
    }

    assert_eq!(store.items(), (n - n.div_ceil(3)) as u64);
    for i in 0..n {
        let key = format!("key{i:05}");
        assert_eq!(store.contains(key.as_bytes()).unwrap(), i % 3 != 0, "{key}");
    }
}
