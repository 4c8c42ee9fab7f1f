//! # LRU Cache for Mapped Regions
//!
//! Bounded cache from logical id to an owned item (a mapped [`Page`] or
//! [`Chunk`] bitmap), evicting the least-recently-used entry by flushing
//! and unmapping it. Recency is an intrusive doubly-linked list threaded
//! through heap-allocated entries: moving an entry to "most recent" is an
//! O(1) splice, and entry addresses are stable for the entry's whole
//! residence, so callers can hold raw handles to cached items across
//! unrelated cache calls (the tree works on several nodes at once while
//! the caches keep faulting pages in underneath it).
//!
//! [`Cache::put`] hands back such a handle, and [`Cache::get`] revalidates
//! one. A handle is invalidated by the entry's eviction, and only then.
//!
//! The cache is single-threaded like the rest of the engine; eviction
//! performs `msync` then `munmap`, in that order.
//!
//! [`Page`]: super::page::Page
//! [`Chunk`]: super::chunk::Chunk

use std::ptr::{self, NonNull};

use eyre::{ensure, Result};
use hashbrown::HashMap;

/// Contract for cacheable items.
pub trait CacheItem {
    fn id(&self) -> u64;

    /// Flush the backing region. With `unmap`, flush unconditionally; the
    /// caller drops the item (and its mapping) immediately after. Without,
    /// flush only when dirty and clear the dirty state.
    fn sync(&mut self, unmap: bool) -> Result<()>;
}

struct Entry<T> {
    item: T,
    prev: *mut Entry<T>,
    next: *mut Entry<T>,
}

/// Bounded id -> item map with LRU eviction.
pub struct Cache<T: CacheItem> {
    map: HashMap<u64, NonNull<Entry<T>>>,
    /// Most recently used.
    head: *mut Entry<T>,
    /// Least recently used.
    tail: *mut Entry<T>,
    limit: usize,
}

impl<T: CacheItem> Cache<T> {
    pub fn new(limit: usize) -> Self {
        debug_assert!(limit >= 1);
        Self {
            map: HashMap::new(),
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts `item` as most recent and returns a handle to it, evicting
    /// the least-recently-used entry if the cache overflows. Inserting an
    /// id that is already cached is a caller bug and fails.
    pub fn put(&mut self, item: T) -> Result<NonNull<T>> {
        let id = item.id();
        ensure!(
            !self.map.contains_key(&id),
            "cache entry {:#x} inserted twice",
            id
        );

        let entry = Box::into_raw(Box::new(Entry {
            item,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }));
        self.push_front(entry);
        // SAFETY: Box::into_raw never returns null.
        self.map.insert(id, unsafe { NonNull::new_unchecked(entry) });

        if self.map.len() > self.limit {
            if let Some(lru) = NonNull::new(self.tail) {
                self.evict_entry(lru)?;
            }
        }

        // SAFETY: the entry was just linked in; its box outlives this call.
        Ok(unsafe { NonNull::from(&mut (*entry).item) })
    }

    /// Looks up `id`, promoting the entry to most recent on a hit.
    pub fn get(&mut self, id: u64) -> Option<NonNull<T>> {
        let entry = *self.map.get(&id)?;
        let raw = entry.as_ptr();
        if raw != self.head {
            self.unlink(raw);
            self.push_front(raw);
        }
        // SAFETY: the entry is resident; its box is owned by the cache.
        Some(unsafe { NonNull::from(&mut (*raw).item) })
    }

    /// Evicts `id` if resident: sync(unmap), then drop.
    pub fn evict(&mut self, id: u64) -> Result<()> {
        match self.map.get(&id) {
            Some(&entry) => self.evict_entry(entry),
            None => Ok(()),
        }
    }

    /// Flushes every resident item, most recent first, without unmapping.
    pub fn sync(&mut self) -> Result<()> {
        let mut cur = self.head;
        while let Some(mut entry) = NonNull::new(cur) {
            // SAFETY: list nodes are valid boxed entries owned by the map.
            let entry = unsafe { entry.as_mut() };
            entry.item.sync(false)?;
            cur = entry.next;
        }
        Ok(())
    }

    /// Evicts every entry. On sync failure the entry is still released and
    /// the first error is reported after the sweep completes.
    pub fn clear(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(entry) = NonNull::new(self.head) {
            if let Err(e) = self.evict_entry(entry) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn evict_entry(&mut self, entry: NonNull<Entry<T>>) -> Result<()> {
        let raw = entry.as_ptr();
        self.unlink(raw);
        // SAFETY: `raw` came from Box::into_raw at insertion and is removed
        // from both the list and the map before the box is reclaimed, so it
        // is dropped exactly once.
        let mut boxed = unsafe {
            self.map.remove(&(*raw).item.id());
            Box::from_raw(raw)
        };
        let result = boxed.item.sync(true);
        drop(boxed);
        result
    }

    fn push_front(&mut self, entry: *mut Entry<T>) {
        // SAFETY: `entry` and `self.head` are valid or null list nodes; all
        // link surgery happens under &mut self.
        unsafe {
            (*entry).prev = ptr::null_mut();
            (*entry).next = self.head;
            if let Some(old) = self.head.as_mut() {
                old.prev = entry;
            } else {
                self.tail = entry;
            }
            self.head = entry;
        }
    }

    fn unlink(&mut self, entry: *mut Entry<T>) {
        // SAFETY: as in push_front; prev/next of a linked entry are valid
        // or null.
        unsafe {
            let prev = (*entry).prev;
            let next = (*entry).next;
            if let Some(p) = prev.as_mut() {
                p.next = next;
            } else {
                self.head = next;
            }
            if let Some(n) = next.as_mut() {
                n.prev = prev;
            } else {
                self.tail = prev;
            }
        }
    }
}

impl<T: CacheItem> Drop for Cache<T> {
    fn drop(&mut self) {
        // Flush what we can; every entry is released regardless.
        let _ = self.clear();
    }
}
