//! # Page Handles
//!
//! A [`Page`] owns one mapped region and its dirty state. Index pages are
//! flushed synchronously (`msync(MS_SYNC)`) because the tree depends on
//! node writes being durable before the header that points at them; data
//! pages flush asynchronously, matching the best-effort durability contract
//! of the store.
//!
//! Pages live inside a [`Cache`](super::cache::Cache) and are reinterpreted
//! in place as B+tree nodes, so the handle exposes raw typed views over the
//! mapping. The engine is single-threaded; a handle is neither `Send` nor
//! `Sync`.

use std::cell::Cell;

use eyre::Result;
use memmap2::MmapMut;

use super::cache::CacheItem;

/// Flush discipline for a mapped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// `msync(MS_SYNC)`; used for index pages and chunk bitmaps.
    Sync,
    /// `msync(MS_ASYNC)`; used for data pages.
    Async,
}

/// An owned mapped region with a dirty flag.
pub struct Page {
    id: u64,
    dirty: Cell<bool>,
    mode: SyncMode,
    base: *mut u8,
    map: MmapMut,
}

impl Page {
    pub fn new(id: u64, mut map: MmapMut, mode: SyncMode) -> Self {
        let base = map.as_mut_ptr();
        Self {
            id,
            dirty: Cell::new(false),
            mode,
            base,
            map,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Marks the page as needing a flush. Shared so that a node view and
    /// its page handle can be live at the same time.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    fn flush(&self) -> Result<()> {
        match self.mode {
            SyncMode::Sync => self.map.flush()?,
            SyncMode::Async => self.map.flush_async()?,
        }
        Ok(())
    }

    /// Reinterprets the mapping at byte offset `off` as a `T`.
    ///
    /// # Safety
    ///
    /// `off + size_of::<T>()` must lie within the mapping, `off` must be
    /// aligned for `T`, and the caller must uphold the engine's aliasing
    /// discipline: views into one page are only used on the single engine
    /// thread and never outlive the page's residence in its cache.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn view_mut<T>(&self, off: usize) -> &mut T {
        debug_assert!(off + std::mem::size_of::<T>() <= self.map.len());
        &mut *self.base.add(off).cast::<T>()
    }

    /// Mutable byte window at `off`, through a shared handle.
    ///
    /// # Safety
    ///
    /// Same contract as [`view_mut`](Self::view_mut): in-bounds and
    /// exclusive use on the engine thread.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, off: usize, len: usize) -> &mut [u8] {
        debug_assert!(off + len <= self.map.len());
        std::slice::from_raw_parts_mut(self.base.add(off), len)
    }
}

impl CacheItem for Page {
    fn id(&self) -> u64 {
        self.id
    }

    /// With `unmap` the region is flushed unconditionally and the caller
    /// drops the handle (dropping unmaps); otherwise only a dirty page is
    /// flushed, and the flag is cleared.
    fn sync(&mut self, unmap: bool) -> Result<()> {
        if unmap {
            return self.flush();
        }
        if self.dirty.replace(false) {
            self.flush()?;
        }
        Ok(())
    }
}
