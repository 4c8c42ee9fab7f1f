//! # Node File
//!
//! The node file (`<name>.db`) holds every B+tree node in 4KB index pages,
//! allocated out of chunked bitmaps. This module owns the file descriptor,
//! the mapped header, a chunk-bitmap cache, and an index-page cache, and
//! exposes the allocator surface the tree is built on: [`NodeFile::get`]
//! dispenses a fresh page pointer, [`NodeFile::alloc`] faults a page into
//! the cache, [`NodeFile::free`] returns one to its bitmap.
//!
//! The header also carries the tree's root pointer and live kv count; the
//! tree reads and writes them through typed accessors here.

use std::fs::File;
use std::path::Path;
use std::ptr::NonNull;

use eyre::{ensure, Result, WrapErr};
use zerocopy::FromBytes;

use super::cache::Cache;
use super::chunk::Chunk;
use super::headers::{NodeFileHeader, INDEX_HDR_SIZE};
use super::mmap::{create_store_file, map_region, open_store_file};
use super::page::{Page, SyncMode};
use super::pointer::Ptr;
use crate::config::{
    CHUNK_CACHE_LIMIT, CHUNK_SIZE, INDEX_BITMAP_BITS, INDEX_CHUNK_HDR_SIZE,
    INDEX_PAGES_PER_CHUNK, INDEX_PAGE_CACHE_LIMIT, INDEX_PAGE_SIZE, NR_INDEX_CHUNKS,
};

/// Index-page allocator and cache layer over the node file.
pub struct NodeFile {
    file: File,
    hdr_base: *mut u8,
    // Keeps the header mapping alive for the lifetime of the handle;
    // accessed through `hdr_base`.
    _hdr_map: memmap2::MmapMut,
    chunks: Cache<Chunk>,
    pages: Cache<Page>,
}

impl NodeFile {
    /// Creates and formats a fresh node file, truncating any existing one.
    pub fn format(path: &Path) -> Result<()> {
        let file = create_store_file(path)?;

        let mut size = 0u64;
        let mut map = map_region(&file, &mut size, 0, INDEX_HDR_SIZE as u64)?;
        NodeFileHeader::mut_from_prefix(&mut map)
            .map_err(|e| eyre::eyre!("failed to map node file header: {e:?}"))?
            .0
            .format();

        map.flush()
            .wrap_err("failed to sync node file header after format")?;
        drop(map);
        file.sync_all()
            .wrap_err_with(|| format!("failed to fsync '{}'", path.display()))
    }

    /// Opens a formatted node file, validating its header.
    pub fn load(path: &Path) -> Result<NodeFile> {
        let file = open_store_file(path)?;

        let on_disk = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            on_disk >= INDEX_HDR_SIZE as u64,
            "node file '{}' truncated: {} bytes, header needs {}",
            path.display(),
            on_disk,
            INDEX_HDR_SIZE
        );

        let mut size = INDEX_HDR_SIZE as u64;
        let mut map = map_region(&file, &mut size, 0, INDEX_HDR_SIZE as u64)?;
        NodeFileHeader::validate(&map)
            .wrap_err_with(|| format!("failed to load '{}'", path.display()))?;

        let hdr_base = map.as_mut_ptr();
        Ok(NodeFile {
            file,
            hdr_base,
            _hdr_map: map,
            chunks: Cache::new(CHUNK_CACHE_LIMIT),
            pages: Cache::new(INDEX_PAGE_CACHE_LIMIT),
        })
    }

    pub fn hdr(&self) -> &NodeFileHeader {
        // SAFETY: the mapping is page aligned, at least INDEX_HDR_SIZE
        // bytes, validated at load, and owned by self.
        unsafe { &*(self.hdr_base as *const NodeFileHeader) }
    }

    pub fn hdr_mut(&mut self) -> &mut NodeFileHeader {
        // SAFETY: as in hdr(); &mut self gives exclusive access.
        unsafe { &mut *(self.hdr_base as *mut NodeFileHeader) }
    }

    pub fn root(&self) -> Ptr {
        self.hdr().root
    }

    pub fn set_root(&mut self, root: Ptr) {
        self.hdr_mut().root = root;
    }

    pub fn nr_kv(&self) -> u64 {
        self.hdr().nr_kv
    }

    pub fn kv_inc(&mut self) {
        self.hdr_mut().nr_kv += 1;
    }

    pub fn kv_dec(&mut self) {
        self.hdr_mut().nr_kv -= 1;
    }

    /// Allocates one index page and returns its pointer, or [`Ptr::NULL`]
    /// when every chunk is exhausted. Sweeps all chunks starting after the
    /// header's last-chunk hint, skipping chunks whose used counter says
    /// they are full.
    pub fn get(&mut self) -> Result<Ptr> {
        for i in 0..NR_INDEX_CHUNKS {
            let ck = (self.hdr().last_chunk as usize + 1 + i) % NR_INDEX_CHUNKS;
            if self.hdr().chunk_used[ck] == INDEX_PAGES_PER_CHUNK {
                continue;
            }
            let mut chunk = self.chunk(ck as u32)?;
            // SAFETY: the handle came from the chunk cache this call; no
            // other chunk handle is live.
            let chunk = unsafe { chunk.as_mut() };
            if let Some(bit) = chunk.get(1) {
                chunk.mask(bit, 1);
                chunk.mark_dirty();
                self.hdr_mut().chunk_used[ck] += 1;
                return Ok(Ptr::encode(INDEX_PAGE_SIZE as u32, ck as u32, bit as u64));
            }
        }
        Ok(Ptr::NULL)
    }

    /// Returns the cached page for `id`, mapping it on a miss.
    pub fn alloc(&mut self, id: Ptr) -> Result<NonNull<Page>> {
        if let Some(page) = self.pages.get(id.raw()) {
            return Ok(page);
        }
        let off = id.node_file_off();
        let mut size = self.hdr().file_size;
        let map = map_region(&self.file, &mut size, off, INDEX_PAGE_SIZE as u64)?;
        self.hdr_mut().file_size = size;
        self.pages.put(Page::new(id.raw(), map, SyncMode::Sync))
    }

    /// Releases the page at `id`: clears its bitmap bit, evicts it from the
    /// page cache, and decrements its chunk's used counter.
    pub fn free(&mut self, id: Ptr) -> Result<()> {
        let ck = id.chunk();
        let mut chunk = self.chunk(ck)?;
        // SAFETY: sole live chunk handle, as in get().
        unsafe { chunk.as_mut() }.unmask(id.id() as u32, 1);
        self.pages.evict(id.raw())?;
        self.hdr_mut().chunk_used[ck as usize] -= 1;
        Ok(())
    }

    /// Flushes chunk bitmaps and cached pages, then fsyncs.
    pub fn sync(&mut self) -> Result<()> {
        self.chunks.sync()?;
        self.pages.sync()?;
        self.file.sync_all().wrap_err("failed to fsync node file")
    }

    fn chunk(&mut self, ck: u32) -> Result<NonNull<Chunk>> {
        if let Some(chunk) = self.chunks.get(ck as u64) {
            return Ok(chunk);
        }
        let off = INDEX_HDR_SIZE as u64 + ck as u64 * CHUNK_SIZE;
        let mut size = self.hdr().file_size;
        let map = map_region(&self.file, &mut size, off, INDEX_CHUNK_HDR_SIZE as u64)?;
        self.hdr_mut().file_size = size;
        let reserved = (INDEX_CHUNK_HDR_SIZE / INDEX_PAGE_SIZE) as u32;
        self.chunks
            .put(Chunk::new(ck as u64, map, reserved, INDEX_BITMAP_BITS as u32))
    }

    #[cfg(test)]
    fn chunk_stats(&mut self, ck: u32) -> Result<(u32, u32)> {
        let used = self.hdr().chunk_used[ck as usize];
        let mut chunk = self.chunk(ck)?;
        // SAFETY: sole live chunk handle in this test helper.
        let pop = unsafe { chunk.as_mut() }.popcount();
        Ok((used, pop))
    }
}

impl Drop for NodeFile {
    fn drop(&mut self) {
        // Best-effort close: flush both caches, then fsync.
        let _ = self.chunks.clear();
        let _ = self.pages.clear();
        let _ = self.file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_node_file(dir: &tempfile::TempDir) -> NodeFile {
        let path = dir.path().join("test.db");
        NodeFile::format(&path).unwrap();
        NodeFile::load(&path).unwrap()
    }

    #[test]
    fn format_then_load() {
        let dir = tempdir().unwrap();
        let nf = open_node_file(&dir);

        assert!(nf.root().is_null());
        assert_eq!(nf.nr_kv(), 0);
        assert_eq!(nf.hdr().file_size, INDEX_HDR_SIZE as u64);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.db");
        std::fs::write(&path, vec![0u8; INDEX_HDR_SIZE]).unwrap();

        assert!(NodeFile::load(&path).is_err());
    }

    #[test]
    fn load_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.db");
        std::fs::write(&path, b"CHAOS").unwrap();

        assert!(NodeFile::load(&path).is_err());
    }

    #[test]
    fn allocate_and_write_pages() {
        let dir = tempdir().unwrap();
        let mut nf = open_node_file(&dir);

        let a = nf.get().unwrap();
        let b = nf.get().unwrap();
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
        assert_eq!(a.length(), INDEX_PAGE_SIZE as u32);

        let page = nf.alloc(a).unwrap();
        // SAFETY: single-threaded test; page is resident.
        unsafe {
            *page.as_ref().view_mut::<u64>(0) = 0x1122_3344;
            page.as_ref().mark_dirty();
        }
        nf.sync().unwrap();

        let again = nf.alloc(a).unwrap();
        // SAFETY: as above.
        assert_eq!(unsafe { *again.as_ref().view_mut::<u64>(0) }, 0x1122_3344);
    }

    #[test]
    fn free_releases_the_bit_and_counter() {
        let dir = tempdir().unwrap();
        let mut nf = open_node_file(&dir);

        let a = nf.get().unwrap();
        nf.alloc(a).unwrap();
        let (used, pop) = nf.chunk_stats(a.chunk()).unwrap();
        assert_eq!((used, pop), (1, 1));

        nf.free(a).unwrap();
        let (used, pop) = nf.chunk_stats(a.chunk()).unwrap();
        assert_eq!((used, pop), (0, 0));

        // The bit is reusable; the cursor has moved past it, but a fresh
        // allocation must still land somewhere valid.
        let b = nf.get().unwrap();
        assert!(!b.is_null());
    }

    #[test]
    fn used_counter_tracks_popcount() {
        let dir = tempdir().unwrap();
        let mut nf = open_node_file(&dir);

        let ids: Vec<Ptr> = (0..16).map(|_| nf.get().unwrap()).collect();
        let (used, pop) = nf.chunk_stats(0).unwrap();
        assert_eq!(used, pop);
        assert_eq!(used, 16);

        for id in &ids[..8] {
            nf.free(*id).unwrap();
        }
        let (used, pop) = nf.chunk_stats(0).unwrap();
        assert_eq!(used, pop);
        assert_eq!(used, 8);
    }

    #[test]
    fn pages_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        NodeFile::format(&path).unwrap();

        let id;
        {
            let mut nf = NodeFile::load(&path).unwrap();
            id = nf.get().unwrap();
            let page = nf.alloc(id).unwrap();
            // SAFETY: single-threaded test; page is resident.
            unsafe {
                page.as_ref().slice_mut(0, 4).copy_from_slice(b"node");
                page.as_ref().mark_dirty();
            }
            nf.sync().unwrap();
        }

        let mut nf = NodeFile::load(&path).unwrap();
        let page = nf.alloc(id).unwrap();
        // SAFETY: as above.
        assert_eq!(unsafe { &page.as_ref().bytes()[..4] }, b"node");
    }
}
