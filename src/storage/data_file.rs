//! # Data File
//!
//! The data file (`<name>.data`) stores key and value blobs as contiguous
//! runs of 64-byte data pages, allocated out of chunked bitmaps exactly
//! like the node file but at a much finer granularity. A blob's pointer
//! carries its byte length, so reading one back needs no per-blob metadata
//! on disk.
//!
//! Data pages are far smaller than the mmap granule, so all I/O goes
//! through [`DataIter`], which walks a blob's run one *system* page at a
//! time, faulting 4KB mappings into the page cache and yielding each one
//! with the byte window that belongs to the blob. Writes use the same walk
//! and mark every touched page dirty.

use std::fs::File;
use std::path::Path;
use std::ptr::NonNull;

use eyre::{ensure, Result, WrapErr};
use zerocopy::FromBytes;

use super::cache::Cache;
use super::chunk::Chunk;
use super::headers::{DataFileHeader, DATA_HDR_SIZE};
use super::mmap::{create_store_file, map_region, open_store_file};
use super::page::{Page, SyncMode};
use super::pointer::{in_sys_page_off, pages_for, Ptr};
use crate::config::{
    CHUNK_CACHE_LIMIT, CHUNK_SIZE, DATA_BITMAP_BITS, DATA_CHUNK_HDR_SIZE, DATA_PAGES_PER_CHUNK,
    DATA_PAGE_CACHE_LIMIT, DATA_PAGE_SIZE, DATA_PER_SYS_PAGE, NR_DATA_CHUNKS, SYS_PAGE_SIZE,
};

/// Blob allocator with streaming I/O over the data file.
pub struct DataFile {
    file: File,
    hdr_base: *mut u8,
    // Keeps the header mapping alive; accessed through `hdr_base`.
    hdr_map: memmap2::MmapMut,
    chunks: Cache<Chunk>,
    pages: Cache<Page>,
}

impl DataFile {
    /// Creates and formats a fresh data file, truncating any existing one.
    pub fn format(path: &Path) -> Result<()> {
        let file = create_store_file(path)?;

        let mut size = 0u64;
        let mut map = map_region(&file, &mut size, 0, DATA_HDR_SIZE as u64)?;
        DataFileHeader::mut_from_prefix(&mut map)
            .map_err(|e| eyre::eyre!("failed to map data file header: {e:?}"))?
            .0
            .format();

        map.flush()
            .wrap_err("failed to sync data file header after format")?;
        drop(map);
        file.sync_all()
            .wrap_err_with(|| format!("failed to fsync '{}'", path.display()))
    }

    /// Opens a formatted data file, validating its header.
    pub fn load(path: &Path) -> Result<DataFile> {
        let file = open_store_file(path)?;

        let on_disk = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            on_disk >= DATA_HDR_SIZE as u64,
            "data file '{}' truncated: {} bytes, header needs {}",
            path.display(),
            on_disk,
            DATA_HDR_SIZE
        );

        let mut size = DATA_HDR_SIZE as u64;
        let mut map = map_region(&file, &mut size, 0, DATA_HDR_SIZE as u64)?;
        DataFileHeader::validate(&map)
            .wrap_err_with(|| format!("failed to load '{}'", path.display()))?;

        let hdr_base = map.as_mut_ptr();
        Ok(DataFile {
            file,
            hdr_base,
            hdr_map: map,
            chunks: Cache::new(CHUNK_CACHE_LIMIT),
            pages: Cache::new(DATA_PAGE_CACHE_LIMIT),
        })
    }

    fn hdr(&self) -> &DataFileHeader {
        // SAFETY: the mapping is page aligned, at least DATA_HDR_SIZE
        // bytes, validated at load, and owned by self.
        unsafe { &*(self.hdr_base as *const DataFileHeader) }
    }

    fn hdr_mut(&mut self) -> &mut DataFileHeader {
        // SAFETY: as in hdr(); &mut self gives exclusive access.
        unsafe { &mut *(self.hdr_base as *mut DataFileHeader) }
    }

    /// Stores `bytes` as one contiguous run of data pages and returns its
    /// pointer, or [`Ptr::NULL`] when no chunk can hold the run.
    pub fn store(&mut self, bytes: &[u8]) -> Result<Ptr> {
        let id = self.find_space(bytes.len())?;
        if id.is_null() {
            return Ok(Ptr::NULL);
        }
        self.iter(id).fill(bytes)?;
        Ok(id)
    }

    /// Returns an iterator over the blob at `id`. No I/O happens until the
    /// iterator is driven.
    pub fn iter(&mut self, id: Ptr) -> DataIter<'_> {
        DataIter {
            remaining: id.length(),
            ckid: id.chunk(),
            used: in_sys_page_off(id.id()) as u32,
            cursor: id.id(),
            id,
            file_off: id.data_file_off(),
            file: self,
        }
    }

    /// Reads the whole blob at `id` into a fresh buffer.
    pub fn read(&mut self, id: Ptr) -> Result<Vec<u8>> {
        self.iter(id).collect()
    }

    /// Releases the blob at `id`: evicts every covered system page, clears
    /// the run's bits, and decrements the chunk's used counter.
    pub fn free(&mut self, id: Ptr) -> Result<()> {
        let ck = id.chunk();
        let npages = pages_for(id.length() as usize);

        let first_sys = id.id() / DATA_PER_SYS_PAGE as u64;
        let last_sys = (id.id() + npages - 1) / DATA_PER_SYS_PAGE as u64;
        for sys in first_sys..=last_sys {
            self.pages.evict(((ck as u64) << 32) | sys)?;
        }

        let mut chunk = self.chunk(ck)?;
        // SAFETY: sole live chunk handle; single engine thread.
        unsafe { chunk.as_mut() }.unmask(id.id() as u32, npages as u32);
        self.hdr_mut().chunk_used[ck as usize] -= npages as u32;
        Ok(())
    }

    /// Flushes cached pages, chunk bitmaps, and the header, then fsyncs.
    pub fn sync(&mut self) -> Result<()> {
        self.pages.sync()?;
        self.chunks.sync()?;
        self.hdr_map
            .flush()
            .wrap_err("failed to sync data file header")?;
        self.file.sync_all().wrap_err("failed to fsync data file")
    }

    /// Finds a chunk that can hold a run of pages covering `size` bytes and
    /// reserves the run. Sweeps chunks starting at the header's last-chunk
    /// hint. The capacity test `used + n >= DATA_PAGES_PER_CHUNK` is
    /// deliberately conservative (it rejects exact fits), trading up to one
    /// run of slack per chunk for allocator simplicity.
    fn find_space(&mut self, size: usize) -> Result<Ptr> {
        let n = pages_for(size) as u32;
        for i in 0..NR_DATA_CHUNKS {
            let ck = (self.hdr().last_chunk as usize + i) % NR_DATA_CHUNKS;
            if self.hdr().chunk_used[ck] + n >= DATA_PAGES_PER_CHUNK {
                continue;
            }
            let mut chunk = self.chunk(ck as u32)?;
            // SAFETY: sole live chunk handle; single engine thread.
            let chunk = unsafe { chunk.as_mut() };
            if let Some(bit) = chunk.get(n) {
                chunk.mask(bit, n);
                chunk.mark_dirty();
                self.hdr_mut().chunk_used[ck] += n;
                return Ok(Ptr::encode(size as u32, ck as u32, bit as u64));
            }
        }
        Ok(Ptr::NULL)
    }

    fn chunk(&mut self, ck: u32) -> Result<NonNull<Chunk>> {
        if let Some(chunk) = self.chunks.get(ck as u64) {
            return Ok(chunk);
        }
        let off = DATA_HDR_SIZE as u64 + ck as u64 * CHUNK_SIZE;
        let mut size = self.hdr().file_size;
        let map = map_region(&self.file, &mut size, off, DATA_CHUNK_HDR_SIZE as u64)?;
        self.hdr_mut().file_size = size;
        let reserved = (DATA_CHUNK_HDR_SIZE / DATA_PAGE_SIZE) as u32;
        self.chunks
            .put(Chunk::new(ck as u64, map, reserved, DATA_BITMAP_BITS as u32))
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

impl Drop for DataFile {
    fn drop(&mut self) {
        // Best-effort close: flush caches and the header, then fsync.
        let _ = self.pages.clear();
        let _ = self.chunks.clear();
        let _ = self.hdr_map.flush();
        let _ = self.file.sync_all();
    }
}

/// Streaming cursor over one blob's run of data pages.
///
/// Each `next_page` call yields the cached system page under the cursor
/// and advances past the bytes of the blob that live in it; the sum of the
/// advances over a full walk is exactly the blob's length.
pub struct DataIter<'a> {
    file: &'a mut DataFile,
    /// Blob bytes not yet walked.
    remaining: u32,
    ckid: u32,
    /// Byte offset inside the current system page; nonzero only before
    /// the first step.
    used: u32,
    /// Data-page cursor within the chunk.
    cursor: u64,
    id: Ptr,
    /// Absolute file offset of the walk.
    file_off: u64,
}

impl DataIter<'_> {
    /// Yields the system page covering the cursor, or `None` once the blob
    /// is exhausted.
    pub fn next_page(&mut self) -> Result<Option<NonNull<Page>>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let key = ((self.ckid as u64) << 32) | (self.cursor / DATA_PER_SYS_PAGE as u64);
        let nbytes = self.remaining.min(SYS_PAGE_SIZE as u32 - self.used);

        let page = match self.file.pages.get(key) {
            Some(page) => page,
            None => {
                let map_off = self.file_off & !(SYS_PAGE_SIZE as u64 - 1);
                let mut size = self.file.hdr().file_size;
                let map = map_region(&self.file.file, &mut size, map_off, SYS_PAGE_SIZE as u64)?;
                self.file.hdr_mut().file_size = size;
                self.file.pages.put(Page::new(key, map, SyncMode::Async))?
            }
        };

        self.used = 0;
        self.file_off += nbytes as u64;
        self.remaining -= nbytes;
        self.cursor += pages_for(nbytes as usize);
        Ok(Some(page))
    }

    /// Drives the walk to completion, copying the blob into a fresh buffer.
    pub fn collect(mut self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.remaining as usize];
        let mut used = in_sys_page_off(self.id.id());
        let mut copied = 0;

        while let Some(page) = self.next_page()? {
            let n = (out.len() - copied).min(SYS_PAGE_SIZE - used);
            // SAFETY: the page is resident for the duration of this call;
            // single engine thread.
            let bytes = unsafe { page.as_ref().bytes() };
            out[copied..copied + n].copy_from_slice(&bytes[used..used + n]);
            copied += n;
            used = 0;
        }

        ensure!(
            copied == out.len(),
            "short blob walk: {} of {} bytes",
            copied,
            out.len()
        );
        Ok(out)
    }

    /// The write-side twin of `collect`: the same walk, copying from the
    /// caller's buffer and dirtying every touched page.
    fn fill(mut self, bytes: &[u8]) -> Result<()> {
        let mut used = in_sys_page_off(self.id.id());
        let mut copied = 0;

        while let Some(page) = self.next_page()? {
            let n = (bytes.len() - copied).min(SYS_PAGE_SIZE - used);
            // SAFETY: in-bounds window of a resident page; single engine
            // thread.
            let page = unsafe { page.as_ref() };
            unsafe { page.slice_mut(used, n) }.copy_from_slice(&bytes[copied..copied + n]);
            page.mark_dirty();
            copied += n;
            used = 0;
        }

        ensure!(
            copied == bytes.len(),
            "short blob write: {} of {} bytes",
            copied,
            bytes.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_data_file(dir: &tempfile::TempDir) -> DataFile {
        let path = dir.path().join("test.data");
        DataFile::format(&path).unwrap();
        DataFile::load(&path).unwrap()
    }

    #[test]
    fn format_then_load() {
        let dir = tempdir().unwrap();
        let df = open_data_file(&dir);
        assert_eq!(df.hdr().file_size, DATA_HDR_SIZE as u64);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.data");
        std::fs::write(&path, vec![0u8; DATA_HDR_SIZE]).unwrap();

        assert!(DataFile::load(&path).is_err());
    }

    #[test]
    fn small_blob_roundtrip() {
        let dir = tempdir().unwrap();
        let mut df = open_data_file(&dir);

        let id = df.store(b"hello, chunked world").unwrap();
        assert!(!id.is_null());
        assert_eq!(id.length(), 20);
        assert_eq!(df.read(id).unwrap(), b"hello, chunked world");
    }

    #[test]
    fn blob_crossing_system_pages_roundtrips() {
        let dir = tempdir().unwrap();
        let mut df = open_data_file(&dir);

        // Lay down enough small blobs to push the next run close to a
        // system-page boundary, then store one that straddles it.
        for _ in 0..60 {
            df.store(&[0xAA; 64]).unwrap();
        }
        let blob: Vec<u8> = (0..9000).map(|i| (i % 251) as u8).collect();
        let id = df.store(&blob).unwrap();

        assert!(!id.is_null());
        assert_eq!(df.read(id).unwrap(), blob);
    }

    #[test]
    fn blobs_are_packed_sequentially() {
        let dir = tempdir().unwrap();
        let mut df = open_data_file(&dir);

        let a = df.store(&[1u8; 100]).unwrap(); // 2 pages
        let b = df.store(&[2u8; 10]).unwrap(); // 1 page

        assert_eq!(b.id(), a.id() + 2);
        assert_eq!(df.read(a).unwrap(), vec![1u8; 100]);
        assert_eq!(df.read(b).unwrap(), vec![2u8; 10]);
    }

    #[test]
    fn free_returns_pages_to_the_bitmap() {
        let dir = tempdir().unwrap();
        let mut df = open_data_file(&dir);

        let a = df.store(&[7u8; 1000]).unwrap(); // 16 pages
        let ck = a.chunk();
        let (used_before, pop_before) = df.chunk_stats(ck).unwrap();
        assert_eq!(used_before, pop_before);
        assert_eq!(used_before, 16);

        df.free(a).unwrap();
        let (used_after, pop_after) = df.chunk_stats(ck).unwrap();
        assert_eq!(used_after, pop_after);
        assert_eq!(used_after, 0);
    }

    #[test]
    fn used_counter_matches_popcount_after_mixed_traffic() {
        let dir = tempdir().unwrap();
        let mut df = open_data_file(&dir);

        let mut live = Vec::new();
        for round in 0..8usize {
            for len in [1usize, 63, 64, 65, 300, 4096, 5000] {
                let payload = vec![round as u8; len];
                live.push(df.store(&payload).unwrap());
            }
            if round % 2 == 1 {
                for id in live.drain(..live.len() / 2) {
                    df.free(id).unwrap();
                }
            }
        }

        let (used, pop) = df.chunk_stats(0).unwrap();
        assert_eq!(used, pop);
    }

    #[test]
    fn full_test_is_conservative() {
        let dir = tempdir().unwrap();
        let mut df = open_data_file(&dir);

        // A chunk reporting exactly n free pages is skipped (>=, not >):
        // doctor the counter so only one page appears free in chunk 0.
        df.hdr_mut().chunk_used[0] = DATA_PAGES_PER_CHUNK - 1;
        let id = df.store(&[1u8; DATA_PAGE_SIZE]).unwrap();
        assert_eq!(id.chunk(), 1, "exact fit must move to the next chunk");

        // With two pages free, a one-page run fits.
        df.hdr_mut().chunk_used[0] = DATA_PAGES_PER_CHUNK - 2;
        df.hdr_mut().last_chunk = 0;
        let id = df.store(&[1u8; DATA_PAGE_SIZE]).unwrap();
        assert_eq!(id.chunk(), 0);
    }

    #[test]
    fn chunk_sweep_wraps_from_the_hint() {
        let dir = tempdir().unwrap();
        let mut df = open_data_file(&dir);

        // Start the sweep at the last chunk and mark it full through the
        // counter; the allocator must wrap to chunk 0 without ever mapping
        // the full chunk's bitmap.
        df.hdr_mut().last_chunk = (NR_DATA_CHUNKS - 1) as u64;
        df.hdr_mut().chunk_used[NR_DATA_CHUNKS - 1] = DATA_PAGES_PER_CHUNK;

        let id = df.store(b"pushed on").unwrap();
        assert_eq!(id.chunk(), 0, "sweep wraps past the last chunk");
    }

    #[test]
    fn blobs_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.data");
        DataFile::format(&path).unwrap();

        let blob: Vec<u8> = (0..10_000).map(|i| (i % 241) as u8).collect();
        let id;
        {
            let mut df = DataFile::load(&path).unwrap();
            id = df.store(&blob).unwrap();
            df.sync().unwrap();
        }

        let mut df = DataFile::load(&path).unwrap();
        assert_eq!(df.read(id).unwrap(), blob);
    }
}
