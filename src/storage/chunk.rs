//! # Chunk Allocation Bitmaps
//!
//! Every 512MB chunk begins with a reserved header region holding a bit
//! array, one bit per allocation unit in the chunk (4KB index pages or 64B
//! data pages). A [`Chunk`] handle maps that header region and implements
//! run allocation over it.
//!
//! The allocator is a circular first-fit scan with a rotating cursor: the
//! cursor starts where the previous allocation ended, which biases
//! successive allocations toward sequential page ids. Runs never wrap
//! around the end of the bitmap, and the bits covering the header region
//! itself are treated as permanently allocated by starting the scan past
//! them. The cursor is a hint only and is not persisted.

use eyre::Result;
use memmap2::MmapMut;

use super::cache::CacheItem;

/// A chunk's allocation bitmap, mapped from the chunk's header region.
pub struct Chunk {
    id: u64,
    dirty: bool,
    /// First usable bit; bits below cover the header region itself.
    reserved: u32,
    total_bits: u32,
    /// Rotating allocation cursor.
    last: u32,
    map: MmapMut,
}

impl Chunk {
    pub fn new(id: u64, map: MmapMut, reserved: u32, total_bits: u32) -> Self {
        debug_assert!(map.len() * 8 >= total_bits as usize);
        Self {
            id,
            dirty: false,
            reserved,
            total_bits,
            last: reserved,
            map,
        }
    }

    /// Finds a run of `n` consecutive clear bits, scanning circularly from
    /// the cursor. Returns the first bit of the run, or `None` when no such
    /// run exists. On success the cursor moves to the end of the run.
    pub fn get(&mut self, n: u32) -> Option<u32> {
        debug_assert!(n >= 1);

        let mut r = self.last;
        let mut l = r;
        let mut scanned = self.reserved;

        while scanned < self.total_bits {
            if r == self.total_bits {
                // Runs do not wrap; restart at the first usable bit.
                r = self.reserved;
                l = r;
            }
            if self.test(r) {
                l = r + 1;
            } else if r - l + 1 == n {
                self.last = r;
                return Some(l);
            }
            scanned += 1;
            r += 1;
        }

        None
    }

    pub fn test(&self, bit: u32) -> bool {
        self.map[(bit >> 3) as usize] & (1 << (bit & 7)) != 0
    }

    /// Sets `n` bits starting at `bit`.
    pub fn mask(&mut self, bit: u32, n: u32) {
        for b in bit..bit + n {
            self.map[(b >> 3) as usize] |= 1 << (b & 7);
        }
    }

    /// Clears `n` bits starting at `bit`.
    pub fn unmask(&mut self, bit: u32, n: u32) {
        for b in bit..bit + n {
            self.map[(b >> 3) as usize] &= !(1 << (b & 7));
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Set bits in the usable range; the reserved prefix never counts.
    pub fn popcount(&self) -> u32 {
        (self.reserved..self.total_bits)
            .filter(|&b| self.test(b))
            .count() as u32
    }
}

impl CacheItem for Chunk {
    fn id(&self) -> u64 {
        self.id
    }

    fn sync(&mut self, unmap: bool) -> Result<()> {
        if unmap {
            self.map.flush()?;
            return Ok(());
        }
        if self.dirty {
            self.map.flush()?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mmap::{create_store_file, map_region};
    use tempfile::tempdir;

    const TOTAL_BITS: u32 = 4096 * 8;
    const RESERVED: u32 = 8;

    fn test_chunk() -> (tempfile::TempDir, Chunk) {
        let dir = tempdir().unwrap();
        let file = create_store_file(&dir.path().join("chunk.bin")).unwrap();
        let mut size = 0u64;
        let map = map_region(&file, &mut size, 0, 4096).unwrap();
        (dir, Chunk::new(0, map, RESERVED, TOTAL_BITS))
    }

    #[test]
    fn first_allocation_skips_reserved_bits() {
        let (_dir, mut chunk) = test_chunk();

        let bit = chunk.get(1).unwrap();
        assert_eq!(bit, RESERVED);
    }

    #[test]
    fn sequential_allocations_advance() {
        let (_dir, mut chunk) = test_chunk();

        let a = chunk.get(1).unwrap();
        chunk.mask(a, 1);
        let b = chunk.get(1).unwrap();
        chunk.mask(b, 1);

        assert_eq!(b, a + 1, "cursor biases toward sequential ids");
    }

    #[test]
    fn run_allocation_finds_contiguous_space() {
        let (_dir, mut chunk) = test_chunk();

        // Occupy RESERVED..RESERVED+3, leave a 2-bit hole, occupy one more.
        chunk.mask(RESERVED, 3);
        chunk.mask(RESERVED + 5, 1);
        chunk.last = RESERVED;

        let run = chunk.get(2).unwrap();
        assert_eq!(run, RESERVED + 3);

        let big = chunk.get(4).unwrap();
        assert_eq!(big, RESERVED + 6, "4-bit run must skip the 2-bit hole");
    }

    #[test]
    fn scan_wraps_but_runs_do_not() {
        let (_dir, mut chunk) = test_chunk();

        // Fill everything except the last 2 bits and the first 2 usable
        // bits; a 3-bit run must fail even though 4 bits are free in total.
        chunk.mask(RESERVED + 2, TOTAL_BITS - RESERVED - 4);
        chunk.last = RESERVED;

        assert!(chunk.get(3).is_none(), "no wrap-around runs");
        assert_eq!(chunk.get(2), Some(RESERVED));
    }

    #[test]
    fn full_bitmap_returns_none() {
        let (_dir, mut chunk) = test_chunk();

        chunk.mask(RESERVED, TOTAL_BITS - RESERVED);
        assert!(chunk.get(1).is_none());
    }

    #[test]
    fn unmask_makes_bits_reusable() {
        let (_dir, mut chunk) = test_chunk();

        let a = chunk.get(4).unwrap();
        chunk.mask(a, 4);
        assert_eq!(chunk.popcount(), 4);

        chunk.unmask(a, 4);
        assert_eq!(chunk.popcount(), 0);
        chunk.last = RESERVED;
        assert_eq!(chunk.get(4), Some(a));
    }
}
