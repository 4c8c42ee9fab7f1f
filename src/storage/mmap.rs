//! # Memory-Mapped Region Management
//!
//! The engine never does read/write syscalls on store files; every byte is
//! accessed through `MAP_SHARED` mappings so that `msync` flushes straight
//! to the file. This module owns the two primitives everything else builds
//! on:
//!
//! - [`open_store_file`] / [`create_store_file`]: open a store file
//!   read-write with direct I/O, mode 0644.
//! - [`map_region`]: map `len` bytes at `off`, growing the file first with
//!   `posix_fallocate` when the mapped range extends past the tracked
//!   high-water mark. Newly allocated ranges are zero-filled through the
//!   mapping before use.
//!
//! The caller tracks the high-water mark (`file_size` in the file headers);
//! growing through `fallocate` rather than `ftruncate` keeps the mapped
//! range fully backed, so a page fault can never hit a hole.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

/// Opens an existing store file read-write with direct I/O.
pub(crate) fn open_store_file(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    open_direct(opts, path)
        .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))
}

/// Creates (or truncates) a store file read-write with direct I/O.
pub(crate) fn create_store_file(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644);
    open_direct(opts, path)
        .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))
}

fn open_direct(mut opts: OpenOptions, path: &Path) -> std::io::Result<File> {
    match opts.custom_flags(libc::O_DIRECT).open(path) {
        // Filesystems without direct I/O support (tmpfs) reject the flag;
        // every byte goes through the mappings anyway, so fall back.
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => opts.custom_flags(0).open(path),
        other => other,
    }
}

/// Maps `len` bytes of `file` at byte offset `off`.
///
/// `file_size` is the caller's high-water mark for the file. When the
/// requested range extends past it, the range is allocated with
/// `posix_fallocate`, the mark is advanced to `off + len`, and the fresh
/// mapping is zero-filled before it is returned.
pub(crate) fn map_region(file: &File, file_size: &mut u64, off: u64, len: u64) -> Result<MmapMut> {
    let mut allocated = false;

    if *file_size < off + len {
        // SAFETY: plain syscall on a valid owned descriptor; no memory is
        // handed to the kernel.
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), off as libc::off_t, len as libc::off_t) };
        ensure!(
            rc == 0,
            "posix_fallocate of {} bytes at offset {} failed: {}",
            len,
            off,
            std::io::Error::from_raw_os_error(rc)
        );
        allocated = true;
        *file_size = off + len;
    }

    // SAFETY: the file is open read-write and the range [off, off + len) is
    // fully allocated (either below the high-water mark or fallocated
    // above), so faulting any mapped page is backed by real blocks. Store
    // files are single-process by contract; nothing truncates them while
    // mapped.
    let mut map = unsafe {
        MmapOptions::new()
            .offset(off)
            .len(len as usize)
            .map_mut(file)
            .wrap_err_with(|| format!("failed to map {} bytes at offset {}", len, off))?
    };

    if allocated {
        map.fill(0);
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn map_region_grows_and_zeroes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grow.bin");
        let file = create_store_file(&path).unwrap();

        let mut size = 0u64;
        let map = map_region(&file, &mut size, 0, 8192).unwrap();

        assert_eq!(size, 8192);
        assert_eq!(file.metadata().unwrap().len(), 8192);
        assert!(map.iter().all(|&b| b == 0));
    }

    #[test]
    fn map_region_skips_allocation_inside_mark() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inside.bin");
        let file = create_store_file(&path).unwrap();

        let mut size = 0u64;
        {
            let mut map = map_region(&file, &mut size, 0, 4096).unwrap();
            map[0] = 0xAB;
            map.flush().unwrap();
        }

        // Remapping the same range must not refill it with zeroes.
        let map = map_region(&file, &mut size, 0, 4096).unwrap();
        assert_eq!(size, 4096);
        assert_eq!(map[0], 0xAB);
    }

    #[test]
    fn map_region_at_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offset.bin");
        let file = create_store_file(&path).unwrap();

        let mut size = 0u64;
        {
            let mut map = map_region(&file, &mut size, 4096, 4096).unwrap();
            map[0] = 0xCD;
            map.flush().unwrap();
        }

        assert_eq!(size, 8192);

        let whole = map_region(&file, &mut size, 0, 8192).unwrap();
        assert_eq!(whole[4096], 0xCD);
    }
}
