//! The segment manager: creates, attaches, resizes, maps, and unmaps the
//! named files backing every block.
//!
//! Slitter hides this behind a small C support library (`map.rs` calls
//! `slitter__reserve_region` et al.) because its mappings are anonymous and
//! throwaway. This crate's mappings must outlive the process, so we instead
//! talk to the OS directly through `libc`, the way `Shadlock0133-mimalloc-rs`
//! does for its platform layer. The aligned-mapping trick (over-reserve,
//! then trim or re-map fixed) is ported straight from the original's
//! `shm_object_map`.
use std::ffi::c_void;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::ptr;

use crate::error::{AllocError, Result};

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

/// Returns the host's page size. Constant for the process's lifetime.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn round_up(size: usize, unit: usize) -> usize {
    if size % unit == 0 {
        size
    } else {
        size + (unit - size % unit)
    }
}

fn last_os_error(path: &Path) -> AllocError {
    AllocError::io(path, std::io::Error::last_os_error())
}

/// Creates a fresh file at `path`, sized to at least `size` bytes (rounded
/// up to a page), and truncates it to that size. Fails if the file already
/// exists.
pub fn create(path: &Path, size: usize) -> Result<(RawFd, usize)> {
    let real_size = round_up(size, page_size());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o666)
        .open(path)
        .map_err(|e| AllocError::io(path, e))?;

    let fd = file.as_raw_fd();
    if unsafe { libc::ftruncate(fd, real_size as libc::off_t) } != 0 {
        let err = last_os_error(path);
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(err);
    }

    // `File` would close `fd` on drop; we want to keep it open for the
    // caller, so leak the `File` wrapper (the fd itself is unaffected).
    std::mem::forget(file);
    Ok((fd, real_size))
}

/// Opens an existing file at `path` and returns its current size.
pub fn attach(path: &Path) -> Result<(RawFd, usize)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| AllocError::io(path, e))?;

    let fd = file.as_raw_fd();
    let metadata = file.metadata().map_err(|e| AllocError::io(path, e))?;
    let size = metadata.len() as usize;

    std::mem::forget(file);
    Ok((fd, size))
}

/// Grows (or shrinks) the file at `path` to `size` bytes, rounded up to a
/// page. The file must already exist.
pub fn resize(path: &Path, size: usize) -> Result<(RawFd, usize)> {
    let real_size = round_up(size, page_size());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| AllocError::io(path, e))?;

    let fd = file.as_raw_fd();
    if unsafe { libc::ftruncate(fd, real_size as libc::off_t) } != 0 {
        return Err(last_os_error(path));
    }

    std::mem::forget(file);
    Ok((fd, real_size))
}

/// Maps `size` bytes of `fd` at the given `alignment` (which must be a
/// power of two, at least the page size). Returns the (possibly adjusted)
/// base address and the actual mapped size.
///
/// When `alignment` exceeds the page size we over-reserve by
/// `alignment - page_size` bytes so there is always an aligned sub-range
/// inside the reservation, then either release the unaligned slop (common
/// case: the kernel happened to hand back an aligned base) or unmap
/// everything and re-map the aligned sub-range with `MAP_FIXED` (always
/// safe, because the fixed range is strictly smaller than what we just
/// unmapped).
pub fn map(fd: RawFd, size: usize, alignment: usize) -> Result<(*mut c_void, usize)> {
    let page = page_size();
    let alignment = alignment.max(page);
    let real_size = round_up(size, alignment);
    let extra = if alignment > page { alignment - page } else { 0 };

    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            real_size + extra,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(AllocError::io(
            Path::new("<mmap>"),
            std::io::Error::last_os_error(),
        ));
    }

    let base = addr as usize;
    let skip = if base % alignment != 0 {
        alignment - (base % alignment)
    } else {
        0
    };

    if skip == 0 {
        if extra > 0 {
            unsafe {
                libc::munmap((base + real_size) as *mut c_void, extra);
            }
        }
        return Ok((addr, real_size));
    }

    unsafe {
        libc::munmap(addr, real_size + extra);
    }

    let fixed = (base + skip) as *mut c_void;
    let remapped = unsafe {
        libc::mmap(
            fixed,
            real_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        )
    };
    if remapped == libc::MAP_FAILED {
        return Err(AllocError::io(
            Path::new("<mmap-fixed>"),
            std::io::Error::last_os_error(),
        ));
    }
    debug_assert_eq!(remapped, fixed);

    Ok((remapped, real_size))
}

/// Releases a mapping previously returned by `map`.
pub fn unmap(addr: *mut c_void, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    if unsafe { libc::munmap(addr, size) } != 0 {
        return Err(AllocError::io(
            Path::new("<munmap>"),
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Removes the backing file at `path`. Block files are left on disk after
/// `fini`; only the manager file is unlinked.
pub fn unlink(path: &Path) -> Result<()> {
    std::fs::remove_file(path).or_else(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Ok(())
        } else {
            Err(AllocError::io(path, e))
        }
    })
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        assert!(page_size() >= 4096);
        assert_eq!(page_size() & (page_size() - 1), 0);
    }

    #[test]
    fn create_attach_map_unmap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.mmap");

        let (fd, size) = create(&path, page_size()).expect("create should succeed");
        assert_eq!(size, page_size());

        let (addr, mapped_size) = map(fd, size, crate::config::ALIGNMENT).expect("map");
        assert_eq!(addr as usize % crate::config::ALIGNMENT, 0);
        assert!(mapped_size >= size);

        unsafe {
            ptr::write_bytes(addr as *mut u8, 0x42, 4);
        }

        unmap(addr, mapped_size).expect("unmap");
        close(fd);

        let (fd2, size2) = attach(&path).expect("attach");
        assert_eq!(size2, size);
        let (addr2, mapped_size2) = map(fd2, size2, crate::config::ALIGNMENT).expect("remap");
        let value = unsafe { ptr::read(addr2 as *const u8) };
        assert_eq!(value, 0x42);

        unmap(addr2, mapped_size2).expect("unmap");
        close(fd2);
        unlink(&path).expect("unlink");
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.mmap");
        let (fd, _) = create(&path, page_size()).unwrap();
        close(fd);

        assert!(create(&path, page_size()).is_err());
        unlink(&path).unwrap();
    }
}
