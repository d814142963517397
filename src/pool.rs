//! Named, resizable shared memory pools
//!
//! A [`Pool`] is a memory-mapped region backed by a POSIX shared memory
//! object (or a plain file), addressed by byte offset rather than by
//! process-local pointer. Cooperating processes open the same name and see
//! the same live bytes; offsets stay stable across remaps, addresses do not.
//!
//! The authoritative size lives in a small header at offset 0. Any process
//! may grow the pool; every other process notices on its next offset
//! translation and remaps before dereferencing.

use crate::error::{Error, Result};
use log::debug;
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate, Mode, OFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, ShmOFlags};
use std::cell::Cell;
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum length of a shared memory object name, including the leading '/'
const MAX_SHM_NAME_LEN: usize = 255;

const POOL_MAGIC: u32 = u32::from_le_bytes(*b"SHMS");
const POOL_VERSION: u32 = 1;

/// Header at offset 0 of every pool. Part of the cross-process ABI.
#[repr(C)]
struct PoolHeader {
    /// Authoritative pool size in bytes. Published with release ordering
    /// after the backing object has been resized.
    size: AtomicU64,
    magic: u32,
    version: u32,
}

/// Offset of the first byte past the pool header. Allocator state starts here.
pub const POOL_HEADER_SIZE: u64 = std::mem::size_of::<PoolHeader>() as u64;

/// Handle to a named shared memory pool
///
/// Each process holds its own mapping of the region. The handle remaps
/// itself lazily when the authoritative size outgrows the local mapping, so
/// it mutates internal state from `&self`; it is deliberately `!Sync`.
/// Share a pool between threads by opening one handle per thread.
pub struct Pool {
    name: String,
    fd: OwnedFd,
    max_size: u64,
    base: Cell<NonNull<u8>>,
    mapped_size: Cell<u64>,
}

// SAFETY: a Pool may move to another thread; it must not be shared between
// threads, which the Cell fields already forbid (`Pool` is !Sync).
unsafe impl Send for Pool {}

fn page_size() -> u64 {
    rustix::param::page_size() as u64
}

/// Shared memory objects need a leading '/'; file paths are used verbatim.
fn object_name(name: &str, file: bool) -> Result<CString> {
    let full = if file || name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    if !file && full.len() > MAX_SHM_NAME_LEN {
        return Err(Error::NameTooLong {
            max: MAX_SHM_NAME_LEN,
            got: full.len(),
        });
    }
    Ok(CString::new(full).expect("pool name contains NUL"))
}

fn open_segment(name: &CString, create_excl: bool, file: bool) -> rustix::io::Result<OwnedFd> {
    let mode = Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH;
    if file {
        let mut flags = OFlags::RDWR;
        if create_excl {
            flags |= OFlags::CREATE | OFlags::EXCL;
        }
        rustix::fs::open(name.as_c_str(), flags, mode)
    } else {
        let mut flags = ShmOFlags::RDWR;
        if create_excl {
            flags |= ShmOFlags::CREATE | ShmOFlags::EXCL;
        }
        shm_open(name.as_c_str(), flags, mode)
    }
}

fn unlink_segment(name: &CString, file: bool) -> rustix::io::Result<()> {
    if file {
        rustix::fs::unlink(name.as_c_str())
    } else {
        shm_unlink(name.as_c_str())
    }
}

fn map_segment(fd: &OwnedFd, size: u64) -> Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size as usize,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| Error::Mmap(e.into()))?
    };
    Ok(NonNull::new(addr.cast::<u8>()).expect("mmap returned null"))
}

impl Pool {
    /// Open the named pool, creating it if it does not exist.
    ///
    /// A freshly created pool is one page long with an initialized header.
    /// `max_size` of 0 means unlimited. `file` selects a file-backed mapping
    /// over an anonymous shared memory object; some platforms (macOS) cannot
    /// resize a shared memory object after creation, so the file path is
    /// forced there.
    pub fn open(name: &str, max_size: u64, file: bool) -> Result<Self> {
        let file = file || cfg!(target_os = "macos");
        let object_name = object_name(name, file)?;

        match open_segment(&object_name, true, file) {
            Ok(fd) => {
                // We created the object: size it to one page and write the
                // header before publishing the size.
                let initial_size = page_size();
                if let Err(e) = ftruncate(&fd, initial_size) {
                    let _ = unlink_segment(&object_name, file);
                    return Err(Error::Truncate(e.into()));
                }
                let base = match map_segment(&fd, initial_size) {
                    Ok(base) => base,
                    Err(e) => {
                        let _ = unlink_segment(&object_name, file);
                        return Err(e);
                    }
                };
                unsafe {
                    let header = base.as_ptr() as *mut PoolHeader;
                    (*header).magic = POOL_MAGIC;
                    (*header).version = POOL_VERSION;
                    (*header).size.store(initial_size, Ordering::Release);
                }
                debug!("created pool '{name}' ({initial_size} bytes)");
                Ok(Self {
                    name: name.to_string(),
                    fd,
                    max_size,
                    base: Cell::new(base),
                    mapped_size: Cell::new(initial_size),
                })
            }
            Err(rustix::io::Errno::EXIST) => {
                // The object already exists: attach and map its current size.
                let fd = open_segment(&object_name, false, file).map_err(|e| Error::ShmOpen {
                    name: name.to_string(),
                    source: e.into(),
                })?;
                let stat = fstat(&fd).map_err(|e| Error::ShmOpen {
                    name: name.to_string(),
                    source: e.into(),
                })?;
                let size = stat.st_size as u64;
                if size < POOL_HEADER_SIZE {
                    return Err(Error::IncompatiblePool {
                        name: name.to_string(),
                    });
                }
                let base = map_segment(&fd, size)?;
                unsafe {
                    let header = base.as_ptr() as *const PoolHeader;
                    if (*header).magic != POOL_MAGIC || (*header).version != POOL_VERSION {
                        let _ = munmap(base.as_ptr().cast(), size as usize);
                        return Err(Error::IncompatiblePool {
                            name: name.to_string(),
                        });
                    }
                }
                debug!("attached pool '{name}' ({size} bytes)");
                Ok(Self {
                    name: name.to_string(),
                    fd,
                    max_size,
                    base: Cell::new(base),
                    mapped_size: Cell::new(size),
                })
            }
            Err(e) => Err(Error::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    /// Open a shared-memory-backed pool with no size limit.
    pub fn open_default(name: &str) -> Result<Self> {
        Self::open(name, 0, false)
    }

    /// Unlink the named pool. Returns whether it existed.
    pub fn delete(name: &str, file: bool) -> Result<bool> {
        let file = file || cfg!(target_os = "macos");
        let object_name = object_name(name, file)?;
        match unlink_segment(&object_name, file) {
            Ok(()) => Ok(true),
            Err(rustix::io::Errno::NOENT) => Ok(false),
            Err(e) => Err(Error::ShmUnlink {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    /// Pool name as given at open time
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured maximum size; 0 means unlimited
    #[inline]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    fn header(&self) -> *const PoolHeader {
        self.base.get().as_ptr() as *const PoolHeader
    }

    /// Authoritative pool size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        unsafe { (*self.header()).size.load(Ordering::Acquire) }
    }

    /// Grow the pool to at least `new_size` bytes.
    ///
    /// The size is rounded up to a page multiple. Growing never shrinks; a
    /// `new_size` at or below the current size is a no-op. Fails with
    /// [`Error::LimitExceeded`] past `max_size`.
    pub fn expand(&self, new_size: u64) -> Result<()> {
        let page = page_size();
        let new_size = (new_size + page - 1) & !(page - 1);
        if new_size <= self.size() {
            return Ok(());
        }
        if self.max_size != 0 && new_size > self.max_size {
            return Err(Error::LimitExceeded {
                requested: new_size,
                max_size: self.max_size,
            });
        }

        ftruncate(&self.fd, new_size).map_err(|e| Error::Truncate(e.into()))?;
        unsafe {
            (*self.header()).size.store(new_size, Ordering::Release);
        }
        debug!("expanded pool '{}' to {} bytes", self.name, new_size);

        // The backing object is larger now; recreate our view of it.
        self.check_size_and_remap()
    }

    /// Remap if the authoritative size has outgrown our mapping.
    ///
    /// A foreign process may have expanded the pool since our last look; a
    /// stale mapping must never be dereferenced past its old end.
    fn check_size_and_remap(&self) -> Result<()> {
        let authoritative = self.size();
        if authoritative == self.mapped_size.get() {
            return Ok(());
        }
        unsafe {
            munmap(
                self.base.get().as_ptr().cast(),
                self.mapped_size.get() as usize,
            )
            .map_err(|e| Error::Mmap(e.into()))?;
        }
        let base = map_segment(&self.fd, authoritative)?;
        self.base.set(base);
        self.mapped_size.set(authoritative);
        debug!("remapped pool '{}' at {} bytes", self.name, authoritative);
        Ok(())
    }

    /// Translate a pool offset to an in-process address.
    ///
    /// This is the single translation primitive: it observes the
    /// authoritative size and remaps first when the local mapping is stale,
    /// so a returned address is always backed. Addresses are invalidated by
    /// any later operation that can grow the pool; re-translate instead of
    /// holding them.
    ///
    /// # Panics
    ///
    /// Panics when the requested range does not fit the pool, and on remap
    /// failure (which is fatal for this process: it indicates OS-level
    /// exhaustion or a race with pool deletion).
    #[inline]
    pub fn at<T>(&self, offset: u64) -> *mut T {
        self.at_bytes(offset, std::mem::size_of::<T>() as u64) as *mut T
    }

    /// Translate a pool offset to an address for `len` bytes. See [`Pool::at`].
    #[inline]
    pub fn at_bytes(&self, offset: u64, len: u64) -> *mut u8 {
        if let Err(e) = self.check_size_and_remap() {
            panic!("pool '{}' remap failed: {e}", self.name);
        }
        let mapped = self.mapped_size.get();
        if offset.checked_add(len).map_or(true, |end| end > mapped) {
            panic!("offset {offset}+{len} out of bounds for pool '{}' of {mapped} bytes", self.name);
        }
        unsafe { self.base.get().as_ptr().add(offset as usize) }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Unmap our view only. The pool itself persists until delete().
        unsafe {
            let _ = munmap(
                self.base.get().as_ptr().cast(),
                self.mapped_size.get() as usize,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool_name(tag: &str) -> String {
        format!("shmstructs-pool-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_create_attach_delete() {
        let name = test_pool_name("basic");
        let _ = Pool::delete(&name, false);

        let pool = Pool::open(&name, 0, false).unwrap();
        assert_eq!(pool.size(), page_size());

        // Write through one handle, read through another.
        unsafe {
            *pool.at::<u64>(POOL_HEADER_SIZE) = 0x1122334455667788;
        }
        let other = Pool::open(&name, 0, false).unwrap();
        assert_eq!(other.size(), pool.size());
        let val = unsafe { *other.at::<u64>(POOL_HEADER_SIZE) };
        assert_eq!(val, 0x1122334455667788);

        drop(other);
        drop(pool);
        assert!(Pool::delete(&name, false).unwrap());
        assert!(!Pool::delete(&name, false).unwrap());
    }

    #[test]
    fn test_expand_and_foreign_remap() {
        let name = test_pool_name("expand");
        let _ = Pool::delete(&name, false);

        let writer = Pool::open(&name, 0, false).unwrap();
        let reader = Pool::open(&name, 0, false).unwrap();
        assert_eq!(reader.size(), page_size());

        writer.expand(3 * page_size() + 1).unwrap();
        assert_eq!(writer.size(), 4 * page_size());

        // The reader's mapping is stale; translation must remap first.
        let far = 4 * page_size() - 8;
        unsafe {
            *writer.at::<u64>(far) = 42;
        }
        let val = unsafe { *reader.at::<u64>(far) };
        assert_eq!(val, 42);
        assert_eq!(reader.size(), 4 * page_size());

        // Expanding to a smaller size is a no-op.
        writer.expand(page_size()).unwrap();
        assert_eq!(writer.size(), 4 * page_size());

        drop(writer);
        drop(reader);
        Pool::delete(&name, false).unwrap();
    }

    #[test]
    fn test_expand_past_limit() {
        let name = test_pool_name("limit");
        let _ = Pool::delete(&name, false);

        let pool = Pool::open(&name, 2 * page_size(), false).unwrap();
        pool.expand(2 * page_size()).unwrap();
        match pool.expand(3 * page_size()) {
            Err(Error::LimitExceeded { max_size, .. }) => {
                assert_eq!(max_size, 2 * page_size());
            }
            other => panic!("expected LimitExceeded, got {other:?}"),
        }

        drop(pool);
        Pool::delete(&name, false).unwrap();
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_translate_out_of_bounds_panics() {
        let name = test_pool_name("oob");
        let _ = Pool::delete(&name, false);
        let pool = Pool::open(&name, 0, false).unwrap();
        // Unlink up front; the mapping stays usable and nothing leaks when
        // the translation below panics.
        Pool::delete(&name, false).unwrap();
        pool.at::<u64>(pool.size());
    }

    #[test]
    fn test_file_backed_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.bin");
        let path = path.to_str().unwrap();

        let pool = Pool::open(path, 0, true).unwrap();
        pool.expand(2 * page_size()).unwrap();
        unsafe {
            *pool.at::<u64>(page_size()) = 7;
        }

        let other = Pool::open(path, 0, true).unwrap();
        assert_eq!(other.size(), 2 * page_size());
        let val = unsafe { *other.at::<u64>(page_size()) };
        assert_eq!(val, 7);

        drop(pool);
        drop(other);
        assert!(Pool::delete(path, true).unwrap());
    }
}
