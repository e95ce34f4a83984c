//! Shared memory region helpers.
//!
//! The proxy itself only needs a base pointer and a size; these types are
//! the common ways of getting one. `SharedRegion` maps a `/dev/shm` object
//! so a peer process (or a test standing in for the DSP) can map the same
//! bytes. `OwnedRegion` is a page-aligned private allocation for
//! single-process use.

use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};

use crate::error::Result;

/// A region backed by a named `/dev/shm` object, visible to both sides.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    fd: RawFd,
    is_owner: bool,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create and map a new shared memory object. The creator owns the
    /// name and unlinks it on drop.
    ///
    /// # Safety
    /// No other live mapping may be using `path` with a different layout.
    pub unsafe fn create<P: AsRef<Path>>(path: P, size: usize) -> Result<Self> {
        let name = path_to_cstring(path)?;

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let raw_fd = fd.as_raw_fd();

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = close(raw_fd);
            let _ = shm_unlink(name.as_c_str());
            return Err(io::Error::from_raw_os_error(e as i32).into());
        }

        let ptr = match Self::map(&fd, size) {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                let _ = shm_unlink(name.as_c_str());
                return Err(e);
            }
        };

        Ok(Self {
            ptr,
            size,
            name,
            fd: fd.into_raw_fd(),
            is_owner: true,
        })
    }

    /// Map an existing shared memory object.
    ///
    /// # Safety
    /// The object must exist with at least `size` bytes.
    pub unsafe fn open<P: AsRef<Path>>(path: P, size: usize) -> Result<Self> {
        let name = path_to_cstring(path)?;

        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let raw_fd = fd.as_raw_fd();

        let ptr = match Self::map(&fd, size) {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                return Err(e);
            }
        };

        Ok(Self {
            ptr,
            size,
            name,
            fd: fd.into_raw_fd(),
            is_owner: false,
        })
    }

    unsafe fn map<F: std::os::fd::AsFd>(fd: &F, size: usize) -> Result<NonNull<u8>> {
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero"))?;
        let ptr = mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(NonNull::new_unchecked(ptr.as_ptr().cast()))
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(NonNull::new_unchecked(self.ptr.as_ptr().cast()), self.size);
            let _ = close(self.fd);
            if self.is_owner {
                let _ = shm_unlink(self.name.as_c_str());
            }
        }
    }
}

fn path_to_cstring<P: AsRef<Path>>(path: P) -> io::Result<CString> {
    let path_str = path.as_ref().to_str().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path contains invalid UTF-8")
    })?;

    let name = if path_str.starts_with('/') {
        path_str.to_string()
    } else {
        format!("/{}", path_str)
    };

    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))
}

/// A page-aligned, zero-initialized private region.
///
/// Stands in for the hardware-provided window when both "processors" are
/// threads of one process, which is how the tests and benches run.
pub struct OwnedRegion {
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for OwnedRegion {}
unsafe impl Sync for OwnedRegion {}

const PAGE_SIZE: usize = 4096;

impl OwnedRegion {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero").into());
        }
        let ptr = unsafe {
            let mut ptr: *mut libc::c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, PAGE_SIZE, size);
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret).into());
            }
            std::ptr::write_bytes(ptr.cast::<u8>(), 0, size);
            ptr.cast::<u8>()
        };
        Ok(Self { ptr, size })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for OwnedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::free(self.ptr.cast());
        }
    }
}
