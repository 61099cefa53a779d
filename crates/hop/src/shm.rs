//! POSIX shared-memory mapping, the OS layer under C3.
//!
//! Mirrors `create_ipc_memory`/`open_ipc_memory`/`close_ipc_memory`'s Unix
//! path from the original C reference implementation: `shm_open` +
//! `ftruncate` + `mmap` to create, `shm_open` + `fstat` + `mmap` to attach
//! (the mapping is sized from the object's actual size rather than a value
//! the attacher has to already know), and `shm_unlink` to remove the name
//! once both sides have disconnected. A `CreateFileMapping` equivalent for
//! Windows is out of scope — see `DESIGN.md`.

use crate::error::HopError;
#[cfg(unix)]
use std::ffi::CString;
#[cfg(unix)]
use std::fs::File;
#[cfg(unix)]
use std::os::unix::io::FromRawFd;

/// Maps an errno onto the connection-state buckets the original
/// implementation's `err_to_connection_state` distinguishes: a missing
/// segment, a permissions failure, or anything else.
#[cfg(unix)]
fn map_errno(errno: i32) -> HopError {
    match errno {
        libc::ENOENT => HopError::NotConnected,
        libc::EACCES => HopError::PermissionDenied,
        _ => HopError::UnknownConnectionError,
    }
}

#[cfg(unix)]
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(unix)]
fn shm_name(name: &str) -> Result<CString, HopError> {
    CString::new(name).map_err(|_| HopError::UnknownConnectionError)
}

/// An owned POSIX shared-memory mapping. Unmaps on drop; does not unlink
/// the name — see [`MappedRegion::unlink`] for that, called only once both
/// sides of a segment have disconnected.
#[cfg(unix)]
pub struct MappedRegion {
    mmap: memmap2::MmapMut,
}

#[cfg(unix)]
impl MappedRegion {
    /// Creates (or re-truncates, if it already exists) the named
    /// shared-memory object and maps `size` bytes of it read-write.
    pub fn create(name: &str, size: usize) -> Result<Self, HopError> {
        let c_name = shm_name(name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(map_errno(last_errno()));
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = map_errno(last_errno());
            unsafe { libc::close(fd) };
            return Err(err);
        }
        // SAFETY: `fd` was just opened above and is owned by this call;
        // `File` takes ownership and closes it on drop.
        let file = unsafe { File::from_raw_fd(fd) };
        let mmap = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|_| HopError::UnknownConnectionError)?;
        Ok(Self { mmap })
    }

    /// Opens an existing named segment and maps the whole of it
    /// read-write, sizing the mapping from the object's current size
    /// rather than a size the caller has to already know.
    pub fn attach(name: &str) -> Result<Self, HopError> {
        let c_name = shm_name(name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(map_errno(last_errno()));
        }
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            let err = map_errno(last_errno());
            unsafe { libc::close(fd) };
            return Err(err);
        }
        // SAFETY: see `create` above.
        let file = unsafe { File::from_raw_fd(fd) };
        let mmap = unsafe { memmap2::MmapOptions::new().len(stat.st_size as usize).map_mut(&file) }
            .map_err(|_| HopError::UnknownConnectionError)?;
        Ok(Self { mmap })
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Removes `name` from the filesystem namespace. Existing mappings
    /// (including this one, if still live) remain valid until unmapped;
    /// best-effort, since a failure here is not actionable by the caller.
    pub fn unlink(name: &str) {
        let Ok(c_name) = shm_name(name) else { return };
        unsafe {
            if libc::shm_unlink(c_name.as_ptr()) != 0 {
                log::warn!("failed to unlink shared segment {name}");
            }
        }
    }
}

/// Non-Unix stand-in with the same surface, so `segment.rs` doesn't need
/// its own `#[cfg]` branches. Every operation fails outright rather than
/// silently pretending to share memory it cannot.
#[cfg(not(unix))]
pub struct MappedRegion(std::convert::Infallible);

#[cfg(not(unix))]
impl MappedRegion {
    pub fn create(_name: &str, _size: usize) -> Result<Self, HopError> {
        Err(HopError::UnknownConnectionError)
    }

    pub fn attach(_name: &str) -> Result<Self, HopError> {
        Err(HopError::UnknownConnectionError)
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self.0 {}
    }

    pub fn len(&self) -> usize {
        match self.0 {}
    }

    pub fn is_empty(&self) -> bool {
        match self.0 {}
    }

    pub fn unlink(_name: &str) {}
}
