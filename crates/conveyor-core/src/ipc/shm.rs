//! Named shared-memory regions used as the bulk batch transport between the
//! coordinator and one worker.
//!
//! Each worker instance gets its own region named
//! `/plugin_<stage>_<coordinator_pid>`. The first KiB is reserved as worker
//! scratch; batch frames start at [`BATCH_FRAME_OFFSET`] on both sides.
//! Regions are single-writer single-reader by convention because at most one
//! call is in flight per worker.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::{Error, Result};

/// Reserved scratch prefix; batch frames are written past it.
pub const BATCH_FRAME_OFFSET: usize = 1024;

/// Region name for a stage owned by this coordinator process.
pub fn region_name(stage: &str) -> String {
    format!("/plugin_{}_{}", stage, std::process::id())
}

/// A named, fixed-size byte region shared with exactly one worker.
pub struct SharedRegion {
    name: String,
    size: usize,
    fd: RawFd,
    ptr: *mut u8,
    owner: bool,
}

// Raw pointer aside, the region is plain shared bytes; the single-writer
// convention is upheld by the per-handle call mutex.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create (or re-create) a region and take ownership of its name; the
    /// name is unlinked again when the region is dropped.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::map(name, size, true)
    }

    /// Attach to a region created by the coordinator.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::map(name, size, false)
    }

    fn map(name: &str, size: usize, create: bool) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| Error::Spawn(format!("invalid shared region name {name:?}")))?;

        let flags = if create {
            libc::O_CREAT | libc::O_RDWR
        } else {
            libc::O_RDWR
        };
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600 as libc::mode_t) };
        if fd < 0 {
            return Err(Error::Spawn(format!(
                "shm_open({name}) failed: {}",
                io::Error::last_os_error()
            )));
        }

        if create && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(Error::Spawn(format!("ftruncate({name}) failed: {err}")));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                if create {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
            return Err(Error::Spawn(format!("mmap({name}) failed: {err}")));
        }

        Ok(SharedRegion {
            name: name.to_string(),
            size,
            fd,
            ptr: ptr as *mut u8,
            owner: create,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
        Ok(())
    }

    /// Copy bytes out of the region at `offset` into `out`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(Error::Codec(format!(
                "shared region access out of bounds: offset {offset} + len {len} > size {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Unlink a region by name, ignoring absence.
    pub fn unlink(name: &str) {
        if let Ok(c_name) = CString::new(name) {
            unsafe {
                libc::shm_unlink(c_name.as_ptr());
            }
        }
    }

    /// Unlink regions for `stage` left behind by coordinator processes that
    /// no longer exist.
    pub fn scrub_stale(stage: &str) {
        let prefix = format!("plugin_{stage}_");
        let shm_dir = Path::new("/dev/shm");
        let entries = match std::fs::read_dir(shm_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(pid_str) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(pid) = pid_str.parse::<i32>() else {
                continue;
            };
            if pid == std::process::id() as i32 {
                continue;
            }
            if unsafe { libc::kill(pid, 0) } != 0 {
                tracing::info!(stage, pid, "removing stale shared region {name}");
                Self::unlink(&format!("/{name}"));
            }
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // A restart can re-create the name while a lapsed call still holds
        // the old region; only unlink when the name still refers to us.
        let still_ours = self.owner && self.name_refers_to_self();
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
        if still_ours {
            Self::unlink(&self.name);
        }
    }
}

impl SharedRegion {
    fn name_refers_to_self(&self) -> bool {
        use std::os::unix::fs::MetadataExt;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut stat) } != 0 {
            return true;
        }
        let path = Path::new("/dev/shm").join(self.name.trim_start_matches('/'));
        match std::fs::metadata(&path) {
            Ok(meta) => meta.ino() == stat.st_ino && meta.dev() == stat.st_dev,
            // Already gone; nothing left to unlink anyway.
            Err(_) => false,
        }
    }
}
