//! Descriptor helpers: file limits, descriptor counting and the virtual interface handle

use crate::error::{EngineError, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use tracing::{debug, info, warn};

/// Smallest soft descriptor limit a run will start with
pub const MIN_FD_LIMIT: u64 = 64;

fn get_nofile() -> io::Result<libc::rlimit> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: rlim is a valid, writable rlimit struct
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rlim)
}

/// Raise the soft descriptor limit to the hard maximum, returning (old, new)
pub fn raise_fd_limit() -> io::Result<(u64, u64)> {
    let mut rlim = get_nofile()?;
    let old = rlim.rlim_cur as u64;
    if rlim.rlim_cur == rlim.rlim_max {
        return Ok((old, old));
    }

    rlim.rlim_cur = rlim.rlim_max;
    // SAFETY: rlim is a fully initialized rlimit struct
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let new = get_nofile()?.rlim_cur as u64;
    info!("Raised descriptor limit {} -> {}", old, new);
    Ok((old, new))
}

/// Current soft descriptor limit
pub fn fd_limit() -> u64 {
    match get_nofile() {
        Ok(rlim) => rlim.rlim_cur as u64,
        Err(e) => {
            warn!("getrlimit failed: {}", e);
            0
        }
    }
}

/// Fail when the soft limit is too low to run
pub fn check_fd_limit() -> Result<()> {
    let limit = fd_limit();
    if limit < MIN_FD_LIMIT {
        return Err(EngineError::DescriptorLimit {
            limit,
            minimum: MIN_FD_LIMIT,
        });
    }
    Ok(())
}

/// Descriptors currently open in this process
pub fn open_fd_count() -> u64 {
    match fs::read_dir("/proc/self/fd") {
        // The directory handle itself shows up in the listing
        Ok(entries) => (entries.count() as u64).saturating_sub(1),
        Err(e) => {
            debug!("cannot list /proc/self/fd: {}", e);
            0
        }
    }
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<i32> {
    // SAFETY: fcntl on a descriptor we hold open
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let wanted = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if wanted != flags {
        // SAFETY: same descriptor, flags derived from F_GETFL
        if unsafe { libc::fcntl(fd, libc::F_SETFL, wanted) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(flags)
}

/// The virtual interface for the duration of one run.
///
/// The host keeps ownership of its descriptor; this holds a duplicate that is
/// switched to non-blocking mode and restored on drop.
pub struct VirtualInterface {
    file: File,
    original_flags: i32,
}

impl VirtualInterface {
    pub fn attach(fd: RawFd) -> Result<Self> {
        if fd < 0 {
            return Err(EngineError::VirtualInterface(format!("invalid descriptor {}", fd)));
        }

        // SAFETY: dup of a caller-provided descriptor; the result is checked below
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(EngineError::VirtualInterface(format!(
                "dup({}) failed: {}",
                fd,
                io::Error::last_os_error()
            )));
        }

        // SAFETY: dup_fd is a fresh descriptor owned by nobody else
        let file = unsafe { File::from_raw_fd(dup_fd) };
        let original_flags = set_nonblocking(dup_fd, true)
            .map_err(|e| EngineError::VirtualInterface(format!("O_NONBLOCK: {}", e)))?;

        debug!("Attached virtual interface fd={} (dup {})", fd, dup_fd);
        Ok(Self { file, original_flags })
    }

    pub fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    pub fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.file.write(packet)
    }
}

impl AsRawFd for VirtualInterface {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for VirtualInterface {
    fn drop(&mut self) {
        if self.original_flags & libc::O_NONBLOCK == 0 {
            if let Err(e) = set_nonblocking(self.file.as_raw_fd(), false) {
                debug!("failed to restore blocking mode: {}", e);
            }
        }
    }
}
