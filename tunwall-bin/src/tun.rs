//! Opening a Linux TUN device

use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::os::fd::{FromRawFd, OwnedFd};

const TUN_DEVICE_PATH: &str = "/dev/net/tun";
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
struct InterfaceRequest {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Attach to (or create) the TUN interface `name` in IFF_TUN | IFF_NO_PI mode
pub fn open_tun(name: &str) -> Result<OwnedFd> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        bail!("invalid tun interface name: {:?}", name);
    }

    let path = CString::new(TUN_DEVICE_PATH)?;
    // SAFETY: path is a valid NUL-terminated string
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("open /dev/net/tun");
    }
    // SAFETY: fd was just returned by open and is owned by nobody else
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut request = InterfaceRequest {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TUN | IFF_NO_PI,
        _pad: [0; 22],
    };
    for (slot, byte) in request.name.iter_mut().zip(name.bytes()) {
        *slot = byte as libc::c_char;
    }

    // SAFETY: request outlives the call and matches struct ifreq's layout
    let rc = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut request as *mut InterfaceRequest) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("TUNSETIFF {}", name));
    }
    Ok(owned)
}
