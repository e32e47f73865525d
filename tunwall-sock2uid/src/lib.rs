//! Owning-uid lookup for local sockets.
//!
//! Relayed flows originate from processes on this device. The kernel publishes
//! every socket in per-protocol tables under `/proc/net`, including the uid of
//! the owner, so a flow's client tuple is enough to find who opened it.

use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport protocol of the socket table to search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl SocketProtocol {
    /// Base name of the kernel table for this protocol
    pub fn table_name(&self) -> &'static str {
        match self {
            SocketProtocol::Tcp => "tcp",
            SocketProtocol::Udp => "udp",
            SocketProtocol::Icmp => "icmp",
        }
    }
}

impl fmt::Display for SocketProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// One row of a kernel socket table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub uid: u32,
    pub inode: u64,
}

#[derive(Debug, Error)]
pub enum Sock2UidError {
    #[error("Socket not found")]
    NotFound,
    #[error("Malformed socket table line: {0}")]
    Malformed(String),
    #[error("System error: {0}")]
    SystemError(String),
    #[error("Not implemented for this platform")]
    NotImplemented,
}

pub type Result<T> = std::result::Result<T, Sock2UidError>;

/// Find the uid owning the socket bound to `local` (and, for TCP, connected to `remote`)
pub fn find_uid(protocol: SocketProtocol, local: SocketAddr, remote: SocketAddr) -> Result<u32> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        platform::linux::find_uid(protocol, local, remote)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (protocol, local, remote);
        Err(Sock2UidError::NotImplemented)
    }
}

/// List all sockets of a protocol family
pub fn socket_entries(protocol: SocketProtocol, ipv6: bool) -> Result<Vec<SocketEntry>> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        platform::linux::socket_entries(protocol, ipv6)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (protocol, ipv6);
        Err(Sock2UidError::NotImplemented)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod platform {
    pub mod linux;
}
