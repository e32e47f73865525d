//! Relay sockets toward the real network
//!
//! Sockets are created with socket2 so they can be protected before any
//! traffic leaves them, then handed to mio for readiness polling.

use crate::error::{EngineError, Result};
use crate::host::HostBridge;
use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, warn};

/// Platform versions below this need every relay socket protected
pub const PROTECT_BEFORE_VERSION: i32 = 21;

/// A session's socket on the real network
pub enum Relay {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

impl Relay {
    pub fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Relay::Stream(s) => registry.register(s, token, interests),
            Relay::Datagram(s) => registry.register(s, token, interests),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Relay::Stream(s) => registry.deregister(s),
            Relay::Datagram(s) => registry.deregister(s),
        }
    }

    pub fn as_stream(&mut self) -> Option<&mut TcpStream> {
        match self {
            Relay::Stream(s) => Some(s),
            Relay::Datagram(_) => None,
        }
    }

    pub fn as_datagram(&mut self) -> Option<&mut UdpSocket> {
        match self {
            Relay::Datagram(s) => Some(s),
            Relay::Stream(_) => None,
        }
    }

    /// Pending socket error, if any
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Relay::Stream(s) => s.take_error(),
            Relay::Datagram(s) => s.take_error(),
        }
    }
}

impl AsRawFd for Relay {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Relay::Stream(s) => s.as_raw_fd(),
            Relay::Datagram(s) => s.as_raw_fd(),
        }
    }
}

/// Protect `socket` through the host when the platform requires it
fn protect(socket: &Socket, host: &mut dyn HostBridge, platform_version: i32) -> Result<()> {
    if platform_version >= PROTECT_BEFORE_VERSION {
        return Ok(());
    }
    let fd = socket.as_raw_fd();
    if host.protect(fd) {
        debug!("Socket fd={} protected", fd);
        Ok(())
    } else {
        warn!("Socket fd={} protection FAILED", fd);
        Err(EngineError::ProtectFailed(fd))
    }
}

fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

/// Start a non-blocking TCP connect to `target`
pub fn open_stream(target: SocketAddr, host: &mut dyn HostBridge, platform_version: i32) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(SockProtocol::TCP))?;
    protect(&socket, host, platform_version)?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&SockAddr::from(target)) {
        Ok(()) => {}
        Err(e) if in_progress(&e) => {}
        Err(e) => return Err(EngineError::Relay(format!("connect {}: {}", target, e))),
    }

    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from_std(std_stream))
}

/// Open a UDP socket connected to `target`
pub fn open_datagram(target: SocketAddr, host: &mut dyn HostBridge, platform_version: i32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(SockProtocol::UDP))?;
    protect(&socket, host, platform_version)?;
    socket.set_nonblocking(true)?;
    socket
        .connect(&SockAddr::from(target))
        .map_err(|e| EngineError::Relay(format!("connect {}: {}", target, e)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket))
}

/// Open an unprivileged ping socket connected to `target`.
///
/// The kernel owns the echo identifier of these sockets and only delivers
/// echo replies matching it.
pub fn open_ping(target: IpAddr, host: &mut dyn HostBridge, platform_version: i32) -> Result<UdpSocket> {
    let (domain, protocol) = match target {
        IpAddr::V4(_) => (Domain::IPV4, SockProtocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, SockProtocol::ICMPV6),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    protect(&socket, host, platform_version)?;
    socket.set_nonblocking(true)?;
    socket
        .connect(&SockAddr::from(SocketAddr::new(target, 0)))
        .map_err(|e| EngineError::Relay(format!("connect {}: {}", target, e)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket))
}
