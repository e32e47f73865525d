use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tracing::trace;

use crate::{Result, SocketEntry, SocketProtocol, Sock2UidError};

/// Convert a kernel hex word to an IPv4 address.
///
/// The kernel prints the raw 32-bit word in host byte order.
fn hex_to_ipv4(hex: &str) -> Result<Ipv4Addr> {
    if hex.len() != 8 {
        return Err(Sock2UidError::Malformed(hex.to_string()));
    }
    let word = u32::from_str_radix(hex, 16).map_err(|_| Sock2UidError::Malformed(hex.to_string()))?;
    Ok(Ipv4Addr::from(word.to_ne_bytes()))
}

/// Convert four kernel hex words to an IPv6 address
fn hex_to_ipv6(hex: &str) -> Result<Ipv6Addr> {
    if hex.len() != 32 || !hex.is_ascii() {
        return Err(Sock2UidError::Malformed(hex.to_string()));
    }

    let mut bytes = [0u8; 16];
    for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
        let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16)
            .map_err(|_| Sock2UidError::Malformed(hex.to_string()))?;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    Ok(Ipv6Addr::from(bytes))
}

fn hex_to_port(hex: &str) -> Result<u16> {
    u16::from_str_radix(hex, 16).map_err(|_| Sock2UidError::Malformed(hex.to_string()))
}

/// Parse an `ADDR:PORT` column
fn parse_socket_addr(field: &str, is_ipv6: bool) -> Result<SocketAddr> {
    let (addr, port) = field
        .split_once(':')
        .ok_or_else(|| Sock2UidError::Malformed(field.to_string()))?;

    let port = hex_to_port(port)?;
    let ip = if is_ipv6 {
        IpAddr::V6(hex_to_ipv6(addr)?)
    } else {
        IpAddr::V4(hex_to_ipv4(addr)?)
    };

    Ok(SocketAddr::new(ip, port))
}

/// Parse one data line of /proc/net/{tcp,udp,icmp}[6]
fn parse_line(line: &str, is_ipv6: bool) -> Result<SocketEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return Err(Sock2UidError::Malformed(line.to_string()));
    }

    let local = parse_socket_addr(parts[1], is_ipv6)?;
    let remote = parse_socket_addr(parts[2], is_ipv6)?;
    let uid = parts[7]
        .parse::<u32>()
        .map_err(|_| Sock2UidError::Malformed(line.to_string()))?;
    let inode = parts[9]
        .parse::<u64>()
        .map_err(|_| Sock2UidError::Malformed(line.to_string()))?;

    Ok(SocketEntry {
        local,
        remote,
        uid,
        inode,
    })
}

fn parse_table(content: &str, is_ipv6: bool) -> Vec<SocketEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| match parse_line(line, is_ipv6) {
            Ok(entry) => Some(entry),
            Err(e) => {
                trace!("skipping socket table line: {}", e);
                None
            }
        })
        .collect()
}

pub fn socket_entries(protocol: SocketProtocol, ipv6: bool) -> Result<Vec<SocketEntry>> {
    let path = if ipv6 {
        format!("/proc/net/{}6", protocol.table_name())
    } else {
        format!("/proc/net/{}", protocol.table_name())
    };

    let content = fs::read_to_string(&path)
        .map_err(|e| Sock2UidError::SystemError(format!("{}: {}", path, e)))?;

    Ok(parse_table(&content, ipv6))
}

/// Normalize IPv4-mapped IPv6 addresses so both tables compare equal
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn matches(
    entry: &SocketEntry,
    protocol: SocketProtocol,
    local: SocketAddr,
    remote: SocketAddr,
) -> bool {
    if entry.local.port() != local.port() {
        return false;
    }

    let entry_ip = canonical(entry.local.ip());
    if entry_ip != canonical(local.ip()) && !entry_ip.is_unspecified() {
        return false;
    }

    match protocol {
        SocketProtocol::Tcp => {
            canonical(entry.remote.ip()) == canonical(remote.ip()) && entry.remote.port() == remote.port()
        }
        // Unconnected datagram sockets list a zero remote
        SocketProtocol::Udp | SocketProtocol::Icmp => {
            entry.remote.port() == 0 || entry.remote.port() == remote.port()
        }
    }
}

fn search(entries: &[SocketEntry], protocol: SocketProtocol, local: SocketAddr, remote: SocketAddr) -> Option<u32> {
    // Prefer an exact local address over a wildcard bind
    let mut wildcard = None;
    for entry in entries.iter().filter(|e| matches(e, protocol, local, remote)) {
        if canonical(entry.local.ip()).is_unspecified() {
            wildcard.get_or_insert(entry.uid);
        } else {
            return Some(entry.uid);
        }
    }
    wildcard
}

pub fn find_uid(protocol: SocketProtocol, local: SocketAddr, remote: SocketAddr) -> Result<u32> {
    let tables: &[bool] = if local.is_ipv4() { &[false, true] } else { &[true] };

    for &ipv6 in tables {
        let entries = match socket_entries(protocol, ipv6) {
            Ok(entries) => entries,
            Err(e) => {
                trace!("{} table unavailable: {}", protocol, e);
                continue;
            }
        };

        if let Some(uid) = search(&entries, protocol, local, remote) {
            return Ok(uid);
        }
    }

    Err(Sock2UidError::NotFound)
}
