//! Packet parsing and building using smoltcp wire types
//!
//! Every field read is bounds-checked against the buffer actually received:
//! the smoltcp `new_checked` constructors validate header and total lengths
//! before any accessor runs, and option parsing never indexes past the TCP
//! header length. Builders compute IPv4 header and transport checksums
//! (pseudo-header included) from scratch.

use crate::error::{EngineError, Result};
use smoltcp::wire::{IpProtocol, IpVersion, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_HEADER_LEN: usize = 8;

pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

const DEFAULT_TTL: u8 = 64;

static IP_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn syn_only() -> Self {
        Self { syn: true, ..Default::default() }
    }
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        flags
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
            urg: byte & 0x20 != 0,
        }
    }
}

/// Compact flag string as shown in packet logs, e.g. `SA` or `PF`
impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marks = [
            (self.syn, 'S'),
            (self.ack, 'A'),
            (self.psh, 'P'),
            (self.fin, 'F'),
            (self.rst, 'R'),
            (self.urg, 'U'),
        ];
        for (set, mark) in marks {
            if set {
                write!(f, "{}", mark)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket<'a> {
    pub version: IpVersion,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: IpProtocol,
    /// Offset of the transport header within the buffer
    pub transport_offset: usize,
    /// Offset of the transport payload within the buffer
    pub payload_offset: usize,
    /// Total IP length (may be shorter than the buffer)
    pub total_len: usize,
    pub transport: TransportInfo,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportInfo {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    Icmp(IcmpInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub header_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpInfo {
    pub icmp_type: u8,
    pub code: u8,
    /// Echo identifier; zero for non-echo messages
    pub ident: u16,
    /// Echo sequence number; zero for non-echo messages
    pub seq_no: u16,
}

impl IcmpInfo {
    pub fn is_echo_request(&self, version: IpVersion) -> bool {
        match version {
            IpVersion::Ipv4 => self.icmp_type == ICMPV4_ECHO_REQUEST,
            IpVersion::Ipv6 => self.icmp_type == ICMPV6_ECHO_REQUEST,
        }
    }
}

impl<'a> ParsedPacket<'a> {
    /// Source port, or the echo identifier for ICMP
    pub fn src_port(&self) -> u16 {
        match &self.transport {
            TransportInfo::Tcp(t) => t.src_port,
            TransportInfo::Udp(u) => u.src_port,
            TransportInfo::Icmp(i) => i.ident,
        }
    }

    /// Destination port; zero for ICMP
    pub fn dst_port(&self) -> u16 {
        match &self.transport {
            TransportInfo::Tcp(t) => t.dst_port,
            TransportInfo::Udp(u) => u.dst_port,
            TransportInfo::Icmp(_) => 0,
        }
    }

    pub fn src_socket(&self) -> SocketAddr {
        SocketAddr::new(self.src_addr, self.src_port())
    }

    pub fn dst_socket(&self) -> SocketAddr {
        SocketAddr::new(self.dst_addr, self.dst_port())
    }

    pub fn is_tcp_syn(&self) -> bool {
        matches!(&self.transport, TransportInfo::Tcp(t) if t.flags.syn && !t.flags.ack)
    }

    pub fn is_dns(&self) -> bool {
        matches!(&self.transport, TransportInfo::Udp(u) if u.dst_port == 53)
    }

    pub fn version_number(&self) -> u8 {
        ip_version_number(self.version)
    }
}

pub fn ip_version_number(version: IpVersion) -> u8 {
    match version {
        IpVersion::Ipv4 => 4,
        IpVersion::Ipv6 => 6,
    }
}

/// Parse an IP packet, optionally verifying every checksum
pub fn parse_packet(data: &[u8], verify_checksums: bool) -> Result<ParsedPacket<'_>> {
    if data.is_empty() {
        return Err(EngineError::PacketTooShort { expected: 1, actual: 0 });
    }

    let version = data[0] >> 4;
    match version {
        4 => parse_ipv4(data, verify_checksums),
        6 => parse_ipv6(data, verify_checksums),
        _ => Err(EngineError::InvalidIpVersion(version)),
    }
}

fn parse_ipv4(data: &[u8], verify: bool) -> Result<ParsedPacket<'_>> {
    if data.len() < IPV4_HEADER_LEN {
        return Err(EngineError::PacketTooShort { expected: IPV4_HEADER_LEN, actual: data.len() });
    }

    let ihl = data[0] & 0x0f;
    if ihl < 5 {
        return Err(EngineError::InvalidPacket(format!("IPv4 header length {} words", ihl)));
    }

    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("IPv4: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    if verify && checksum(&data[..header_len]) != 0 {
        return Err(EngineError::ChecksumMismatch("IPv4"));
    }

    if pkt.more_frags() || pkt.frag_offset() != 0 {
        return Err(EngineError::InvalidPacket("IPv4 fragment".to_string()));
    }

    let src = IpAddr::V4(pkt.src_addr());
    let dst = IpAddr::V4(pkt.dst_addr());
    let protocol = pkt.next_header();
    if protocol == IpProtocol::Icmpv6 {
        return Err(EngineError::UnsupportedProtocol(protocol.into()));
    }

    let total_len = pkt.total_len() as usize;
    let segment = &data[header_len..total_len];
    let (transport, payload_start) = parse_transport(protocol, src, dst, segment, verify)?;

    Ok(ParsedPacket {
        version: IpVersion::Ipv4,
        src_addr: src,
        dst_addr: dst,
        protocol,
        transport_offset: header_len,
        payload_offset: header_len + payload_start.start,
        total_len,
        transport,
        payload: &segment[payload_start],
    })
}

fn parse_ipv6(data: &[u8], verify: bool) -> Result<ParsedPacket<'_>> {
    if data.len() < IPV6_HEADER_LEN {
        return Err(EngineError::PacketTooShort { expected: IPV6_HEADER_LEN, actual: data.len() });
    }

    let pkt = Ipv6Packet::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("IPv6: {}", e)))?;

    let src = IpAddr::V6(pkt.src_addr());
    let dst = IpAddr::V6(pkt.dst_addr());
    // Extension headers are not walked; they surface as unsupported protocols
    let protocol = pkt.next_header();
    if protocol == IpProtocol::Icmp {
        return Err(EngineError::UnsupportedProtocol(protocol.into()));
    }

    let total_len = IPV6_HEADER_LEN + pkt.payload_len() as usize;
    let segment = &data[IPV6_HEADER_LEN..total_len];
    let (transport, payload_range) = parse_transport(protocol, src, dst, segment, verify)?;

    Ok(ParsedPacket {
        version: IpVersion::Ipv6,
        src_addr: src,
        dst_addr: dst,
        protocol,
        transport_offset: IPV6_HEADER_LEN,
        payload_offset: IPV6_HEADER_LEN + payload_range.start,
        total_len,
        transport,
        payload: &segment[payload_range],
    })
}

type PayloadRange = std::ops::Range<usize>;

fn parse_transport(
    protocol: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
    segment: &[u8],
    verify: bool,
) -> Result<(TransportInfo, PayloadRange)> {
    match protocol {
        IpProtocol::Tcp => parse_tcp(src, dst, segment, verify),
        IpProtocol::Udp => parse_udp(src, dst, segment, verify),
        IpProtocol::Icmp | IpProtocol::Icmpv6 => parse_icmp(protocol, src, dst, segment, verify),
        other => Err(EngineError::UnsupportedProtocol(other.into())),
    }
}

fn parse_tcp(src: IpAddr, dst: IpAddr, data: &[u8], verify: bool) -> Result<(TransportInfo, PayloadRange)> {
    if data.len() < TCP_HEADER_LEN {
        return Err(EngineError::PacketTooShort { expected: TCP_HEADER_LEN, actual: data.len() });
    }

    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("TCP: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    if header_len < TCP_HEADER_LEN || header_len > data.len() {
        return Err(EngineError::InvalidPacket(format!("TCP header length {}", header_len)));
    }

    if verify && transport_checksum(src, dst, IpProtocol::Tcp.into(), data) != 0 {
        return Err(EngineError::ChecksumMismatch("TCP"));
    }

    let mss = parse_mss_option(&data[TCP_HEADER_LEN..header_len]);

    let info = TcpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
            urg: pkt.urg(),
        },
        window: pkt.window_len(),
        mss,
        header_len,
    };

    Ok((TransportInfo::Tcp(info), header_len..data.len()))
}

fn parse_mss_option(opts: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            kind => {
                let len = *opts.get(i + 1)? as usize;
                if len < 2 || i + len > opts.len() {
                    return None;
                }
                if kind == 2 && len == 4 {
                    return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                }
                i += len;
            }
        }
    }
    None
}

fn parse_udp(src: IpAddr, dst: IpAddr, data: &[u8], verify: bool) -> Result<(TransportInfo, PayloadRange)> {
    if data.len() < UDP_HEADER_LEN {
        return Err(EngineError::PacketTooShort { expected: UDP_HEADER_LEN, actual: data.len() });
    }

    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("UDP: {}", e)))?;

    let udp_len = pkt.len() as usize;
    let stored = pkt.checksum();
    let skip = src.is_ipv4() && stored == 0;
    if verify && !skip && transport_checksum(src, dst, IpProtocol::Udp.into(), &data[..udp_len]) != 0 {
        return Err(EngineError::ChecksumMismatch("UDP"));
    }

    let info = UdpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
    };

    Ok((TransportInfo::Udp(info), UDP_HEADER_LEN..udp_len))
}

fn parse_icmp(
    protocol: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
    data: &[u8],
    verify: bool,
) -> Result<(TransportInfo, PayloadRange)> {
    if data.len() < ICMP_HEADER_LEN {
        return Err(EngineError::PacketTooShort { expected: ICMP_HEADER_LEN, actual: data.len() });
    }

    if verify {
        let sum = if protocol == IpProtocol::Icmpv6 {
            transport_checksum(src, dst, protocol.into(), data)
        } else {
            checksum(data)
        };
        if sum != 0 {
            return Err(EngineError::ChecksumMismatch("ICMP"));
        }
    }

    let icmp_type = data[0];
    let is_echo = matches!(
        icmp_type,
        ICMPV4_ECHO_REPLY | ICMPV4_ECHO_REQUEST | ICMPV6_ECHO_REQUEST | ICMPV6_ECHO_REPLY
    );
    let (ident, seq_no) = if is_echo {
        (
            u16::from_be_bytes([data[4], data[5]]),
            u16::from_be_bytes([data[6], data[7]]),
        )
    } else {
        (0, 0)
    };

    let info = IcmpInfo {
        icmp_type,
        code: data[1],
        ident,
        seq_no,
    };

    Ok((TransportInfo::Icmp(info), ICMP_HEADER_LEN..data.len()))
}

/// Write an IP header for `transport_len` bytes of `protocol` and return the buffer
fn build_ip(src: IpAddr, dst: IpAddr, protocol: IpProtocol, transport_len: usize) -> Result<(Vec<u8>, usize)> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total_len = IPV4_HEADER_LEN + transport_len;
            if total_len > u16::MAX as usize {
                return Err(EngineError::InvalidPacket(format!("IPv4 packet of {} bytes", total_len)));
            }

            let mut pkt = vec![0u8; total_len];
            pkt[0] = 0x45;
            pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
            pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());
            pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
            pkt[8] = DEFAULT_TTL;
            pkt[9] = protocol.into();
            pkt[12..16].copy_from_slice(&s.octets());
            pkt[16..20].copy_from_slice(&d.octets());

            let ip_cksum = checksum(&pkt[..IPV4_HEADER_LEN]);
            pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
            Ok((pkt, IPV4_HEADER_LEN))
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            if transport_len > u16::MAX as usize {
                return Err(EngineError::InvalidPacket(format!("IPv6 payload of {} bytes", transport_len)));
            }

            let mut pkt = vec![0u8; IPV6_HEADER_LEN + transport_len];
            pkt[0] = 0x60;
            pkt[4..6].copy_from_slice(&(transport_len as u16).to_be_bytes());
            pkt[6] = protocol.into();
            pkt[7] = DEFAULT_TTL;
            pkt[8..24].copy_from_slice(&s.octets());
            pkt[24..40].copy_from_slice(&d.octets());
            Ok((pkt, IPV6_HEADER_LEN))
        }
        (s, d) => Err(EngineError::AddressFamilyMismatch(s, d)),
    }
}

/// Build a TCP segment, with an MSS option on SYN segments when given
#[allow(clippy::too_many_arguments)]
pub fn build_tcp(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    mss: Option<u16>,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let opts_len = if flags.syn && mss.is_some() { 4 } else { 0 };
    let tcp_hdr_len = TCP_HEADER_LEN + opts_len;
    let (mut pkt, start) = build_ip(src.ip(), dst.ip(), IpProtocol::Tcp, tcp_hdr_len + payload.len())?;

    let tcp = &mut pkt[start..];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = ((tcp_hdr_len / 4) as u8) << 4;
    tcp[13] = flags.to_byte();
    tcp[14..16].copy_from_slice(&window.to_be_bytes());

    if let (true, Some(mss_val)) = (flags.syn, mss) {
        tcp[20] = 2;
        tcp[21] = 4;
        tcp[22..24].copy_from_slice(&mss_val.to_be_bytes());
    }

    tcp[tcp_hdr_len..].copy_from_slice(payload);

    let cksum = transport_checksum(src.ip(), dst.ip(), IpProtocol::Tcp.into(), tcp);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

    Ok(pkt)
}

/// Build a UDP datagram
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let (mut pkt, start) = build_ip(src.ip(), dst.ip(), IpProtocol::Udp, udp_len)?;

    let udp = &mut pkt[start..];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    let mut cksum = transport_checksum(src.ip(), dst.ip(), IpProtocol::Udp.into(), udp);
    if cksum == 0 {
        cksum = 0xFFFF;
    }
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    Ok(pkt)
}

/// Largest transport payload that still fits in one `mtu`-sized packet
pub fn max_payload(mtu: usize, ip: IpAddr, transport_header_len: usize) -> usize {
    let ip_header_len = if ip.is_ipv4() { IPV4_HEADER_LEN } else { IPV6_HEADER_LEN };
    mtu.saturating_sub(ip_header_len + transport_header_len)
}

/// Build an ICMP/ICMPv6 packet around `message` (header included); the checksum is recomputed
pub fn build_icmp(src: IpAddr, dst: IpAddr, message: &[u8]) -> Result<Vec<u8>> {
    if message.len() < ICMP_HEADER_LEN {
        return Err(EngineError::PacketTooShort { expected: ICMP_HEADER_LEN, actual: message.len() });
    }

    let protocol = if src.is_ipv4() { IpProtocol::Icmp } else { IpProtocol::Icmpv6 };
    let (mut pkt, start) = build_ip(src, dst, protocol, message.len())?;

    let icmp = &mut pkt[start..];
    icmp.copy_from_slice(message);
    icmp[2..4].copy_from_slice(&[0, 0]);

    let cksum = if protocol == IpProtocol::Icmpv6 {
        transport_checksum(src, dst, protocol.into(), icmp)
    } else {
        checksum(icmp)
    };
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());

    Ok(pkt)
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum; returns zero when run over data that carries a valid checksum
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Transport checksum including the IPv4 or IPv6 pseudo-header
pub fn transport_checksum(src: IpAddr, dst: IpAddr, proto: u8, data: &[u8]) -> u16 {
    let mut sum = 0u32;
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum = sum_words(&s.octets(), sum);
            sum = sum_words(&d.octets(), sum);
            sum = sum.wrapping_add(proto as u32);
            sum = sum.wrapping_add(data.len() as u32);
        }
        _ => {
            let s = match src {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let d = match dst {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            sum = sum_words(&s.octets(), sum);
            sum = sum_words(&d.octets(), sum);
            let len = data.len() as u32;
            sum = sum.wrapping_add(len >> 16).wrapping_add(len & 0xFFFF);
            sum = sum.wrapping_add(proto as u32);
        }
    }
    fold(sum_words(data, sum))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parses_built_ipv4_udp() {
        let pkt = build_udp(v4("10.1.10.1:40000"), v4("8.8.8.8:53"), b"query").unwrap();
        let parsed = parse_packet(&pkt, true).unwrap();

        assert_eq!(parsed.version, IpVersion::Ipv4);
        assert_eq!(parsed.protocol, IpProtocol::Udp);
        assert_eq!(parsed.src_socket(), v4("10.1.10.1:40000"));
        assert_eq!(parsed.dst_socket(), v4("8.8.8.8:53"));
        assert_eq!(parsed.payload, b"query");
        assert_eq!(parsed.payload_offset, 28);
        assert!(parsed.is_dns());
    }

    #[test]
    fn short_ipv4_header_length_is_rejected_without_checksums() {
        let mut pkt = build_udp(v4("10.1.10.1:40000"), v4("8.8.8.8:53"), b"query").unwrap();
        for ihl in [0u8, 4] {
            pkt[0] = 0x40 | ihl;
            assert!(matches!(parse_packet(&pkt, false), Err(EngineError::InvalidPacket(_))));
        }
    }

    #[test]
    fn payload_budget_leaves_room_for_headers() {
        let v4_ip: IpAddr = "10.0.0.1".parse().unwrap();
        let v6_ip: IpAddr = "fd00::1".parse().unwrap();
        assert_eq!(max_payload(1500, v4_ip, UDP_HEADER_LEN), 1472);
        assert_eq!(max_payload(1500, v6_ip, UDP_HEADER_LEN), 1452);
        assert_eq!(max_payload(1500, v4_ip, 0), 1480);

        let payload = vec![0u8; max_payload(1500, v4_ip, UDP_HEADER_LEN)];
        let pkt = build_udp(v4("10.0.0.1:53"), v4("10.0.0.2:4000"), &payload).unwrap();
        assert_eq!(pkt.len(), 1500);
    }

    #[test]
    fn parses_built_ipv6_tcp_syn_with_mss() {
        let src: SocketAddr = "[fd00::2]:51000".parse().unwrap();
        let dst: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let pkt = build_tcp(src, dst, 1000, 0, TcpFlags::syn_only(), 65535, Some(1400), &[]).unwrap();
        let parsed = parse_packet(&pkt, true).unwrap();

        assert_eq!(parsed.version, IpVersion::Ipv6);
        assert!(parsed.is_tcp_syn());
        match parsed.transport {
            TransportInfo::Tcp(ref tcp) => {
                assert_eq!(tcp.seq, 1000);
                assert_eq!(tcp.mss, Some(1400));
                assert_eq!(tcp.header_len, 24);
                assert_eq!(tcp.window, 65535);
            }
            ref other => panic!("unexpected transport {:?}", other),
        }
    }

    #[test]
    fn parses_icmp_echo() {
        let mut echo = vec![ICMPV4_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0x00, 0x07];
        echo.extend_from_slice(b"ping");
        let pkt = build_icmp("10.0.0.2".parse().unwrap(), "1.1.1.1".parse().unwrap(), &echo).unwrap();
        let parsed = parse_packet(&pkt, true).unwrap();

        match parsed.transport {
            TransportInfo::Icmp(ref icmp) => {
                assert!(icmp.is_echo_request(IpVersion::Ipv4));
                assert_eq!(icmp.ident, 0x1234);
                assert_eq!(icmp.seq_no, 7);
            }
            ref other => panic!("unexpected transport {:?}", other),
        }
        assert_eq!(parsed.payload, b"ping");
        assert_eq!(parsed.src_port(), 0x1234);
    }

    #[test]
    fn icmpv6_checksum_covers_pseudo_header() {
        let mut echo = vec![ICMPV6_ECHO_REQUEST, 0, 0, 0, 0, 1, 0, 1];
        echo.extend_from_slice(&[0xAB; 13]);
        let src: IpAddr = "fd00::2".parse().unwrap();
        let dst: IpAddr = "2001:db8::53".parse().unwrap();
        let mut pkt = build_icmp(src, dst, &echo).unwrap();
        assert!(parse_packet(&pkt, true).is_ok());

        // Same message under another destination no longer verifies
        pkt[39] ^= 0x01;
        assert!(matches!(parse_packet(&pkt, true), Err(EngineError::ChecksumMismatch("ICMP"))));
    }

    #[test]
    fn rejects_corrupted_checksums() {
        let mut pkt = build_tcp(v4("10.0.0.2:1234"), v4("1.2.3.4:80"), 1, 2, TcpFlags::psh_ack(), 1024, None, b"data").unwrap();
        let last = pkt.len() - 1;
        pkt[last] ^= 0xFF;

        assert!(matches!(parse_packet(&pkt, true), Err(EngineError::ChecksumMismatch("TCP"))));
        assert!(parse_packet(&pkt, false).is_ok());

        let mut pkt = build_udp(v4("10.0.0.2:1234"), v4("1.2.3.4:80"), b"x").unwrap();
        pkt[10] ^= 0x01;
        assert!(matches!(parse_packet(&pkt, true), Err(EngineError::ChecksumMismatch("IPv4"))));
    }

    #[test]
    fn zero_udp_checksum_is_accepted_on_ipv4() {
        let mut pkt = build_udp(v4("10.0.0.2:1234"), v4("1.2.3.4:9"), b"abc").unwrap();
        pkt[26] = 0;
        pkt[27] = 0;
        assert!(parse_packet(&pkt, true).is_ok());
    }

    #[test]
    fn rejects_unsupported_and_mismatched_input() {
        assert!(matches!(parse_packet(&[], true), Err(EngineError::PacketTooShort { .. })));
        assert!(matches!(parse_packet(&[0x50; 40], true), Err(EngineError::InvalidIpVersion(5))));

        let mut gre = build_udp(v4("10.0.0.2:1"), v4("10.0.0.3:2"), b"").unwrap();
        gre[9] = 47;
        gre[10] = 0;
        gre[11] = 0;
        let cksum = checksum(&gre[..20]);
        gre[10..12].copy_from_slice(&cksum.to_be_bytes());
        assert!(matches!(parse_packet(&gre, true), Err(EngineError::UnsupportedProtocol(47))));

        let mixed = build_udp(v4("10.0.0.2:1"), "[::1]:2".parse().unwrap(), b"");
        assert!(matches!(mixed, Err(EngineError::AddressFamilyMismatch(..))));
    }

    #[test]
    fn rejects_fragments() {
        let mut pkt = build_udp(v4("10.0.0.2:1"), v4("10.0.0.3:2"), b"frag").unwrap();
        pkt[6] = 0x20;
        pkt[10] = 0;
        pkt[11] = 0;
        let cksum = checksum(&pkt[..20]);
        pkt[10..12].copy_from_slice(&cksum.to_be_bytes());
        assert!(matches!(parse_packet(&pkt, true), Err(EngineError::InvalidPacket(_))));
    }

    #[test]
    fn flag_strings_follow_log_convention() {
        assert_eq!(TcpFlags::syn_ack().to_string(), "SA");
        assert_eq!(TcpFlags::fin_ack().to_string(), "AF");
        assert_eq!(TcpFlags::from_byte(0x3F).to_string(), "SAPFRU");
        assert_eq!(TcpFlags::from_byte(TcpFlags::rst_ack().to_byte()), TcpFlags::rst_ack());
    }

    #[test]
    fn mss_option_parsing_is_bounded() {
        assert_eq!(parse_mss_option(&[1, 1, 2, 4, 0x05, 0xB4]), Some(1460));
        assert_eq!(parse_mss_option(&[2, 4, 0x05]), None);
        assert_eq!(parse_mss_option(&[3, 0]), None);
        assert_eq!(parse_mss_option(&[8]), None);
    }
}
