//! ICMP echo relay over unprivileged ping sockets

use crate::engine::{attach_relay, check_policy, Action, Readiness, StepContext};
use crate::host::Verdict;
use crate::packet::{build_icmp, max_payload, ParsedPacket, TransportInfo, ICMPV4_ECHO_REPLY, ICMPV6_ECHO_REPLY, ICMP_HEADER_LEN};
use crate::relay::{open_ping, Relay};
use crate::session::{FlowKey, Protocol, ProtocolState, Session, SessionId, SessionTable};
use mio::Interest;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpSession {
    /// Echo identifier used by the client
    pub ident: u16,
    pub seq_no: u16,
    pub closing: bool,
}

fn send_echo(session: &mut Session, message: &[u8]) -> io::Result<()> {
    let socket = session
        .relay
        .as_mut()
        .and_then(Relay::as_datagram)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no relay socket"))?;
    let sent = socket.send(message)?;
    session.bytes_sent += sent as u64;
    Ok(())
}

pub fn on_virtual_packet(
    ctx: &mut StepContext<'_>,
    table: &mut SessionTable,
    packet: &ParsedPacket<'_>,
    raw: &[u8],
) -> Vec<Action> {
    let TransportInfo::Icmp(info) = &packet.transport else {
        return vec![Action::Drop];
    };

    if !info.is_echo_request(packet.version) {
        trace!("ICMP type {} code {} not relayed", info.icmp_type, info.code);
        return vec![Action::Drop];
    }

    let key = FlowKey::new(
        Protocol::Icmp,
        SocketAddr::new(packet.src_addr, info.ident),
        SocketAddr::new(packet.dst_addr, 0),
    );
    let message = &raw[packet.transport_offset..packet.total_len];

    if let Some(id) = table.lookup(&key) {
        let Some(session) = table.get_mut(id) else {
            return vec![Action::Drop];
        };
        session.touch(ctx.now);
        if let ProtocolState::Icmp(state) = &mut session.state {
            state.closing = false;
            state.seq_no = info.seq_no;
        }
        if let Err(e) = send_echo(session, message) {
            debug!(flow = %key, "echo send failed: {}", e);
            return vec![Action::Close(id)];
        }
        return Vec::new();
    }

    let data = format!("type {}/{}", info.icmp_type, info.code);
    let (verdict, uid) = check_policy(ctx, &key, "", data);
    if verdict == Verdict::Deny {
        return vec![Action::Drop];
    }

    let socket = match open_ping(packet.dst_addr, ctx.host, ctx.run.platform_version) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(flow = %key, "ping socket failed: {}", e);
            ctx.stats.record_denied();
            return vec![Action::Error(e)];
        }
    };

    let state = IcmpSession {
        ident: info.ident,
        seq_no: info.seq_no,
        closing: false,
    };
    let id = match table.insert(key, uid, ProtocolState::Icmp(state), ctx.now) {
        Ok(id) => id,
        Err(e) => return vec![Action::Error(e)],
    };
    let Some(session) = table.get_mut(id) else {
        return vec![Action::Drop];
    };

    if let Err(e) = attach_relay(ctx, session, Relay::Datagram(socket), Interest::READABLE) {
        return vec![Action::Close(id), Action::Error(e)];
    }
    debug!(id, flow = %key, seq = info.seq_no, "ICMP echo session");

    if let Err(e) = send_echo(session, message) {
        debug!(flow = %key, "echo send failed: {}", e);
        return vec![Action::Close(id)];
    }
    Vec::new()
}

pub fn on_relay_ready(
    ctx: &mut StepContext<'_>,
    table: &mut SessionTable,
    id: SessionId,
    readiness: Readiness,
) -> Vec<Action> {
    let Some(session) = table.get_mut(id) else {
        return Vec::new();
    };
    let key = session.key;
    let Session { relay, state, bytes_received, last_activity, .. } = session;
    let ProtocolState::Icmp(icmp) = state else {
        return Vec::new();
    };
    let Some(socket) = relay.as_mut().and_then(Relay::as_datagram) else {
        return Vec::new();
    };

    let mut actions = Vec::new();
    if readiness.error {
        if let Ok(Some(e)) = socket.take_error() {
            debug!(flow = %key, "ICMP socket error: {}", e);
        }
        icmp.closing = true;
        return actions;
    }

    let reply_type = if key.src.is_ipv4() { ICMPV4_ECHO_REPLY } else { ICMPV6_ECHO_REPLY };
    let capacity = max_payload(ctx.config.mtu, key.src.ip(), 0);
    let mut buf = vec![0u8; capacity + 1];
    loop {
        match socket.recv(&mut buf) {
            Ok(n) if n < ICMP_HEADER_LEN => trace!(flow = %key, "short ICMP reply ({} bytes)", n),
            Ok(n) if n > capacity => {
                debug!(flow = %key, "dropping ICMP reply over {} bytes", capacity);
                ctx.stats.record_oversized();
            }
            Ok(n) => {
                let reply = &mut buf[..n];
                if reply[0] != reply_type {
                    trace!(flow = %key, "ignoring ICMP type {}", reply[0]);
                    continue;
                }
                // The kernel rewrote the identifier; restore the client's
                reply[4..6].copy_from_slice(&icmp.ident.to_be_bytes());
                *bytes_received += n as u64;
                *last_activity = ctx.now;
                icmp.closing = true;
                actions.push(Action::from_packet(build_icmp(key.dst.ip(), key.src.ip(), reply)));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(flow = %key, "ICMP recv failed: {}", e);
                icmp.closing = true;
                break;
            }
        }
    }
    actions
}

/// Closing sessions and sessions past the reply timeout are evicted
pub fn expired(ctx: &StepContext<'_>, session: &Session) -> bool {
    let ProtocolState::Icmp(icmp) = &session.state else {
        return false;
    };
    icmp.closing || session.idle_for(ctx.now) >= ctx.config.icmp_timeout()
}
