//! UDP pseudo-connection relay
//!
//! A UDP session is only an idle-bounded mapping from a client tuple to a
//! connected relay socket. Port-53 traffic is inspected on the way out (to
//! block names) and on the way back (to report resolutions).

use crate::dns;
use crate::engine::{attach_relay, check_policy, Action, Readiness, StepContext};
use crate::host::{now_millis, DnsRecord, Verdict};
use crate::packet::{build_udp, max_payload, ParsedPacket, UDP_HEADER_LEN};
use crate::relay::{open_datagram, Relay};
use crate::session::{FlowKey, Protocol, ProtocolState, Session, SessionId, SessionTable};
use mio::Interest;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Once;
use tracing::{debug, info, trace, warn};

pub const DNS_PORT: u16 = 53;

static UPSTREAM_UDP_WARNING: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    Active,
    Closing,
}

impl fmt::Display for UdpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdpState::Active => write!(f, "ACTIVE"),
            UdpState::Closing => write!(f, "CLOSING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpSession {
    pub state: UdpState,
    /// Where the relay socket is connected, when it differs from the flow's destination
    pub relay_target: Option<SocketAddr>,
}

impl UdpSession {
    pub fn new(relay_target: Option<SocketAddr>) -> Self {
        Self {
            state: UdpState::Active,
            relay_target,
        }
    }
}

fn set_closing(session: &mut Session) {
    if let ProtocolState::Udp(udp) = &mut session.state {
        udp.state = UdpState::Closing;
    }
}

/// Send one datagram through the session's relay socket
fn send(session: &mut Session, payload: &[u8]) -> Vec<Action> {
    let Some(socket) = session.relay.as_mut().and_then(Relay::as_datagram) else {
        return vec![Action::Drop];
    };
    match socket.send(payload) {
        Ok(n) => {
            session.bytes_sent += n as u64;
            Vec::new()
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            trace!(flow = %session.key, "relay send would block, dropping datagram");
            vec![Action::Drop]
        }
        Err(e) => {
            debug!(flow = %session.key, "relay send failed: {}", e);
            set_closing(session);
            vec![Action::Drop]
        }
    }
}

/// Answer a blocked DNS query directly on the virtual interface
fn blocked_reply(ctx: &mut StepContext<'_>, key: &FlowKey, query: &[u8]) -> Option<Action> {
    let name = dns::query_name(query)?;
    if !ctx.host.is_domain_blocked(&name) {
        return None;
    }

    info!(flow = %key, "DNS query for blocked domain {} answered with rcode {}", name, ctx.run.forced_rcode);
    let action = match dns::blocked_response(query, ctx.run.forced_rcode) {
        Ok(response) => Action::from_packet(build_udp(key.dst, key.src, &response)),
        Err(e) => {
            debug!(flow = %key, "cannot answer blocked query: {}", e);
            Action::Drop
        }
    };
    Some(action)
}

pub fn on_virtual_packet(ctx: &mut StepContext<'_>, table: &mut SessionTable, packet: &ParsedPacket<'_>) -> Vec<Action> {
    let key = FlowKey::new(Protocol::Udp, packet.src_socket(), packet.dst_socket());
    let payload = packet.payload;

    if key.dst.port() == DNS_PORT {
        if let Some(action) = blocked_reply(ctx, &key, payload) {
            return vec![action];
        }
    }

    if let Some(id) = table.lookup(&key) {
        let Some(session) = table.get_mut(id) else {
            return vec![Action::Drop];
        };
        if matches!(&session.state, ProtocolState::Udp(udp) if udp.state == UdpState::Closing) {
            trace!(flow = %key, "session closing, dropping datagram");
            return vec![Action::Drop];
        }
        session.touch(ctx.now);
        return send(session, payload);
    }

    let data = if key.dst.port() == DNS_PORT {
        dns::query_name(payload).unwrap_or_default()
    } else {
        String::new()
    };
    let (verdict, uid) = check_policy(ctx, &key, "", data);
    let redirect = match verdict {
        Verdict::Deny => return vec![Action::Drop],
        Verdict::Allow { redirect } => redirect,
    };

    let resolver = ctx.config.dns_resolver.filter(|_| ctx.run.dns_forward && key.dst.port() == DNS_PORT);
    let relay_target = resolver.or(redirect);
    let target = relay_target.unwrap_or(key.dst);

    if ctx.upstream.is_some() {
        UPSTREAM_UDP_WARNING.call_once(|| {
            warn!("UDP is not relayed through the SOCKS5 upstream, sending it directly");
        });
    }

    let socket = match open_datagram(target, ctx.host, ctx.run.platform_version) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(flow = %key, "UDP relay socket failed: {}", e);
            ctx.stats.record_denied();
            return vec![Action::Error(e)];
        }
    };

    let id = match table.insert(key, uid, ProtocolState::Udp(UdpSession::new(relay_target)), ctx.now) {
        Ok(id) => id,
        Err(e) => return vec![Action::Error(e)],
    };
    let Some(session) = table.get_mut(id) else {
        return vec![Action::Drop];
    };

    if let Err(e) = attach_relay(ctx, session, Relay::Datagram(socket), Interest::READABLE) {
        return vec![Action::Close(id), Action::Error(e)];
    }
    debug!(id, flow = %key, target = %target, "UDP session");

    send(session, payload)
}

fn report_resolution(ctx: &mut StepContext<'_>, key: &FlowKey, response: &[u8]) {
    let message = match dns::parse_message(response) {
        Ok(message) => message,
        Err(e) => {
            debug!(flow = %key, "unparsable DNS response: {}", e);
            return;
        }
    };
    let query_name = message.query_name().unwrap_or_default().to_string();
    for answer in &message.answers {
        if let Some(resource) = &answer.resource {
            debug!("DNS {} -> {} {} ttl {}", query_name, answer.name, resource, answer.ttl);
            ctx.host.report_dns(&DnsRecord {
                time_ms: now_millis(),
                query_name: query_name.clone(),
                answer_name: answer.name.clone(),
                resource: resource.clone(),
                ttl: answer.ttl,
            });
        }
    }
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

    if readiness.error {
        if let Some(Ok(Some(e))) = session.relay.as_ref().map(Relay::take_error) {
            debug!(flow = %key, "UDP relay error: {}", e);
        }
        set_closing(session);
        return Vec::new();
    }

    let mut actions = Vec::new();
    let mut responses = Vec::new();
    let capacity = max_payload(ctx.config.mtu, key.src.ip(), UDP_HEADER_LEN);
    // One spare byte tells an exact fit from a datagram the kernel cut short
    let mut buf = vec![0u8; capacity + 1];
    let mut failed = false;
    {
        let Some(socket) = session.relay.as_mut().and_then(Relay::as_datagram) else {
            return actions;
        };
        loop {
            match socket.recv(&mut buf) {
                Ok(n) if n > capacity => {
                    debug!(flow = %key, "dropping datagram over {} bytes", capacity);
                    ctx.stats.record_oversized();
                }
                Ok(n) => responses.push(buf[..n].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // ICMP port unreachable surfaces here as ECONNREFUSED
                    debug!(flow = %key, "UDP relay recv failed: {}", e);
                    failed = true;
                    break;
                }
            }
        }
    }
    if failed {
        set_closing(session);
    }

    for response in responses {
        session.bytes_received += response.len() as u64;
        session.touch(ctx.now);
        if key.dst.port() == DNS_PORT {
            report_resolution(ctx, &key, &response);
        }
        actions.push(Action::from_packet(build_udp(key.dst, key.src, &response)));
    }
    actions
}

/// Closing sessions and sessions idle past their timeout are evicted
pub fn expired(ctx: &StepContext<'_>, session: &Session) -> bool {
    let ProtocolState::Udp(udp) = &session.state else {
        return false;
    };
    udp.state == UdpState::Closing || session.idle_for(ctx.now) >= ctx.config.udp_timeout(session.key.dst.port())
}
