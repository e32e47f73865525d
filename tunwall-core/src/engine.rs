//! Protocol engine plumbing shared by the ICMP, UDP and TCP state machines
//!
//! ```text
//!  virtual packet ──► parse_packet ──► icmp / udp / tcp ──► Vec<Action>
//!  relay readiness ─────────────────► icmp / udp / tcp ──► Vec<Action>
//!  sweep tick ──────────────────────► icmp / udp / tcp ──► Vec<Action>
//! ```
//!
//! Engines never write to the virtual interface themselves. They return
//! actions and the dispatcher applies them in order.

use crate::config::{EngineConfig, UpstreamRelay};
use crate::error::EngineError;
use crate::host::{now_millis, HostBridge, PacketRecord, UsageRecord, Verdict};
use crate::packet::{parse_packet, TransportInfo};
use crate::relay::Relay;
use crate::session::{FlowKey, Protocol, Session, SessionId, SessionTable};
use crate::stats::EngineStats;
use crate::{icmp, tcp, udp};
use mio::event::Event;
use mio::{Interest, Registry, Token};
use std::time::Instant;
use tracing::{debug, warn};

/// Result of one engine step
#[derive(Debug)]
pub enum Action {
    /// Write this packet to the virtual interface
    Forward(Vec<u8>),
    Drop,
    /// Tear the session down
    Close(SessionId),
    Error(EngineError),
}

impl Action {
    pub(crate) fn from_packet(packet: crate::error::Result<Vec<u8>>) -> Self {
        match packet {
            Ok(bytes) => Action::Forward(bytes),
            Err(e) => Action::Error(e),
        }
    }
}

/// Parameters fixed for the duration of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    pub platform_version: i32,
    /// Send port-53 traffic to the configured resolver
    pub dns_forward: bool,
    /// Response code for blocked domains
    pub forced_rcode: u8,
}

/// Everything an engine step may touch besides the session table
pub struct StepContext<'a> {
    pub registry: &'a Registry,
    pub host: &'a mut dyn HostBridge,
    pub config: &'a EngineConfig,
    pub upstream: Option<&'a UpstreamRelay>,
    pub stats: &'a EngineStats,
    pub run: RunParams,
    pub now: Instant,
}

/// Readiness of a relay socket, detached from the mio event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
        }
    }
}

/// Ask the host about a new flow and log the decision
pub(crate) fn check_policy(ctx: &mut StepContext<'_>, key: &FlowKey, flags: &str, data: String) -> (Verdict, i32) {
    let uid = ctx.host.owner_uid(key);
    let verdict = match ctx.host.decide(key, uid) {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!("Policy call failed for {}, denying: {}", key, e);
            Verdict::Deny
        }
    };

    ctx.host.report_packet(&PacketRecord {
        time_ms: now_millis(),
        version: key.version(),
        protocol: key.ip_protocol(),
        flags: flags.to_string(),
        src: key.src,
        dst: key.dst,
        data,
        uid,
        allowed: verdict.is_allowed(),
    });

    if !verdict.is_allowed() {
        ctx.stats.record_denied();
        debug!(flow = %key, uid, "denied");
    }
    (verdict, uid)
}

/// Attach a freshly opened relay to its session and start polling it
pub(crate) fn attach_relay(
    ctx: &StepContext<'_>,
    session: &mut Session,
    mut relay: Relay,
    interests: Interest,
) -> crate::error::Result<()> {
    relay.register(ctx.registry, Token(session.id), interests)?;
    ctx.stats.record_relay_opened();
    session.relay = Some(relay);
    Ok(())
}

/// Deregister and close a session's relay socket, if it still has one
pub(crate) fn release_relay(registry: &Registry, stats: &EngineStats, relay: &mut Option<Relay>) {
    if let Some(mut socket) = relay.take() {
        if let Err(e) = socket.deregister(registry) {
            debug!("deregister failed: {}", e);
        }
        stats.record_relay_closed();
    }
}

/// Close a removed session; returns its usage when there is any to report
pub fn close_session(registry: &Registry, stats: &EngineStats, mut session: Session) -> Option<UsageRecord> {
    release_relay(registry, stats, &mut session.relay);
    debug!(id = session.id, flow = %session.key, state = %session.state.label(), "session closed");

    if session.bytes_sent == 0 && session.bytes_received == 0 {
        return None;
    }
    Some(UsageRecord {
        time_ms: now_millis(),
        version: session.key.version(),
        protocol: session.key.ip_protocol(),
        dst: session.key.dst,
        uid: session.uid,
        sent: session.bytes_sent,
        received: session.bytes_received,
    })
}

/// Remove a session from the table and report its usage
pub fn teardown(ctx: &mut StepContext<'_>, table: &mut SessionTable, id: SessionId) {
    if let Some(session) = table.remove(id) {
        if let Some(usage) = close_session(ctx.registry, ctx.stats, session) {
            ctx.host.report_usage(&usage);
        }
    }
}

/// Decode one packet from the virtual interface and route it
pub fn handle_virtual_packet(ctx: &mut StepContext<'_>, table: &mut SessionTable, data: &[u8]) -> Vec<Action> {
    let packet = match parse_packet(data, ctx.config.verify_checksums) {
        Ok(packet) => packet,
        Err(e) => {
            ctx.stats.record_decode_failure();
            debug!("Dropping undecodable packet ({} bytes): {}", data.len(), e);
            return vec![Action::Drop];
        }
    };

    match packet.transport {
        TransportInfo::Tcp(_) => tcp::on_virtual_packet(ctx, table, &packet),
        TransportInfo::Udp(_) => udp::on_virtual_packet(ctx, table, &packet),
        TransportInfo::Icmp(_) => icmp::on_virtual_packet(ctx, table, &packet, data),
    }
}

/// Route a readiness event to the owning session's engine
pub fn handle_relay_ready(
    ctx: &mut StepContext<'_>,
    table: &mut SessionTable,
    id: SessionId,
    readiness: Readiness,
) -> Vec<Action> {
    let Some(protocol) = table.get(id).map(|s| s.key.protocol) else {
        // Session already gone
        return Vec::new();
    };

    match protocol {
        Protocol::Tcp => tcp::on_relay_ready(ctx, table, id, readiness),
        Protocol::Udp => udp::on_relay_ready(ctx, table, id, readiness),
        Protocol::Icmp => icmp::on_relay_ready(ctx, table, id, readiness),
    }
}

/// Idle sweep: expire sessions, enforce TCP timeouts and retransmit
pub fn sweep(ctx: &mut StepContext<'_>, table: &mut SessionTable) -> Vec<Action> {
    let mut actions = Vec::new();
    for id in table.ids() {
        let Some(session) = table.get_mut(id) else {
            continue;
        };
        let expired = match session.key.protocol {
            Protocol::Icmp => icmp::expired(ctx, session),
            Protocol::Udp => udp::expired(ctx, session),
            Protocol::Tcp => tcp::sweep(ctx, session, &mut actions),
        };
        if expired {
            actions.push(Action::Close(id));
        }
    }
    actions
}
