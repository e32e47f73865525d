//! TCP split-proxy relay
//!
//! The client talks to a synthesized peer: every segment it receives is
//! built here, with sequence numbers that have nothing to do with the relay
//! socket's. Two cursors track the virtual side:
//!
//! - `remote_seq`: next byte expected from the client
//! - `local_seq`: next byte we will send, with `acked` trailing it
//!
//! Bytes between `acked` and `local_seq` stay in `unacked` until the client
//! acknowledges them, so the sweep can retransmit after a dropped write.
//!
//! Virtual state names follow the relay side's view: a client FIN moves
//! ESTABLISHED to FIN_WAIT1, relay EOF moves it to LAST_ACK.

use crate::config::EngineConfig;
use crate::engine::{attach_relay, check_policy, release_relay, Action, Readiness, StepContext};
use crate::error::EngineError;
use crate::host::{now_millis, ConnectionRecord, Verdict};
use crate::packet::{build_tcp, ParsedPacket, TcpFlags, TcpInfo, TransportInfo};
use crate::relay::{open_stream, Relay};
use crate::session::{FlowKey, Protocol, ProtocolState, Session, SessionId, SessionTable};
use crate::socks5::{Socks5Handshake, Socks5Step};
use mio::net::TcpStream;
use mio::Interest;
use socket2::SockRef;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// MSS assumed when the client does not send the option
pub const DEFAULT_CLIENT_MSS: u16 = 536;

/// Virtual-side state, as reported in `SessionInfo::state`.
///
/// Names are taken from the relay side: the flow "closes first" when the
/// client sends FIN, and "closes second" when the relay reaches EOF first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    /// SYN accepted, relay still connecting; no SYN-ACK sent yet
    SynRecv,
    Established,
    /// Client sent FIN; queued bytes drain to the relay, then its write side is shut
    FinWait1,
    /// Relay hit EOF first, our FIN is acknowledged, waiting for the client's FIN
    FinWait2,
    /// Relay EOF before our FIN is built; passed through within one step, never reported
    CloseWait,
    /// Relay hit EOF first and our FIN is not yet acknowledged
    LastAck,
    /// Both FINs sent, ours not yet acknowledged
    Closing,
    /// Both directions closed; kept for the linger period
    TimeWait,
    /// Reset or aborted; evicted on the next sweep
    Close,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

impl TcpState {
    /// States between the first FIN and TIME_WAIT
    pub fn is_closing_phase(&self) -> bool {
        matches!(
            self,
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::CloseWait | TcpState::LastAck | TcpState::Closing
        )
    }
}

/// Progress of the relay socket's own connection
#[derive(Debug)]
enum Upstream {
    Connecting,
    Socks5(Socks5Handshake),
    Connected,
}

#[derive(Debug)]
pub struct TcpSession {
    pub state: TcpState,
    upstream: Upstream,
    /// Target reached through the SOCKS5 upstream, if one is used
    socks_target: Option<std::net::SocketAddr>,
    iss: u32,
    local_seq: u32,
    acked: u32,
    remote_seq: u32,
    remote_window: u32,
    mss: u16,
    recv_buffer: usize,
    /// Client bytes waiting to be written to the relay
    forward: VecDeque<u8>,
    /// Bytes sent to the client, not yet acknowledged
    unacked: VecDeque<u8>,
    fin_sent: bool,
    fin_acked: bool,
    fin_received: bool,
    relay_eof: bool,
    relay_shutdown: bool,
    /// Relay had data while the client window was closed
    relay_pending: bool,
    data_seen: bool,
    reported: bool,
    advertised: u16,
    last_progress: Instant,
}

impl TcpSession {
    fn new(syn: &TcpInfo, config: &EngineConfig, key: &FlowKey, socks_target: Option<std::net::SocketAddr>, now: Instant) -> Self {
        let iss: u32 = rand::random();
        let client_mss = syn.mss.unwrap_or(DEFAULT_CLIENT_MSS);
        Self {
            state: TcpState::SynRecv,
            upstream: Upstream::Connecting,
            socks_target,
            iss,
            local_seq: iss,
            acked: iss,
            remote_seq: syn.seq.wrapping_add(1),
            remote_window: syn.window as u32,
            mss: client_mss.min(config.mss(key.dst.ip())),
            recv_buffer: config.tcp_recv_buffer,
            forward: VecDeque::new(),
            unacked: VecDeque::new(),
            fin_sent: false,
            fin_acked: false,
            fin_received: false,
            relay_eof: false,
            relay_shutdown: false,
            relay_pending: false,
            data_seen: false,
            reported: false,
            advertised: config.tcp_recv_buffer as u16,
            last_progress: now,
        }
    }

    /// Free space in the queue toward the relay
    pub fn window(&self) -> u16 {
        self.recv_buffer.saturating_sub(self.forward.len()).min(u16::MAX as usize) as u16
    }

    fn in_flight(&self) -> u32 {
        self.local_seq.wrapping_sub(self.acked)
    }

    /// Bytes the client window still accepts
    fn send_room(&self) -> usize {
        self.remote_window.saturating_sub(self.in_flight()) as usize
    }

    fn awaiting_ack(&self) -> bool {
        !self.unacked.is_empty() || (self.fin_sent && !self.fin_acked)
    }
}

/// Signed distance from `b` to `a` in sequence space
fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// RST answering a segment that has no session
fn reset_for(key: &FlowKey, seg: &TcpInfo, payload_len: usize) -> Action {
    let packet = if seg.flags.ack {
        build_tcp(key.dst, key.src, seg.ack, 0, TcpFlags::rst_only(), 0, None, &[])
    } else {
        let consumed = payload_len as u32 + seg.flags.syn as u32 + seg.flags.fin as u32;
        build_tcp(
            key.dst,
            key.src,
            0,
            seg.seq.wrapping_add(consumed),
            TcpFlags::rst_ack(),
            0,
            None,
            &[],
        )
    };
    Action::from_packet(packet)
}

/// Mutable view of one TCP session, split from its table entry
struct TcpFlow<'s> {
    id: SessionId,
    key: FlowKey,
    uid: i32,
    tcp: &'s mut TcpSession,
    relay: &'s mut Option<Relay>,
    sent: &'s mut u64,
    received: &'s mut u64,
    last_activity: &'s mut Instant,
}

fn flow_of(session: &mut Session) -> Option<TcpFlow<'_>> {
    let Session {
        id,
        key,
        uid,
        relay,
        state,
        bytes_sent,
        bytes_received,
        last_activity,
        ..
    } = session;
    match state {
        ProtocolState::Tcp(tcp) => Some(TcpFlow {
            id: *id,
            key: *key,
            uid: *uid,
            tcp: tcp.as_mut(),
            relay,
            sent: bytes_sent,
            received: bytes_received,
            last_activity,
        }),
        _ => None,
    }
}

impl TcpFlow<'_> {
    fn stream(&mut self) -> Option<&mut TcpStream> {
        self.relay.as_mut().and_then(Relay::as_stream)
    }

    /// Build a segment toward the client
    fn segment(&mut self, seq: u32, flags: TcpFlags, payload: &[u8]) -> Action {
        let window = self.tcp.window();
        self.tcp.advertised = window;
        Action::from_packet(build_tcp(
            self.key.dst,
            self.key.src,
            seq,
            self.tcp.remote_seq,
            flags,
            window,
            None,
            payload,
        ))
    }

    fn ack(&mut self) -> Action {
        let seq = self.tcp.local_seq;
        self.segment(seq, TcpFlags::ack_only(), &[])
    }

    fn syn_ack(&mut self, ctx: &StepContext<'_>) -> Action {
        let window = self.tcp.window();
        self.tcp.advertised = window;
        Action::from_packet(build_tcp(
            self.key.dst,
            self.key.src,
            self.tcp.iss,
            self.tcp.remote_seq,
            TcpFlags::syn_ack(),
            window,
            Some(ctx.config.mss(self.key.dst.ip())),
            &[],
        ))
    }

    /// Zero linger so dropping the relay socket resets the peer instead of closing it
    fn abort_relay(&mut self) {
        let id = self.id;
        if let Some(stream) = self.stream() {
            if let Err(e) = SockRef::from(&*stream).set_linger(Some(Duration::ZERO)) {
                debug!(id, "SO_LINGER on relay failed: {}", e);
            }
        }
    }

    /// RST toward the client; the session is torn down
    fn reset(&mut self, reason: &str) -> Vec<Action> {
        debug!(id = self.id, flow = %self.key, state = %self.tcp.state, "reset: {}", reason);
        self.abort_relay();
        let rst = if self.tcp.state == TcpState::SynRecv {
            Action::from_packet(build_tcp(
                self.key.dst,
                self.key.src,
                0,
                self.tcp.remote_seq,
                TcpFlags::rst_ack(),
                0,
                None,
                &[],
            ))
        } else {
            let seq = self.tcp.local_seq;
            self.segment(seq, TcpFlags::rst_ack(), &[])
        };
        self.tcp.state = TcpState::Close;
        vec![rst, Action::Close(self.id)]
    }

    /// Relay connected (directly or through SOCKS5): answer the SYN
    fn establish(&mut self, ctx: &StepContext<'_>) -> Action {
        self.tcp.upstream = Upstream::Connected;
        self.tcp.state = TcpState::Established;
        self.tcp.local_seq = self.tcp.iss.wrapping_add(1);
        self.tcp.acked = self.tcp.local_seq;
        self.tcp.last_progress = ctx.now;
        // Edge-triggered readiness may already have been consumed
        self.tcp.relay_pending = true;
        info!(id = self.id, flow = %self.key, "TCP established");
        self.syn_ack(ctx)
    }

    fn enter_time_wait(&mut self, ctx: &StepContext<'_>) {
        self.tcp.state = TcpState::TimeWait;
        release_relay(ctx.registry, ctx.stats, self.relay);
        debug!(id = self.id, flow = %self.key, "TIME_WAIT");
    }

    /// Our FIN toward the client, sent once the relay reached EOF
    fn send_fin(&mut self, ctx: &StepContext<'_>) -> Action {
        let seq = self.tcp.local_seq;
        let action = self.segment(seq, TcpFlags::fin_ack(), &[]);
        if !self.tcp.awaiting_ack() {
            self.tcp.last_progress = ctx.now;
        }
        self.tcp.local_seq = seq.wrapping_add(1);
        self.tcp.fin_sent = true;
        self.tcp.state = match self.tcp.state {
            TcpState::FinWait1 => TcpState::Closing,
            _ => TcpState::LastAck,
        };
        action
    }

    /// Read from the relay while the client window has room
    fn pump_relay(&mut self, ctx: &StepContext<'_>) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.tcp.relay_eof || !matches!(self.tcp.upstream, Upstream::Connected) {
            return actions;
        }
        if !matches!(
            self.tcp.state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 | TcpState::CloseWait
        ) {
            return actions;
        }

        let mss = self.tcp.mss as usize;
        let mut buf = vec![0u8; mss];
        loop {
            let room = self.tcp.send_room();
            if room == 0 {
                self.tcp.relay_pending = true;
                trace!(id = self.id, "client window full");
                break;
            }

            let want = room.min(mss);
            let Some(stream) = self.stream() else {
                break;
            };
            match stream.read(&mut buf[..want]) {
                Ok(0) => {
                    self.tcp.relay_eof = true;
                    self.tcp.relay_pending = false;
                    debug!(id = self.id, flow = %self.key, "relay EOF");
                    actions.push(self.send_fin(ctx));
                    break;
                }
                Ok(n) => {
                    if !self.tcp.awaiting_ack() {
                        self.tcp.last_progress = ctx.now;
                    }
                    let seq = self.tcp.local_seq;
                    actions.push(self.segment(seq, TcpFlags::psh_ack(), &buf[..n]));
                    self.tcp.unacked.extend(&buf[..n]);
                    self.tcp.local_seq = seq.wrapping_add(n as u32);
                    self.tcp.data_seen = true;
                    *self.received += n as u64;
                    *self.last_activity = ctx.now;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.tcp.relay_pending = false;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    actions.extend(self.reset(&format!("relay read: {}", e)));
                    break;
                }
            }
        }
        actions
    }

    /// Write queued client bytes to the relay; half-close once a client FIN is drained
    fn flush_forward(&mut self) -> io::Result<usize> {
        let mut written = 0;
        let shutdown_due = {
            let tcp = &mut *self.tcp;
            let Some(stream) = self.relay.as_mut().and_then(Relay::as_stream) else {
                return Ok(0);
            };
            while !tcp.forward.is_empty() {
                let (head, _) = tcp.forward.as_slices();
                match stream.write(head) {
                    Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "relay accepted nothing")),
                    Ok(n) => {
                        tcp.forward.drain(..n);
                        written += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            tcp.fin_received && tcp.forward.is_empty() && !tcp.relay_shutdown
        };

        if shutdown_due {
            if let Some(stream) = self.stream() {
                match stream.shutdown(Shutdown::Write) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                    Err(e) => return Err(e),
                }
            }
            self.tcp.relay_shutdown = true;
            debug!(id = self.id, flow = %self.key, "relay write side shut down");
        }
        Ok(written)
    }

    /// Apply the client's acknowledgement; false when it acknowledges unsent data
    fn apply_ack(&mut self, ctx: &StepContext<'_>, seg: &TcpInfo) -> bool {
        if seq_diff(seg.ack, self.tcp.local_seq) > 0 {
            return false;
        }
        if seq_diff(seg.ack, self.tcp.acked) > 0 {
            let advanced = seg.ack.wrapping_sub(self.tcp.acked) as usize;
            let data = advanced.min(self.tcp.unacked.len());
            self.tcp.unacked.drain(..data);
            self.tcp.acked = seg.ack;
            self.tcp.last_progress = ctx.now;
            if self.tcp.fin_sent && seg.ack == self.tcp.local_seq {
                self.tcp.fin_acked = true;
            }
        }
        self.tcp.remote_window = seg.window as u32;
        true
    }

    fn on_segment(&mut self, ctx: &mut StepContext<'_>, seg: &TcpInfo, payload: &[u8]) -> Vec<Action> {
        *self.last_activity = ctx.now;
        let mut actions = Vec::new();

        if seg.flags.rst {
            debug!(id = self.id, flow = %self.key, state = %self.tcp.state, "RST from client");
            self.abort_relay();
            self.tcp.state = TcpState::Close;
            return vec![Action::Close(self.id)];
        }

        match self.tcp.state {
            TcpState::Listen | TcpState::SynRecv => {
                // Waiting for the relay; a repeated SYN is answered once connected
                trace!(id = self.id, "segment before relay connected");
                return vec![Action::Drop];
            }
            TcpState::TimeWait | TcpState::Close => {
                if seg.flags.fin {
                    actions.push(self.ack());
                } else {
                    actions.push(Action::Drop);
                }
                return actions;
            }
            _ => {}
        }

        if seg.flags.syn {
            if self.tcp.state == TcpState::Established && !self.tcp.data_seen && !seg.flags.ack {
                debug!(id = self.id, "SYN retransmit, repeating SYN-ACK");
                actions.push(self.syn_ack(ctx));
            } else {
                actions.push(Action::Drop);
            }
            return actions;
        }

        if seg.flags.ack {
            let fin_was_acked = self.tcp.fin_acked;
            if !self.apply_ack(ctx, seg) {
                debug!(id = self.id, ack = seg.ack, local = self.tcp.local_seq, "ACK beyond sent data");
                return vec![Action::Drop];
            }
            if self.tcp.fin_acked && !fin_was_acked {
                match self.tcp.state {
                    TcpState::LastAck => self.tcp.state = TcpState::FinWait2,
                    TcpState::Closing => self.enter_time_wait(ctx),
                    _ => {}
                }
            }
        }

        let mut need_ack = false;
        let mut in_order = true;
        let fin_seq = seg.seq.wrapping_add(payload.len() as u32);

        if !payload.is_empty() {
            if self.tcp.fin_received {
                need_ack = true;
                in_order = false;
            } else {
                let offset = seq_diff(self.tcp.remote_seq, seg.seq);
                let fresh: &[u8] = if offset < 0 {
                    trace!(id = self.id, seq = seg.seq, expected = self.tcp.remote_seq, "gap");
                    in_order = false;
                    &[]
                } else if offset as usize >= payload.len() {
                    trace!(id = self.id, seq = seg.seq, "old data");
                    &[]
                } else {
                    &payload[offset as usize..]
                };
                need_ack = true;

                if !fresh.is_empty() {
                    if !self.tcp.reported {
                        self.tcp.reported = true;
                        ctx.host.report_connection(&ConnectionRecord {
                            time_ms: now_millis(),
                            version: self.key.version(),
                            dst: self.key.dst,
                            uid: self.uid,
                            payload: fresh,
                        });
                    }
                    let room = self.tcp.recv_buffer.saturating_sub(self.tcp.forward.len());
                    let take = fresh.len().min(room);
                    if take < fresh.len() {
                        trace!(id = self.id, "receive buffer full, dropping {} bytes", fresh.len() - take);
                    }
                    self.tcp.forward.extend(&fresh[..take]);
                    self.tcp.remote_seq = self.tcp.remote_seq.wrapping_add(take as u32);
                    self.tcp.data_seen = true;
                    *self.sent += take as u64;
                }
            }
        }

        if seg.flags.fin && in_order {
            if !self.tcp.fin_received && self.tcp.remote_seq == fin_seq {
                self.tcp.fin_received = true;
                self.tcp.remote_seq = fin_seq.wrapping_add(1);
                debug!(id = self.id, flow = %self.key, state = %self.tcp.state, "FIN from client");
                match self.tcp.state {
                    TcpState::Established | TcpState::CloseWait => self.tcp.state = TcpState::FinWait1,
                    TcpState::LastAck => self.tcp.state = TcpState::Closing,
                    TcpState::FinWait2 => self.enter_time_wait(ctx),
                    _ => {}
                }
            }
            need_ack = true;
        }

        if let Err(e) = self.flush_forward() {
            return self.reset(&format!("relay write: {}", e));
        }

        if need_ack {
            actions.push(self.ack());
        }

        if self.tcp.relay_pending && self.tcp.send_room() > 0 {
            actions.extend(self.pump_relay(ctx));
        }
        actions
    }

    fn on_relay_ready(&mut self, ctx: &mut StepContext<'_>, readiness: Readiness) -> Vec<Action> {
        if matches!(self.tcp.state, TcpState::TimeWait | TcpState::Close) {
            return Vec::new();
        }

        match self.tcp.upstream {
            Upstream::Connecting => self.on_connect_progress(ctx, readiness),
            Upstream::Socks5(_) => self.on_socks5_progress(ctx, readiness),
            Upstream::Connected => {
                if readiness.error {
                    let reason = match self.relay.as_ref().map(Relay::take_error) {
                        Some(Ok(Some(e))) | Some(Err(e)) => e.to_string(),
                        _ => "socket error".to_string(),
                    };
                    return self.reset(&reason);
                }

                let mut actions = Vec::new();
                if readiness.writable && !self.tcp.forward.is_empty() {
                    let before = self.tcp.advertised;
                    match self.flush_forward() {
                        Ok(n) if n > 0 => {
                            let window = self.tcp.window();
                            if before == 0 || window.saturating_sub(before) >= self.tcp.mss {
                                trace!(id = self.id, window, "window update");
                                actions.push(self.ack());
                            }
                        }
                        Ok(_) => {}
                        Err(e) => return self.reset(&format!("relay write: {}", e)),
                    }
                }
                if readiness.readable || readiness.read_closed || self.tcp.relay_pending {
                    actions.extend(self.pump_relay(ctx));
                }
                actions
            }
        }
    }

    fn on_connect_progress(&mut self, ctx: &mut StepContext<'_>, readiness: Readiness) -> Vec<Action> {
        let Some(stream) = self.stream() else {
            return Vec::new();
        };
        match stream.take_error() {
            Ok(Some(e)) | Err(e) => return self.reset(&format!("connect failed: {}", e)),
            Ok(None) => {}
        }
        match stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                if readiness.error || readiness.read_closed {
                    return self.reset("connect failed");
                }
                return Vec::new();
            }
            Err(e) => return self.reset(&format!("connect failed: {}", e)),
        }

        match self.tcp.socks_target {
            None => vec![self.establish(ctx)],
            Some(target) => {
                let credentials = ctx.upstream.and_then(|u| u.credentials());
                let handshake = Socks5Handshake::new(target, credentials);
                let greeting = handshake.greeting();
                if let Err(e) = self.write_small(&greeting) {
                    return self.reset(&format!("SOCKS5 greeting: {}", e));
                }
                debug!(id = self.id, proxy = %self.key.dst, target = %target, "SOCKS5 greeting sent");
                self.tcp.upstream = Upstream::Socks5(handshake);
                Vec::new()
            }
        }
    }

    fn on_socks5_progress(&mut self, ctx: &mut StepContext<'_>, readiness: Readiness) -> Vec<Action> {
        if readiness.error {
            return self.reset("SOCKS5 proxy connection failed");
        }
        loop {
            let wanted = match &self.tcp.upstream {
                Upstream::Socks5(handshake) => handshake.wanted(),
                _ => return Vec::new(),
            };
            let mut buf = vec![0u8; wanted];
            let Some(stream) = self.stream() else {
                return Vec::new();
            };
            let n = match stream.read(&mut buf) {
                Ok(0) => return self.reset("SOCKS5 proxy closed the connection"),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Vec::new(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.reset(&format!("SOCKS5 read: {}", e)),
            };

            let step = match &mut self.tcp.upstream {
                Upstream::Socks5(handshake) => handshake.on_data(&buf[..n]),
                _ => return Vec::new(),
            };
            match step {
                Ok(Socks5Step::NeedMore) => {}
                Ok(Socks5Step::Send(bytes)) => {
                    if let Err(e) = self.write_small(&bytes) {
                        return self.reset(&format!("SOCKS5 write: {}", e));
                    }
                }
                Ok(Socks5Step::Connected) => {
                    debug!(id = self.id, "SOCKS5 tunnel ready");
                    return vec![self.establish(ctx)];
                }
                Err(e) => {
                    warn!(id = self.id, flow = %self.key, "SOCKS5 handshake failed: {}", e);
                    return self.reset(&e.to_string());
                }
            }
        }
    }

    /// Handshake messages are tiny and go out on a fresh socket in one write
    fn write_small(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let stream = self
            .stream()
            .ok_or_else(|| EngineError::Internal("no relay socket".to_string()))?;
        let n = stream.write(bytes)?;
        if n != bytes.len() {
            return Err(EngineError::ProxyError("short write to proxy".to_string()));
        }
        Ok(())
    }

    /// Timeouts and retransmission; true when the session should go
    fn sweep(&mut self, ctx: &StepContext<'_>, created: Instant, actions: &mut Vec<Action>) -> bool {
        let idle = ctx.now.saturating_duration_since(*self.last_activity);
        match self.tcp.state {
            TcpState::Close => return true,
            TcpState::TimeWait => return idle >= ctx.config.tcp_linger(),
            TcpState::Listen | TcpState::SynRecv => {
                if ctx.now.saturating_duration_since(created) >= ctx.config.tcp_connect_timeout() {
                    actions.extend(self.reset("connect timeout").into_iter().filter(|a| !matches!(a, Action::Close(_))));
                    return true;
                }
                return false;
            }
            TcpState::Established => {
                if idle >= ctx.config.tcp_idle_timeout() {
                    actions.extend(self.reset("idle timeout").into_iter().filter(|a| !matches!(a, Action::Close(_))));
                    return true;
                }
            }
            state if state.is_closing_phase() => {
                if idle >= ctx.config.tcp_close_timeout() {
                    actions.extend(self.reset("close timeout").into_iter().filter(|a| !matches!(a, Action::Close(_))));
                    return true;
                }
            }
            _ => {}
        }

        if self.tcp.awaiting_ack()
            && ctx.now.saturating_duration_since(self.tcp.last_progress) >= ctx.config.tcp_retransmit()
        {
            self.tcp.last_progress = ctx.now;
            let seq = self.tcp.acked;
            if self.tcp.unacked.is_empty() {
                trace!(id = self.id, "retransmit FIN");
                actions.push(self.segment(seq, TcpFlags::fin_ack(), &[]));
            } else {
                let len = self.tcp.unacked.len().min(self.tcp.mss as usize);
                let chunk: Vec<u8> = self.tcp.unacked.iter().take(len).copied().collect();
                trace!(id = self.id, seq, len, "retransmit");
                actions.push(self.segment(seq, TcpFlags::psh_ack(), &chunk));
            }
        }
        false
    }
}

fn on_new_flow(
    ctx: &mut StepContext<'_>,
    table: &mut SessionTable,
    key: FlowKey,
    seg: &TcpInfo,
    payload_len: usize,
) -> Vec<Action> {
    if seg.flags.rst {
        return vec![Action::Drop];
    }

    let is_connect = seg.flags.syn && !seg.flags.ack && !seg.flags.rst && !seg.flags.fin;
    if !is_connect {
        trace!(flow = %key, flags = %seg.flags, "segment for unknown flow");
        return vec![reset_for(&key, seg, payload_len)];
    }

    let (verdict, uid) = check_policy(ctx, &key, &seg.flags.to_string(), String::new());
    let redirect = match verdict {
        Verdict::Deny => return vec![reset_for(&key, seg, payload_len)],
        Verdict::Allow { redirect } => redirect,
    };

    let target = redirect.unwrap_or(key.dst);
    let (connect_to, socks_target) = match ctx.upstream {
        Some(upstream) => (upstream.socket_addr(), Some(target)),
        None => (target, None),
    };

    let stream = match open_stream(connect_to, ctx.host, ctx.run.platform_version) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(flow = %key, "TCP relay socket failed: {}", e);
            ctx.stats.record_denied();
            return vec![reset_for(&key, seg, payload_len), Action::Error(e)];
        }
    };

    let state = TcpSession::new(seg, ctx.config, &key, socks_target, ctx.now);
    let id = match table.insert(key, uid, ProtocolState::Tcp(Box::new(state)), ctx.now) {
        Ok(id) => id,
        Err(e) => return vec![Action::Error(e)],
    };
    let Some(session) = table.get_mut(id) else {
        return vec![Action::Drop];
    };

    let interests = Interest::READABLE | Interest::WRITABLE;
    if let Err(e) = attach_relay(ctx, session, Relay::Stream(stream), interests) {
        return vec![reset_for(&key, seg, payload_len), Action::Close(id), Action::Error(e)];
    }

    debug!(id, flow = %key, target = %target, via = ?socks_target.map(|_| connect_to), "TCP connecting");
    Vec::new()
}

pub fn on_virtual_packet(ctx: &mut StepContext<'_>, table: &mut SessionTable, packet: &ParsedPacket<'_>) -> Vec<Action> {
    let TransportInfo::Tcp(seg) = &packet.transport else {
        return vec![Action::Drop];
    };
    let key = FlowKey::new(Protocol::Tcp, packet.src_socket(), packet.dst_socket());

    let Some(id) = table.lookup(&key) else {
        return on_new_flow(ctx, table, key, seg, packet.payload.len());
    };
    let Some(mut flow) = table.get_mut(id).and_then(flow_of) else {
        return vec![Action::Drop];
    };
    flow.on_segment(ctx, seg, packet.payload)
}

pub fn on_relay_ready(
    ctx: &mut StepContext<'_>,
    table: &mut SessionTable,
    id: SessionId,
    readiness: Readiness,
) -> Vec<Action> {
    let Some(mut flow) = table.get_mut(id).and_then(flow_of) else {
        return Vec::new();
    };
    flow.on_relay_ready(ctx, readiness)
}

/// Sweep one TCP session; returns true when it should be evicted
pub fn sweep(ctx: &StepContext<'_>, session: &mut Session, actions: &mut Vec<Action>) -> bool {
    let created = session.created;
    match flow_of(session) {
        Some(mut flow) => flow.sweep(ctx, created, actions),
        None => false,
    }
}
