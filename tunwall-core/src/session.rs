//! Session table
//!
//! Sessions are owned by a single table keyed by flow. Handles are allocated
//! from a counter that never wraps back, so a readiness event for a session
//! that is already gone can never address a newer one.

use crate::error::{EngineError, Result};
use crate::icmp::IcmpSession;
use crate::relay::Relay;
use crate::tcp::{TcpSession, TcpState};
use crate::udp::{UdpSession, UdpState};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Session handle, doubling as the readiness token of the relay socket
pub type SessionId = usize;

/// First handle; lower tokens are reserved for the dispatcher
pub const FIRST_SESSION_ID: SessionId = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Client tuple of a flow.
///
/// For ICMP the source port carries the echo identifier and the destination
/// port is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn new(protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    pub fn version(&self) -> u8 {
        if self.src.is_ipv4() {
            4
        } else {
            6
        }
    }

    /// IP protocol number as it appears on the wire
    pub fn ip_protocol(&self) -> u8 {
        match (self.protocol, self.src.is_ipv4()) {
            (Protocol::Icmp, true) => 1,
            (Protocol::Icmp, false) => 58,
            (Protocol::Tcp, _) => 6,
            (Protocol::Udp, _) => 17,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Protocol specific session state
pub enum ProtocolState {
    Icmp(IcmpSession),
    Udp(UdpSession),
    Tcp(Box<TcpSession>),
}

impl ProtocolState {
    pub fn label(&self) -> String {
        match self {
            ProtocolState::Icmp(icmp) => {
                if icmp.closing {
                    "closing".to_string()
                } else {
                    "active".to_string()
                }
            }
            ProtocolState::Udp(udp) => udp.state.to_string(),
            ProtocolState::Tcp(tcp) => tcp.state.to_string(),
        }
    }
}

pub struct Session {
    pub id: SessionId,
    pub key: FlowKey,
    pub uid: i32,
    pub created: Instant,
    pub last_activity: Instant,
    /// Bytes sent toward the network
    pub bytes_sent: u64,
    /// Bytes received from the network
    pub bytes_received: u64,
    pub relay: Option<Relay>,
    pub state: ProtocolState,
}

impl Session {
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Whether this session counts as live in statistics
    pub fn is_live(&self) -> bool {
        match &self.state {
            ProtocolState::Icmp(icmp) => !icmp.closing,
            ProtocolState::Udp(udp) => udp.state == UdpState::Active,
            ProtocolState::Tcp(tcp) => !matches!(tcp.state, TcpState::Closing | TcpState::Close),
        }
    }

    pub fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            id: self.id,
            key: self.key,
            state: self.state.label(),
            uid: self.uid,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            age_ms: now.saturating_duration_since(self.created).as_millis() as u64,
        }
    }
}

/// Diagnostic snapshot of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub key: FlowKey,
    pub state: String,
    pub uid: i32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub age_ms: u64,
}

pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    by_key: HashMap<FlowKey, SessionId>,
    next_id: SessionId,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            by_key: HashMap::new(),
            next_id: FIRST_SESSION_ID,
        }
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<SessionId> {
        self.by_key.get(key).copied()
    }

    /// Insert a new session; fails when the tuple is already present
    pub fn insert(&mut self, key: FlowKey, uid: i32, state: ProtocolState, now: Instant) -> Result<SessionId> {
        if self.by_key.contains_key(&key) {
            return Err(EngineError::DuplicateSession(key.to_string()));
        }

        let id = self.next_id;
        self.next_id += 1;

        self.by_key.insert(key, id);
        self.sessions.insert(
            id,
            Session {
                id,
                key,
                uid,
                created: now,
                last_activity: now,
                bytes_sent: 0,
                bytes_received: 0,
                relay: None,
                state,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        self.by_key.remove(&session.key);
        Some(session)
    }

    pub fn for_each<F: FnMut(&Session)>(&self, mut f: F) {
        for session in self.sessions.values() {
            f(session);
        }
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remove every session, handing them back for teardown
    pub fn clear_all(&mut self) -> Vec<Session> {
        self.by_key.clear();
        let mut sessions: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        sessions.sort_unstable_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn count_live(&self, protocol: Protocol) -> usize {
        self.sessions
            .values()
            .filter(|s| s.key.protocol == protocol && s.is_live())
            .count()
    }
}
