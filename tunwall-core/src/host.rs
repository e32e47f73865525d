//! Host policy and telemetry boundary
//!
//! Every call here runs synchronously on the dispatch thread. A failing policy
//! call is a deny; failing telemetry calls are logged by the implementor and
//! otherwise ignored.

use crate::session::{FlowKey, Protocol};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tunwall_sock2uid::SocketProtocol;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Host call failed: {0}")]
    Call(String),
    #[error("Unexpected host response: {0}")]
    Unexpected(String),
}

/// Outcome of a policy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Relay the flow, optionally to another target
    Allow { redirect: Option<SocketAddr> },
    Deny,
}

impl Verdict {
    pub fn allow() -> Self {
        Verdict::Allow { redirect: None }
    }

    pub fn redirect(target: SocketAddr) -> Self {
        Verdict::Allow { redirect: Some(target) }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }
}

/// One policy decision, as logged by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub time_ms: i64,
    pub version: u8,
    pub protocol: u8,
    pub flags: String,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub data: String,
    pub uid: i32,
    pub allowed: bool,
}

/// First client payload of a flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord<'a> {
    pub time_ms: i64,
    pub version: u8,
    pub dst: SocketAddr,
    pub uid: i32,
    pub payload: &'a [u8],
}

/// One resolved DNS answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub time_ms: i64,
    pub query_name: String,
    pub answer_name: String,
    pub resource: String,
    pub ttl: u32,
}

/// Bytes accounted to a flow when its session is destroyed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub time_ms: i64,
    pub version: u8,
    pub protocol: u8,
    pub dst: SocketAddr,
    pub uid: i32,
    pub sent: u64,
    pub received: u64,
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Capabilities the host provides to the engine
pub trait HostBridge {
    /// Allow or deny a new flow owned by `uid`
    fn decide(&mut self, key: &FlowKey, uid: i32) -> Result<Verdict, HostError>;

    fn report_packet(&mut self, record: &PacketRecord);

    fn report_connection(&mut self, record: &ConnectionRecord<'_>);

    fn report_dns(&mut self, record: &DnsRecord);

    fn report_usage(&mut self, record: &UsageRecord);

    fn is_domain_blocked(&mut self, name: &str) -> bool;

    /// Exclude a socket from the virtual interface's routing
    fn protect(&mut self, fd: RawFd) -> bool;

    /// Owning uid of the flow, -1 when unknown
    fn owner_uid(&mut self, key: &FlowKey) -> i32 {
        let protocol = match key.protocol {
            Protocol::Tcp => SocketProtocol::Tcp,
            Protocol::Udp => SocketProtocol::Udp,
            Protocol::Icmp => SocketProtocol::Icmp,
        };
        match tunwall_sock2uid::find_uid(protocol, key.src, key.dst) {
            Ok(uid) => uid as i32,
            Err(_) => -1,
        }
    }

    /// Run-level failure notification
    fn report_error(&mut self, code: i32, message: &str) {
        let _ = (code, message);
    }
}
