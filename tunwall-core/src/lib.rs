//! tunwall core - session-based packet relay for a no-root TUN firewall
//!
//! Packets read from a virtual interface are terminated locally and relayed
//! over ordinary sockets, so per-flow policy can be applied without raw
//! socket privileges. Nothing is forwarded at the IP layer.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  control threads: start / stop / clear / query_stats / ...   |
//! +--------------------------------------------------------------+
//!                 |  Mutex<DispatchState> + Waker
//!                 v
//! +--------------------------------------------------------------+
//! |                 Dispatcher (one mio Poll)                    |
//! |                                                              |
//! |  TUN fd --> parse_packet --+--> ICMP engine --> ping socket  |
//! |                            +--> UDP engine  --> UDP socket   |
//! |                            +--> TCP engine  --> TCP / SOCKS5 |
//! |                                                              |
//! |  SessionTable: FlowKey -> Session { relay, protocol state }  |
//! +--------------------------------------------------------------+
//!                 |  synchronous calls
//!                 v
//! +--------------------------------------------------------------+
//! |  HostBridge: decide, report_*, is_domain_blocked, protect    |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use tunwall_core::prelude::*;
//!
//! let firewall = Firewall::init(29);
//! firewall.start(LogLevel::Info);
//! // blocks until firewall.stop() is called from another thread
//! firewall.run(tun_fd, false, 3, &mut my_host)?;
//! firewall.done();
//! ```

pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod host;
pub mod icmp;
pub mod packet;
pub mod relay;
pub mod session;
pub mod socks5;
pub mod stats;
pub mod sys;
pub mod tcp;
pub mod udp;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use capture::PcapWriter;
pub use config::{CaptureConfig, EngineConfig, LogLevel, UpstreamRelay};
pub use error::{EngineError, Result};
pub use firewall::{is_numeric_address, Firewall};
pub use host::{ConnectionRecord, DnsRecord, HostBridge, HostError, PacketRecord, UsageRecord, Verdict};
pub use packet::{parse_packet, ParsedPacket, TcpFlags};
pub use session::{FlowKey, Protocol, SessionId, SessionInfo};
pub use stats::{CounterSnapshot, SessionStats};
pub use tcp::TcpState;
pub use udp::UdpState;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::{CaptureConfig, EngineConfig, LogLevel, UpstreamRelay};
    pub use crate::error::{EngineError, Result};
    pub use crate::firewall::Firewall;
    pub use crate::host::{ConnectionRecord, DnsRecord, HostBridge, HostError, PacketRecord, UsageRecord, Verdict};
    pub use crate::session::FlowKey;
}
