//! Engine counters and statistics snapshots

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters, shared between the dispatch thread and queries
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Packets read from the virtual interface
    pub packets_read: AtomicU64,
    /// Packets written to the virtual interface
    pub packets_written: AtomicU64,
    /// Packets that failed to decode
    pub decode_failures: AtomicU64,
    /// Packets dropped because the virtual interface would block
    pub dropped_writes: AtomicU64,
    /// Relay sockets opened
    pub relay_opened: AtomicU64,
    /// Relay sockets closed
    pub relay_closed: AtomicU64,
    /// Flows rejected by policy or resource failure
    pub denied: AtomicU64,
    /// Relay datagrams dropped because they would not fit in the MTU
    pub oversized: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.packets_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.packets_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_write(&self) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_opened(&self) {
        self.relay_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_closed(&self) {
        self.relay_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized(&self) {
        self.oversized.fetch_add(1, Ordering::Relaxed);
    }

    /// Relay sockets currently open
    pub fn relays_open(&self) -> u64 {
        self.relay_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.relay_closed.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            relay_opened: self.relay_opened.load(Ordering::Relaxed),
            relay_closed: self.relay_closed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub packets_read: u64,
    pub packets_written: u64,
    pub decode_failures: u64,
    pub dropped_writes: u64,
    pub relay_opened: u64,
    pub relay_closed: u64,
    pub denied: u64,
    pub oversized: u64,
}

/// Result of a statistics query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// ICMP sessions not yet closing
    pub icmp_count: usize,
    /// UDP sessions still active
    pub udp_count: usize,
    /// TCP sessions not closing or closed
    pub tcp_count: usize,
    /// Descriptors currently open in this process
    pub open_fds: u64,
    /// Current soft descriptor limit
    pub fd_limit: u64,
}
