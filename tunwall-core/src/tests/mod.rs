//! Dispatcher-level tests
//!
//! A `UnixDatagram` pair stands in for the TUN device: the engine owns one
//! end, the test writes and reads raw IP packets on the other.

mod end_to_end;

use crate::config::{EngineConfig, LogLevel};
use crate::error::Result;
use crate::firewall::Firewall;
use crate::host::{ConnectionRecord, DnsRecord, HostBridge, HostError, PacketRecord, UsageRecord, Verdict};
use crate::packet::{build_tcp, build_udp, parse_packet, TcpFlags, TcpInfo, TransportInfo};
use crate::session::FlowKey;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Route engine logs through the test harness; `RUST_LOG` picks the level
fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) const TEST_UID: i32 = 10_123;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub(crate) struct Recorded {
    pub packets: Vec<PacketRecord>,
    pub connections: Vec<(SocketAddr, Vec<u8>)>,
    pub dns: Vec<DnsRecord>,
    pub usage: Vec<UsageRecord>,
    pub errors: Vec<(i32, String)>,
}

type Policy = Box<dyn FnMut(&FlowKey) -> Verdict + Send>;

/// Host that applies a closure policy and records every call
pub(crate) struct TestHost {
    policy: Policy,
    blocked: Vec<String>,
    recorded: Arc<Mutex<Recorded>>,
}

impl TestHost {
    pub fn new(policy: impl FnMut(&FlowKey) -> Verdict + Send + 'static) -> Self {
        Self {
            policy: Box::new(policy),
            blocked: Vec::new(),
            recorded: Arc::default(),
        }
    }

    pub fn allow_all() -> Self {
        Self::new(|_| Verdict::allow())
    }

    pub fn redirect_all(target: SocketAddr) -> Self {
        Self::new(move |_| Verdict::redirect(target))
    }

    pub fn block(mut self, name: &str) -> Self {
        self.blocked.push(name.to_string());
        self
    }
}

impl HostBridge for TestHost {
    fn decide(&mut self, key: &FlowKey, uid: i32) -> std::result::Result<Verdict, HostError> {
        assert_eq!(uid, TEST_UID);
        Ok((self.policy)(key))
    }

    fn report_packet(&mut self, record: &PacketRecord) {
        self.recorded.lock().packets.push(record.clone());
    }

    fn report_connection(&mut self, record: &ConnectionRecord<'_>) {
        self.recorded.lock().connections.push((record.dst, record.payload.to_vec()));
    }

    fn report_dns(&mut self, record: &DnsRecord) {
        self.recorded.lock().dns.push(record.clone());
    }

    fn report_usage(&mut self, record: &UsageRecord) {
        self.recorded.lock().usage.push(record.clone());
    }

    fn is_domain_blocked(&mut self, name: &str) -> bool {
        self.blocked.iter().any(|b| b == name)
    }

    fn protect(&mut self, _fd: RawFd) -> bool {
        true
    }

    fn owner_uid(&mut self, _key: &FlowKey) -> i32 {
        TEST_UID
    }

    fn report_error(&mut self, code: i32, message: &str) {
        self.recorded.lock().errors.push((code, message.to_string()));
    }
}

/// A running firewall wired to a fake virtual interface
pub(crate) struct Harness {
    pub firewall: Arc<Firewall>,
    pub tun: UnixDatagram,
    pub recorded: Arc<Mutex<Recorded>>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl Harness {
    pub fn start(config: EngineConfig, host: TestHost) -> Self {
        let firewall = Arc::new(Firewall::with_config(29, config).unwrap());
        Self::start_on(firewall, host)
    }

    pub fn start_on(firewall: Arc<Firewall>, host: TestHost) -> Self {
        Self::start_with(firewall, host, false)
    }

    /// Run with the DNS forwarding override switched on or off
    pub fn start_with(firewall: Arc<Firewall>, mut host: TestHost, dns_forward: bool) -> Self {
        init_test_logging();
        let (engine_side, test_side) = UnixDatagram::pair().unwrap();
        test_side.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        let recorded = host.recorded.clone();

        firewall.start(LogLevel::Debug);
        let runner = firewall.clone();
        let thread = thread::spawn(move || {
            let result = runner.run(engine_side.as_raw_fd(), dns_forward, 3, &mut host);
            drop(engine_side);
            result
        });

        Self {
            firewall,
            tun: test_side,
            recorded,
            thread: Some(thread),
        }
    }

    pub fn send(&self, packet: Vec<u8>) {
        self.tun.send(&packet).unwrap();
    }

    pub fn recv(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 65536];
        let n = self.tun.recv(&mut buf).expect("no packet from the engine");
        buf.truncate(n);
        buf
    }

    /// True when nothing arrives within `wait`
    pub fn quiet_for(&self, wait: Duration) -> bool {
        self.tun.set_read_timeout(Some(wait)).unwrap();
        let mut buf = vec![0u8; 65536];
        let quiet = self.tun.recv(&mut buf).is_err();
        self.tun.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        quiet
    }

    pub fn recv_tcp(&self) -> (TcpInfo, Vec<u8>) {
        let bytes = self.recv();
        tcp_segment(&bytes)
    }

    /// Collect TCP segments until one matches `done`
    pub fn recv_tcp_until(&self, mut done: impl FnMut(&TcpInfo) -> bool) -> Vec<(TcpInfo, Vec<u8>)> {
        let mut segments = Vec::new();
        loop {
            let (tcp, payload) = self.recv_tcp();
            let finished = done(&tcp);
            segments.push((tcp, payload));
            if finished {
                return segments;
            }
        }
    }

    pub fn stop(mut self) -> Result<()> {
        self.firewall.stop();
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.firewall.stop();
            let _ = thread.join();
        }
    }
}

pub(crate) fn tcp_segment(bytes: &[u8]) -> (TcpInfo, Vec<u8>) {
    let packet = parse_packet(bytes, true).unwrap();
    match packet.transport {
        TransportInfo::Tcp(tcp) => (tcp, packet.payload.to_vec()),
        other => panic!("expected TCP, got {:?}", other),
    }
}

pub(crate) fn udp_payload(bytes: &[u8]) -> (SocketAddr, SocketAddr, Vec<u8>) {
    let packet = parse_packet(bytes, true).unwrap();
    match &packet.transport {
        TransportInfo::Udp(_) => (packet.src_socket(), packet.dst_socket(), packet.payload.to_vec()),
        other => panic!("expected UDP, got {:?}", other),
    }
}

/// Client-side TCP segment builder for one flow
pub(crate) struct Client {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl Client {
    pub fn new(src: &str, dst: &str) -> Self {
        Self {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
        }
    }

    pub fn syn(&self, seq: u32) -> Vec<u8> {
        build_tcp(self.src, self.dst, seq, 0, TcpFlags::syn_only(), 65535, Some(1460), &[]).unwrap()
    }

    pub fn segment(&self, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
        build_tcp(self.src, self.dst, seq, ack, flags, 65535, None, payload).unwrap()
    }

    pub fn udp(&self, payload: &[u8]) -> Vec<u8> {
        build_udp(self.src, self.dst, payload).unwrap()
    }
}

/// Poll `cond` until it holds or the deadline passes
pub(crate) fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Timeouts short enough for tests
pub(crate) fn fast_config() -> EngineConfig {
    EngineConfig {
        sweep_interval_ms: 10,
        tcp_linger_ms: 300,
        tcp_retransmit_ms: 5_000,
        ..Default::default()
    }
}
