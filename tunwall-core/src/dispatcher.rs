//! Single-threaded mio event loop
//!
//! One poll covers the virtual interface, the waker used for cross-thread
//! stop/clear requests and every relay socket. Relay sockets are registered
//! with their session id as token, which is why ids start above the two
//! reserved tokens.
//!
//! The shared state lock is held for one iteration's worth of engine steps
//! and released across the poll wait, so control threads only ever wait for
//! the current iteration to finish.

use crate::capture::PcapWriter;
use crate::config::{EngineConfig, LogLevel, UpstreamRelay};
use crate::engine::{self, Action, Readiness, RunParams, StepContext};
use crate::error::{EngineError, Result};
use crate::host::{HostBridge, UsageRecord};
use crate::session::SessionTable;
use crate::stats::EngineStats;
use crate::sys::VirtualInterface;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

pub const TUN_TOKEN: Token = Token(0);
pub const WAKER_TOKEN: Token = Token(1);

/// Packets read from the virtual interface before relay events get a turn
const TUN_BATCH: usize = 64;
const EVENT_CAPACITY: usize = 1024;

/// Everything the dispatcher and the control surface share
pub(crate) struct DispatchState {
    pub table: SessionTable,
    pub config: EngineConfig,
    pub upstream: Option<UpstreamRelay>,
    pub capture: Option<PcapWriter>,
    pub log_level: LogLevel,
    /// Registry of the running poll, for teardown from other threads
    pub registry: Option<Registry>,
    /// Usage of sessions cleared by another thread, reported by the dispatcher
    pub pending_usage: Vec<UsageRecord>,
}

impl DispatchState {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            table: SessionTable::new(),
            config,
            upstream: None,
            capture: None,
            log_level: LogLevel::default(),
            registry: None,
            pending_usage: Vec::new(),
        }
    }
}

pub(crate) struct Shared {
    pub state: Mutex<DispatchState>,
    pub stopping: AtomicBool,
    pub waker: Mutex<Option<Arc<Waker>>>,
    pub stats: EngineStats,
}

impl Shared {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            state: Mutex::new(DispatchState::new(config)),
            stopping: AtomicBool::new(false),
            waker: Mutex::new(None),
            stats: EngineStats::new(),
        }
    }

    /// Interrupt the poll wait, if a run is in progress
    pub fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            if let Err(e) = waker.wake() {
                warn!("Failed to wake dispatcher: {}", e);
            }
        }
    }
}

/// Write engine output to the virtual interface and act on closes and errors
fn apply_actions(
    ctx: &mut StepContext<'_>,
    table: &mut SessionTable,
    tun: &mut VirtualInterface,
    capture: &mut Option<PcapWriter>,
    actions: Vec<Action>,
) {
    for action in actions {
        match action {
            Action::Forward(packet) => {
                if let Some(writer) = capture.as_mut() {
                    writer.write_packet(&packet);
                }
                match tun.write_packet(&packet) {
                    Ok(_) => ctx.stats.record_written(),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        ctx.stats.record_dropped_write();
                        trace!("virtual interface full, dropped {} bytes", packet.len());
                    }
                    Err(e) => {
                        ctx.stats.record_dropped_write();
                        warn!("virtual interface write failed: {}", e);
                    }
                }
            }
            Action::Drop => {}
            Action::Close(id) => engine::teardown(ctx, table, id),
            Action::Error(e) if e.is_malformed_input() => debug!("{}", e),
            Action::Error(e) => warn!("{}", e),
        }
    }
}

enum TunRead {
    Drained,
    More,
}

/// Read and route up to one batch of packets from the virtual interface
fn read_virtual(
    ctx: &mut StepContext<'_>,
    table: &mut SessionTable,
    tun: &mut VirtualInterface,
    capture: &mut Option<PcapWriter>,
    buf: &mut [u8],
) -> Result<TunRead> {
    for _ in 0..TUN_BATCH {
        let n = match tun.read_packet(buf) {
            Ok(0) => return Err(EngineError::VirtualInterface("end of stream".to_string())),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(TunRead::Drained),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EngineError::VirtualInterface(format!("read: {}", e))),
        };

        ctx.stats.record_read();
        let packet = &buf[..n];
        if let Some(writer) = capture.as_mut() {
            writer.write_packet(packet);
        }
        let actions = engine::handle_virtual_packet(ctx, table, packet);
        apply_actions(ctx, table, tun, capture, actions);
    }
    Ok(TunRead::More)
}

/// Run the event loop on `fd` until a stop request or a fatal error.
///
/// Every session is torn down and its usage reported before this returns,
/// whatever the outcome.
pub(crate) fn run(shared: &Shared, fd: i32, params: RunParams, host: &mut dyn HostBridge) -> Result<()> {
    let mut tun = VirtualInterface::attach(fd)?;
    let mut poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

    let tun_fd = tun.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&tun_fd), TUN_TOKEN, Interest::READABLE)?;
    shared.state.lock().registry = Some(poll.registry().try_clone()?);
    *shared.waker.lock() = Some(waker);

    info!("=== Dispatcher started (fd={}, dns_forward={}) ===", fd, params.dns_forward);
    let result = event_loop(shared, &mut poll, &mut tun, params, host);

    *shared.waker.lock() = None;
    let mut state = shared.state.lock();
    let state = &mut *state;
    state.registry = None;

    let sessions = state.table.clear_all();
    let count = sessions.len();
    for usage in state.pending_usage.drain(..) {
        host.report_usage(&usage);
    }
    for session in sessions {
        if let Some(usage) = engine::close_session(poll.registry(), &shared.stats, session) {
            host.report_usage(&usage);
        }
    }

    if let Err(e) = poll.registry().deregister(&mut SourceFd(&tun_fd)) {
        debug!("deregister virtual interface: {}", e);
    }
    match &result {
        Ok(()) => info!("=== Dispatcher stopped, {} sessions closed ===", count),
        Err(e) => error!("=== Dispatcher failed: {} ({} sessions closed) ===", e, count),
    }
    result
}

fn event_loop(
    shared: &Shared,
    poll: &mut Poll,
    tun: &mut VirtualInterface,
    params: RunParams,
    host: &mut dyn HostBridge,
) -> Result<()> {
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    let mut buf = Vec::new();
    let mut ready = Vec::new();
    // Packets queued before registration produce no edge
    let mut tun_pending = true;
    let mut last_sweep = Instant::now();

    loop {
        if shared.stopping.load(Ordering::Acquire) {
            debug!("stop requested");
            return Ok(());
        }

        let timeout = if tun_pending {
            Duration::ZERO
        } else {
            let interval = shared.state.lock().config.sweep_interval();
            interval.saturating_sub(last_sweep.elapsed())
        };
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }

        ready.clear();
        for event in events.iter() {
            match event.token() {
                TUN_TOKEN => tun_pending = true,
                WAKER_TOKEN => trace!("woken"),
                Token(id) => ready.push((id, Readiness::from(event))),
            }
        }

        if shared.stopping.load(Ordering::Acquire) {
            debug!("stop requested");
            return Ok(());
        }

        let mut guard = shared.state.lock();
        let DispatchState {
            table,
            config,
            upstream,
            capture,
            pending_usage,
            ..
        } = &mut *guard;

        if buf.len() != config.mtu {
            buf.resize(config.mtu, 0);
        }

        let mut ctx = StepContext {
            registry: poll.registry(),
            host: &mut *host,
            config: &*config,
            upstream: upstream.as_ref(),
            stats: &shared.stats,
            run: params,
            now: Instant::now(),
        };

        for usage in pending_usage.drain(..) {
            ctx.host.report_usage(&usage);
        }

        if tun_pending {
            tun_pending = matches!(read_virtual(&mut ctx, table, tun, capture, &mut buf)?, TunRead::More);
        }

        for (id, readiness) in ready.drain(..) {
            let actions = engine::handle_relay_ready(&mut ctx, table, id, readiness);
            apply_actions(&mut ctx, table, tun, capture, actions);
        }

        if last_sweep.elapsed() >= config.sweep_interval() {
            ctx.now = Instant::now();
            let actions = engine::sweep(&mut ctx, table);
            apply_actions(&mut ctx, table, tun, capture, actions);
            last_sweep = ctx.now;
            trace!(sessions = table.len(), "sweep");
        }
    }
}
