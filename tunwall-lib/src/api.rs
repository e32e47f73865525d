//! Handle-based control API
//!
//! Hosts that cannot hold a Rust reference (JNI, C) get an integer handle
//! from [`init`]. Every other call looks the engine up by that handle.

use crate::error::{FirewallError, Result};
use crate::logging;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use tunwall_core::{CaptureConfig, Firewall, HostBridge, LogLevel, SessionInfo, SessionStats, UpstreamRelay};

static FIREWALLS: Lazy<RwLock<HashMap<i64, Arc<Firewall>>>> = Lazy::new(|| RwLock::new(HashMap::new()));
static NEXT_HANDLE: AtomicI64 = AtomicI64::new(1);

/// Look up the engine behind `handle`
pub fn firewall(handle: i64) -> Result<Arc<Firewall>> {
    FIREWALLS
        .read()
        .get(&handle)
        .cloned()
        .ok_or(FirewallError::UnknownHandle(handle))
}

/// Create an engine and return its handle
pub fn init(platform_version: i32) -> i64 {
    logging::init_logging();
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    FIREWALLS
        .write()
        .insert(handle, Arc::new(Firewall::init(platform_version)));
    debug!("Created firewall handle {}", handle);
    handle
}

/// Set the log priority (Android numbering) and arm the engine
pub fn start(handle: i64, log_priority: i32) -> Result<()> {
    let level = LogLevel::from_priority(log_priority);
    logging::set_log_level(level);
    firewall(handle)?.start(level);
    Ok(())
}

/// Block relaying `tun_fd` until [`stop`] is called
pub fn run(handle: i64, tun_fd: RawFd, dns_forward: bool, forced_rcode: i32, host: &mut dyn HostBridge) -> Result<()> {
    let rcode = u8::try_from(forced_rcode)
        .ok()
        .filter(|rcode| *rcode <= 15)
        .ok_or_else(|| FirewallError::InvalidArgument(format!("DNS rcode {} out of range", forced_rcode)))?;
    let firewall = firewall(handle)?;
    firewall.run(tun_fd, dns_forward, rcode, host)?;
    Ok(())
}

pub fn stop(handle: i64) -> Result<()> {
    firewall(handle)?.stop();
    Ok(())
}

pub fn clear(handle: i64) -> Result<()> {
    firewall(handle)?.clear();
    Ok(())
}

/// Tear the engine down and release its handle
pub fn done(handle: i64) -> Result<()> {
    let firewall = FIREWALLS
        .write()
        .remove(&handle)
        .ok_or(FirewallError::UnknownHandle(handle))?;
    firewall.done();
    info!("Released firewall handle {}", handle);
    Ok(())
}

pub fn query_stats(handle: i64) -> Result<SessionStats> {
    Ok(firewall(handle)?.query_stats())
}

/// Enable capture to `path`, or disable it with `None`
pub fn configure_capture(handle: i64, path: Option<&str>, record_size: i32, max_file_size: i32) -> Result<()> {
    let firewall = firewall(handle)?;
    let capture = match path {
        Some(path) if !path.is_empty() => {
            let record_size = usize::try_from(record_size)
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| FirewallError::InvalidArgument(format!("record size {}", record_size)))?;
            let max_file_size = u64::try_from(max_file_size)
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| FirewallError::InvalidArgument(format!("max file size {}", max_file_size)))?;
            Some(CaptureConfig {
                path: PathBuf::from(path),
                record_size,
                max_file_size,
            })
        }
        _ => None,
    };
    firewall.configure_capture(capture)?;
    Ok(())
}

/// Route TCP through a SOCKS5 proxy; an empty address or port 0 disables it
pub fn configure_upstream_relay(
    handle: i64,
    address: Option<&str>,
    port: i32,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()> {
    let firewall = firewall(handle)?;
    let upstream = match address {
        Some(address) if !address.is_empty() && port != 0 => {
            let ip: IpAddr = address.parse()?;
            let port =
                u16::try_from(port).map_err(|_| FirewallError::InvalidArgument(format!("port {}", port)))?;
            let relay = UpstreamRelay::new(ip, port);
            Some(match username {
                Some(user) if !user.is_empty() => relay.with_credentials(user, password.unwrap_or("")),
                _ => relay,
            })
        }
        _ => None,
    };
    firewall.configure_upstream_relay(upstream);
    Ok(())
}

pub fn mtu(handle: i64) -> Result<usize> {
    Ok(firewall(handle)?.mtu())
}

pub fn sessions(handle: i64) -> Result<Vec<SessionInfo>> {
    Ok(firewall(handle)?.sessions())
}

pub use tunwall_core::is_numeric_address;
