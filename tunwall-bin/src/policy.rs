//! Static YAML policy host

use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use tracing::{debug, error, info, warn};
use tunwall_core::{
    CaptureConfig, ConnectionRecord, DnsRecord, EngineConfig, FlowKey, HostBridge, HostError, PacketRecord,
    UpstreamRelay, UsageRecord, Verdict,
};

/// Top-level layout of the configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub engine: EngineConfig,
    pub policy: Policy,
    pub upstream: Option<UpstreamRelay>,
    pub capture: Option<CaptureConfig>,
}

impl FileConfig {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let config: FileConfig = serde_yaml::from_str(text)?;
        config.engine.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Redirect {
    pub from: SocketAddr,
    pub to: SocketAddr,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub deny_addresses: Vec<IpAddr>,
    pub deny_ports: Vec<u16>,
    pub deny_uids: Vec<i32>,
    /// Names answered locally; a name also blocks its subdomains
    pub blocked_domains: Vec<String>,
    pub redirects: Vec<Redirect>,
    /// SO_MARK applied to relay sockets so routing rules can keep them off the TUN
    pub protect_mark: Option<u32>,
}

pub struct PolicyHost {
    policy: Policy,
    deny_addresses: HashSet<IpAddr>,
    deny_ports: HashSet<u16>,
    blocked: Vec<String>,
}

impl PolicyHost {
    pub fn new(policy: Policy) -> Self {
        let deny_addresses = policy.deny_addresses.iter().copied().collect();
        let deny_ports = policy.deny_ports.iter().copied().collect();
        let blocked = policy
            .blocked_domains
            .iter()
            .map(|name| name.trim_end_matches('.').to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        Self {
            policy,
            deny_addresses,
            deny_ports,
            blocked,
        }
    }

    fn verdict(&self, key: &FlowKey, uid: i32) -> Verdict {
        if self.deny_addresses.contains(&key.dst.ip())
            || self.deny_ports.contains(&key.dst.port())
            || self.policy.deny_uids.contains(&uid)
        {
            return Verdict::Deny;
        }
        match self.policy.redirects.iter().find(|r| r.from == key.dst) {
            Some(redirect) => Verdict::redirect(redirect.to),
            None => Verdict::allow(),
        }
    }
}

impl HostBridge for PolicyHost {
    fn decide(&mut self, key: &FlowKey, uid: i32) -> Result<Verdict, HostError> {
        let verdict = self.verdict(key, uid);
        debug!("{} uid={} -> {:?}", key, uid, verdict);
        Ok(verdict)
    }

    fn report_packet(&mut self, record: &PacketRecord) {
        info!(
            "packet v{} proto={} {} -> {} flags={} uid={} allowed={} {}",
            record.version,
            record.protocol,
            record.src,
            record.dst,
            record.flags,
            record.uid,
            record.allowed,
            record.data
        );
    }

    fn report_connection(&mut self, record: &ConnectionRecord<'_>) {
        info!(
            "connection v{} -> {} uid={} first payload {} bytes",
            record.version,
            record.dst,
            record.uid,
            record.payload.len()
        );
    }

    fn report_dns(&mut self, record: &DnsRecord) {
        info!(
            "dns {} -> {} {} ttl={}",
            record.query_name, record.answer_name, record.resource, record.ttl
        );
    }

    fn report_usage(&mut self, record: &UsageRecord) {
        info!(
            "usage v{} proto={} {} uid={} sent={} received={}",
            record.version, record.protocol, record.dst, record.uid, record.sent, record.received
        );
    }

    fn is_domain_blocked(&mut self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        self.blocked.iter().any(|blocked| {
            name == *blocked
                || name
                    .strip_suffix(blocked.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    fn protect(&mut self, fd: RawFd) -> bool {
        let Some(mark) = self.policy.protect_mark else {
            return true;
        };
        // SAFETY: fd is a live socket owned by the engine; mark outlives the call
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            warn!("SO_MARK on fd {} failed: {}", fd, std::io::Error::last_os_error());
            return false;
        }
        true
    }

    fn report_error(&mut self, code: i32, message: &str) {
        error!("engine error {}: {}", code, message);
    }
}
