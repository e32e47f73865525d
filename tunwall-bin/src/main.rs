mod policy;
mod tun;

use anyhow::{bail, Context, Result};
use clap::Parser;
use policy::{FileConfig, PolicyHost};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::fs;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};
use tunwall_core::{CaptureConfig, Firewall, LogLevel, UpstreamRelay};

/// tunwall - no-root TUN firewall relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Already-open TUN descriptor inherited from the parent
    #[arg(long, conflicts_with = "device")]
    fd: Option<i32>,

    /// TUN interface to open (must already be configured and routed)
    #[arg(short, long)]
    device: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,

    /// Redirect DNS to the configured resolver
    #[arg(long)]
    dns_forward: bool,

    /// Response code for locally answered blocked names
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(0..=15))]
    rcode: u8,

    /// verbose, debug, info, warn or error
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: LogLevel,

    /// Capture forwarded packets to this pcap file
    #[arg(long)]
    pcap: Option<PathBuf>,

    /// Bytes kept per captured packet
    #[arg(long, default_value_t = 64)]
    pcap_record_size: usize,

    /// Capture file size at which it starts over
    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    pcap_max_size: u64,

    /// Relay TCP through this SOCKS5 proxy
    #[arg(long)]
    socks5: Option<SocketAddr>,
}

fn parse_level(text: &str) -> std::result::Result<LogLevel, String> {
    match text.to_ascii_lowercase().as_str() {
        "verbose" | "trace" => Ok(LogLevel::Verbose),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" | "warning" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        other => Err(format!("unknown log level '{}'", other)),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            FileConfig::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(FileConfig::default()),
    }
}

/// Keeps an opened device alive for the whole run
enum TunHandle {
    Inherited(i32),
    Opened(OwnedFd),
}

impl TunHandle {
    fn raw(&self) -> i32 {
        match self {
            TunHandle::Inherited(fd) => *fd,
            TunHandle::Opened(fd) => fd.as_raw_fd(),
        }
    }
}

fn watch_signals(firewall: Arc<Firewall>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new().name("tunwall-signals".to_string()).spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("Received signal {}, stopping", signal);
            firewall.stop();
        }
    })?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tunwall::init_logging();
    tunwall::set_log_level(args.log_level);

    let mut config = load_config(args.config.as_ref())?;
    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    if let Some(addr) = args.socks5 {
        config.upstream = Some(UpstreamRelay::new(addr.ip(), addr.port()));
    }
    if let Some(path) = args.pcap.clone() {
        config.capture = Some(CaptureConfig {
            path,
            record_size: args.pcap_record_size,
            max_file_size: args.pcap_max_size,
        });
    }
    if args.dns_forward && config.engine.dns_resolver.is_none() {
        warn!("--dns-forward given without engine.dns_resolver; DNS stays on its original path");
    }

    let tun = match (args.fd, args.device.as_deref()) {
        (Some(fd), _) => TunHandle::Inherited(fd),
        (None, Some(name)) => TunHandle::Opened(tun::open_tun(name)?),
        (None, None) => bail!("either --fd or --device is required"),
    };

    let firewall = Arc::new(Firewall::with_config(0, config.engine)?);
    firewall.configure_capture(config.capture)?;
    firewall.configure_upstream_relay(config.upstream);
    firewall.start(args.log_level);
    watch_signals(Arc::clone(&firewall))?;

    let mut host = PolicyHost::new(config.policy);
    info!("=== tunwall running on fd {} ===", tun.raw());
    let result = firewall.run(tun.raw(), args.dns_forward, args.rcode, &mut host);

    let stats = firewall.stats();
    info!(
        "read={} written={} decode_failures={} dropped_writes={} denied={} oversized={}",
        stats.packets_read,
        stats.packets_written,
        stats.decode_failures,
        stats.dropped_writes,
        stats.denied,
        stats.oversized
    );
    firewall.done();
    result?;
    info!("=== tunwall stopped ===");
    Ok(())
}
