//! Error types for the tunwall relay engine

use std::io;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the relay engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(u8),

    #[error("Checksum mismatch in {0} header")]
    ChecksumMismatch(&'static str),

    #[error("Address family mismatch between {0} and {1}")]
    AddressFamilyMismatch(std::net::IpAddr, std::net::IpAddr),

    #[error("Duplicate session for {0}")]
    DuplicateSession(String),

    #[error("Relay socket error: {0}")]
    Relay(String),

    #[error("Socket protect failed for fd {0}")]
    ProtectFailed(i32),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Proxy auth failed")]
    ProxyAuthFailed,

    #[error("DNS error: {0}")]
    DnsError(String),

    #[error("Virtual interface error: {0}")]
    VirtualInterface(String),

    #[error("File descriptor limit {limit} below usable minimum {minimum}")]
    DescriptorLimit { limit: u64, minimum: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Decode failures are dropped and counted, never surfaced
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidPacket(_)
                | EngineError::PacketTooShort { .. }
                | EngineError::InvalidIpVersion(_)
                | EngineError::UnsupportedProtocol(_)
                | EngineError::ChecksumMismatch(_)
        )
    }

    /// Errors that reject a flow as if it was denied
    pub fn is_resource_failure(&self) -> bool {
        matches!(self, EngineError::Io(_) | EngineError::ProtectFailed(_) | EngineError::Relay(_))
    }

    /// Numeric code handed to the host on run-level failures
    pub fn code(&self) -> i32 {
        match self {
            EngineError::VirtualInterface(_) => 1,
            EngineError::DescriptorLimit { .. } => 2,
            EngineError::Io(e) => e.raw_os_error().unwrap_or(3),
            _ => 4,
        }
    }
}
