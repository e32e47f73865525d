use std::net::AddrParseError;
use thiserror::Error;
use tunwall_core::EngineError;

/// Errors surfaced through the control API
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("Unknown firewall handle {0}")]
    UnknownHandle(i64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid address: {0}")]
    Address(#[from] AddrParseError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, FirewallError>;
