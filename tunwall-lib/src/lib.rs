//! tunwall control library
//!
//! Wraps [`tunwall_core::Firewall`] in a handle registry for hosts that talk
//! through FFI, installs the tracing subscriber, and on Android exports the
//! JNI entry points of the VPN service.

pub mod api;
mod error;
pub mod logging;

#[cfg(target_os = "android")]
pub mod android_jni;

pub use api::*;
pub use error::{FirewallError, Result};
pub use logging::{init_logging, set_log_level};
