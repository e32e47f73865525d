//! Non-blocking SOCKS5 CONNECT handshake (RFC 1928, RFC 1929)
//!
//! The relay socket is driven by readiness events, so the handshake is a
//! state machine: the caller writes `greeting()` once the proxy connection is
//! up, then feeds it exactly `wanted()` bytes at a time. Reading no further
//! than the handshake keeps any early server data in the socket.

use crate::error::{EngineError, Result};
use std::net::{IpAddr, SocketAddr};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_REJECTED: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Phase {
    Greeting,
    Auth,
    Connect,
    Done,
}

/// What the caller should do after feeding data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Step {
    /// Write these bytes to the proxy
    Send(Vec<u8>),
    /// Keep reading
    NeedMore,
    /// Tunnel established
    Connected,
}

#[derive(Debug, Clone)]
pub struct Socks5Handshake {
    phase: Socks5Phase,
    target: SocketAddr,
    credentials: Option<(String, String)>,
    buf: Vec<u8>,
}

fn reply_message(status: u8) -> &'static str {
    match status {
        0x01 => "General SOCKS server failure",
        0x02 => "Connection not allowed by ruleset",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "Unknown error",
    }
}

impl Socks5Handshake {
    pub fn new(target: SocketAddr, credentials: Option<(&str, &str)>) -> Self {
        Self {
            phase: Socks5Phase::Greeting,
            target,
            credentials: credentials.map(|(u, p)| (u.to_string(), p.to_string())),
            buf: Vec::with_capacity(32),
        }
    }

    pub fn phase(&self) -> Socks5Phase {
        self.phase
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Method selection message
    pub fn greeting(&self) -> Vec<u8> {
        if self.credentials.is_some() {
            vec![VERSION, 0x02, METHOD_NONE, METHOD_USER_PASS]
        } else {
            vec![VERSION, 0x01, METHOD_NONE]
        }
    }

    /// Bytes still missing from the reply of the current phase
    pub fn wanted(&self) -> usize {
        let total = match self.phase {
            Socks5Phase::Greeting | Socks5Phase::Auth => 2,
            Socks5Phase::Connect => {
                if self.buf.len() < 5 {
                    5
                } else {
                    match self.buf[3] {
                        0x01 => 4 + 4 + 2,
                        0x04 => 4 + 16 + 2,
                        0x03 => 4 + 1 + self.buf[4] as usize + 2,
                        // Rejected in on_data once the header is complete
                        _ => 5,
                    }
                }
            }
            Socks5Phase::Done => 0,
        };
        total.saturating_sub(self.buf.len())
    }

    fn auth_request(user: &str, pass: &str) -> Result<Vec<u8>> {
        if user.len() > 255 || pass.len() > 255 {
            return Err(EngineError::ProxyError("Credentials too long".to_string()));
        }
        let mut auth = vec![AUTH_VERSION, user.len() as u8];
        auth.extend_from_slice(user.as_bytes());
        auth.push(pass.len() as u8);
        auth.extend_from_slice(pass.as_bytes());
        Ok(auth)
    }

    fn connect_request(&self) -> Vec<u8> {
        let mut request = vec![VERSION, CMD_CONNECT, 0x00];
        match self.target.ip() {
            IpAddr::V4(ipv4) => {
                request.push(0x01);
                request.extend_from_slice(&ipv4.octets());
            }
            IpAddr::V6(ipv6) => {
                request.push(0x04);
                request.extend_from_slice(&ipv6.octets());
            }
        }
        request.extend_from_slice(&self.target.port().to_be_bytes());
        request
    }

    /// Feed bytes read from the proxy; never more than `wanted()`
    pub fn on_data(&mut self, data: &[u8]) -> Result<Socks5Step> {
        if data.len() > self.wanted() {
            return Err(EngineError::ProxyError("Unexpected data from proxy".to_string()));
        }
        self.buf.extend_from_slice(data);

        if self.phase == Socks5Phase::Connect && self.buf.len() >= 4 && !matches!(self.buf[3], 0x01 | 0x03 | 0x04) {
            return Err(EngineError::ProxyError(format!(
                "Unsupported address type {} in reply",
                self.buf[3]
            )));
        }

        if self.wanted() > 0 {
            return Ok(Socks5Step::NeedMore);
        }

        let reply = std::mem::take(&mut self.buf);
        match self.phase {
            Socks5Phase::Greeting => {
                if reply[0] != VERSION {
                    return Err(EngineError::ProxyError("Invalid SOCKS5 version in response".to_string()));
                }
                match reply[1] {
                    METHOD_NONE => {
                        self.phase = Socks5Phase::Connect;
                        Ok(Socks5Step::Send(self.connect_request()))
                    }
                    METHOD_USER_PASS => match &self.credentials {
                        Some((user, pass)) => {
                            let auth = Self::auth_request(user, pass)?;
                            self.phase = Socks5Phase::Auth;
                            Ok(Socks5Step::Send(auth))
                        }
                        None => Err(EngineError::ProxyError(
                            "Proxy requires auth but no credentials configured".to_string(),
                        )),
                    },
                    METHOD_REJECTED => Err(EngineError::ProxyError("No acceptable auth method".to_string())),
                    other => Err(EngineError::ProxyError(format!("Unsupported auth method {}", other))),
                }
            }
            Socks5Phase::Auth => {
                if reply[1] != 0x00 {
                    return Err(EngineError::ProxyAuthFailed);
                }
                self.phase = Socks5Phase::Connect;
                Ok(Socks5Step::Send(self.connect_request()))
            }
            Socks5Phase::Connect => {
                if reply[0] != VERSION {
                    return Err(EngineError::ProxyError("Invalid SOCKS5 version in response".to_string()));
                }
                if reply[1] != 0x00 {
                    return Err(EngineError::ProxyError(format!(
                        "CONNECT failed: {}",
                        reply_message(reply[1])
                    )));
                }
                self.phase = Socks5Phase::Done;
                Ok(Socks5Step::Connected)
            }
            Socks5Phase::Done => Ok(Socks5Step::Connected),
        }
    }
}
