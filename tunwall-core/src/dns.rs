//! DNS message inspection for relayed port-53 traffic
//!
//! Only what the relay needs: the question name of a query, the A/AAAA
//! answers of a response, and a synthesized reply for blocked names.

use crate::error::{EngineError, Result};
use std::net::{Ipv4Addr, Ipv6Addr};

const HEADER_LEN: usize = 12;
const MAX_POINTER_JUMPS: usize = 16;
const MAX_NAME_LEN: usize = 255;

/// TTL of answers in synthesized replies
pub const BLOCKED_TTL: u32 = 600;

static UNSPECIFIED_V4: [u8; 4] = [0; 4];
static UNSPECIFIED_V6: [u8; 16] = [0; 16];

/// DNS record type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DnsQueryType {
    A = 1,
    AAAA = 28,
    CNAME = 5,
    Other = 0,
}

impl DnsQueryType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => Self::A,
            28 => Self::AAAA,
            5 => Self::CNAME,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: u16,
    pub ttl: u32,
    /// Address text for A/AAAA records
    pub resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsAnswer>,
    /// Offset just past the question section
    pub questions_end: usize,
}

impl DnsMessage {
    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }

    pub fn query_name(&self) -> Option<&str> {
        self.questions.first().map(|q| q.name.as_str())
    }
}

fn be16(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| EngineError::DnsError("Truncated".into()))
}

fn be32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| EngineError::DnsError("Truncated".into()))
}

/// Read a possibly compressed name, returning it and the offset after it
fn parse_name(data: &[u8], start: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut jumps = 0;
    let mut resume = None;
    let mut total = 0;

    loop {
        let len = *data
            .get(pos)
            .ok_or_else(|| EngineError::DnsError("Name truncated".into()))? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            let low = *data
                .get(pos + 1)
                .ok_or_else(|| EngineError::DnsError("Pointer truncated".into()))? as usize;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(EngineError::DnsError("Pointer loop".into()));
            }
            resume.get_or_insert(pos + 2);
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }

        if len & 0xC0 != 0 {
            return Err(EngineError::DnsError(format!("Bad label type 0x{:02x}", len)));
        }

        pos += 1;
        let label = data
            .get(pos..pos + len)
            .ok_or_else(|| EngineError::DnsError("Label truncated".into()))?;
        total += len + 1;
        if total > MAX_NAME_LEN {
            return Err(EngineError::DnsError("Name too long".into()));
        }
        labels.push(String::from_utf8_lossy(label).to_string());
        pos += len;
    }

    Ok((labels.join("."), resume.unwrap_or(pos)))
}

/// Parse header, questions and answers; authority/additional are ignored
pub fn parse_message(data: &[u8]) -> Result<DnsMessage> {
    if data.len() < HEADER_LEN {
        return Err(EngineError::DnsError("Too short".into()));
    }

    let id = be16(data, 0)?;
    let flags = be16(data, 2)?;
    let qdcount = be16(data, 4)?;
    let ancount = be16(data, 6)?;

    let mut pos = HEADER_LEN;
    let mut questions = Vec::with_capacity(qdcount.min(4) as usize);
    for _ in 0..qdcount {
        let (name, next) = parse_name(data, pos)?;
        let qtype = be16(data, next)?;
        let qclass = be16(data, next + 2)?;
        questions.push(DnsQuestion { name, qtype, qclass });
        pos = next + 4;
    }
    let questions_end = pos;

    let mut answers = Vec::with_capacity(ancount.min(16) as usize);
    for _ in 0..ancount {
        let (name, next) = parse_name(data, pos)?;
        let rtype = be16(data, next)?;
        let ttl = be32(data, next + 4)?;
        let rdlength = be16(data, next + 8)? as usize;
        let rdata_start = next + 10;
        let rdata = data
            .get(rdata_start..rdata_start + rdlength)
            .ok_or_else(|| EngineError::DnsError("Record data truncated".into()))?;

        let resource = match (DnsQueryType::from_u16(rtype), rdlength) {
            (DnsQueryType::A, 4) => Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string()),
            (DnsQueryType::AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Some(Ipv6Addr::from(octets).to_string())
            }
            _ => None,
        };

        answers.push(DnsAnswer { name, rtype, ttl, resource });
        pos = rdata_start + rdlength;
    }

    Ok(DnsMessage {
        id,
        flags,
        questions,
        answers,
        questions_end,
    })
}

/// Query name of a DNS request, if it parses as one
pub fn query_name(data: &[u8]) -> Option<String> {
    let message = parse_message(data).ok()?;
    if message.is_response() {
        return None;
    }
    message.query_name().map(str::to_string)
}

/// Build a reply to `query` carrying `rcode`.
///
/// With rcode 0 an A or AAAA question is answered with the unspecified
/// address so the client fails fast instead of retrying.
pub fn blocked_response(query: &[u8], rcode: u8) -> Result<Vec<u8>> {
    let message = parse_message(query)?;
    if message.is_response() {
        return Err(EngineError::DnsError("Not a query".into()));
    }
    let question = message
        .questions
        .first()
        .ok_or_else(|| EngineError::DnsError("No question".into()))?;

    let answer: Option<&[u8]> = match (rcode, DnsQueryType::from_u16(question.qtype)) {
        (0, DnsQueryType::A) => Some(&UNSPECIFIED_V4[..]),
        (0, DnsQueryType::AAAA) => Some(&UNSPECIFIED_V6[..]),
        _ => None,
    };

    let mut r = Vec::with_capacity(message.questions_end + 28);
    r.extend_from_slice(&message.id.to_be_bytes());
    // QR, opcode and RD copied from the query, RA set
    let flags = 0x8000 | (message.flags & 0x7900) | 0x0080 | (rcode as u16 & 0x000F);
    r.extend_from_slice(&flags.to_be_bytes());
    r.extend_from_slice(&(message.questions.len() as u16).to_be_bytes());
    r.extend_from_slice(&(answer.is_some() as u16).to_be_bytes());
    r.extend_from_slice(&0u16.to_be_bytes());
    r.extend_from_slice(&0u16.to_be_bytes());
    r.extend_from_slice(&query[HEADER_LEN..message.questions_end]);

    if let Some(rdata) = answer {
        r.extend_from_slice(&0xC00Cu16.to_be_bytes());
        r.extend_from_slice(&question.qtype.to_be_bytes());
        r.extend_from_slice(&question.qclass.to_be_bytes());
        r.extend_from_slice(&BLOCKED_TTL.to_be_bytes());
        r.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        r.extend_from_slice(rdata);
    }

    Ok(r)
}
