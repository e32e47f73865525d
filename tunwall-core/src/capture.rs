//! Packet capture in classic pcap format
//!
//! Records use link type 101 (raw IP). The file never grows much past
//! `max_file_size`: once a write crosses it, the file is cut back to the
//! global header and capture starts over.

use crate::config::CaptureConfig;
use crate::error::{EngineError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
pub const LINKTYPE_RAW: u32 = 101;
pub const GLOBAL_HEADER_LEN: u64 = 24;
pub const RECORD_HEADER_LEN: usize = 16;

pub struct PcapWriter {
    file: File,
    path: PathBuf,
    record_size: usize,
    max_file_size: u64,
    last_ts: (u32, u32),
}

impl PcapWriter {
    /// Open (or continue) a capture file
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        if config.record_size == 0 {
            return Err(EngineError::Capture("record_size cannot be zero".to_string()));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&config.path)
            .map_err(|e| EngineError::Capture(format!("{}: {}", config.path.display(), e)))?;

        if file.metadata()?.len() == 0 {
            file.write_all(&global_header(config.record_size as u32))?;
        }

        info!(
            "Capturing to {} (record size {}, max {} bytes)",
            config.path.display(),
            config.record_size,
            config.max_file_size
        );
        Ok(Self {
            file,
            path: config.path.clone(),
            record_size: config.record_size,
            max_file_size: config.max_file_size,
            last_ts: (0, 0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one packet; failures are logged and otherwise ignored
    pub fn write_packet(&mut self, data: &[u8]) {
        if let Err(e) = self.try_write(data, SystemTime::now()) {
            warn!("pcap write to {} failed: {}", self.path.display(), e);
        }
    }

    fn try_write(&mut self, data: &[u8], at: SystemTime) -> std::io::Result<()> {
        let ts = self.timestamp(at);
        let incl = data.len().min(self.record_size);

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + incl);
        record.extend_from_slice(&ts.0.to_le_bytes());
        record.extend_from_slice(&ts.1.to_le_bytes());
        record.extend_from_slice(&(incl as u32).to_le_bytes());
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(&data[..incl]);
        self.file.write_all(&record)?;

        if self.file.metadata()?.len() > self.max_file_size {
            debug!("pcap file {} over {} bytes, truncating", self.path.display(), self.max_file_size);
            self.file.set_len(GLOBAL_HEADER_LEN)?;
            self.file.seek(SeekFrom::End(0))?;
        }
        Ok(())
    }

    /// Wall-clock timestamp, never earlier than the previous record's
    fn timestamp(&mut self, at: SystemTime) -> (u32, u32) {
        let since = at.duration_since(UNIX_EPOCH).unwrap_or_default();
        let ts = (since.as_secs() as u32, since.subsec_micros());
        if ts > self.last_ts {
            self.last_ts = ts;
        }
        self.last_ts
    }

    /// Flush and sync the file to disk
    pub fn close(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        debug!("pcap file {} closed", self.path.display());
        Ok(())
    }
}

fn global_header(snaplen: u32) -> [u8; GLOBAL_HEADER_LEN as usize] {
    let mut header = [0u8; GLOBAL_HEADER_LEN as usize];
    header[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
    header[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
    // thiszone and sigfigs stay zero
    header[16..20].copy_from_slice(&snaplen.to_le_bytes());
    header[20..24].copy_from_slice(&LINKTYPE_RAW.to_le_bytes());
    header
}
