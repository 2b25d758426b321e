//! Outer replication frames carried over the COPY BOTH stream
//!
//! The server interleaves XLogData frames (`w`), which wrap a pgoutput
//! payload, with primary keepalives (`k`). The client answers with standby
//! status updates (`r`). These framings belong to the streaming replication
//! protocol itself, not to pgoutput.

use super::Lsn;
use super::buffer::{BufferReader, BufferWriter};
use crate::core::errors::DecodeError;

/// Size of an encoded standby status update: tag + 4 u64/i64 fields + reply flag
pub const STATUS_UPDATE_LEN: usize = 34;

/// WAL data frame wrapping one logical replication payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    /// WAL position where this payload starts
    pub data_start: Lsn,
    /// Current end of WAL on the server
    pub wal_end: Lsn,
    /// Server send time, microseconds since the PostgreSQL epoch
    pub send_time_micros: i64,
    /// The pgoutput payload
    pub data: Vec<u8>,
}

impl XLogData {
    /// Parse a `w` frame as delivered by the COPY stream (tag included).
    pub fn parse(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = BufferReader::new(frame);
        let tag = reader.read_u8()?;
        if tag != b'w' {
            return Err(DecodeError::malformed(
                0,
                format!("expected XLogData frame, found tag '{}'", tag as char),
            ));
        }
        let data_start = reader.read_u64()?;
        let wal_end = reader.read_u64()?;
        let send_time_micros = reader.read_i64()?;
        let data = reader.read_bytes(reader.remaining())?.to_vec();

        Ok(Self {
            data_start,
            wal_end,
            send_time_micros,
            data,
        })
    }
}

/// Primary keepalive frame; `reply_requested` demands an immediate status update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveBody {
    pub wal_end: Lsn,
    pub send_time_micros: i64,
    pub reply_requested: bool,
}

impl KeepaliveBody {
    /// Parse a `k` frame as delivered by the COPY stream (tag included).
    pub fn parse(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = BufferReader::new(frame);
        let tag = reader.read_u8()?;
        if tag != b'k' {
            return Err(DecodeError::malformed(
                0,
                format!("expected keepalive frame, found tag '{}'", tag as char),
            ));
        }

        Ok(Self {
            wal_end: reader.read_u64()?,
            send_time_micros: reader.read_i64()?,
            reply_requested: reader.read_u8()? != 0,
        })
    }
}

/// Standby status update acknowledging positions back to the server
#[derive(Debug, Clone, Copy)]
pub struct StatusUpdate {
    /// Last WAL position received and written locally
    pub write_lsn: Lsn,
    /// Last WAL position durably flushed; advances the slot's confirmed point
    pub flush_lsn: Lsn,
    /// Last WAL position applied downstream
    pub apply_lsn: Lsn,
    /// Client clock, microseconds since the PostgreSQL epoch
    pub client_time_micros: i64,
}

impl StatusUpdate {
    /// Encode an `r` frame for PQputCopyData.
    pub fn encode(&self) -> Result<[u8; STATUS_UPDATE_LEN], DecodeError> {
        let mut frame = [0u8; STATUS_UPDATE_LEN];
        let mut writer = BufferWriter::new(&mut frame);
        writer.write_u8(b'r')?;
        writer.write_u64(self.write_lsn)?;
        writer.write_u64(self.flush_lsn)?;
        writer.write_u64(self.apply_lsn)?;
        writer.write_i64(self.client_time_micros)?;
        writer.write_u8(0)?; // no reply requested
        debug_assert_eq!(writer.bytes_written(), STATUS_UPDATE_LEN);
        Ok(frame)
    }
}
