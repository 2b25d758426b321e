//! Replication transport over libpq
//!
//! [`ReplicationTransport`] is the seam between the session state machine and
//! the wire: starting replication, creating slots, reading XLogData frames
//! and writing standby status updates. [`PgReplicationTransport`] is the
//! production implementation over a safe wrapper around libpq's COPY BOTH
//! streaming; tests substitute a scripted transport.

use std::ffi::{CStr, CString};
use std::ptr;
use std::time::{Duration, Instant};

use libpq_sys::{
    ConnStatusType, ExecStatusType, PGconn, PGresult, PQclear, PQconnectdb, PQdb, PQerrorMessage,
    PQexec, PQfinish, PQflush, PQfreemem, PQgetCopyData, PQgetvalue, PQntuples, PQputCopyData,
    PQresultErrorField, PQresultStatus, PQstatus,
};
use tracing::{debug, info, warn};

use crate::core::config::ReplicationConfig;
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::protocol::timestamp::now_pg_micros;
use crate::protocol::wire::{KeepaliveBody, StatusUpdate, XLogData};
use crate::protocol::{Lsn, format_lsn};

/// SQLSTATE for `undefined_object`, returned when a slot does not exist
const SQLSTATE_UNDEFINED_OBJECT: &str = "42704";
/// `PQresultErrorField` code for the SQLSTATE, 'C' in the protocol
const PG_DIAG_SQLSTATE: std::os::raw::c_int = b'C' as std::os::raw::c_int;

/// Row returned by CREATE_REPLICATION_SLOT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSlot {
    pub slot_name: String,
    /// LSN at which the slot became consistent, in `X/X` text form
    pub consistent_point: String,
    /// Name of the exported snapshot
    pub snapshot: String,
    pub plugin: String,
}

/// The replication connection and cursor as seen by the session
pub trait ReplicationTransport {
    /// Run IDENTIFY_SYSTEM as a connection sanity check
    fn identify_system(&mut self) -> ReplicationResult<()>;

    /// Enter COPY BOTH mode streaming from `slot` at `start_lsn`.
    ///
    /// Fails with [`ReplicationError::SlotMissing`] when the server reports
    /// an undefined object.
    fn start_replication(
        &mut self,
        slot: &str,
        publication: &str,
        start_lsn: Lsn,
    ) -> ReplicationResult<()>;

    /// Roll back the transaction aborted by a failed START_REPLICATION
    fn rollback(&mut self) -> ReplicationResult<()>;

    /// Create a pgoutput logical slot and return its init row
    fn create_replication_slot(&mut self, slot: &str) -> ReplicationResult<CreatedSlot>;

    /// Block for the next XLogData frame. Keepalives are answered internally
    /// and never surface. `None` means the stream ended.
    fn read_xlog(&mut self) -> ReplicationResult<Option<XLogData>>;

    /// Acknowledge everything up to `flush_lsn` as durably flushed
    fn send_feedback(&mut self, flush_lsn: Lsn) -> ReplicationResult<()>;

    /// Release the cursor; called on every session exit path
    fn close(&mut self) -> ReplicationResult<()>;
}

/// Safe wrapper for a PostgreSQL connection using libpq
pub struct PgConnection {
    conn: *mut PGconn,
}

// The raw pointer is owned exclusively by this wrapper.
unsafe impl Send for PgConnection {}

impl PgConnection {
    /// Connect with the given conninfo string.
    pub fn connect(conninfo: &str) -> ReplicationResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(ReplicationError::transport(
                "failed to allocate connection object",
            ));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let message = last_error(conn).unwrap_or_else(|| "unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(ReplicationError::transport(format!(
                "connection failed: {message}"
            )));
        }

        Ok(Self { conn })
    }

    /// Name of the connected database
    pub fn db_name(&self) -> ReplicationResult<String> {
        let name = unsafe { PQdb(self.conn) };
        if name.is_null() {
            return Err(ReplicationError::transport("connection has no database"));
        }
        Ok(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    /// Execute a query and wrap the result.
    pub fn exec(&self, query: &str) -> ReplicationResult<PgQueryResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            let message = last_error(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::transport(format!(
                "query execution failed: {message}"
            )));
        }

        Ok(PgQueryResult { result })
    }

    /// Blocking read of one COPY data row; `None` when the COPY ended.
    pub fn get_copy_data(&self) -> ReplicationResult<Option<Vec<u8>>> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        // async=0: block until a full row is available or the COPY ends
        let len = unsafe { PQgetCopyData(self.conn, &mut buffer, 0) };

        match len {
            -2 => {
                let message = last_error(self.conn).unwrap_or_else(|| "unknown error".to_string());
                Err(ReplicationError::transport(message))
            }
            -1 => Ok(None),
            0 => Ok(None),
            len => {
                if buffer.is_null() {
                    return Err(ReplicationError::transport("received null copy buffer"));
                }
                let data =
                    unsafe { std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(Some(data))
            }
        }
    }

    /// Send one COPY data row to the server.
    pub fn put_copy_data(&self, data: &[u8]) -> ReplicationResult<()> {
        let result = unsafe {
            PQputCopyData(
                self.conn,
                data.as_ptr() as *const std::os::raw::c_char,
                data.len() as i32,
            )
        };

        if result != 1 {
            let message = last_error(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::transport(format!(
                "failed to send copy data: {message}"
            )));
        }
        Ok(())
    }

    /// Flush buffered output to the server.
    pub fn flush(&self) -> ReplicationResult<()> {
        if unsafe { PQflush(self.conn) } != 0 {
            return Err(ReplicationError::transport("failed to flush connection"));
        }
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn last_error(conn: *const PGconn) -> Option<String> {
    unsafe {
        let error = PQerrorMessage(conn);
        if error.is_null() {
            None
        } else {
            Some(CStr::from_ptr(error).to_string_lossy().trim().to_owned())
        }
    }
}

/// Safe wrapper for a libpq query result
pub struct PgQueryResult {
    result: *mut PGresult,
}

impl PgQueryResult {
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        let value = unsafe { PQgetvalue(self.result, row, col) };
        if value.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(value) }.to_string_lossy().into_owned())
        }
    }

    /// SQLSTATE of a failed command, when the server provided one
    pub fn sqlstate(&self) -> Option<String> {
        let value = unsafe { PQresultErrorField(self.result, PG_DIAG_SQLSTATE) };
        if value.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(value) }.to_string_lossy().into_owned())
        }
    }
}

impl Drop for PgQueryResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}

/// Production transport: one libpq replication connection in COPY BOTH mode
pub struct PgReplicationTransport {
    conn: PgConnection,
    received_lsn: Lsn,
    flush_lsn: Lsn,
    last_feedback: Instant,
    feedback_interval: Duration,
    streaming: bool,
}

impl PgReplicationTransport {
    /// Open a logical replication connection for the configured dsn.
    pub fn connect(config: &ReplicationConfig) -> ReplicationResult<Self> {
        let conninfo = replication_conninfo(&config.dsn);
        info!("opening replication connection");
        let conn = PgConnection::connect(&conninfo)?;

        Ok(Self {
            conn,
            received_lsn: 0,
            flush_lsn: 0,
            last_feedback: Instant::now(),
            feedback_interval: Duration::from_secs(config.feedback_interval_secs),
            streaming: false,
        })
    }

    fn write_status(&mut self) -> ReplicationResult<()> {
        let frame = StatusUpdate {
            write_lsn: self.received_lsn,
            flush_lsn: self.flush_lsn,
            apply_lsn: self.flush_lsn,
            client_time_micros: now_pg_micros(),
        }
        .encode()?;

        self.conn.put_copy_data(&frame)?;
        self.conn.flush()?;
        self.last_feedback = Instant::now();
        debug!(
            write = %format_lsn(self.received_lsn),
            flush = %format_lsn(self.flush_lsn),
            "sent standby status update"
        );
        Ok(())
    }

    fn note_received(&mut self, wal_end: Lsn) {
        if wal_end > self.received_lsn {
            self.received_lsn = wal_end;
        }
    }
}

impl ReplicationTransport for PgReplicationTransport {
    fn identify_system(&mut self) -> ReplicationResult<()> {
        let result = self.conn.exec("IDENTIFY_SYSTEM")?;
        if !result.is_ok() {
            return Err(ReplicationError::transport(format!(
                "IDENTIFY_SYSTEM failed: {:?}",
                result.status()
            )));
        }
        info!(
            system_id = ?result.getvalue(0, 0),
            timeline = ?result.getvalue(0, 1),
            xlogpos = ?result.getvalue(0, 2),
            dbname = ?result.getvalue(0, 3),
            "system identification successful"
        );
        Ok(())
    }

    fn start_replication(
        &mut self,
        slot: &str,
        publication: &str,
        start_lsn: Lsn,
    ) -> ReplicationResult<()> {
        let sql = format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL {} (proto_version '1', publication_names '{}')",
            slot,
            format_lsn(start_lsn),
            publication
        );
        info!(slot, publication, start_lsn = %format_lsn(start_lsn), "starting replication");

        let result = self.conn.exec(&sql)?;
        if result.status() != ExecStatusType::PGRES_COPY_BOTH {
            if result.sqlstate().as_deref() == Some(SQLSTATE_UNDEFINED_OBJECT) {
                return Err(ReplicationError::SlotMissing {
                    slot: slot.to_string(),
                });
            }
            return Err(ReplicationError::transport(format!(
                "failed to start replication: {:?}",
                result.status()
            )));
        }

        self.streaming = true;
        Ok(())
    }

    fn rollback(&mut self) -> ReplicationResult<()> {
        // The failed START_REPLICATION leaves an aborted transaction behind
        // on some server versions; clearing it must not itself fail the
        // session.
        if let Err(err) = self.conn.exec("ROLLBACK") {
            debug!("rollback after failed start returned: {err}");
        }
        Ok(())
    }

    fn create_replication_slot(&mut self, slot: &str) -> ReplicationResult<CreatedSlot> {
        let sql = format!("CREATE_REPLICATION_SLOT \"{slot}\" LOGICAL pgoutput");
        info!(slot, "creating replication slot");

        let result = self.conn.exec(&sql)?;
        if !result.is_ok() || result.ntuples() < 1 {
            return Err(ReplicationError::transport(format!(
                "failed to create replication slot: {:?}",
                result.status()
            )));
        }

        let field = |col: i32, name: &str| {
            result.getvalue(0, col).ok_or_else(|| {
                ReplicationError::transport(format!("slot creation returned no {name}"))
            })
        };

        Ok(CreatedSlot {
            slot_name: field(0, "slot name")?,
            consistent_point: field(1, "consistent point")?,
            snapshot: field(2, "snapshot")?,
            plugin: field(3, "plugin")?,
        })
    }

    fn read_xlog(&mut self) -> ReplicationResult<Option<XLogData>> {
        loop {
            if self.last_feedback.elapsed() > self.feedback_interval {
                self.write_status()?;
            }

            let Some(frame) = self.conn.get_copy_data()? else {
                return Ok(None);
            };
            if frame.is_empty() {
                continue;
            }

            match frame[0] {
                b'w' => {
                    let xlog = XLogData::parse(&frame)?;
                    self.note_received(xlog.wal_end);
                    return Ok(Some(xlog));
                }
                b'k' => {
                    let keepalive = KeepaliveBody::parse(&frame)?;
                    self.note_received(keepalive.wal_end);
                    if keepalive.reply_requested {
                        debug!("server requested feedback in keepalive");
                        self.write_status()?;
                    }
                }
                other => {
                    warn!("ignoring unknown copy frame tag '{}'", other as char);
                }
            }
        }
    }

    fn send_feedback(&mut self, flush_lsn: Lsn) -> ReplicationResult<()> {
        if flush_lsn > self.flush_lsn {
            self.flush_lsn = flush_lsn;
        }
        self.write_status()
    }

    fn close(&mut self) -> ReplicationResult<()> {
        if self.streaming {
            // Best effort: leave the server with our final position.
            if let Err(err) = self.write_status() {
                warn!("failed to send final feedback during close: {err}");
            }
            self.streaming = false;
        }
        Ok(())
    }
}

/// Append `replication=database` to a dsn, handling both conninfo and URI forms
fn replication_conninfo(dsn: &str) -> String {
    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        let separator = if dsn.contains('?') { '&' } else { '?' };
        format!("{dsn}{separator}replication=database")
    } else {
        format!("{dsn} replication=database")
    }
}
