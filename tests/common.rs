//! Shared fixtures for session tests: pgoutput payload builders, a scripted
//! transport and a recording consumer.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pgcdc::catalog::SourceMetadata;
use pgcdc::core::errors::ReplicationResult;
use pgcdc::events::store::{DataStore, FlushHandle};
use pgcdc::events::{ChangeEvent, PgValue, ReplicationMessage, SlotInitInfo, TableSchema, Transaction};
use pgcdc::protocol::wire::XLogData;
use pgcdc::protocol::{Cell, Lsn, Oid};
use pgcdc::replication::transport::{CreatedSlot, ReplicationTransport};
use pgcdc::ReplicationError;

// ---------------------------------------------------------------------------
// Payload builders: the inverse of the pgoutput decoders.

fn push_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

pub fn encode_tuple(buf: &mut Vec<u8>, cells: &[Cell]) {
    buf.extend_from_slice(&(cells.len() as i16).to_be_bytes());
    for cell in cells {
        match cell {
            Cell::Null => buf.push(b'n'),
            Cell::UnchangedToast => buf.push(b'u'),
            Cell::Text(text) => {
                buf.push(b't');
                buf.extend_from_slice(&(text.len() as i32).to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
            }
        }
    }
}

pub fn begin_payload(final_lsn: Lsn, commit_ts_micros: i64, xid: u32) -> Vec<u8> {
    let mut buf = vec![b'B'];
    buf.extend_from_slice(&final_lsn.to_be_bytes());
    buf.extend_from_slice(&commit_ts_micros.to_be_bytes());
    buf.extend_from_slice(&xid.to_be_bytes());
    buf
}

pub fn commit_payload(commit_lsn: Lsn, end_lsn: Lsn, commit_ts_micros: i64) -> Vec<u8> {
    let mut buf = vec![b'C', 0];
    buf.extend_from_slice(&commit_lsn.to_be_bytes());
    buf.extend_from_slice(&end_lsn.to_be_bytes());
    buf.extend_from_slice(&commit_ts_micros.to_be_bytes());
    buf
}

/// Columns as `(part_of_pkey, name, type_oid)`
pub fn relation_payload(
    relation_id: Oid,
    namespace: &str,
    name: &str,
    columns: &[(bool, &str, Oid)],
) -> Vec<u8> {
    let mut buf = vec![b'R'];
    buf.extend_from_slice(&relation_id.to_be_bytes());
    push_cstr(&mut buf, namespace);
    push_cstr(&mut buf, name);
    buf.push(b'd');
    buf.extend_from_slice(&(columns.len() as i16).to_be_bytes());
    for (pkey, col_name, type_id) in columns {
        buf.push(if *pkey { 1 } else { 0 });
        push_cstr(&mut buf, col_name);
        buf.extend_from_slice(&type_id.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
    }
    buf
}

pub fn insert_payload(relation_id: Oid, cells: &[Cell]) -> Vec<u8> {
    let mut buf = vec![b'I'];
    buf.extend_from_slice(&relation_id.to_be_bytes());
    buf.push(b'N');
    encode_tuple(&mut buf, cells);
    buf
}

pub fn update_payload(
    relation_id: Oid,
    old: Option<(u8, &[Cell])>,
    new: &[Cell],
) -> Vec<u8> {
    let mut buf = vec![b'U'];
    buf.extend_from_slice(&relation_id.to_be_bytes());
    if let Some((kind, old_cells)) = old {
        buf.push(kind);
        encode_tuple(&mut buf, old_cells);
    }
    buf.push(b'N');
    encode_tuple(&mut buf, new);
    buf
}

pub fn delete_payload(relation_id: Oid, kind: u8, old: &[Cell]) -> Vec<u8> {
    let mut buf = vec![b'D'];
    buf.extend_from_slice(&relation_id.to_be_bytes());
    buf.push(kind);
    encode_tuple(&mut buf, old);
    buf
}

pub fn truncate_payload(relation_ids: &[Oid]) -> Vec<u8> {
    let mut buf = vec![b'T'];
    buf.extend_from_slice(&(relation_ids.len() as i32).to_be_bytes());
    buf.push(0);
    for id in relation_ids {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf
}

pub fn text(value: &str) -> Cell {
    Cell::Text(value.to_string())
}

pub fn xlog(data_start: Lsn, payload: Vec<u8>) -> XLogData {
    XLogData {
        data_start,
        wal_end: data_start,
        send_time_micros: 0,
        data: payload,
    }
}

// ---------------------------------------------------------------------------
// Scripted transport.

/// Observable side effects of a [`ScriptedTransport`], shared with the test
#[derive(Default)]
pub struct TransportProbe {
    pub feedback: Mutex<Vec<Lsn>>,
    pub closed: AtomicBool,
    pub start_calls: Mutex<Vec<Lsn>>,
    pub rolled_back: AtomicBool,
    pub slot_created: AtomicBool,
}

impl TransportProbe {
    pub fn feedback_lsns(&self) -> Vec<Lsn> {
        self.feedback.lock().unwrap().clone()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-memory transport replaying a fixed list of XLogData frames
pub struct ScriptedTransport {
    script: VecDeque<XLogData>,
    slot_exists: bool,
    probe: Arc<TransportProbe>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<XLogData>, slot_exists: bool) -> (Self, Arc<TransportProbe>) {
        let probe = Arc::new(TransportProbe::default());
        (
            Self {
                script: script.into(),
                slot_exists,
                probe: probe.clone(),
            },
            probe,
        )
    }
}

impl ReplicationTransport for ScriptedTransport {
    fn identify_system(&mut self) -> ReplicationResult<()> {
        Ok(())
    }

    fn start_replication(
        &mut self,
        slot: &str,
        _publication: &str,
        start_lsn: Lsn,
    ) -> ReplicationResult<()> {
        self.probe.start_calls.lock().unwrap().push(start_lsn);
        if !self.slot_exists {
            return Err(ReplicationError::SlotMissing {
                slot: slot.to_string(),
            });
        }
        Ok(())
    }

    fn rollback(&mut self) -> ReplicationResult<()> {
        self.probe.rolled_back.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn create_replication_slot(&mut self, slot: &str) -> ReplicationResult<CreatedSlot> {
        self.slot_exists = true;
        self.probe.slot_created.store(true, Ordering::SeqCst);
        Ok(CreatedSlot {
            slot_name: slot.to_string(),
            consistent_point: "0/16B3748".to_string(),
            snapshot: "00000003-00000002-1".to_string(),
            plugin: "pgoutput".to_string(),
        })
    }

    fn read_xlog(&mut self) -> ReplicationResult<Option<XLogData>> {
        Ok(self.script.pop_front())
    }

    fn send_feedback(&mut self, flush_lsn: Lsn) -> ReplicationResult<()> {
        self.probe.feedback.lock().unwrap().push(flush_lsn);
        Ok(())
    }

    fn close(&mut self) -> ReplicationResult<()> {
        self.probe.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Canned metadata resolver.

pub struct StubSource {
    types: HashMap<Oid, &'static str>,
    not_null: Vec<&'static str>,
}

impl StubSource {
    pub fn integration() -> Self {
        Self {
            types: HashMap::from([
                (23, "integer"),
                (3802, "jsonb"),
                (1700, "numeric(10,2)"),
                (1184, "timestamp with time zone"),
                (25, "text"),
            ]),
            not_null: vec!["id", "updated_at"],
        }
    }
}

impl SourceMetadata for StubSource {
    fn column_type_name(&mut self, type_id: Oid, _atttypmod: i32) -> ReplicationResult<String> {
        Ok(self.types.get(&type_id).unwrap_or(&"text").to_string())
    }

    fn column_is_optional(
        &mut self,
        _namespace: &str,
        _table: &str,
        column: &str,
    ) -> ReplicationResult<bool> {
        Ok(!self.not_null.contains(&column))
    }
}

// ---------------------------------------------------------------------------
// Recording consumer.

#[derive(Default)]
pub struct RecordingStore {
    pub slot_infos: Vec<SlotInitInfo>,
    pub begins: Vec<Transaction>,
    pub relations: Vec<TableSchema>,
    pub events: Vec<ChangeEvent>,
    pub commits: Vec<Transaction>,
    /// Handler invocation order, one tag per call
    pub calls: Vec<&'static str>,
    /// Acknowledge each commit at the commit envelope's data_start
    pub ack_commits: bool,
    /// Per-commit override LSNs, consumed front to back before `ack_commits`
    pub ack_overrides: VecDeque<Lsn>,
    /// Return `Stop` when an insert on `public.control` carries command=exit
    pub stop_on_exit_marker: bool,
}

impl RecordingStore {
    pub fn acknowledging() -> Self {
        Self {
            ack_commits: true,
            ..Self::default()
        }
    }
}

impl DataStore for RecordingStore {
    fn handle_slot_created(&mut self, info: &SlotInitInfo) -> ReplicationResult<()> {
        self.calls.push("slot_created");
        self.slot_infos.push(info.clone());
        Ok(())
    }

    fn handle_begin(
        &mut self,
        txn: &Transaction,
        _message: &ReplicationMessage,
        _flush: &mut FlushHandle,
    ) -> ReplicationResult<()> {
        self.calls.push("begin");
        self.begins.push(txn.clone());
        Ok(())
    }

    fn handle_change_event(
        &mut self,
        event: &ChangeEvent,
        _message: &ReplicationMessage,
        _flush: &mut FlushHandle,
    ) -> ReplicationResult<()> {
        self.calls.push("change");
        self.events.push(event.clone());

        if self.stop_on_exit_marker {
            let on_control = event
                .table_schema()
                .is_some_and(|schema| schema.table == "control");
            let is_exit = event
                .after
                .as_ref()
                .and_then(|after| after.get("command"))
                .is_some_and(|value| *value == PgValue::Text("exit".to_string()));
            if on_control && is_exit {
                return Err(ReplicationError::Stop);
            }
        }
        Ok(())
    }

    fn handle_relation(
        &mut self,
        schema: &TableSchema,
        _message: &ReplicationMessage,
        _flush: &mut FlushHandle,
    ) -> ReplicationResult<()> {
        self.calls.push("relation");
        self.relations.push(schema.clone());
        Ok(())
    }

    fn handle_commit(
        &mut self,
        txn: &Transaction,
        message: &ReplicationMessage,
        flush: &mut FlushHandle,
    ) -> ReplicationResult<()> {
        self.calls.push("commit");
        self.commits.push(txn.clone());
        if let Some(lsn) = self.ack_overrides.pop_front() {
            flush.commit(lsn);
        } else if self.ack_commits {
            flush.commit(message.data_start);
        }
        Ok(())
    }
}
