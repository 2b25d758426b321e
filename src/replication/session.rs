//! Replication session lifecycle and dispatch loop
//!
//! One session drives one slot: it starts replication (creating the slot on
//! first use), decodes each incoming message, maintains the transaction
//! context and the schema catalog, hands events to the consumer and applies
//! the consumer's flush requests as monotonic LSN feedback.
//!
//! ```text
//! idle ──start──▶ awaiting_slot ──slot exists──▶ streaming
//!                      │                            ▲
//!                      └─ missing ─▶ create_slot ───┘
//! streaming ──stop/error──▶ closed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{MetadataStore, SchemaCatalog, SourceMetadata};
use crate::core::config::ReplicationConfig;
use crate::core::errors::{DecodeError, ReplicationError, ReplicationResult};
use crate::events::store::{DataStore, FlushHandle};
use crate::events::{ReplicationMessage, SlotInitInfo, Transaction, build_change_event};
use crate::protocol::timestamp::pg_micros_to_utc;
use crate::protocol::wire::XLogData;
use crate::protocol::{Lsn, PgoutputMessage, parse_lsn};
use crate::replication::transport::ReplicationTransport;

/// A single replication session over one slot
pub struct ReplicationSession<T: ReplicationTransport> {
    config: ReplicationConfig,
    transport: T,
    catalog: SchemaCatalog,
    source: Box<dyn SourceMetadata + Send>,
    transaction: Option<Transaction>,
    last_flushed: Lsn,
    shutdown: Arc<AtomicBool>,
}

impl<T: ReplicationTransport> ReplicationSession<T> {
    pub fn new(
        config: ReplicationConfig,
        transport: T,
        metadata_store: Box<dyn MetadataStore + Send>,
        source: Box<dyn SourceMetadata + Send>,
        database: String,
    ) -> Self {
        Self {
            config,
            transport,
            catalog: SchemaCatalog::new(database, metadata_store),
            source,
            transaction: None,
            last_flushed: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install an external shutdown flag; setting it ends the stream like a
    /// consumer stop.
    pub fn with_shutdown_signal(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the session until the stream ends, the consumer stops it, or an
    /// error occurs. The transport is released on every exit path; a consumer
    /// [`ReplicationError::Stop`] terminates the stream normally.
    pub fn run(&mut self, store: &mut dyn DataStore) -> ReplicationResult<()> {
        let result = self.run_inner(store);

        if let Err(err) = self.transport.close() {
            warn!("error while releasing replication cursor: {err}");
        }

        match result {
            Err(err) if err.is_stop() => {
                info!("stream stopped by consumer");
                Ok(())
            }
            other => other,
        }
    }

    fn run_inner(&mut self, store: &mut dyn DataStore) -> ReplicationResult<()> {
        self.transport.identify_system()?;
        self.start_streaming(store)?;
        info!(
            database = self.catalog.database(),
            publication = %self.config.publication_name,
            slot = %self.config.slot_name,
            "consuming replication stream"
        );
        self.consume(store)
    }

    /// Enter streaming, creating the slot when the server does not know it.
    fn start_streaming(&mut self, store: &mut dyn DataStore) -> ReplicationResult<()> {
        let started = self.transport.start_replication(
            &self.config.slot_name,
            &self.config.publication_name,
            self.config.start_lsn,
        );

        match started {
            Ok(()) => Ok(()),
            Err(ReplicationError::SlotMissing { slot }) => {
                info!(slot, "replication slot not found, creating it");
                self.transport.rollback()?;
                let created = self
                    .transport
                    .create_replication_slot(&self.config.slot_name)?;

                let consistent_point =
                    parse_lsn(&created.consistent_point).ok_or_else(|| {
                        ReplicationError::transport(format!(
                            "slot creation returned invalid consistent point '{}'",
                            created.consistent_point
                        ))
                    })?;
                let info = SlotInitInfo {
                    dsn: self.config.dsn.clone(),
                    publication_name: self.config.publication_name.clone(),
                    slot_name: created.slot_name,
                    consistent_point,
                    snapshot: created.snapshot,
                    plugin: created.plugin,
                };
                store.handle_slot_created(&info)?;

                self.transport.start_replication(
                    &self.config.slot_name,
                    &self.config.publication_name,
                    self.config.start_lsn,
                )
            }
            Err(err) => Err(err),
        }
    }

    fn consume(&mut self, store: &mut dyn DataStore) -> ReplicationResult<()> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutdown signal received, ending stream");
                return Ok(());
            }

            let Some(xlog) = self.transport.read_xlog()? else {
                info!("replication stream ended");
                return Ok(());
            };
            self.dispatch(xlog, store)?;
        }
    }

    /// Decode one XLogData frame and route it to the consumer.
    fn dispatch(&mut self, xlog: XLogData, store: &mut dyn DataStore) -> ReplicationResult<()> {
        let send_time = pg_micros_to_utc(xlog.send_time_micros).ok_or_else(|| {
            DecodeError::malformed(0, format!("invalid send time {}", xlog.send_time_micros))
        })?;
        let envelope = ReplicationMessage {
            message_id: Uuid::new_v4(),
            data_start: xlog.data_start,
            data_size: xlog.data.len(),
            wal_end: xlog.wal_end,
            send_time,
            payload: xlog.data,
        };

        let message = PgoutputMessage::decode(&envelope.payload)?;
        let mut flush = FlushHandle::new();

        match message {
            PgoutputMessage::Relation(relation) => {
                let schema = self
                    .catalog
                    .upsert_relation(&relation, &mut *self.source)?;
                store.handle_relation(&schema, &envelope, &mut flush)?;
            }

            PgoutputMessage::Begin {
                final_lsn,
                commit_ts_micros,
                xid,
            } => {
                if self.transaction.is_some() {
                    return Err(DecodeError::malformed(
                        0,
                        format!("Begin for xid {xid} inside an open transaction"),
                    )
                    .into());
                }
                let commit_ts = pg_micros_to_utc(commit_ts_micros).ok_or_else(|| {
                    DecodeError::malformed(0, format!("invalid commit time {commit_ts_micros}"))
                })?;
                let txn = Transaction {
                    tx_id: xid,
                    begin_lsn: final_lsn,
                    commit_lsn: None,
                    commit_ts,
                };
                self.transaction = Some(txn.clone());
                store.handle_begin(&txn, &envelope, &mut flush)?;
            }

            PgoutputMessage::Commit { commit_lsn, .. } => {
                let mut txn = self.transaction.take().ok_or_else(|| {
                    DecodeError::malformed(0, "Commit without an open transaction")
                })?;
                txn.commit_lsn = Some(commit_lsn);
                store.handle_commit(&txn, &envelope, &mut flush)?;
            }

            PgoutputMessage::Origin { name, .. } => {
                // Origin filtering is not implemented.
                debug!(origin = %name, "ignoring origin message");
            }

            row_change @ (PgoutputMessage::Insert { .. }
            | PgoutputMessage::Update { .. }
            | PgoutputMessage::Delete { .. }
            | PgoutputMessage::Truncate { .. }) => {
                let txn = self.transaction.as_ref().ok_or_else(|| {
                    DecodeError::malformed(0, "row change outside a transaction")
                })?;
                let event = build_change_event(&row_change, &envelope, txn, &self.catalog)?;
                store.handle_change_event(&event, &envelope, &mut flush)?;
            }
        }

        self.apply_flush(flush)
    }

    /// Send the consumer's flush request to the server, keeping the flush LSN
    /// monotonically non-decreasing. Out-of-order requests are dropped.
    fn apply_flush(&mut self, mut flush: FlushHandle) -> ReplicationResult<()> {
        if let Some(lsn) = flush.take() {
            if lsn > self.last_flushed {
                self.transport.send_feedback(lsn)?;
                self.last_flushed = lsn;
            } else if lsn < self.last_flushed {
                debug!(
                    requested = lsn,
                    flushed = self.last_flushed,
                    "dropping out-of-order flush request"
                );
            }
        }
        Ok(())
    }
}
