//! Consumer boundary for decoded change events
//!
//! [`DataStore`] is the contract between the replication session and whatever
//! stores the captured changes (a database, a queue, a file...). The session
//! passes a [`FlushHandle`] into each handler; calling [`FlushHandle::commit`]
//! is how a consumer acknowledges durable progress and advances the slot's
//! confirmed position.
//!
//! [`LogStore`] is the default implementation: it logs everything and
//! acknowledges each commit, which is enough for inspection and for wiring up
//! a new deployment before a real store exists.

use tracing::{debug, info, warn};

use crate::core::errors::ReplicationResult;
use crate::events::{ChangeEvent, ReplicationMessage, SlotInitInfo, TableSchema, Transaction};
use crate::protocol::{Lsn, format_lsn};
use crate::source::SourceDBHandler;

/// Records the flush LSN a consumer wants acknowledged.
///
/// A fresh handle is passed into every handler invocation; after the handler
/// returns, the session compares the recorded value against what has already
/// been sent and only ever advances. Out-of-order requests are dropped there,
/// so consumers may call [`commit`](Self::commit) freely.
#[derive(Debug, Default)]
pub struct FlushHandle {
    requested: Option<Lsn>,
}

impl FlushHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Request that everything up to `lsn` be acknowledged as flushed.
    pub fn commit(&mut self, lsn: Lsn) {
        self.requested = Some(self.requested.map_or(lsn, |cur| cur.max(lsn)));
    }

    pub(crate) fn take(&mut self) -> Option<Lsn> {
        self.requested.take()
    }
}

/// A consumer of replication events.
///
/// Handlers are invoked in wire order on the session thread: a relation
/// before the first change that references it, a begin before every event of
/// its transaction, the commit after all of them. Returning
/// [`crate::core::errors::ReplicationError::Stop`] from any handler ends the
/// stream gracefully; any other error aborts the session.
pub trait DataStore {
    /// Called once when the session had to create the replication slot
    fn handle_slot_created(&mut self, info: &SlotInitInfo) -> ReplicationResult<()>;

    fn handle_begin(
        &mut self,
        txn: &Transaction,
        message: &ReplicationMessage,
        flush: &mut FlushHandle,
    ) -> ReplicationResult<()>;

    fn handle_change_event(
        &mut self,
        event: &ChangeEvent,
        message: &ReplicationMessage,
        flush: &mut FlushHandle,
    ) -> ReplicationResult<()>;

    fn handle_relation(
        &mut self,
        schema: &TableSchema,
        message: &ReplicationMessage,
        flush: &mut FlushHandle,
    ) -> ReplicationResult<()>;

    fn handle_commit(
        &mut self,
        txn: &Transaction,
        message: &ReplicationMessage,
        flush: &mut FlushHandle,
    ) -> ReplicationResult<()>;
}

/// Default consumer that logs changes and acknowledges every commit
pub struct LogStore {
    quiet: bool,
}

impl LogStore {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl DataStore for LogStore {
    fn handle_slot_created(&mut self, info: &SlotInitInfo) -> ReplicationResult<()> {
        info!(
            slot = %info.slot_name,
            plugin = %info.plugin,
            consistent_point = %format_lsn(info.consistent_point),
            "replication slot created"
        );

        // Enumerate the tables an initial sync could seed, under the snapshot
        // exported by slot creation.
        let mut source = SourceDBHandler::connect(&info.dsn)?;
        let tables = source.publication_tables(&info.snapshot, &info.publication_name)?;
        for (namespace, table) in tables {
            info!("publication {} includes table {namespace}.{table}", info.publication_name);
        }
        Ok(())
    }

    fn handle_begin(
        &mut self,
        txn: &Transaction,
        message: &ReplicationMessage,
        _flush: &mut FlushHandle,
    ) -> ReplicationResult<()> {
        if !self.quiet {
            info!(
                message_id = %message.message_id,
                tx_id = txn.tx_id,
                begin_lsn = %format_lsn(txn.begin_lsn),
                commit_ts = %txn.commit_ts,
                "transaction begin"
            );
        }
        Ok(())
    }

    fn handle_change_event(
        &mut self,
        event: &ChangeEvent,
        message: &ReplicationMessage,
        _flush: &mut FlushHandle,
    ) -> ReplicationResult<()> {
        match serde_json::to_string_pretty(event) {
            Ok(rendered) => info!("{}:{rendered}", message.message_id),
            Err(err) => {
                warn!("change event could not be rendered: {err}");
                info!("{}:{event:?}", message.message_id);
            }
        }
        Ok(())
    }

    fn handle_relation(
        &mut self,
        schema: &TableSchema,
        message: &ReplicationMessage,
        _flush: &mut FlushHandle,
    ) -> ReplicationResult<()> {
        if !self.quiet {
            info!(
                message_id = %message.message_id,
                relation_id = schema.relation_id,
                "schema for {}.{}",
                schema.namespace,
                schema.table
            );
        }
        Ok(())
    }

    fn handle_commit(
        &mut self,
        txn: &Transaction,
        message: &ReplicationMessage,
        flush: &mut FlushHandle,
    ) -> ReplicationResult<()> {
        flush.commit(message.data_start);
        if !self.quiet {
            debug!(
                message_id = %message.message_id,
                tx_id = txn.tx_id,
                "transaction commit acknowledged"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_handle_keeps_the_maximum() {
        let mut flush = FlushHandle::new();
        assert_eq!(flush.take(), None);

        flush.commit(100);
        flush.commit(50);
        assert_eq!(flush.take(), Some(100));
        assert_eq!(flush.take(), None);
    }

    #[test]
    fn flush_handle_records_single_request() {
        let mut flush = FlushHandle::new();
        flush.commit(7);
        assert_eq!(flush.take(), Some(7));
    }
}
