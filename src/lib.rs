//! pgcdc - PostgreSQL logical change-data-capture consumer
//!
//! Connects to a source database as a replication client, subscribes to a
//! publication through a replication slot, decodes the binary `pgoutput`
//! stream into typed per-row change events and hands each one, together with
//! schema and transaction metadata, to a pluggable [`events::DataStore`]
//! consumer. Slot lifecycle is managed by the session: the slot is created on
//! first use and durable progress is acknowledged through monotonic LSN
//! feedback driven by the consumer's commit callback.

pub mod catalog;
pub mod core;
pub mod events;
pub mod protocol;
pub mod replication;
pub mod source;

// Re-export the public surface
pub use crate::catalog::{
    InMemoryMetadataStore, MetadataStore, RowValidator, SchemaCatalog, SourceMetadata,
};
pub use crate::core::{DecodeError, DecodeKind, ReplicationConfig, ReplicationError, ReplicationResult};
pub use crate::events::{
    ChangeEvent, ColumnDefinition, DataStore, FlushHandle, LogStore, Operation, PgValue,
    ReplicationMessage, Row, SlotInitInfo, TableSchema, Transaction,
};
pub use crate::protocol::{Cell, Lsn, Oid, PgoutputMessage, TupleData, Xid, format_lsn, parse_lsn};
pub use crate::replication::{PgReplicationTransport, ReplicationSession, ReplicationTransport};
pub use crate::source::SourceDBHandler;
