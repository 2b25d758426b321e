//! Change event model and construction
//!
//! The data model carried from the replication session to the consumer:
//! the raw message envelope, table schemas, transaction metadata and the
//! typed per-row [`ChangeEvent`].

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::{Lsn, Oid, Xid};

pub mod builder;
pub mod store;

// Re-export for convenience
pub use builder::build_change_event;
pub use store::{DataStore, FlushHandle, LogStore};

/// Raw replication message envelope, immutable once constructed.
///
/// Wraps the payload of one XLogData frame together with a message UUID
/// assigned on receipt and the server-side positions and timing.
#[derive(Debug, Clone)]
pub struct ReplicationMessage {
    pub message_id: Uuid,
    /// WAL position where the payload starts
    pub data_start: Lsn,
    pub payload: Vec<u8>,
    pub send_time: DateTime<Utc>,
    pub data_size: usize,
    /// Current end of WAL on the server
    pub wal_end: Lsn,
}

/// Metadata about one column of a replicated table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub part_of_pkey: bool,
    /// Type OID on the source
    pub type_id: Oid,
    /// Human-readable type name as resolved by `format_type`
    pub type_name: String,
    /// True iff the source column lacks a NOT NULL constraint
    pub optional: bool,
}

/// Schema of a replicated table.
///
/// Column order matches the Relation message and therefore the cell order of
/// every subsequent tuple for this relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub database: String,
    pub namespace: String,
    pub table: String,
    pub relation_id: Oid,
    pub column_definitions: Vec<ColumnDefinition>,
}

impl TableSchema {
    /// Names of the primary key columns, in schema order
    pub fn key_columns(&self) -> Vec<&str> {
        self.column_definitions
            .iter()
            .filter(|col| col.part_of_pkey)
            .map(|col| col.name.as_str())
            .collect()
    }
}

/// Transaction metadata; created at Begin, disposed after Commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub tx_id: Xid,
    pub begin_lsn: Lsn,
    /// Set once the Commit message has been seen
    pub commit_lsn: Option<Lsn>,
    pub commit_ts: DateTime<Utc>,
}

/// Details captured when the session creates its replication slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInitInfo {
    pub dsn: String,
    pub publication_name: String,
    pub slot_name: String,
    /// LSN at which the slot became consistent
    pub consistent_point: Lsn,
    /// Exported snapshot usable for an initial table sync
    pub snapshot: String,
    pub plugin: String,
}

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl Operation {
    pub fn as_char(&self) -> char {
        match self {
            Operation::Insert => 'I',
            Operation::Update => 'U',
            Operation::Delete => 'D',
            Operation::Truncate => 'T',
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl Serialize for Operation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.as_char())
    }
}

/// A column value converted according to the column's source type name.
///
/// Modeled after the wire text representation: integers and decimals are
/// parsed, timestamps become instants, `json`/`jsonb` become parsed JSON,
/// everything else stays text. `UnchangedToast` is a sentinel for a TOASTed
/// value that was not transmitted; it is never real data.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    UnchangedToast,
    Integer(i64),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Numeric(Decimal),
    Text(String),
}

impl Serialize for PgValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PgValue::Null => serializer.serialize_none(),
            PgValue::UnchangedToast => serializer.serialize_str("__unchanged_toast__"),
            PgValue::Integer(v) => v.serialize(serializer),
            PgValue::Timestamp(v) => v.serialize(serializer),
            PgValue::TimestampTz(v) => v.serialize(serializer),
            PgValue::Json(v) => v.serialize(serializer),
            PgValue::Numeric(v) => v.serialize(serializer),
            PgValue::Text(v) => v.serialize(serializer),
        }
    }
}

/// A validated row image: column name to converted value
pub type Row = HashMap<String, PgValue>;

/// One row-level change, coupled to its transaction and schema.
///
/// Insert/Update/Delete events carry exactly one schema in `table_schemata`;
/// a Truncate carries one per truncated relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub op: Operation,
    /// UUID of the envelope this event was decoded from
    pub message_id: Uuid,
    /// WAL position of the envelope (`data_start`)
    pub lsn: Lsn,
    pub transaction: Transaction,
    pub table_schemata: Vec<TableSchema>,
    pub before: Option<Row>,
    pub after: Option<Row>,
    /// Uniquely identifies the affected row; includes the virtual keys
    /// `database`, `namespace` and `table`
    pub key: Option<Row>,
}

impl ChangeEvent {
    /// The affected table; the first one for a multi-table Truncate
    pub fn table_schema(&self) -> Option<&TableSchema> {
        self.table_schemata.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> TableSchema {
        TableSchema {
            database: "unittest".to_string(),
            namespace: "public".to_string(),
            table: "integration".to_string(),
            relation_id: 16385,
            column_definitions: vec![
                ColumnDefinition {
                    name: "id".to_string(),
                    part_of_pkey: true,
                    type_id: 23,
                    type_name: "integer".to_string(),
                    optional: false,
                },
                ColumnDefinition {
                    name: "text_data".to_string(),
                    part_of_pkey: false,
                    type_id: 25,
                    type_name: "text".to_string(),
                    optional: true,
                },
            ],
        }
    }

    #[test]
    fn key_columns_preserve_schema_order() {
        let mut schema = sample_schema();
        schema.column_definitions[1].part_of_pkey = true;
        assert_eq!(schema.key_columns(), vec!["id", "text_data"]);
    }

    #[test]
    fn operation_serializes_as_single_letter() {
        assert_eq!(serde_json::to_string(&Operation::Insert).unwrap(), "\"I\"");
        assert_eq!(serde_json::to_string(&Operation::Truncate).unwrap(), "\"T\"");
    }

    #[test]
    fn toast_sentinel_is_not_null_in_json() {
        let null = serde_json::to_value(PgValue::Null).unwrap();
        let toast = serde_json::to_value(PgValue::UnchangedToast).unwrap();
        assert!(null.is_null());
        assert_eq!(toast, serde_json::json!("__unchanged_toast__"));
    }
}
