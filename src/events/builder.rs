//! Builds change events from decoded row messages
//!
//! Couples a decoded Insert/Update/Delete/Truncate to the current transaction
//! and the schema catalog, producing a [`ChangeEvent`] with validated
//! `before`/`after` images and a row key.

use std::collections::HashMap;

use crate::catalog::{RowValidator, SchemaCatalog};
use crate::core::errors::{DecodeError, ReplicationError, ReplicationResult};
use crate::events::{ChangeEvent, Operation, PgValue, ReplicationMessage, Row, TableSchema, Transaction};
use crate::protocol::{Cell, OldTupleKind, Oid, PgoutputMessage, TupleData};

/// Build a [`ChangeEvent`] from a decoded row message.
///
/// Callers must only pass Insert/Update/Delete/Truncate messages; the
/// transaction context must already be established by a Begin.
pub fn build_change_event(
    message: &PgoutputMessage,
    envelope: &ReplicationMessage,
    transaction: &Transaction,
    catalog: &SchemaCatalog,
) -> ReplicationResult<ChangeEvent> {
    let (op, table_schemata, before, after) = match message {
        PgoutputMessage::Insert {
            relation_id,
            new_tuple,
        } => {
            let relation = lookup(catalog, *relation_id)?;
            let after = relation.validate_full(new_tuple)?;
            (Operation::Insert, vec![relation.schema.clone()], None, Some(after))
        }

        PgoutputMessage::Update {
            relation_id,
            old_kind,
            old_tuple,
            new_tuple,
        } => {
            let relation = lookup(catalog, *relation_id)?;
            let before = match (old_kind, old_tuple) {
                (Some(OldTupleKind::Full), Some(old)) => Some(relation.validate_full(old)?),
                (Some(OldTupleKind::Key), Some(old)) => Some(relation.validate_key(old)?),
                _ => None,
            };
            let after = relation.validate_full(new_tuple)?;
            (
                Operation::Update,
                vec![relation.schema.clone()],
                before,
                Some(after),
            )
        }

        PgoutputMessage::Delete {
            relation_id,
            old_kind,
            old_tuple,
        } => {
            let relation = lookup(catalog, *relation_id)?;
            let before = match old_kind {
                OldTupleKind::Full => relation.validate_full(old_tuple)?,
                OldTupleKind::Key => relation.validate_key(old_tuple)?,
            };
            (
                Operation::Delete,
                vec![relation.schema.clone()],
                Some(before),
                None,
            )
        }

        PgoutputMessage::Truncate { relation_ids, .. } => {
            let mut schemata = Vec::with_capacity(relation_ids.len());
            for relation_id in relation_ids {
                schemata.push(lookup(catalog, *relation_id)?.schema.clone());
            }
            (Operation::Truncate, schemata, None, None)
        }

        other => {
            return Err(DecodeError::malformed(
                0,
                format!("not a row change message: {other:?}"),
            )
            .into());
        }
    };

    // Unchanged-TOAST sentinels in an old image are not data; drop them
    // before the image doubles as the row key.
    let before = before.map(|mut row| {
        row.retain(|_, value| *value != PgValue::UnchangedToast);
        row
    });

    let key = match op {
        Operation::Truncate => None,
        _ => Some(derive_key(
            before.as_ref(),
            after.as_ref(),
            &table_schemata[0],
        )?),
    };

    Ok(ChangeEvent {
        op,
        message_id: envelope.message_id,
        lsn: envelope.data_start,
        transaction: transaction.clone(),
        table_schemata,
        before,
        after,
        key,
    })
}

struct CatalogEntry<'a> {
    schema: &'a TableSchema,
    row_validator: &'a RowValidator,
    key_validator: &'a RowValidator,
}

impl CatalogEntry<'_> {
    fn validate_full(&self, tuple: &TupleData) -> ReplicationResult<Row> {
        let raw = zip_cells(self.schema, tuple)?;
        Ok(self.row_validator.validate(&raw)?)
    }

    fn validate_key(&self, tuple: &TupleData) -> ReplicationResult<Row> {
        let raw = zip_cells(self.schema, tuple)?;
        Ok(self.key_validator.validate(&raw)?)
    }
}

fn lookup(catalog: &SchemaCatalog, relation_id: Oid) -> ReplicationResult<CatalogEntry<'_>> {
    let miss = || ReplicationError::CatalogMiss {
        database: catalog.database().to_string(),
        relation_id,
    };
    Ok(CatalogEntry {
        schema: catalog.schema(relation_id).ok_or_else(&miss)?,
        row_validator: catalog.row_validator(relation_id).ok_or_else(&miss)?,
        key_validator: catalog.key_validator(relation_id).ok_or_else(&miss)?,
    })
}

/// Pair tuple cells with column names, in schema order
fn zip_cells(schema: &TableSchema, tuple: &TupleData) -> Result<HashMap<String, Cell>, DecodeError> {
    if tuple.column_count() != schema.column_definitions.len() {
        return Err(DecodeError::malformed(
            0,
            format!(
                "tuple has {} columns but relation {} has {}",
                tuple.column_count(),
                schema.relation_id,
                schema.column_definitions.len()
            ),
        ));
    }
    Ok(schema
        .column_definitions
        .iter()
        .zip(&tuple.cells)
        .map(|(col, cell)| (col.name.clone(), cell.clone()))
        .collect())
}

/// Derive the row key: the old image when one exists, otherwise the key
/// columns of the new image. The virtual `database` / `namespace` / `table`
/// entries are added last and overwrite real columns of the same name.
fn derive_key(
    before: Option<&Row>,
    after: Option<&Row>,
    schema: &TableSchema,
) -> ReplicationResult<Row> {
    let mut key = match (before, after) {
        (Some(before), _) => before.clone(),
        (None, Some(after)) => {
            let mut key = Row::new();
            for column in schema.key_columns() {
                let value = after.get(column).ok_or_else(|| {
                    DecodeError::missing_required_column(column.to_string())
                })?;
                key.insert(column.to_string(), value.clone());
            }
            key
        }
        (None, None) => Row::new(),
    };

    key.insert(
        "database".to_string(),
        PgValue::Text(schema.database.clone()),
    );
    key.insert(
        "namespace".to_string(),
        PgValue::Text(schema.namespace.clone()),
    );
    key.insert("table".to_string(), PgValue::Text(schema.table.clone()));
    Ok(key)
}
