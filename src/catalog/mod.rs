//! Schema catalog for replicated relations
//!
//! Relation messages announce a table's column layout; the catalog enriches
//! that with type names and nullability resolved on the source database and
//! keeps the result, together with synthesized row validators, keyed by
//! `(database, relation_id)`. Resolution happens once per relation and once
//! per type OID; later Relation messages for a known relation return the
//! cached schema untouched.

use std::collections::HashMap;

use tracing::debug;

use crate::core::errors::ReplicationResult;
use crate::events::{ColumnDefinition, TableSchema};
use crate::protocol::{Oid, RelationBody};

pub mod validator;

pub use validator::{RowValidator, TypeConverter};

/// Resolves column metadata on the source database.
///
/// Implemented by the live source connection; tests substitute a stub.
pub trait SourceMetadata {
    /// Human-readable type name for a type OID, i.e. `format_type(oid, mod)`
    fn column_type_name(&mut self, type_id: Oid, atttypmod: i32) -> ReplicationResult<String>;

    /// True iff the column lacks a NOT NULL constraint
    fn column_is_optional(
        &mut self,
        namespace: &str,
        table: &str,
        column: &str,
    ) -> ReplicationResult<bool>;
}

/// Black-box key/value store backing the catalog.
///
/// Everything is keyed by `(database, oid)`; the default implementation is
/// [`InMemoryMetadataStore`], but any persistent catalog can stand in.
pub trait MetadataStore {
    fn column_type(&self, database: &str, type_id: Oid) -> Option<&str>;
    fn add_column_type(&mut self, database: &str, type_id: Oid, type_name: String);

    fn table_schema(&self, database: &str, relation_id: Oid) -> Option<&TableSchema>;
    fn add_table_schema(&mut self, database: &str, relation_id: Oid, schema: TableSchema);

    fn row_validator(&self, database: &str, relation_id: Oid) -> Option<&RowValidator>;
    fn add_row_validator(&mut self, database: &str, relation_id: Oid, validator: RowValidator);

    fn key_validator(&self, database: &str, relation_id: Oid) -> Option<&RowValidator>;
    fn add_key_validator(&mut self, database: &str, relation_id: Oid, validator: RowValidator);
}

/// In-memory metadata store, the default catalog backing
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    pg_types: HashMap<(String, Oid), String>,
    table_schemas: HashMap<(String, Oid), TableSchema>,
    row_validators: HashMap<(String, Oid), RowValidator>,
    key_validators: HashMap<(String, Oid), RowValidator>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn column_type(&self, database: &str, type_id: Oid) -> Option<&str> {
        self.pg_types
            .get(&(database.to_string(), type_id))
            .map(String::as_str)
    }

    fn add_column_type(&mut self, database: &str, type_id: Oid, type_name: String) {
        self.pg_types.insert((database.to_string(), type_id), type_name);
    }

    fn table_schema(&self, database: &str, relation_id: Oid) -> Option<&TableSchema> {
        self.table_schemas.get(&(database.to_string(), relation_id))
    }

    fn add_table_schema(&mut self, database: &str, relation_id: Oid, schema: TableSchema) {
        self.table_schemas
            .insert((database.to_string(), relation_id), schema);
    }

    fn row_validator(&self, database: &str, relation_id: Oid) -> Option<&RowValidator> {
        self.row_validators.get(&(database.to_string(), relation_id))
    }

    fn add_row_validator(&mut self, database: &str, relation_id: Oid, validator: RowValidator) {
        self.row_validators
            .insert((database.to_string(), relation_id), validator);
    }

    fn key_validator(&self, database: &str, relation_id: Oid) -> Option<&RowValidator> {
        self.key_validators.get(&(database.to_string(), relation_id))
    }

    fn add_key_validator(&mut self, database: &str, relation_id: Oid, validator: RowValidator) {
        self.key_validators
            .insert((database.to_string(), relation_id), validator);
    }
}

/// Per-session schema catalog over a metadata store
pub struct SchemaCatalog {
    database: String,
    store: Box<dyn MetadataStore + Send>,
}

impl SchemaCatalog {
    pub fn new(database: String, store: Box<dyn MetadataStore + Send>) -> Self {
        Self { database, store }
    }

    /// Database this catalog is scoped to
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Install the schema announced by a Relation message.
    ///
    /// The first time a relation is seen, type names and nullability are
    /// resolved through `source` and both validators are synthesized. On any
    /// later call for the same relation the cached schema is returned and the
    /// source is not consulted again.
    pub fn upsert_relation(
        &mut self,
        relation: &RelationBody,
        source: &mut dyn SourceMetadata,
    ) -> ReplicationResult<TableSchema> {
        if let Some(schema) = self.store.table_schema(&self.database, relation.relation_id) {
            return Ok(schema.clone());
        }

        debug!(
            relation_id = relation.relation_id,
            table = %relation.relation_name,
            "resolving schema for new relation"
        );

        let mut column_definitions = Vec::with_capacity(relation.columns.len());
        for column in &relation.columns {
            let cached = self
                .store
                .column_type(&self.database, column.type_id)
                .map(str::to_owned);
            let type_name = match cached {
                Some(name) => name,
                None => {
                    let name = source.column_type_name(column.type_id, column.atttypmod)?;
                    self.store
                        .add_column_type(&self.database, column.type_id, name.clone());
                    name
                }
            };

            let optional = source.column_is_optional(
                &relation.namespace,
                &relation.relation_name,
                &column.name,
            )?;

            column_definitions.push(ColumnDefinition {
                name: column.name.clone(),
                part_of_pkey: column.part_of_pkey,
                type_id: column.type_id,
                type_name,
                optional,
            });
        }

        let schema = TableSchema {
            database: self.database.clone(),
            namespace: relation.namespace.clone(),
            table: relation.relation_name.clone(),
            relation_id: relation.relation_id,
            column_definitions,
        };

        self.store.add_row_validator(
            &self.database,
            relation.relation_id,
            RowValidator::full_row(&schema.column_definitions),
        );
        self.store.add_key_validator(
            &self.database,
            relation.relation_id,
            RowValidator::key_only(&schema.column_definitions),
        );
        self.store
            .add_table_schema(&self.database, relation.relation_id, schema.clone());

        Ok(schema)
    }

    /// Cached schema for a relation, if announced this session
    pub fn schema(&self, relation_id: Oid) -> Option<&TableSchema> {
        self.store.table_schema(&self.database, relation_id)
    }

    /// Full-row validator for a relation
    pub fn row_validator(&self, relation_id: Oid) -> Option<&RowValidator> {
        self.store.row_validator(&self.database, relation_id)
    }

    /// Key-only validator for a relation
    pub fn key_validator(&self, relation_id: Oid) -> Option<&RowValidator> {
        self.store.key_validator(&self.database, relation_id)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StubSource;
    use super::*;
    use crate::protocol::RelationColumn;

    fn integration_relation() -> RelationBody {
        RelationBody {
            relation_id: 16385,
            namespace: "public".to_string(),
            relation_name: "integration".to_string(),
            replica_identity: 'd',
            columns: vec![
                RelationColumn {
                    part_of_pkey: true,
                    name: "id".to_string(),
                    type_id: 23,
                    atttypmod: -1,
                },
                RelationColumn {
                    part_of_pkey: false,
                    name: "updated_at".to_string(),
                    type_id: 1184,
                    atttypmod: -1,
                },
            ],
        }
    }

    fn stub() -> StubSource {
        StubSource::new(
            &[(23, "integer"), (1184, "timestamp with time zone")],
            &["id", "updated_at"],
        )
    }

    #[test]
    fn upsert_resolves_types_and_nullability() {
        let mut catalog = SchemaCatalog::new(
            "unittest".to_string(),
            Box::new(InMemoryMetadataStore::new()),
        );
        let mut source = stub();

        let schema = catalog
            .upsert_relation(&integration_relation(), &mut source)
            .unwrap();

        assert_eq!(schema.relation_id, 16385);
        assert_eq!(schema.database, "unittest");
        assert_eq!(schema.column_definitions[0].type_name, "integer");
        assert!(!schema.column_definitions[0].optional);
        assert_eq!(
            schema.column_definitions[1].type_name,
            "timestamp with time zone"
        );
        assert_eq!(schema.key_columns(), vec!["id"]);
        assert!(catalog.row_validator(16385).is_some());
        assert!(catalog.key_validator(16385).is_some());
        assert_eq!(catalog.key_validator(16385).unwrap().column_count(), 1);
    }

    #[test]
    fn second_upsert_is_cached_and_does_not_requery() {
        let mut catalog = SchemaCatalog::new(
            "unittest".to_string(),
            Box::new(InMemoryMetadataStore::new()),
        );
        let mut source = stub();
        let relation = integration_relation();

        let first = catalog.upsert_relation(&relation, &mut source).unwrap();
        let type_queries = source.type_queries;
        let nullability_queries = source.nullability_queries;

        let second = catalog.upsert_relation(&relation, &mut source).unwrap();
        assert_eq!(first, second);
        assert_eq!(source.type_queries, type_queries);
        assert_eq!(source.nullability_queries, nullability_queries);
    }

    #[test]
    fn type_oids_are_resolved_once_across_relations() {
        let mut catalog = SchemaCatalog::new(
            "unittest".to_string(),
            Box::new(InMemoryMetadataStore::new()),
        );
        let mut source = stub();

        catalog
            .upsert_relation(&integration_relation(), &mut source)
            .unwrap();
        assert_eq!(source.type_queries, 2);

        // A second relation reusing OID 23 hits the type cache.
        let mut other = integration_relation();
        other.relation_id = 16390;
        other.relation_name = "control".to_string();
        other.columns.truncate(1);
        catalog.upsert_relation(&other, &mut source).unwrap();
        assert_eq!(source.type_queries, 2);
    }

    #[test]
    fn unknown_relation_is_absent() {
        let catalog = SchemaCatalog::new(
            "unittest".to_string(),
            Box::new(InMemoryMetadataStore::new()),
        );
        assert!(catalog.schema(99999).is_none());
    }
}
