//! Metadata queries against the source database
//!
//! A plain (non-replication) connection used to resolve what the wire does
//! not carry: human-readable type names, NOT NULL constraints, and the tables
//! of a publication under an exported snapshot.

use tracing::debug;

use crate::catalog::SourceMetadata;
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::protocol::Oid;
use crate::replication::transport::{PgConnection, PgQueryResult};

/// Helper connection for source-side metadata resolution
pub struct SourceDBHandler {
    conn: PgConnection,
    database: String,
}

impl SourceDBHandler {
    /// Connect to the source with a regular (non-replication) session.
    pub fn connect(dsn: &str) -> ReplicationResult<Self> {
        let conn = PgConnection::connect(dsn)?;
        let database = conn.db_name()?;
        debug!(database, "metadata connection established");
        Ok(Self { conn, database })
    }

    /// Name of the database this handler is connected to
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Run a query expected to return rows; rolls back and surfaces a query
    /// error on failure.
    fn fetch(&mut self, query: &str) -> ReplicationResult<PgQueryResult> {
        let result = self.conn.exec(query)?;
        if !result.is_ok() {
            // Leave the connection usable for the next query.
            let _ = self.conn.exec("ROLLBACK");
            return Err(ReplicationError::query(format!(
                "query failed with {:?}: {query}",
                result.status()
            )));
        }
        Ok(result)
    }

    fn fetch_single(&mut self, query: &str) -> ReplicationResult<String> {
        let result = self.fetch(query)?;
        if result.ntuples() < 1 {
            return Err(ReplicationError::query(format!(
                "query returned no rows: {query}"
            )));
        }
        result
            .getvalue(0, 0)
            .ok_or_else(|| ReplicationError::query(format!("query returned NULL: {query}")))
    }

    /// Tables published under `publication`, read within the exported
    /// snapshot so the list matches the slot's consistent point.
    pub fn publication_tables(
        &mut self,
        snapshot: &str,
        publication: &str,
    ) -> ReplicationResult<Vec<(String, String)>> {
        self.fetch("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ")?;
        let listed = (|| {
            self.fetch(&format!("SET TRANSACTION SNAPSHOT '{snapshot}'"))?;
            let result = self.fetch(&format!(
                "SELECT schemaname, tablename FROM pg_publication_tables WHERE pubname = '{publication}'"
            ))?;

            let mut tables = Vec::with_capacity(result.ntuples() as usize);
            for row in 0..result.ntuples() {
                let namespace = result.getvalue(row, 0).unwrap_or_default();
                let table = result.getvalue(row, 1).unwrap_or_default();
                tables.push((namespace, table));
            }
            Ok(tables)
        })();

        match listed {
            Ok(tables) => {
                self.fetch("COMMIT")?;
                Ok(tables)
            }
            Err(err) => {
                let _ = self.conn.exec("ROLLBACK");
                Err(err)
            }
        }
    }
}

impl SourceMetadata for SourceDBHandler {
    fn column_type_name(&mut self, type_id: Oid, atttypmod: i32) -> ReplicationResult<String> {
        self.fetch_single(&format!(
            "SELECT format_type({type_id}, {atttypmod}) AS data_type"
        ))
    }

    fn column_is_optional(
        &mut self,
        namespace: &str,
        table: &str,
        column: &str,
    ) -> ReplicationResult<bool> {
        let attnotnull = self.fetch_single(&format!(
            "SELECT attnotnull FROM pg_attribute \
             WHERE attrelid = '{namespace}.{table}'::regclass AND attname = '{column}'"
        ))?;
        // attnotnull says whether the column has a NOT NULL constraint;
        // optional is the negation.
        Ok(attnotnull != "t")
    }
}
