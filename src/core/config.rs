//! Configuration for the replication session
//!
//! All settings funnel through [`ReplicationConfig::new`] which validates the
//! fields against PostgreSQL naming rules before a connection is attempted.

use super::{ReplicationError, ReplicationResult};
use crate::protocol::{Lsn, parse_lsn};

/// Validated configuration for a replication session
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Source database connection string, passed through to libpq
    pub dsn: String,
    /// Name of an existing publication on the source
    pub publication_name: String,
    /// Replication slot; created on first use if missing
    pub slot_name: String,
    /// LSN to resume from; 0 means the slot's confirmed position
    pub start_lsn: Lsn,
    /// How often an unchanged standby status is re-sent to the server
    pub feedback_interval_secs: u64,
}

impl ReplicationConfig {
    /// Validate the raw settings and build a config.
    ///
    /// `start_lsn` accepts either the PostgreSQL `X/X` form or a plain
    /// decimal (usually `0`).
    pub fn new(
        dsn: String,
        publication_name: String,
        slot_name: String,
        start_lsn: &str,
    ) -> ReplicationResult<Self> {
        if dsn.trim().is_empty() {
            return Err(ReplicationError::config("dsn cannot be empty"));
        }

        if publication_name.trim().is_empty() {
            return Err(ReplicationError::config("publication name cannot be empty"));
        }

        if slot_name.trim().is_empty() {
            return Err(ReplicationError::config("slot name cannot be empty"));
        }

        if !slot_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ReplicationError::config(
                "slot name can only contain alphanumeric characters and underscores",
            ));
        }

        if slot_name.len() > 63 {
            // PostgreSQL identifier length limit
            return Err(ReplicationError::config(
                "slot name cannot be longer than 63 characters",
            ));
        }

        let start_lsn = parse_lsn(start_lsn)
            .ok_or_else(|| ReplicationError::config(format!("invalid start LSN: '{start_lsn}'")))?;

        Ok(Self {
            dsn,
            publication_name,
            slot_name,
            start_lsn,
            feedback_interval_secs: 1,
        })
    }
}
