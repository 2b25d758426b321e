//! Error types for the CDC consumer
//!
//! Structured error handling using thiserror. Decode failures carry their own
//! kind and byte offset so a bad frame can be pinpointed in the WAL stream.

use thiserror::Error;

/// Result type alias for convenience
pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

/// Classification of a decode failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    /// The payload ended before the field being read
    Truncated,
    /// The bytes do not form a valid pgoutput v1 message
    Malformed,
    /// A message kind outside protocol version 1 (streaming, two-phase, ...)
    Unsupported,
    /// A NOT NULL column was absent from the decoded row
    MissingRequiredColumn,
}

impl std::fmt::Display for DecodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeKind::Truncated => write!(f, "truncated"),
            DecodeKind::Malformed => write!(f, "malformed"),
            DecodeKind::Unsupported => write!(f, "unsupported"),
            DecodeKind::MissingRequiredColumn => write!(f, "missing required column"),
        }
    }
}

/// Failure while decoding a replication payload
#[derive(Error, Debug, Clone)]
#[error("{kind} message at offset {offset}: {detail}")]
pub struct DecodeError {
    pub kind: DecodeKind,
    pub offset: usize,
    pub detail: String,
}

impl DecodeError {
    pub fn truncated<S: Into<String>>(offset: usize, detail: S) -> Self {
        Self {
            kind: DecodeKind::Truncated,
            offset,
            detail: detail.into(),
        }
    }

    pub fn malformed<S: Into<String>>(offset: usize, detail: S) -> Self {
        Self {
            kind: DecodeKind::Malformed,
            offset,
            detail: detail.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(offset: usize, detail: S) -> Self {
        Self {
            kind: DecodeKind::Unsupported,
            offset,
            detail: detail.into(),
        }
    }

    pub fn missing_required_column<S: Into<String>>(column: S) -> Self {
        Self {
            kind: DecodeKind::MissingRequiredColumn,
            offset: 0,
            detail: column.into(),
        }
    }
}

/// Main error type for the CDC consumer
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// START_REPLICATION was refused because the slot does not exist.
    /// Recovered locally by creating the slot and retrying.
    #[error("replication slot '{slot}' does not exist")]
    SlotMissing { slot: String },

    /// A replication payload could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A row change referenced a relation never announced by the server
    #[error("relation {relation_id} in database '{database}' is not in the catalog")]
    CatalogMiss { database: String, relation_id: u32 },

    /// A metadata resolution query on the source database failed
    #[error("metadata query failed: {message}")]
    Query { message: String },

    /// The underlying replication connection failed
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Configuration related errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Graceful termination requested by the consumer; swallowed by the
    /// session so the stream ends without an error.
    #[error("stream stopped by consumer")]
    Stop,

    /// String conversion errors
    #[error("string conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    /// C string conversion errors
    #[error("c string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),
}

impl ReplicationError {
    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a metadata query error
    pub fn query<S: Into<String>>(message: S) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// True for the distinguished stop signal
    pub fn is_stop(&self) -> bool {
        matches!(self, ReplicationError::Stop)
    }
}
