//! pgoutput protocol version 1 message decoders
//!
//! Every logical replication payload starts with a single-byte tag selecting
//! the message kind. [`PgoutputMessage::decode`] dispatches on that tag and
//! consumes the body with a [`BufferReader`].
//!
//! ## Message flow
//!
//! A transaction arrives as:
//! 1. `Begin` - transaction starts
//! 2. `Relation` - table schema information (before the first change of each
//!    table in the session)
//! 3. `Insert`/`Update`/`Delete`/`Truncate` - data changes
//! 4. `Commit` - transaction completes
//!
//! Tags belonging to later protocol versions (streamed transactions,
//! two-phase commit, logical decoding messages) decode to an `unsupported`
//! error; anything else is `malformed`.

use serde::Serialize;

use super::Lsn;
use super::buffer::BufferReader;
use crate::core::errors::DecodeError;

/// Object ID of a relation or type
pub type Oid = u32;
/// Transaction ID
pub type Xid = u32;

/// One column slot of a decoded tuple.
///
/// The wire tags `n`, `u` and `t` map onto the three variants. An unchanged
/// TOAST value means the column was not modified and its (large, out-of-line)
/// value was not transmitted; it must not be confused with NULL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Cell {
    Null,
    UnchangedToast,
    Text(String),
}

/// A decoded row: one [`Cell`] per column, in relation column order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TupleData {
    pub cells: Vec<Cell>,
}

impl TupleData {
    pub fn column_count(&self) -> usize {
        self.cells.len()
    }
}

/// Which columns an old-row image carries, per the wire tag.
///
/// `K` (key) is sent under REPLICA IDENTITY DEFAULT and carries only the
/// replica identity columns; `O` (old) is sent under REPLICA IDENTITY FULL
/// and carries the whole row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OldTupleKind {
    Key,
    Full,
}

/// One column of a Relation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationColumn {
    pub part_of_pkey: bool,
    pub name: String,
    pub type_id: Oid,
    pub atttypmod: i32,
}

/// Schema announcement for a relation referenced by subsequent row messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationBody {
    pub relation_id: Oid,
    pub namespace: String,
    pub relation_name: String,
    pub replica_identity: char,
    pub columns: Vec<RelationColumn>,
}

/// A decoded pgoutput v1 message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PgoutputMessage {
    /// Transaction start; all messages up to the next Commit belong to it
    Begin {
        final_lsn: Lsn,
        /// Commit time in microseconds since 2000-01-01 00:00:00 UTC
        commit_ts_micros: i64,
        xid: Xid,
    },

    /// Transaction end; the changes are now durable on the source
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_ts_micros: i64,
    },

    /// Replication origin of the transaction; decoded and then ignored
    Origin { commit_lsn: Lsn, name: String },

    /// Table schema information
    Relation(RelationBody),

    /// Row insertion
    Insert { relation_id: Oid, new_tuple: TupleData },

    /// Row modification; the old image is present only when the replica
    /// identity produces one
    Update {
        relation_id: Oid,
        old_kind: Option<OldTupleKind>,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },

    /// Row deletion; carries the old image selected by the replica identity
    Delete {
        relation_id: Oid,
        old_kind: OldTupleKind,
        old_tuple: TupleData,
    },

    /// All rows of one or more tables deleted at once
    Truncate {
        /// bit 0 = CASCADE, bit 1 = RESTART IDENTITY
        options: i8,
        relation_ids: Vec<Oid>,
    },
}

impl PgoutputMessage {
    /// Decode a logical replication payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = BufferReader::new(payload);
        let tag = reader.read_u8().map_err(|_| {
            DecodeError::malformed(0, "empty replication payload")
        })?;

        let message = match tag {
            b'B' => Self::decode_begin(&mut reader)?,
            b'C' => Self::decode_commit(&mut reader)?,
            b'O' => Self::decode_origin(&mut reader)?,
            b'R' => Self::decode_relation(&mut reader)?,
            b'I' => Self::decode_insert(&mut reader)?,
            b'U' => Self::decode_update(&mut reader)?,
            b'D' => Self::decode_delete(&mut reader)?,
            b'T' => Self::decode_truncate(&mut reader)?,
            // Streamed-transaction, two-phase, logical-decoding-message and
            // Type frames; all outside proto_version 1 as consumed here
            b'S' | b'E' | b'c' | b'A' | b'M' | b'Y' | b'b' | b'P' | b'K' | b'r' => {
                return Err(DecodeError::unsupported(
                    0,
                    format!("message tag '{}' requires a newer protocol version", tag as char),
                ));
            }
            other => {
                return Err(DecodeError::malformed(
                    0,
                    format!("unknown message tag 0x{other:02x}"),
                ));
            }
        };

        if reader.remaining() > 0 {
            return Err(DecodeError::malformed(
                reader.position(),
                format!("{} trailing bytes after message body", reader.remaining()),
            ));
        }

        Ok(message)
    }

    fn decode_begin(reader: &mut BufferReader<'_>) -> Result<Self, DecodeError> {
        Ok(PgoutputMessage::Begin {
            final_lsn: reader.read_u64()?,
            commit_ts_micros: reader.read_i64()?,
            xid: reader.read_u32()?,
        })
    }

    fn decode_commit(reader: &mut BufferReader<'_>) -> Result<Self, DecodeError> {
        Ok(PgoutputMessage::Commit {
            flags: reader.read_u8()?,
            commit_lsn: reader.read_u64()?,
            end_lsn: reader.read_u64()?,
            commit_ts_micros: reader.read_i64()?,
        })
    }

    fn decode_origin(reader: &mut BufferReader<'_>) -> Result<Self, DecodeError> {
        Ok(PgoutputMessage::Origin {
            commit_lsn: reader.read_u64()?,
            name: reader.read_cstr()?,
        })
    }

    fn decode_relation(reader: &mut BufferReader<'_>) -> Result<Self, DecodeError> {
        let relation_id = reader.read_u32()?;
        let namespace = reader.read_cstr()?;
        let relation_name = reader.read_cstr()?;
        let replica_identity = reader.read_u8()? as char;
        let column_count = reader.read_i16()?;
        if column_count < 0 {
            return Err(DecodeError::malformed(
                reader.position(),
                format!("negative column count {column_count}"),
            ));
        }

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let flags = reader.read_i8()?;
            columns.push(RelationColumn {
                part_of_pkey: flags & 1 == 1,
                name: reader.read_cstr()?,
                type_id: reader.read_u32()?,
                atttypmod: reader.read_i32()?,
            });
        }

        Ok(PgoutputMessage::Relation(RelationBody {
            relation_id,
            namespace,
            relation_name,
            replica_identity,
            columns,
        }))
    }

    fn decode_insert(reader: &mut BufferReader<'_>) -> Result<Self, DecodeError> {
        let relation_id = reader.read_u32()?;
        expect_tag(reader, b'N')?;
        Ok(PgoutputMessage::Insert {
            relation_id,
            new_tuple: decode_tuple_data(reader)?,
        })
    }

    fn decode_update(reader: &mut BufferReader<'_>) -> Result<Self, DecodeError> {
        let relation_id = reader.read_u32()?;
        let offset = reader.position();
        let marker = reader.read_u8()?;

        let (old_kind, old_tuple) = match marker {
            b'K' => (Some(OldTupleKind::Key), Some(decode_tuple_data(reader)?)),
            b'O' => (Some(OldTupleKind::Full), Some(decode_tuple_data(reader)?)),
            b'N' => (None, None),
            other => {
                return Err(DecodeError::malformed(
                    offset,
                    format!("invalid update marker '{}'", other as char),
                ));
            }
        };

        if old_tuple.is_some() {
            expect_tag(reader, b'N')?;
        }

        Ok(PgoutputMessage::Update {
            relation_id,
            old_kind,
            old_tuple,
            new_tuple: decode_tuple_data(reader)?,
        })
    }

    fn decode_delete(reader: &mut BufferReader<'_>) -> Result<Self, DecodeError> {
        let relation_id = reader.read_u32()?;
        let offset = reader.position();
        let old_kind = match reader.read_u8()? {
            b'K' => OldTupleKind::Key,
            b'O' => OldTupleKind::Full,
            other => {
                return Err(DecodeError::malformed(
                    offset,
                    format!("invalid delete marker '{}'", other as char),
                ));
            }
        };

        Ok(PgoutputMessage::Delete {
            relation_id,
            old_kind,
            old_tuple: decode_tuple_data(reader)?,
        })
    }

    fn decode_truncate(reader: &mut BufferReader<'_>) -> Result<Self, DecodeError> {
        let relation_count = reader.read_i32()?;
        if relation_count < 0 {
            return Err(DecodeError::malformed(
                reader.position(),
                format!("negative relation count {relation_count}"),
            ));
        }
        let options = reader.read_i8()?;
        // Capacity from untrusted input is clamped; pushes still fail cleanly
        // on truncation.
        let mut relation_ids = Vec::with_capacity((relation_count as usize).min(1024));
        for _ in 0..relation_count {
            relation_ids.push(reader.read_u32()?);
        }

        Ok(PgoutputMessage::Truncate {
            options,
            relation_ids,
        })
    }
}

fn expect_tag(reader: &mut BufferReader<'_>, expected: u8) -> Result<(), DecodeError> {
    let offset = reader.position();
    let tag = reader.read_u8()?;
    if tag != expected {
        return Err(DecodeError::malformed(
            offset,
            format!(
                "expected '{}' marker, found '{}'",
                expected as char, tag as char
            ),
        ));
    }
    Ok(())
}

fn decode_tuple_data(reader: &mut BufferReader<'_>) -> Result<TupleData, DecodeError> {
    let column_count = reader.read_i16()?;
    if column_count < 0 {
        return Err(DecodeError::malformed(
            reader.position(),
            format!("negative tuple column count {column_count}"),
        ));
    }

    let mut cells = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let offset = reader.position();
        let cell = match reader.read_u8()? {
            b'n' => Cell::Null,
            b'u' => Cell::UnchangedToast,
            b't' => {
                let length = reader.read_i32()?;
                if length < 0 {
                    return Err(DecodeError::malformed(
                        offset,
                        format!("negative cell length {length}"),
                    ));
                }
                let bytes = reader.read_bytes(length as usize)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError::malformed(offset, "cell is not valid UTF-8"))?;
                Cell::Text(text.to_owned())
            }
            other => {
                return Err(DecodeError::malformed(
                    offset,
                    format!("unknown cell tag '{}'", other as char),
                ));
            }
        };
        cells.push(cell);
    }

    Ok(TupleData { cells })
}
