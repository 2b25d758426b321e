//! PostgreSQL logical replication protocol handling
//!
//! Everything needed to take bytes off the replication socket and turn them
//! into structured messages: the payload cursor, the pgoutput v1 decoders,
//! the outer COPY-BOTH wire frames and the timestamp epoch conversions.

pub mod buffer;
pub mod messages;
pub mod timestamp;
pub mod wire;

// Re-export for convenience
pub use buffer::{BufferReader, BufferWriter};
pub use messages::{
    Cell, OldTupleKind, Oid, PgoutputMessage, RelationBody, RelationColumn, TupleData, Xid,
};
pub use wire::{KeepaliveBody, XLogData};

/// WAL location pointer, a 64-bit byte position in the server's WAL
pub type Lsn = u64;

/// Render an LSN in the `X/X` form used by PostgreSQL
pub fn format_lsn(lsn: Lsn) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Parse an LSN from the `X/X` form, also accepting a plain decimal
pub fn parse_lsn(text: &str) -> Option<Lsn> {
    match text.split_once('/') {
        Some((hi, lo)) => {
            let hi = u64::from_str_radix(hi, 16).ok()?;
            let lo = u64::from_str_radix(lo, 16).ok()?;
            (hi <= u32::MAX as u64 && lo <= u32::MAX as u64).then_some((hi << 32) | lo)
        }
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_round_trips_through_text_form() {
        let lsn = (0x16 << 32) | 0xB374_D848;
        assert_eq!(format_lsn(lsn), "16/B374D848");
        assert_eq!(parse_lsn("16/B374D848"), Some(lsn));
    }

    #[test]
    fn parse_lsn_accepts_zero() {
        assert_eq!(parse_lsn("0"), Some(0));
        assert_eq!(parse_lsn("0/0"), Some(0));
    }

    #[test]
    fn parse_lsn_rejects_garbage() {
        assert_eq!(parse_lsn("one/two"), None);
        assert_eq!(parse_lsn("1/2/3"), None);
        assert_eq!(parse_lsn("100000000/0"), None);
    }
}
