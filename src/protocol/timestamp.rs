//! Timestamp conversions between PostgreSQL and Unix epochs
//!
//! Replication timestamps are microseconds since 2000-01-01 00:00:00 UTC.
//! Conversions are needed in both directions: decoding commit times from the
//! stream and stamping outgoing standby status updates.

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds from the Unix epoch (1970) to the PostgreSQL epoch (2000)
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Convert a replication-stream timestamp to a wall-clock instant.
///
/// Returns `None` for values outside chrono's representable range, which a
/// well-formed stream never produces.
pub fn pg_micros_to_utc(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Current time in microseconds since the PostgreSQL epoch, for feedback
/// frames sent to the server.
pub fn now_pg_micros() -> i64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before the Unix epoch");
    let unix_micros = since_unix.as_secs() as i64 * 1_000_000 + since_unix.subsec_micros() as i64;
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_the_pg_epoch() {
        let ts = pg_micros_to_utc(0).unwrap();
        assert_eq!(ts.to_rfc3339(), "2000-01-01T00:00:00+00:00");
    }

    #[test]
    fn converts_micros_with_subsecond_part() {
        let ts = pg_micros_to_utc(1_500_000).unwrap();
        assert_eq!(ts.timestamp(), PG_EPOCH_OFFSET_SECS + 1);
        assert_eq!(ts.timestamp_subsec_micros(), 500_000);
    }

    #[test]
    fn negative_micros_land_before_2000() {
        let ts = pg_micros_to_utc(-1_000_000).unwrap();
        assert_eq!(ts.to_rfc3339(), "1999-12-31T23:59:59+00:00");
    }

    #[test]
    fn now_is_after_the_pg_epoch() {
        assert!(now_pg_micros() > 0);
    }
}
