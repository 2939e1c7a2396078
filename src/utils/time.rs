use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// PostgreSQL epoch (2000-01-01) offset applied to standby feedback
/// timestamps, exactly as the replication peer expects them.
const POSTGRES_EPOCH_OFFSET_MICROS: u64 = 946_684_800_000_000;

pub fn format_unix_seconds(second: u64) -> String {
    let d = UNIX_EPOCH + Duration::from_secs(second);
    let datetime = DateTime::<Utc>::from(d);
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Timestamp for PostgreSQL standby status updates.
pub fn postgres_feedback_micros() -> u64 {
    let unix_seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix_seconds * 1_000_000 + POSTGRES_EPOCH_OFFSET_MICROS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_unix_seconds() {
        assert_eq!(format_unix_seconds(0), "1970-01-01 00:00:00");
        assert_eq!(format_unix_seconds(1_000_000_000), "2001-09-09 01:46:40");
    }

    #[test]
    fn test_feedback_micros_offset() {
        let micros = postgres_feedback_micros();
        assert!(micros > POSTGRES_EPOCH_OFFSET_MICROS);
    }
}
