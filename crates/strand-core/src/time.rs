//! Wall-clock helpers
//!
//! Timestamps in checkpoints and audit records are Unix milliseconds.

use time::OffsetDateTime;

/// Current time as Unix milliseconds
pub fn unix_millis() -> u64 {
    u64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(0)
}

/// Calendar date (`YYYY-MM-DD`, UTC) of a Unix-millisecond timestamp
pub fn utc_date(millis: u64) -> String {
    let nanos = i128::from(millis) * 1_000_000;
    match OffsetDateTime::from_unix_timestamp_nanos(nanos) {
        Ok(at) => format!("{:04}-{:02}-{:02}", at.year(), u8::from(at.month()), at.day()),
        Err(_) => "1970-01-01".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_calendar_date() {
        // 2024-02-29T12:00:00Z
        assert_eq!(utc_date(1_709_208_000_000), "2024-02-29");
        assert_eq!(utc_date(0), "1970-01-01");
    }

    #[test]
    fn clock_is_after_epoch() {
        assert!(unix_millis() > 1_600_000_000_000);
    }
}
