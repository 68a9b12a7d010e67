use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

/// Injectable wall clock returning Unix milliseconds.
pub type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Clock backed by the system time.
pub fn system_clock() -> ClockFn {
    Arc::new(current_unix_timestamp_ms)
}

fn datetime_from_unix_ms(unix_ms: u64) -> DateTime<Utc> {
    let millis = i64::try_from(unix_ms).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Formats `unix_ms` as an RFC 3339 / ISO-8601 UTC string with millisecond precision.
pub fn format_iso8601_ms(unix_ms: u64) -> String {
    datetime_from_unix_ms(unix_ms).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an ISO-8601 timestamp back into Unix milliseconds.
pub fn parse_iso8601_ms(raw: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim()).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}

/// UTC calendar date containing `unix_ms`.
pub fn utc_date_for(unix_ms: u64) -> NaiveDate {
    datetime_from_unix_ms(unix_ms).date_naive()
}

/// Unix milliseconds at UTC midnight starting `date`.
pub fn utc_midnight_ms(date: NaiveDate) -> u64 {
    date.and_hms_opt(0, 0, 0)
        .map(|value| value.and_utc().timestamp_millis())
        .and_then(|value| u64::try_from(value).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{format_iso8601_ms, parse_iso8601_ms, utc_date_for, utc_midnight_ms};

    #[test]
    fn unit_iso8601_formatting_is_utc_with_millis() {
        assert_eq!(format_iso8601_ms(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(
            format_iso8601_ms(1_700_000_000_123),
            "2023-11-14T22:13:20.123Z"
        );
    }

    #[test]
    fn unit_parse_iso8601_accepts_offsets_and_rejects_garbage() {
        assert_eq!(
            parse_iso8601_ms("2023-11-14T22:13:20.123Z"),
            Some(1_700_000_000_123)
        );
        assert_eq!(
            parse_iso8601_ms("2023-11-14T23:13:20.123+01:00"),
            Some(1_700_000_000_123)
        );
        assert_eq!(parse_iso8601_ms("yesterday"), None);
    }

    #[test]
    fn unit_utc_date_and_midnight_agree() {
        let date = utc_date_for(1_700_000_000_123);
        assert_eq!(date.to_string(), "2023-11-14");
        let midnight = utc_midnight_ms(date);
        assert!(midnight <= 1_700_000_000_123);
        assert_eq!(utc_date_for(midnight), date);
    }
}
