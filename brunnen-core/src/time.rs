//! Timestamp parsing shared by query parameters and upload payloads
//!
//! Devices send ISO-8601 timestamps, sometimes without an offset. Those are
//! taken as UTC.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("invalid timestamp '{0}': expected ISO-8601 (e.g. 2024-09-05T00:05:23)")]
    Malformed(String),

    #[error("timestamp '{0}' is out of range (1970-01-01 up to 2262-04-11)")]
    OutOfRange(String),
}

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse an ISO-8601 timestamp, with or without offset
///
/// Only instants the database can store are accepted: unsigned nanoseconds
/// since the Unix epoch that fit in an `i64`.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, TimeError> {
    let ts = parse_any(input.trim()).ok_or_else(|| TimeError::Malformed(input.to_string()))?;
    if epoch_nanos(&ts).is_none() {
        return Err(TimeError::OutOfRange(input.to_string()));
    }
    Ok(ts)
}

fn parse_any(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Nanoseconds since the Unix epoch, if `ts` is not before it and fits in an `i64`
pub fn epoch_nanos(ts: &DateTime<Utc>) -> Option<u128> {
    ts.timestamp_nanos_opt()
        .and_then(|nanos| u128::try_from(nanos).ok())
}

/// Format as RFC 3339 with second precision and a `Z` suffix
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Format as RFC 3339 keeping the sub-second part
pub fn format_precise(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Current time
///
/// Settings are stamped with it and devices see the values written after
/// their previous sync, so the sub-second part is kept.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_naive_and_offset() {
        let expected = Utc.with_ymd_and_hms(2024, 9, 5, 0, 5, 23).unwrap();
        assert_eq!(parse_timestamp("2024-09-05T00:05:23").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-09-05 00:05:23").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-09-05T00:05:23Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-09-05T02:05:23+02:00").unwrap(), expected);
    }

    #[test]
    fn test_parse_date_only() {
        let expected = Utc.with_ymd_and_hms(2024, 9, 5, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-09-05").unwrap(), expected);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert_eq!(err, TimeError::Malformed("yesterday".to_string()));
    }

    #[test]
    fn test_parse_rejects_unstorable_instants() {
        assert_eq!(
            parse_timestamp("1500-01-01T00:00:00").unwrap_err(),
            TimeError::OutOfRange("1500-01-01T00:00:00".to_string())
        );
        assert!(matches!(
            parse_timestamp("1969-12-31T23:59:59Z"),
            Err(TimeError::OutOfRange(_))
        ));
        assert!(matches!(
            parse_timestamp("2263-01-01"),
            Err(TimeError::OutOfRange(_))
        ));
        assert!(parse_timestamp("1970-01-01T00:00:00").is_ok());
        assert!(parse_timestamp("2262-04-11T00:00:00").is_ok());
    }

    #[test]
    fn test_epoch_nanos() {
        let ts = Utc.with_ymd_and_hms(2024, 9, 5, 0, 5, 23).unwrap();
        assert_eq!(epoch_nanos(&ts), Some(1_725_494_723_000_000_000));
        let old = Utc.with_ymd_and_hms(1500, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(epoch_nanos(&old), None);
    }

    #[test]
    fn test_format() {
        let ts = Utc.with_ymd_and_hms(2024, 9, 5, 0, 5, 23).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-09-05T00:05:23Z");

        let precise = ts + chrono::Duration::milliseconds(250);
        assert_eq!(format_timestamp(&precise), "2024-09-05T00:05:23Z");
        assert_eq!(format_precise(&precise), "2024-09-05T00:05:23.250Z");
    }
}
