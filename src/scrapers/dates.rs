//! Lenient timestamp parsing for feeds and page metadata.
//!
//! Feeds mix ISO-8601 and RFC-2822 dates freely, and page metadata adds
//! naive and date-only forms. Anything unparsable yields `None`.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Parse an ISO-8601 timestamp. Naive values are taken as UTC.
pub fn parse_iso8601(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::<FixedOffset>::parse_from_str(value, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse an RFC-2822 mailbox date (`Sun, 01 Feb 2026 01:00:00 GMT`).
pub fn parse_rfc2822(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// ISO-8601 first, then RFC-2822.
pub fn parse_feed_datetime(value: &str) -> Option<DateTime<Utc>> {
    parse_iso8601(value).or_else(|| parse_rfc2822(value))
}

/// Page-metadata variant: a trailing `Z` is rewritten to `+00:00` and
/// retried when the plain parse fails.
pub fn parse_metadata_datetime(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    parse_feed_datetime(trimmed).or_else(|| {
        trimmed
            .strip_suffix('Z')
            .and_then(|rest| parse_feed_datetime(&format!("{rest}+00:00")))
    })
}
