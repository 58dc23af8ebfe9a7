//! Timestamp parsing shared by every parser
//!
//! Bad timestamps never block ingestion: callers use [`parse_or_now`] and get
//! the current instant back when nothing matches.

use crate::events::{now, Timestamp};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use log::warn;
use serde_json::Value;

/// Unix values above this are read as milliseconds
const MILLIS_CUTOFF: f64 = 1e12;

/// Formats carrying an explicit offset
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%d/%b/%Y:%H:%M:%S %z",
];

/// Formats without an offset, read as UTC
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d/%b/%Y:%H:%M:%S",
    "%b %d %Y %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a timestamp string, returning `None` when no known form matches
///
/// Purely numeric strings are Unix time (milliseconds above 1e12). Everything
/// else goes through RFC 3339, RFC 2822, ISO-8601 variants, Apache
/// (`10/Oct/2024:13:55:36 +0000`) and syslog (`Oct 10 13:55:36`, current year).
pub fn parse_timestamp(input: &str) -> Option<Timestamp> {
    let text = input.trim();
    if text.is_empty() {
        return None;
    }

    if text.chars().all(|c| c.is_ascii_digit()) {
        return text.parse::<f64>().ok().and_then(from_unix);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt);
    }

    // Trailing Z is UTC; rewrite so the offset formats can take it
    let normalized = match text.strip_suffix('Z').or_else(|| text.strip_suffix('z')) {
        Some(stripped) => format!("{}+00:00", stripped),
        None => text.to_string(),
    };

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, format) {
            return Some(dt);
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }

    if let Some(dt) = parse_syslog(&normalized) {
        return Some(dt);
    }

    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive).fixed_offset())
}

/// Syslog timestamps carry no year; assume the current one
fn parse_syslog(text: &str) -> Option<Timestamp> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let with_year = format!("{} {}", Utc::now().year(), collapsed);
    NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive).fixed_offset())
}

/// Interpret a Unix value in seconds, or milliseconds above 1e12
pub fn from_unix(value: f64) -> Option<Timestamp> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value > MILLIS_CUTOFF {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis.round() as i64).map(|dt| dt.fixed_offset())
}

/// Parse a timestamp string, falling back to the current instant
pub fn parse_or_now(input: &str) -> Timestamp {
    parse_timestamp(input).unwrap_or_else(|| {
        warn!("Failed to parse timestamp '{}', using current time", input);
        now()
    })
}

/// Parse a JSON timestamp field (string or Unix number), falling back to now
pub fn value_or_now(value: Option<&Value>) -> Timestamp {
    match value {
        Some(Value::String(s)) => parse_or_now(s),
        Some(Value::Number(n)) => n.as_f64().and_then(from_unix).unwrap_or_else(|| {
            warn!("Failed to parse numeric timestamp {}, using current time", n);
            now()
        }),
        Some(other) => {
            warn!("Unsupported timestamp value {}, using current time", other);
            now()
        }
        None => now(),
    }
}
