//! Fixed 30 second sampling step and canonical platform timestamps.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, TimeZone, Timelike, Utc};
use thiserror::Error;

pub const STEP_SECONDS: i64 = 30;

/// Platform wire format: UTC, millisecond precision, literal `Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("range end {end} is before start {start}")]
    ReversedRange { start: String, end: String },
    #[error("range {start}..={end} is not a whole number of {step_seconds}s steps")]
    MisalignedRange {
        start: String,
        end: String,
        step_seconds: i64,
    },
}

pub fn step() -> ChronoDuration {
    ChronoDuration::seconds(STEP_SECONDS)
}

pub fn steps(count: i64) -> ChronoDuration {
    ChronoDuration::seconds(STEP_SECONDS.saturating_mul(count))
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Accepts the canonical format and any RFC 3339 timestamp; the result is
/// truncated to millisecond precision.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ClockError> {
    let trimmed = raw.trim();
    let parsed = NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|_| ClockError::InvalidTimestamp(raw.to_string()))?;
    Ok(canonicalize(parsed))
}

pub fn canonicalize(ts: DateTime<Utc>) -> DateTime<Utc> {
    let millis = ts.timestamp_millis();
    Utc.timestamp_millis_opt(millis).single().unwrap_or(ts)
}

pub fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

pub fn minus_days(ts: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    ts - ChronoDuration::days(i64::from(days))
}

/// The platform drops the sample stamped exactly at a month boundary when it is
/// used as a range end, so such instants are pushed one step forward.
pub fn correct_month_boundary(ts: DateTime<Utc>) -> DateTime<Utc> {
    if ts.day() == 1 && ts.hour() == 0 && ts.minute() == 0 && ts.second() == 0 {
        ts + step()
    } else {
        ts
    }
}

/// Number of samples in the inclusive range `[start, end]`.
pub fn sample_count(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize, ClockError> {
    if end < start {
        return Err(ClockError::ReversedRange {
            start: format_timestamp(start),
            end: format_timestamp(end),
        });
    }
    let span_ms = (end - start).num_milliseconds();
    let step_ms = STEP_SECONDS * 1_000;
    if span_ms % step_ms != 0 {
        return Err(ClockError::MisalignedRange {
            start: format_timestamp(start),
            end: format_timestamp(end),
            step_seconds: STEP_SECONDS,
        });
    }
    Ok((span_ms / step_ms) as usize + 1)
}

pub fn time_grid(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        out.push(cursor);
        cursor += step();
    }
    out
}
