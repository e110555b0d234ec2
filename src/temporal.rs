//! # Temporal Module
//!
//! Timestamp handling against the globally configured format string. All
//! comparisons inside the engine happen on parsed values; the formatted
//! strings are what gets persisted.

use chrono::NaiveDateTime;

use crate::error::{EngineError, Result};

/// Parse a timestamp string with the configured format.
pub fn parse_timestamp(value: &str, format: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, format).map_err(|_| EngineError::TimeParse {
        value: value.to_string(),
        format: format.to_string(),
    })
}

/// Parse a timestamp, returning `None` when the value is absent instead of
/// failing. A present but malformed value is still an error.
pub fn parse_optional(value: Option<&str>, format: &str) -> Result<Option<NaiveDateTime>> {
    match value {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => parse_timestamp(v, format).map(Some),
    }
}

/// Format a timestamp with the configured format.
pub fn format_timestamp(value: NaiveDateTime, format: &str) -> String {
    value.format(format).to_string()
}

/// Age of `then` relative to `now` in whole days.
///
/// A delta that is minutes into the next day still counts as the same day
/// total, which is what makes the expiration boundary day-granular.
pub fn age_in_days(now: NaiveDateTime, then: NaiveDateTime) -> i64 {
    (now - then).num_days()
}
