//! Conversion of textual cells into sample values.
//!
//! Every driver value reaches the scrape engine as text. A cell is first read
//! as a plain float; failing that it may be a signed day/time interval such as
//! `+01 02:03:04`, which is converted to a number of seconds.

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

const SECONDS_PER_DAY: f64 = 86_400.0;

lazy_static! {
    static ref INTERVAL_PATTERN: Regex =
        Regex::new(r"^([+-])([0-9]+)[ \t\n\f\r]([0-9]{2}):([0-9]{2}):([0-9]{2})$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("cannot convert '{0}' to a float")]
    Unparseable(String),

    #[error("interval '{0}' is out of range")]
    IntervalRange(String),
}

/// Converts a cell into a float, falling back to the interval grammar.
pub fn coerce(text: &str) -> Result<f64, CoercionError> {
    let trimmed = text.trim();
    if let Ok(value) = trimmed.parse::<f64>() {
        return Ok(value);
    }
    interval_to_seconds(trimmed)
}

/// Parses `[+-]D HH:MM:SS` into signed seconds.
pub fn interval_to_seconds(text: &str) -> Result<f64, CoercionError> {
    let caps = INTERVAL_PATTERN
        .captures(text)
        .ok_or_else(|| CoercionError::Unparseable(text.to_string()))?;

    // Digit-only captures: days may exceed u64, the rest are two digits wide.
    let days: f64 = caps[2]
        .parse()
        .map_err(|_| CoercionError::Unparseable(text.to_string()))?;
    let field = |idx: usize| caps[idx].parse::<u32>().unwrap_or(u32::MAX);
    let (hours, minutes, seconds) = (field(3), field(4), field(5));

    if hours > 23 || minutes > 59 || seconds > 59 {
        return Err(CoercionError::IntervalRange(text.to_string()));
    }

    let total = days * SECONDS_PER_DAY
        + f64::from(hours) * 3600.0
        + f64::from(minutes) * 60.0
        + f64::from(seconds);

    Ok(if &caps[1] == "-" { -total } else { total })
}

/// Parses a non-negative integer cell (histogram counts).
pub fn coerce_count(text: &str) -> Option<u64> {
    text.trim().parse::<u64>().ok()
}
