//! # Duration Parsing
//!
//! Parses Kubernetes-style duration strings used by the controller configuration.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

static DURATION_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?P<number>\d+)(?P<unit>ms|[smhd])$").ok());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("duration string cannot be empty")]
    Empty,
    #[error("invalid duration format '{0}', expected <number><unit> (e.g. '30s', '20m', '7d')")]
    InvalidFormat(String),
    #[error("invalid duration number in '{0}'")]
    InvalidNumber(String),
}

/// Parse Kubernetes duration string into `std::time::Duration`
///
/// Supports formats: "500ms", "30s", "1m", "5m", "1h", "7d". A zero
/// duration is accepted so timeouts and budgets can be disabled in tests.
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration, DurationParseError> {
    let trimmed = duration_str.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let lower = trimmed.to_lowercase();
    let captures = DURATION_REGEX
        .as_ref()
        .and_then(|re| re.captures(&lower))
        .ok_or_else(|| DurationParseError::InvalidFormat(trimmed.to_string()))?;

    let number: u64 = captures
        .name("number")
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| DurationParseError::InvalidNumber(trimmed.to_string()))?;

    let duration = match captures.name("unit").map(|m| m.as_str()) {
        Some("ms") => Duration::from_millis(number),
        Some("s") => Duration::from_secs(number),
        Some("m") => Duration::from_secs(number.saturating_mul(60)),
        Some("h") => Duration::from_secs(number.saturating_mul(3600)),
        Some("d") => Duration::from_secs(number.saturating_mul(86_400)),
        _ => return Err(DurationParseError::InvalidFormat(trimmed.to_string())),
    };

    Ok(duration)
}
