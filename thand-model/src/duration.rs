//! Implementation of workflow durations.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Represents an error parsing a duration.
#[derive(Debug, thiserror::Error)]
pub enum DurationError {
    /// The duration string is not a valid ISO-8601 duration.
    #[error("`{0}` is not a valid ISO-8601 duration")]
    Invalid(String),
    /// The duration uses calendar units.
    #[error("`{0}` uses calendar units (years or months), which are not supported")]
    CalendarUnits(String),
}

/// Represents a duration as it appears in a workflow document: either an
/// ISO-8601 string or the structural form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    /// An ISO-8601 duration string, e.g. `PT1H30M`.
    Iso(String),
    /// The structural form.
    Parts(DurationParts),
}

impl Default for DurationSpec {
    fn default() -> Self {
        Self::Parts(Default::default())
    }
}

impl DurationSpec {
    /// Converts the specification into a standard duration.
    pub fn to_duration(&self) -> Result<Duration, DurationError> {
        match self {
            Self::Iso(s) => parse_iso8601(s),
            Self::Parts(parts) => Ok(parts.to_duration()),
        }
    }
}

/// Represents the structural form of a duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationParts {
    /// The number of days.
    #[serde(default)]
    pub days: u64,
    /// The number of hours.
    #[serde(default)]
    pub hours: u64,
    /// The number of minutes.
    #[serde(default)]
    pub minutes: u64,
    /// The number of seconds.
    #[serde(default)]
    pub seconds: u64,
    /// The number of milliseconds.
    #[serde(default)]
    pub milliseconds: u64,
}

impl DurationParts {
    /// Converts the parts into a standard duration.
    pub fn to_duration(&self) -> Duration {
        Duration::from_millis(
            self.milliseconds
                + self.seconds * 1_000
                + self.minutes * 60_000
                + self.hours * 3_600_000
                + self.days * 86_400_000,
        )
    }
}

/// Parses an ISO-8601 duration of the form `PnWnDTnHnMnS`.
///
/// Calendar units (years and months) are rejected: their length depends on
/// the instant they are applied to, and scheduled revocation requires a
/// determinate duration.
pub fn parse_iso8601(s: &str) -> Result<Duration, DurationError> {
    let original = s;
    let s = s.trim();
    let rest = s
        .strip_prefix('P')
        .or_else(|| s.strip_prefix('p'))
        .ok_or_else(|| DurationError::Invalid(original.to_string()))?;

    if rest.is_empty() {
        return Err(DurationError::Invalid(original.to_string()));
    }

    let mut millis: u64 = 0;
    let mut in_time = false;
    let mut number = String::new();
    let mut seen_any = false;

    for c in rest.chars() {
        match c {
            'T' | 't' => {
                if in_time || !number.is_empty() {
                    return Err(DurationError::Invalid(original.to_string()));
                }
                in_time = true;
            }
            '0'..='9' | '.' => number.push(c),
            unit => {
                if number.is_empty() {
                    return Err(DurationError::Invalid(original.to_string()));
                }
                let value: f64 = number
                    .parse()
                    .map_err(|_| DurationError::Invalid(original.to_string()))?;
                number.clear();
                seen_any = true;

                let factor: u64 = match (unit.to_ascii_uppercase(), in_time) {
                    ('Y', false) => {
                        return Err(DurationError::CalendarUnits(original.to_string()));
                    }
                    ('M', false) => {
                        return Err(DurationError::CalendarUnits(original.to_string()));
                    }
                    ('W', false) => 7 * 86_400_000,
                    ('D', false) => 86_400_000,
                    ('H', true) => 3_600_000,
                    ('M', true) => 60_000,
                    ('S', true) => 1_000,
                    _ => return Err(DurationError::Invalid(original.to_string())),
                };

                millis += (value * factor as f64) as u64;
            }
        }
    }

    if !number.is_empty() || !seen_any {
        return Err(DurationError::Invalid(original.to_string()));
    }

    Ok(Duration::from_millis(millis))
}
