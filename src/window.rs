use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use crate::error::InputError;

/// Hour-aligned trailing interval over which issuances are counted.
///
/// Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QuotaWindow {
    /// `start` is `now - lookback` truncated to its hour; `end` is `now`
    /// truncated to its hour plus one hour. `None` if either bound falls
    /// outside the representable range.
    pub fn compute(now: DateTime<Utc>, lookback: Duration) -> Option<Self> {
        let start = truncate_to_hour(now.checked_sub_signed(lookback)?);
        let end = truncate_to_hour(now).checked_add_signed(Duration::hours(1))?;
        Some(Self { start, end })
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

pub fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    // duration_trunc only fails for timestamps outside the nanosecond range
    t.duration_trunc(Duration::hours(1)).unwrap_or_else(|_| {
        let secs = t.timestamp();
        DateTime::from_timestamp(secs - secs.rem_euclid(3_600), 0).unwrap_or(t)
    })
}

/// Parse an RFC 3339 instant used to freeze the evaluation clock.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, InputError> {
    DateTime::parse_from_rfc3339(input.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| InputError::MalformedTimestamp(input.to_string()))
}
