//! Recurring schedule parser.
//! Supports: "hourly", "daily", "every N minutes|hours|days"
//! (singular units accepted, case-insensitive).
//!
//! Anything unrecognized falls back to hourly with a warning instead of
//! failing, so a typo in a job definition never blocks registration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const MINUTE_MS: u64 = 60_000;
pub const HOURLY_MS: u64 = 3_600_000;
pub const DAILY_MS: u64 = 86_400_000;

/// A parsed fixed-interval schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// The expression as given by the caller.
    pub expression: String,
    pub interval_ms: u64,
}

impl Schedule {
    /// Parse an expression, falling back to hourly when it is not recognized.
    pub fn parse(expression: &str) -> Self {
        match Self::try_parse(expression) {
            Some(schedule) => schedule,
            None => {
                tracing::warn!(
                    "Unrecognized schedule '{}', falling back to hourly",
                    expression
                );
                Self {
                    expression: expression.to_string(),
                    interval_ms: HOURLY_MS,
                }
            }
        }
    }

    /// Strict parse. Returns `None` for anything outside the supported forms.
    pub fn try_parse(expression: &str) -> Option<Self> {
        let normalized = expression.trim().to_ascii_lowercase();
        let interval_ms = match normalized.as_str() {
            "hourly" => HOURLY_MS,
            "daily" => DAILY_MS,
            _ => parse_every(&normalized)?,
        };
        Some(Self {
            expression: expression.to_string(),
            interval_ms,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.interval_ms).unwrap_or(i64::MAX))
    }

    /// Next execution after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        after
            .checked_add_signed(self.interval())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// "every N <unit>" → milliseconds.
fn parse_every(expression: &str) -> Option<u64> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    let [every, count, unit] = parts.as_slice() else {
        return None;
    };
    if *every != "every" {
        return None;
    }
    let n: u64 = count.parse().ok()?;
    if n == 0 {
        return None;
    }
    let unit_ms = match *unit {
        "minute" | "minutes" => MINUTE_MS,
        "hour" | "hours" => HOURLY_MS,
        "day" | "days" => DAILY_MS,
        _ => return None,
    };
    n.checked_mul(unit_ms)
}
