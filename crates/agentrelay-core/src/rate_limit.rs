//! Rate-limit detection and resume-time parsing.
//!
//! Providers report throttling as free text, so detection is a
//! case-insensitive match against known phrasings. When the message carries
//! an explicit reset hint such as `resets 1pm (America/Los_Angeles)`, the
//! hint is turned into a concrete delay. Callers fall back to their own
//! backoff when no hint can be parsed.

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use tracing::debug;

/// Default safety margin added on top of a parsed reset time.
pub const DEFAULT_RESET_BUFFER: Duration = Duration::from_secs(120);

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "rate-limit",
    "ratelimit",
    "usage limit",
    "too many requests",
    "http 429",
    "status 429",
    "error 429",
    "insufficient_quota",
    "quota exceeded",
    "hit your limit",
    "resource_exhausted",
    "overloaded",
];

static RESET_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bresets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\s*\(\s*([A-Za-z][A-Za-z0-9_+\-]*(?:/[A-Za-z0-9_+\-]+)*)\s*\)",
    )
    .expect("Invalid regex")
});

/// Whether a message matches a provider rate-limit or quota signature.
pub fn is_rate_limited(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Wall-clock reset time announced by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetHint {
    pub time: NaiveTime,
    pub zone: Tz,
}

impl ResetHint {
    /// First instant strictly after `now` at which the zone's clock reads
    /// the hinted time.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_today = now.with_timezone(&self.zone).date_naive();
        let mut date = local_today;
        for _ in 0..3 {
            if let Some(candidate) = self
                .zone
                .from_local_datetime(&date.and_time(self.time))
                .earliest()
            {
                let candidate = candidate.with_timezone(&Utc);
                if candidate > now {
                    return Some(candidate);
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

/// Parse a `resets <time> (<IANA zone>)` hint.
///
/// Accepts `1pm`, `3:30pm`, `at 11am` and 24-hour `14:00`. A bare hour
/// without minutes or a meridiem is ambiguous and rejected, as is any zone
/// chrono-tz does not know.
pub fn parse_reset_hint(text: &str) -> Option<ResetHint> {
    let caps = RESET_HINT.captures(text)?;

    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    let meridiem = caps.get(3).map(|m| m.as_str().to_lowercase());

    let hour = match meridiem.as_deref() {
        Some(m) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (m, hour) {
                ("am", 12) => 0,
                ("am", h) => h,
                ("pm", 12) => 12,
                (_, h) => h + 12,
            }
        }
        None if caps.get(2).is_some() => hour,
        None => return None,
    };

    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let zone_name = &caps[4];
    let zone = match Tz::from_str(zone_name) {
        Ok(zone) => zone,
        Err(_) => {
            debug!(zone = %zone_name, "Unknown time zone in reset hint");
            return None;
        }
    };

    Some(ResetHint { time, zone })
}

/// Delay until the reset announced in `message`, plus `buffer`.
///
/// Returns `None` when the message has no usable hint.
pub fn resume_delay(message: &str, now: DateTime<Utc>, buffer: Duration) -> Option<Duration> {
    let hint = parse_reset_hint(message)?;
    let at = hint.next_occurrence(now)?;
    let gap = (at - now).to_std().ok()?;
    Some(gap.saturating_add(buffer))
}
