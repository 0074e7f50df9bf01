//! Response directives embedded in agent output.
//!
//! The agent is instructed to use three free-text conventions:
//!
//! - `[[callback: <delay>: <prompt>]]` - schedule a one-shot autonomous run
//! - `[[upload: <path>]]` - attach a local file to the reply
//! - `![alt](<local path>)` or `![[<local path>]]` - embed a local image
//!
//! [`extract`] strips them from the text and returns them as structured data.
//! Grammars are applied in that order so a callback prompt that mentions an
//! upload tag is consumed whole by the callback match.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::models::ScheduledCallback;

static CALLBACK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\[\[\s*(?:callback|schedule)\s*:\s*([^:\]]+?)\s*:\s*(.+?)\s*\]\]")
        .expect("Invalid regex")
});

static UPLOAD_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\[\s*upload\s*:\s*([^\]\n]+?)\s*\]\]").expect("Invalid regex")
});

static IMAGE_EMBED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[\[([^\]\n]+?)\]\]").expect("Invalid regex"));

static MARKDOWN_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"!\[([^\]\n]*)\]\(\s*<?([^)>\s]+)>?(?:\s+"[^"]*")?\s*\)"#).expect("Invalid regex")
});

static URL_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:[a-z][a-z0-9+.\-]*://|data:|mailto:)").expect("Invalid regex"));

static DELAY_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d+(?:\.\d+)?)\s*(hours|hour|hrs|hr|h|minutes|minute|mins|min|m|seconds|second|secs|sec|s)([a-z]?)",
    )
    .expect("Invalid regex")
});

static EXCESS_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("Invalid regex"));

/// Result of directive extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    /// Display-ready text with every directive removed
    pub text: String,
    pub uploads: Vec<PathBuf>,
    pub callbacks: Vec<ScheduledCallback>,
}

/// Pull directives out of raw agent output.
pub fn extract(raw: &str) -> Extracted {
    let mut uploads = Vec::new();
    let mut callbacks = Vec::new();
    let mut found = false;

    let text = CALLBACK_TAG.replace_all(raw, |caps: &Captures| {
        found = true;
        let delay_text = &caps[1];
        let prompt = caps[2].trim();
        match parse_delay(delay_text) {
            Some(delay) if !prompt.is_empty() => {
                debug!(delay_ms = delay.as_millis() as u64, "Extracted callback directive");
                callbacks.push(ScheduledCallback::new(delay, prompt));
            }
            _ => warn!(delay = %delay_text, "Dropping callback directive with unusable delay"),
        }
        String::new()
    });

    let text = UPLOAD_TAG.replace_all(&text, |caps: &Captures| {
        found = true;
        uploads.push(PathBuf::from(clean_path(&caps[1])));
        String::new()
    });

    let text = IMAGE_EMBED.replace_all(&text, |caps: &Captures| {
        let target = clean_path(&caps[1]);
        if URL_SCHEME.is_match(&target) {
            return caps[0].to_string();
        }
        found = true;
        uploads.push(PathBuf::from(target));
        String::new()
    });

    let text = MARKDOWN_IMAGE.replace_all(&text, |caps: &Captures| {
        let target = clean_path(&caps[2]);
        if URL_SCHEME.is_match(&target) {
            return caps[0].to_string();
        }
        found = true;
        uploads.push(PathBuf::from(target));
        caps[1].trim().to_string()
    });

    let text = if found {
        EXCESS_BLANK_LINES.replace_all(&text, "\n\n").trim().to_string()
    } else {
        text.trim().to_string()
    };

    Extracted {
        text,
        uploads,
        callbacks,
    }
}

fn clean_path(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '`' || c == '"' || c == '\'')
        .trim()
        .to_string()
}

/// Largest delay in milliseconds that still converts losslessly to `u64`.
const MAX_DELAY_MS: f64 = u64::MAX as f64 / 2.0;

/// Parse a free-form delay such as `1h30m`, `90s`, `2 hours` or `45`.
///
/// A bare integer is whole minutes. Returns `None` for anything that does
/// not parse, that sums to zero, or that is too large to represent, so
/// callers can tell "no delay" apart from "immediately".
pub fn parse_delay(input: &str) -> Option<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        let minutes: u64 = trimmed.parse().ok()?;
        if minutes == 0 {
            return None;
        }
        return minutes.checked_mul(60).map(Duration::from_secs);
    }

    let mut total_ms = 0f64;
    let mut matched = false;
    for caps in DELAY_TOKEN.captures_iter(trimmed) {
        if !caps[3].is_empty() {
            continue;
        }
        let Ok(value) = caps[1].parse::<f64>() else {
            continue;
        };
        let unit_ms = match caps[2].to_lowercase().chars().next() {
            Some('h') => 3_600_000.0,
            Some('m') => 60_000.0,
            _ => 1_000.0,
        };
        total_ms += value * unit_ms;
        matched = true;
    }

    // also rejects NaN and infinity from absurdly long digit runs
    if !matched || !(1.0..=MAX_DELAY_MS).contains(&total_ms) {
        return None;
    }
    Some(Duration::from_millis(total_ms.round() as u64))
}
