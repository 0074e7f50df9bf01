use anyhow::{Result, bail};
use chrono::{DateTime, Local, TimeZone};
use std::io::{IsTerminal, Read};
use std::time::Duration;

use agentrelay_core::ContextId;

pub fn format_timestamp(timestamp: i64) -> String {
    let datetime: DateTime<Local> = match Local.timestamp_millis_opt(timestamp).single() {
        Some(dt) => dt,
        None => return "-".to_string(),
    };

    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `1h 5m`, `42m`, `30s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}

pub fn parse_context(input: &str) -> Result<ContextId> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        bail!("Context id must look like `surface` or `surface:sub`");
    }
    Ok(ContextId::parse(trimmed))
}

pub fn read_stdin_to_string() -> Result<String> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(String::new());
    }
    let mut input = String::new();
    stdin.read_to_string(&mut input)?;
    Ok(input.trim().to_string())
}
