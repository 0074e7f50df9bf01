use anyhow::{Result, bail};
use serde::Serialize;
use std::time::Duration;

use agentrelay_core::ContextId;

use crate::cli::HeartbeatCommands;
use crate::commands::utils::{format_duration, parse_context};
use crate::config::RelayConfig;
use crate::output::{OutputFormat, json::print_json};
use crate::setup::Relay;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatStatus {
    context: String,
    enabled: bool,
    interval_ms: Option<u64>,
    prompt: Option<String>,
}

pub async fn run(
    relay: Relay,
    config: &RelayConfig,
    command: HeartbeatCommands,
    format: OutputFormat,
) -> Result<()> {
    match command {
        HeartbeatCommands::Enable {
            context,
            interval,
            prompt,
        } => {
            let context = parse_context(&context.context)?;
            let interval = match interval {
                Some(minutes) => interval_from_minutes(minutes)?,
                None => config.default_heartbeat_interval(),
            };
            // Blank prompt means the configured default is used at tick time.
            let prompt = prompt.unwrap_or_default();
            relay.heartbeat.enable(&context, interval, prompt).await?;
            // Timers only run under `serve`; this process exits right away.
            relay.heartbeat.stop(&context);

            if !format.is_json() {
                println!("Heartbeat enabled. Run `agentrelay serve` to keep it ticking.");
            }
            print_status(&relay, &context, format).await
        }
        HeartbeatCommands::Disable(context) => {
            let context = parse_context(&context.context)?;
            relay.heartbeat.disable(&context).await?;
            print_status(&relay, &context, format).await
        }
        HeartbeatCommands::Status(context) => {
            let context = parse_context(&context.context)?;
            print_status(&relay, &context, format).await
        }
    }
}

fn interval_from_minutes(minutes: u64) -> Result<Duration> {
    if minutes == 0 {
        bail!("Interval must be at least one minute");
    }
    // persisted as milliseconds
    match minutes.checked_mul(60_000) {
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => bail!("Interval of {minutes} minutes is too large"),
    }
}

async fn print_status(relay: &Relay, context: &ContextId, format: OutputFormat) -> Result<()> {
    let record = relay.orchestrator.context(context).await?;
    let settings = record.and_then(|r| r.heartbeat);
    let status = HeartbeatStatus {
        context: context.key(),
        enabled: settings.as_ref().is_some_and(|s| s.enabled),
        interval_ms: settings.as_ref().map(|s| s.interval_ms),
        prompt: settings.map(|s| s.prompt),
    };

    if format.is_json() {
        return print_json(&status);
    }

    println!("Context:   {}", status.context);
    println!("Enabled:   {}", if status.enabled { "yes" } else { "no" });
    if let Some(ms) = status.interval_ms {
        println!("Interval:  {}", format_duration(Duration::from_millis(ms)));
    }
    match status.prompt.as_deref() {
        Some(prompt) if !prompt.trim().is_empty() => println!("Prompt:    {prompt}"),
        Some(_) => println!("Prompt:    (default)"),
        None => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_from_minutes() {
        assert_eq!(interval_from_minutes(5).unwrap(), Duration::from_secs(300));
        assert!(interval_from_minutes(0).is_err());
        assert!(interval_from_minutes(u64::MAX / 60).is_err());
        let err = interval_from_minutes(u64::MAX).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
