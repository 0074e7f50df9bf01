use anyhow::{Result, bail};
use colored::Colorize;
use tokio::sync::mpsc;

use agentrelay_core::{BackendKind, RunRequest, RunResult};

use crate::cli::RunArgs;
use crate::commands::utils::{parse_context, read_stdin_to_string};
use crate::output::{OutputFormat, json::print_json};
use crate::presenter::print_result;
use crate::setup::Relay;

pub async fn run(relay: Relay, args: RunArgs, format: OutputFormat) -> Result<()> {
    let context = parse_context(&args.context.context)?;

    let prompt = match args.prompt.clone() {
        Some(prompt) => prompt,
        None => read_stdin_to_string()?,
    };
    if prompt.trim().is_empty() {
        bail!("Prompt is required");
    }

    for image in &args.images {
        if !image.exists() {
            bail!("Image not found: {}", image.display());
        }
    }

    let mut request = RunRequest::new(with_image_paths(prompt, &args))
        .with_continuation(args.continuation)
        .with_images(args.images.clone());
    if let Some(model) = args.model {
        request = request.with_model(model);
    }

    // Human activity pushes the next heartbeat tick out.
    relay.heartbeat.reset_timer(&context);

    let (sink, mut updates) = mpsc::unbounded_channel::<String>();
    let streaming = !format.is_json();
    let echo = tokio::spawn(async move {
        let mut shown = String::new();
        while let Some(text) = updates.recv().await {
            if !streaming {
                continue;
            }
            // Text is replaced per turn; echo only the new tail when it grew.
            match text.strip_prefix(shown.as_str()) {
                Some(tail) => eprint!("{}", tail.dimmed()),
                None => eprint!("\n{}", text.dimmed()),
            }
            shown = text;
        }
        if streaming && !shown.is_empty() {
            eprintln!();
        }
    });

    let result = relay
        .orchestrator
        .submit_with_sink(&context, request, Some(sink))
        .await;
    let _ = echo.await;
    let result = result?;

    let scheduled = relay.callbacks.schedule(&context, result.callbacks.clone());
    print_run(&result, format)?;

    if scheduled.is_empty() || args.no_wait {
        relay.callbacks.shutdown();
        return Ok(());
    }

    if !format.is_json() {
        eprintln!(
            "{}",
            format!("Waiting for {} scheduled callback(s)...", scheduled.len()).dimmed()
        );
    }
    tokio::select! {
        _ = relay.callbacks.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Interrupted, dropping pending callbacks".yellow());
        }
    }
    relay.callbacks.shutdown();
    Ok(())
}

/// Claude has no native image input, so image paths are listed in the
/// prompt for it to read from disk.
fn with_image_paths(prompt: String, args: &RunArgs) -> String {
    if args.images.is_empty() {
        return prompt;
    }
    if args
        .model
        .as_deref()
        .is_some_and(|model| BackendKind::for_model(model) == BackendKind::Codex)
    {
        return prompt;
    }

    let mut prompt = prompt;
    prompt.push_str("\n\nAttached images:");
    for image in &args.images {
        prompt.push_str(&format!("\n- {}", image.display()));
    }
    prompt
}

fn print_run(result: &RunResult, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        return print_json(result);
    }

    if result.is_error {
        println!("{}", result.display_text.red());
    } else {
        print_result(result);
    }

    let mut summary = format!("{:.1}s", result.duration_ms as f64 / 1000.0);
    if result.cost_usd > 0.0 {
        summary.push_str(&format!(", ${:.4}", result.cost_usd));
    }
    if let Some(usage) = result.usage {
        summary.push_str(&format!(
            ", {} in / {} out tokens",
            usage.input_tokens, usage.output_tokens
        ));
    }
    eprintln!("{}", summary.dimmed());
    Ok(())
}
