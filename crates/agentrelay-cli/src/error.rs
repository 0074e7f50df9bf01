use colored::Colorize;

pub fn handle_error(err: anyhow::Error) -> ! {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let msg = format!("{err:#}").to_lowercase();

    if msg.contains("failed to spawn") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Make sure the agent CLI is installed and on PATH, or point to it with:");
        eprintln!("  {} export AGENTRELAY_CLAUDE_BIN=/path/to/claude", "$".dimmed());
        eprintln!("  {} export AGENTRELAY_CODEX_BIN=/path/to/codex", "$".dimmed());
    }

    if msg.contains("is corrupt") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Move the snapshot file aside to start with empty state.");
    }

    if msg.contains("rate limit") || msg.contains("usage limit") || msg.contains("429") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  The provider is throttling requests. Try again later.");
    }

    std::process::exit(1);
}
