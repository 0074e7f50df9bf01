mod cli;
mod commands;
mod config;
mod error;
mod output;
mod paths;
mod presenter;
mod setup;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use setup::prepare_relay;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error::handle_error(err);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Always log to file; stdout is reserved for command output.
    let log_dir = paths::logs_dir()?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "agentrelay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .with_level(true)
        .init();

    let config = config::RelayConfig::load();
    let format = cli.format;
    let relay = prepare_relay(&config, cli.state_path, cli.workdir, format).await?;

    match cli.command {
        Commands::Run(args) => commands::run::run(relay, args, format).await,
        Commands::Heartbeat { command } => {
            commands::heartbeat::run(relay, &config, command, format).await
        }
        Commands::Contexts => commands::contexts::run(relay, format).await,
        Commands::Reset(args) => commands::reset::run(relay, args, format).await,
        Commands::Model(args) => commands::model::run(relay, args, format).await,
        Commands::Serve => commands::serve::run(relay).await,
    }
}
