use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "agentrelay")]
#[command(version, about = "AgentRelay - run Claude and Codex agents per conversation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Snapshot file (defaults to ~/.agentrelay/state.json)
    #[arg(long, global = true, env = "AGENTRELAY_STATE_PATH")]
    pub state_path: Option<PathBuf>,

    /// Directory agents run in (defaults to the current directory)
    #[arg(long, global = true, env = "AGENTRELAY_WORKDIR")]
    pub workdir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent once for a context
    Run(RunArgs),

    /// Heartbeat management
    Heartbeat {
        #[command(subcommand)]
        command: HeartbeatCommands,
    },

    /// List persisted contexts
    Contexts,

    /// Forget a context's session, heartbeat and pending callbacks
    Reset(ContextArgs),

    /// Set or clear a model override
    Model(ModelArgs),

    /// Restore heartbeats and keep running until interrupted
    Serve,
}

#[derive(Args)]
pub struct ContextArgs {
    /// Context id, `surface` or `surface:sub`
    #[arg(short, long, default_value = "local")]
    pub context: String,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    /// Model for this run only
    #[arg(short, long)]
    pub model: Option<String>,

    /// Continue the context's stored session
    #[arg(long = "continue")]
    pub continuation: bool,

    /// Image to pass to the agent (repeatable)
    #[arg(long = "image")]
    pub images: Vec<PathBuf>,

    /// Do not wait for callbacks scheduled by the reply
    #[arg(long)]
    pub no_wait: bool,

    /// Prompt (reads stdin when omitted)
    pub prompt: Option<String>,
}

#[derive(Subcommand)]
pub enum HeartbeatCommands {
    /// Enable the heartbeat for a context
    Enable {
        #[command(flatten)]
        context: ContextArgs,

        /// Minutes between ticks (defaults to the configured interval)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Prompt sent on every tick
        #[arg(short, long)]
        prompt: Option<String>,
    },

    /// Disable the heartbeat for a context
    Disable(ContextArgs),

    /// Show the heartbeat settings for a context
    Status(ContextArgs),
}

#[derive(Args)]
pub struct ModelArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    /// Apply to every context instead of one
    #[arg(long)]
    pub global: bool,

    /// Model id; omit to clear the override
    pub model: Option<String>,
}
