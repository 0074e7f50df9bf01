//! CLI setup module
//!
//! Wires the store, orchestrator and schedulers for one process.

use std::path::PathBuf;
use std::sync::Arc;

use agentrelay_core::{
    CallbackScheduler, CliBackendFactory, FixedWorkdir, HeartbeatScheduler, Orchestrator,
};
use agentrelay_storage::JsonSessionStore;
use anyhow::{Context, Result};
use tracing::info;

use crate::config::RelayConfig;
use crate::output::OutputFormat;
use crate::paths;
use crate::presenter::TerminalPresenter;

pub struct Relay {
    pub orchestrator: Arc<Orchestrator>,
    pub heartbeat: Arc<HeartbeatScheduler>,
    pub callbacks: Arc<CallbackScheduler>,
}

/// Build the relay engine from config and global flags.
pub async fn prepare_relay(
    config: &RelayConfig,
    state_path: Option<PathBuf>,
    workdir: Option<PathBuf>,
    format: OutputFormat,
) -> Result<Relay> {
    let state_path = match state_path.or_else(|| config.state_path.clone()) {
        Some(path) => path,
        None => paths::state_path()?,
    };
    let store = Arc::new(
        JsonSessionStore::open(&state_path)
            .await
            .with_context(|| format!("Failed to open snapshot {}", state_path.display()))?,
    );

    let workdir = match workdir.or_else(|| config.working_dir.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };
    info!(workdir = %workdir.display(), state = %state_path.display(), "Preparing relay");

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(CliBackendFactory::new(config.backend_config())),
        Arc::new(FixedWorkdir(workdir)),
        config.orchestrator_config(),
    ));

    let presenter = Arc::new(TerminalPresenter::new(format));
    let callbacks = CallbackScheduler::new(
        orchestrator.clone(),
        presenter.clone(),
        config.callback_config(),
    );
    let heartbeat = HeartbeatScheduler::builder(store, orchestrator.clone())
        .presenter(presenter)
        .callbacks(callbacks.clone())
        .config(config.heartbeat_config())
        .build();

    orchestrator.add_reset_listener(&heartbeat);
    orchestrator.add_reset_listener(&callbacks);

    Ok(Relay {
        orchestrator,
        heartbeat,
        callbacks,
    })
}
