use anyhow::Result;
use tracing::info;

use crate::setup::Relay;

pub async fn run(relay: Relay) -> Result<()> {
    let restored = relay.heartbeat.restore_from_store().await?;
    info!(restored, "Relay serving");
    println!("Relay running with {restored} heartbeat(s). Press Ctrl+C to stop.");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    let _ = shutdown_tx.send(());
                }
                _ = tokio::signal::ctrl_c() => {
                    let _ = shutdown_tx.send(());
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(());
        });
    }

    let _ = shutdown_rx.await;

    relay.callbacks.shutdown();
    let stopped = relay.heartbeat.active_count();
    info!(heartbeats = stopped, "Relay stopping");
    println!("Relay stopped");
    Ok(())
}
