//! Long-running worker command.

use anyhow::Result;
use memoflow_scheduler::Worker;
use tokio::sync::watch;
use tracing::{info, warn};

use super::Env;

pub async fn run(env: &Env, id: Option<String>) -> Result<()> {
    let scheduler = env.scheduler()?;
    let id = id.unwrap_or_else(|| format!("worker-{}", std::process::id()));
    let worker = Worker::new(id, scheduler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            // keep the sender alive so the worker isn't stopped by accident
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested, finishing current batch");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
    Ok(())
}
