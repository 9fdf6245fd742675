//! Long-running worker that keeps pulling batches.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::batch::BatchScheduler;

/// A worker that runs batches until told to stop.
pub struct Worker {
    id: String,
    scheduler: Arc<BatchScheduler>,
}

impl Worker {
    pub fn new(id: impl Into<String>, scheduler: Arc<BatchScheduler>) -> Self {
        Self {
            id: id.into(),
            scheduler,
        }
    }

    /// Poll interval plus random jitter, so idle workers don't wake in step.
    fn poll_delay(&self) -> Duration {
        let settings = self.scheduler.settings();
        let jitter_ms = settings.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        settings.poll_interval + Duration::from_millis(jitter)
    }

    /// Run the worker loop until `shutdown` flips to true or its sender is
    /// dropped. Shutdown is checked between batches and while idle; a batch
    /// in progress runs to completion.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "Starting worker");
        let batch_size = self.scheduler.settings().batch_size;

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            let pause = match self.scheduler.process_next_batch(batch_size).await {
                Ok(report) if report.made_progress() => {
                    info!(
                        worker_id = %self.id,
                        processed = report.processed,
                        failed = report.failed,
                        skipped = report.skipped,
                        "Batch complete"
                    );
                    None
                }
                Ok(_) => Some(self.poll_delay()),
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to fetch batch");
                    Some(self.poll_delay() * 2)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}
