//! One-shot job commands.

use anyhow::{Context, Result};
use memoflow_core::{JobId, NewJob, OwnerId};
use memoflow_db::JobStore;
use memoflow_scheduler::LockManager;

use super::{Env, print_json};

pub async fn process(env: &Env, job_id: JobId, owner: Option<OwnerId>, force: bool) -> Result<()> {
    let scheduler = env.scheduler()?;
    let result = scheduler
        .orchestrator()
        .process_job(job_id, owner, force)
        .await;
    print_json(&result)?;
    if !result.success && !result.non_fatal {
        anyhow::bail!("job {} failed", job_id);
    }
    Ok(())
}

pub async fn batch(env: &Env, size: Option<usize>) -> Result<()> {
    let scheduler = env.scheduler()?;
    let size = size.unwrap_or(env.config.scheduler.batch_size);
    let report = scheduler
        .process_next_batch(size)
        .await
        .context("Failed to run batch")?;
    print_json(&report)
}

pub async fn enqueue(
    env: &Env,
    owner: OwnerId,
    payload: String,
    priority: i32,
    duration: Option<i32>,
) -> Result<()> {
    let mut job = NewJob::new(owner, payload).with_priority(priority);
    if let Some(secs) = duration {
        job = job.with_expected_duration(secs);
    }
    let job = env.store.enqueue(job).await.context("Failed to enqueue job")?;
    println!("{}", job.id);
    Ok(())
}

pub async fn cleanup(env: &Env) -> Result<()> {
    let locks = LockManager::new(env.store.clone());
    let cleared = locks
        .cleanup_abandoned(env.config.lock.ttl, env.config.lock.grace)
        .await
        .context("Failed to clear abandoned locks")?;
    println!("Cleared {} abandoned lock(s)", cleared);
    Ok(())
}

pub async fn health(env: &Env) -> Result<()> {
    let scheduler = env.scheduler()?;
    let metrics = scheduler
        .health_metrics()
        .await
        .context("Failed to collect health metrics")?;
    print_json(&metrics)
}
