//! Batch scheduling and worker loop scenarios.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{Harness, auth, test_config};
use memoflow_core::{ErrorCategory, NewJob};
use memoflow_db::JobStore;
use memoflow_scheduler::Worker;
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn batch_runs_fresh_jobs_first_then_oldest() {
    let h = Harness::new();
    let now = Utc::now();
    let a = h
        .store
        .enqueue(NewJob::new(h.owner, "a.wav").recorded_at(now - chrono::Duration::hours(2)))
        .await
        .unwrap();
    let b = h
        .store
        .enqueue(NewJob::new(h.owner, "b.wav").recorded_at(now - chrono::Duration::hours(1)))
        .await
        .unwrap();
    let c = h
        .store
        .enqueue(NewJob::new(h.owner, "c.wav").recorded_at(now - chrono::Duration::hours(3)))
        .await
        .unwrap();
    let mut retried = h.job(c.id);
    retried.attempts = 2;
    h.store.insert(retried);

    let report = h.scheduler.process_next_batch(10).await.unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(h.transcriber.seen(), vec!["a.wav", "b.wav", "c.wav"]);
    for id in [a.id, b.id, c.id] {
        assert!(h.job(id).is_completed());
    }
}

#[tokio::test(start_paused = true)]
async fn shorter_and_higher_priority_jobs_break_ties() {
    let h = Harness::new();
    let at = Utc::now() - chrono::Duration::minutes(5);
    for (name, duration, priority) in [
        ("unknown.wav", None, 9),
        ("long.wav", Some(600), 0),
        ("short-low.wav", Some(30), 0),
        ("short-high.wav", Some(30), 5),
    ] {
        let mut job = NewJob::new(h.owner, name).recorded_at(at).with_priority(priority);
        if let Some(secs) = duration {
            job = job.with_expected_duration(secs);
        }
        h.store.enqueue(job).await.unwrap();
    }

    h.scheduler.process_next_batch(10).await.unwrap();

    assert_eq!(
        h.transcriber.seen(),
        vec!["short-high.wav", "short-low.wav", "long.wav", "unknown.wav"]
    );
}

#[tokio::test(start_paused = true)]
async fn batch_size_limits_work() {
    let h = Harness::new();
    for name in ["1.wav", "2.wav", "3.wav"] {
        h.enqueue(name).await;
    }

    let report = h.scheduler.process_next_batch(2).await.unwrap();
    assert_eq!(report.processed, 2);

    let report = h.scheduler.process_next_batch(2).await.unwrap();
    assert_eq!(report.processed, 1);

    let report = h.scheduler.process_next_batch(2).await.unwrap();
    assert!(!report.made_progress());
}

#[tokio::test(start_paused = true)]
async fn failures_are_reported_without_stopping_the_batch() {
    let h = Harness::new();
    let first = h.enqueue("first.wav").await;
    let second = h.enqueue("second.wav").await;
    h.analyzer.fail_next([auth()]);

    let report = h.scheduler.process_next_batch(10).await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains(&first.id.to_string()));
    assert_eq!(report.metrics.error_categories[&ErrorCategory::Auth], 1);
    assert!((report.metrics.error_rate - 0.5).abs() < f64::EPSILON);
    assert!(h.job(second.id).is_completed());
}

#[tokio::test(start_paused = true)]
async fn exhausted_jobs_are_not_picked_up() {
    let h = Harness::new();
    let job = h.enqueue("dead.wav").await;
    let mut dead = h.job(job.id);
    dead.attempts = test_config().scheduler.max_job_attempts;
    h.store.insert(dead);

    let report = h.scheduler.process_next_batch(10).await.unwrap();

    assert!(!report.made_progress());
    assert_eq!(h.transcriber.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_locks_are_swept_before_the_batch() {
    let h = Harness::new();
    let config = test_config();
    let abandoned = h.enqueue("abandoned.wav").await;
    let live = h.enqueue("live.wav").await;
    h.store.try_lock(abandoned.id, config.lock.ttl).await.unwrap();
    h.store.try_lock(live.id, config.lock.ttl).await.unwrap();
    h.backdate_lock(abandoned.id, 120);

    let report = h.scheduler.process_next_batch(10).await.unwrap();

    assert_eq!(report.processed, 1);
    assert!(h.job(abandoned.id).is_completed());
    assert!(!h.job(live.id).is_completed());
    assert!(h.job(live.id).locked_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn pacing_waits_between_jobs_but_not_after_the_last() {
    let mut config = test_config();
    config.scheduler.base_delay = Duration::from_secs(1);
    config.scheduler.max_delay = Duration::from_secs(10);
    let h = Harness::with_config(config);
    for name in ["1.wav", "2.wav", "3.wav"] {
        h.enqueue(name).await;
    }

    let report = h.scheduler.process_next_batch(10).await.unwrap();

    assert_eq!(report.processed, 3);
    assert!(report.metrics.elapsed_ms >= 2_000, "{}", report.metrics.elapsed_ms);
    assert!(report.metrics.elapsed_ms < 3_000, "{}", report.metrics.elapsed_ms);
    assert!(!report.metrics.circuit_open);
}

#[tokio::test(start_paused = true)]
async fn health_metrics_reflect_the_store_and_breakers() {
    let h = Harness::new();
    h.enqueue("first.wav").await;
    h.enqueue("second.wav").await;
    let stuck = h.enqueue("stuck.wav").await;
    h.store.try_lock(stuck.id, test_config().lock.ttl).await.unwrap();
    h.analyzer.fail_next([auth()]);

    h.scheduler.process_next_batch(10).await.unwrap();
    h.backdate_lock(stuck.id, 61);

    let health = h.scheduler.health_metrics().await.unwrap();
    assert!((health.success_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(health.stuck_job_count, 1);
    assert_eq!(health.jobs.completed, 1);
    assert!(health.circuit_breakers.iter().any(|c| c.key == "analysis"));
}

#[tokio::test(start_paused = true)]
async fn worker_drains_queue_and_stops_on_shutdown() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;
    let (tx, rx) = watch::channel(false);

    let worker = Worker::new("test-worker", h.scheduler.clone());
    let handle = tokio::spawn(async move { worker.run(rx).await });

    for _ in 0..100 {
        if h.job(job.id).is_completed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(h.job(job.id).is_completed());

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn worker_stops_when_shutdown_sender_is_dropped() {
    let h = Harness::new();
    let (tx, rx) = watch::channel(false);
    let worker = Worker::new("test-worker", h.scheduler.clone());
    let handle = tokio::spawn(async move { worker.run(rx).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(tx);
    tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}
