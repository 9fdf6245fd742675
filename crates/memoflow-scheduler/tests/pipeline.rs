//! End-to-end scenarios for the per-job pipeline.

mod common;

use std::time::Duration;

use common::{Harness, auth, test_config, timeout};
use memoflow_core::provider::KnowledgeStore;
use memoflow_core::{ErrorCategory, OwnerId, ProcessingError};
use memoflow_db::JobStore;
use memoflow_scheduler::{LockManager, PipelineState};

#[tokio::test(start_paused = true)]
async fn analysis_timeouts_are_retried_to_completion() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;
    h.analyzer.fail_next([timeout(), timeout()]);

    let result = h.orchestrator().process_job(job.id, None, false).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.final_state, PipelineState::Completed);
    assert_eq!(h.analyzer.calls(), 3);

    let stored = h.job(job.id);
    assert_eq!(stored.transcript.as_deref(), Some("transcript of memo.wav"));
    assert!(stored.analysis.is_some());
    assert!(stored.completed_at.is_some());
    assert!(stored.locked_at.is_none());
    assert_eq!(stored.attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_analysis_failure_keeps_transcript() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;
    h.analyzer.fail_next([auth()]);

    let result = h.orchestrator().process_job(job.id, None, false).await;

    assert!(!result.success);
    assert_eq!(result.final_state, PipelineState::Failed);
    assert_eq!(result.failed_stage, Some(PipelineState::Analysis));
    assert_eq!(result.error_category, Some(ErrorCategory::Auth));
    assert!(result.transcript.is_some());
    assert!(!result.non_fatal);
    assert_eq!(h.analyzer.calls(), 1);

    let stored = h.job(job.id);
    assert!(stored.transcript.is_some());
    assert!(stored.analysis.is_none());
    assert!(stored.completed_at.is_none());
    assert_eq!(stored.last_error_category, Some(ErrorCategory::Auth));
    assert_eq!(stored.attempts, 1);
    assert!(stored.locked_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn retried_job_reuses_persisted_transcript() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;
    h.analyzer.fail_next([auth()]);
    h.orchestrator().process_job(job.id, None, false).await;

    let result = h.orchestrator().process_job(job.id, None, false).await;

    assert!(result.success);
    assert_eq!(h.transcriber.calls(), 1);
    assert_eq!(h.analyzer.calls(), 2);
    let stored = h.job(job.id);
    assert!(stored.last_error.is_none());
    assert_eq!(stored.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn completed_job_is_idempotent() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;

    let first = h.orchestrator().process_job(job.id, None, false).await;
    let second = h.orchestrator().process_job(job.id, None, false).await;

    assert!(first.success && second.success);
    assert_eq!(second.final_state, PipelineState::Completed);
    assert_eq!(second.transcript, first.transcript);
    assert_eq!(second.analysis, first.analysis);
    assert_eq!(h.transcriber.calls(), 1);
    assert_eq!(h.analyzer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn force_reprocess_reruns_analysis_only() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;
    h.orchestrator().process_job(job.id, None, false).await;

    let result = h.orchestrator().process_job(job.id, None, true).await;

    assert!(result.success);
    assert_eq!(h.transcriber.calls(), 1);
    assert_eq!(h.analyzer.calls(), 2);
    assert!(h.job(job.id).locked_at.is_none());

    // the re-run's identical summary is not appended twice
    let context = h.knowledge.context_for(h.owner).await.unwrap();
    assert_eq!(context.summary.lines().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn job_locked_elsewhere_is_non_fatal() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;
    let ttl = test_config().lock.ttl;
    h.store.try_lock(job.id, ttl).await.unwrap().unwrap();

    let result = h.orchestrator().process_job(job.id, None, false).await;

    assert!(!result.success);
    assert!(result.non_fatal);
    assert_eq!(result.failed_stage, Some(PipelineState::LockAcquisition));
    assert_eq!(h.transcriber.calls(), 0);
    assert_eq!(h.job(job.id).attempts, 0);

    // a forced run still respects the live lock
    let forced = h.orchestrator().process_job(job.id, None, true).await;
    assert!(forced.non_fatal);
}

#[tokio::test(start_paused = true)]
async fn expired_lock_is_taken_over() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;
    let ttl = test_config().lock.ttl;
    h.store.try_lock(job.id, ttl).await.unwrap().unwrap();
    h.backdate_lock(job.id, 61);

    let result = h.orchestrator().process_job(job.id, None, false).await;

    assert!(result.success);
    let stored = h.job(job.id);
    assert_eq!(stored.lock_generation, 2);
    assert!(stored.locked_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn other_owners_cannot_see_the_job() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;

    let result = h
        .orchestrator()
        .process_job(job.id, Some(OwnerId::new()), false)
        .await;

    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::NotFound));
    let stored = h.job(job.id);
    assert_eq!(stored.lock_generation, 0);
    assert_eq!(stored.attempts, 0);

    let own = h.orchestrator().process_job(job.id, Some(h.owner), false).await;
    assert!(own.success);
}

#[tokio::test(start_paused = true)]
async fn missing_job_is_not_found() {
    let h = Harness::new();
    let result = h
        .orchestrator()
        .process_job(memoflow_core::JobId::new(), None, false)
        .await;
    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::NotFound));
    assert_eq!(result.failed_stage, Some(PipelineState::Initializing));
}

#[tokio::test(start_paused = true)]
async fn missing_payload_fails_transcription() {
    let h = Harness::new();
    let job = h.enqueue("gone.wav").await;
    h.storage.mark_missing("gone.wav");

    let result = h.orchestrator().process_job(job.id, None, false).await;

    assert_eq!(result.failed_stage, Some(PipelineState::Transcription));
    assert_eq!(result.error_category, Some(ErrorCategory::NotFound));
    assert!(result.transcript.is_none());
    assert_eq!(h.transcriber.calls(), 0);
    let stored = h.job(job.id);
    assert_eq!(stored.attempts, 1);
    assert!(stored.transcript.is_none());
}

#[tokio::test(start_paused = true)]
async fn knowledge_context_accumulates_per_owner() {
    let h = Harness::new();
    let first = h.enqueue("first.wav").await;
    let second = h.enqueue("second.wav").await;

    h.orchestrator().process_job(first.id, None, false).await;
    assert!(h.analyzer.last_context().unwrap().is_empty());

    h.orchestrator().process_job(second.id, None, false).await;
    let context = h.analyzer.last_context().unwrap();
    assert!(context.summary.contains("first.wav"));
    assert_eq!(context.recent_topics, vec!["memo"]);
}

#[tokio::test(start_paused = true)]
async fn stale_lease_cannot_write() {
    let h = Harness::new();
    let job = h.enqueue("memo.wav").await;
    let ttl = test_config().lock.ttl;
    let locks = LockManager::new(h.store.clone());

    let stale = locks.acquire(job.id, ttl).await.unwrap();
    h.backdate_lock(job.id, 120);
    let fresh = locks.acquire(job.id, ttl).await.unwrap();

    let result = h.orchestrator().process_leased(stale, false).await;

    assert!(!result.success);
    assert_eq!(result.failed_stage, Some(PipelineState::Transcription));
    let stored = h.job(job.id);
    assert!(stored.transcript.is_none());
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.lock_generation, fresh.generation);
    assert!(stored.locked_at.is_some());

    let result = h.orchestrator().process_leased(fresh, false).await;
    assert!(result.success);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_stops_provider_calls() {
    let h = Harness::new();
    h.transcriber.fail_always(ProcessingError::provider(
        ErrorCategory::Provider,
        "500 Internal Server Error",
    ));

    for name in ["a.wav", "b.wav", "c.wav"] {
        let job = h.enqueue(name).await;
        let result = h.orchestrator().process_job(job.id, None, false).await;
        assert_eq!(result.error_category, Some(ErrorCategory::Provider));
        assert!(!result.non_fatal);
    }
    assert!(h.breaker().is_open("transcription"));
    let calls = h.transcriber.calls();

    let job = h.enqueue("d.wav").await;
    let result = h.orchestrator().process_job(job.id, None, false).await;

    assert!(result.non_fatal);
    assert_eq!(h.transcriber.calls(), calls);
    let stored = h.job(job.id);
    assert_eq!(stored.attempts, 0);
    assert!(stored.locked_at.is_none());

    // after the reset timeout one trial goes through and closes the circuit
    tokio::time::advance(test_config().circuit_breaker.reset_timeout + Duration::from_secs(1)).await;
    h.transcriber.recover();
    let result = h.orchestrator().process_job(job.id, None, false).await;
    assert!(result.success);
    assert!(!h.breaker().is_open("transcription"));
}
