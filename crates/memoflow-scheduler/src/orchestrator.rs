//! Per-job pipeline: lock, transcribe, analyze, save, release.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use memoflow_config::WorkerConfig;
use memoflow_core::classify::classify;
use memoflow_core::provider::{
    AnalysisProvider, KnowledgeStore, PayloadStorage, TranscriptionProvider,
};
use memoflow_core::{
    AnalysisResult, ErrorCategory, Job, JobId, OwnerContext, OwnerId, ProcessingError, Result,
};
use memoflow_db::JobStore;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::circuit::CircuitBreaker;
use crate::lock::{Lease, LockManager};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Where a job is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Initializing,
    LockAcquisition,
    Transcription,
    Analysis,
    Saving,
    Completed,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Initializing => "initializing",
            PipelineState::LockAcquisition => "lock_acquisition",
            PipelineState::Transcription => "transcription",
            PipelineState::Analysis => "analysis",
            PipelineState::Saving => "saving",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of processing one job. Never an error: failures are data.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub job_id: JobId,
    pub success: bool,
    pub transcript: Option<String>,
    pub analysis: Option<AnalysisResult>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub warning: Option<String>,
    pub final_state: PipelineState,
    /// Stage that was running when the job failed.
    pub failed_stage: Option<PipelineState>,
    /// The failure was not counted against the job (lock held elsewhere,
    /// circuit open).
    pub non_fatal: bool,
}

impl ProcessResult {
    fn completed(job_id: JobId, transcript: String, analysis: AnalysisResult) -> Self {
        Self {
            job_id,
            success: true,
            transcript: Some(transcript),
            analysis: Some(analysis),
            error: None,
            error_category: None,
            warning: None,
            final_state: PipelineState::Completed,
            failed_stage: None,
            non_fatal: false,
        }
    }

    /// Result for a job that had already been completed.
    fn cached(job: Job) -> Self {
        Self {
            job_id: job.id,
            success: true,
            transcript: job.transcript,
            analysis: job.analysis,
            error: None,
            error_category: None,
            warning: None,
            final_state: PipelineState::Completed,
            failed_stage: None,
            non_fatal: false,
        }
    }

    fn failed(job_id: JobId, stage: PipelineState, err: &ProcessingError) -> Self {
        Self {
            job_id,
            success: false,
            transcript: None,
            analysis: None,
            error: Some(err.to_string()),
            error_category: Some(classify(err).category),
            warning: None,
            final_state: PipelineState::Failed,
            failed_stage: Some(stage),
            non_fatal: err.is_non_fatal(),
        }
    }

    fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        if !warnings.is_empty() {
            self.warning = Some(warnings.join("; "));
        }
        self
    }
}

/// External collaborators the pipeline calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn PayloadStorage>,
    pub transcriber: Arc<dyn TranscriptionProvider>,
    pub analyzer: Arc<dyn AnalysisProvider>,
    pub knowledge: Arc<dyn KnowledgeStore>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub lock_ttl: Duration,
    pub transcription_retry: RetryPolicy,
    pub analysis_retry: RetryPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            lock_ttl: config.lock.ttl,
            transcription_retry: RetryPolicy::from(&config.retry_for("transcription")),
            analysis_retry: RetryPolicy::from(&config.retry_for("analysis")),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// Work accumulated before a failure, kept for the failure result.
#[derive(Default)]
struct Progress {
    transcript: Option<String>,
    warnings: Vec<String>,
}

struct StageError {
    stage: PipelineState,
    error: ProcessingError,
}

fn at(stage: PipelineState) -> impl FnOnce(ProcessingError) -> StageError {
    move |error| StageError { stage, error }
}

/// Drives a single job through the pipeline under its lock.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    locks: Arc<LockManager>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    collaborators: Collaborators,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<LockManager>,
        breaker: Arc<CircuitBreaker>,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            locks,
            breaker,
            retry: RetryExecutor::new(),
            collaborators,
            settings,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn lock_ttl(&self) -> Duration {
        self.settings.lock_ttl
    }

    fn enter(&self, job_id: JobId, state: PipelineState) {
        info!(job_id = %job_id, state = %state, "Pipeline state");
    }

    /// Process one job end to end, taking its lock first.
    ///
    /// With `owner_id` set, a job belonging to someone else is reported as
    /// not found. `force_reprocess` re-runs a completed job, reusing its
    /// stored transcript.
    pub async fn process_job(
        &self,
        job_id: JobId,
        owner_id: Option<OwnerId>,
        force_reprocess: bool,
    ) -> ProcessResult {
        self.enter(job_id, PipelineState::Initializing);
        let job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let err = ProcessingError::NotFound(format!("job {}", job_id));
                return ProcessResult::failed(job_id, PipelineState::Initializing, &err);
            }
            Err(e) => {
                let err = ProcessingError::from(e);
                error!(job_id = %job_id, error = %err, "Failed to load job");
                return ProcessResult::failed(job_id, PipelineState::Initializing, &err);
            }
        };
        if let Some(owner) = owner_id {
            if job.owner_id != owner {
                warn!(job_id = %job_id, owner_id = %owner, "Job requested by another owner");
                let err = ProcessingError::NotFound(format!("job {}", job_id));
                return ProcessResult::failed(job_id, PipelineState::Initializing, &err);
            }
        }

        self.enter(job_id, PipelineState::LockAcquisition);
        let ttl = self.settings.lock_ttl;
        let lease = if force_reprocess {
            self.locks.acquire_forced(job_id, ttl).await
        } else {
            self.locks.acquire(job_id, ttl).await
        };
        match lease {
            Some(lease) => self.process_leased(lease, force_reprocess).await,
            None => self.lock_unavailable(job_id, force_reprocess).await,
        }
    }

    /// Work out why the lock couldn't be taken.
    async fn lock_unavailable(&self, job_id: JobId, force_reprocess: bool) -> ProcessResult {
        let stage = PipelineState::LockAcquisition;
        match self.store.get(job_id).await {
            Ok(Some(job)) if job.is_completed() && !force_reprocess => {
                info!(job_id = %job_id, "Job already completed");
                ProcessResult::cached(job)
            }
            Ok(Some(job)) if job.is_locked(self.settings.lock_ttl, chrono::Utc::now()) => {
                info!(job_id = %job_id, "Job is being processed elsewhere");
                ProcessResult::failed(job_id, stage, &ProcessingError::LockConflict(job_id))
            }
            Ok(Some(_)) | Err(_) => {
                let err = ProcessingError::Persistence(format!(
                    "could not acquire lock on job {}",
                    job_id
                ));
                ProcessResult::failed(job_id, stage, &err)
            }
            Ok(None) => {
                let err = ProcessingError::NotFound(format!("job {}", job_id));
                ProcessResult::failed(job_id, stage, &err)
            }
        }
    }

    /// Process a job whose lock the caller already holds. The lease is
    /// released before returning.
    pub async fn process_leased(&self, lease: Lease, force_reprocess: bool) -> ProcessResult {
        let job = match self.store.get(lease.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let err = ProcessingError::NotFound(format!("job {}", lease.job_id));
                return ProcessResult::failed(lease.job_id, PipelineState::LockAcquisition, &err);
            }
            Err(e) => {
                let stage = StageError {
                    stage: PipelineState::LockAcquisition,
                    error: e.into(),
                };
                return self.fail(&lease, stage, Progress::default()).await;
            }
        };

        if job.is_completed() && !force_reprocess {
            info!(job_id = %job.id, "Job completed while waiting for the lock");
            if let Err(e) = self.locks.release(&lease).await {
                warn!(job_id = %job.id, error = %e, "Failed to release lock");
            }
            return ProcessResult::cached(job);
        }

        let mut progress = Progress::default();
        match self.run_stages(&lease, &job, &mut progress).await {
            Ok(result) => result,
            Err(stage) => self.fail(&lease, stage, progress).await,
        }
    }

    async fn run_stages(
        &self,
        lease: &Lease,
        job: &Job,
        progress: &mut Progress,
    ) -> std::result::Result<ProcessResult, StageError> {
        self.enter(job.id, PipelineState::Transcription);
        let transcript = match &job.transcript {
            Some(existing) => {
                info!(job_id = %job.id, "Reusing stored transcript");
                existing.clone()
            }
            None => {
                let transcript = self
                    .transcribe(job)
                    .await
                    .map_err(at(PipelineState::Transcription))?;
                self.store
                    .save_transcript(job.id, lease.generation, &transcript)
                    .await
                    .map_err(|e| StageError {
                        stage: PipelineState::Transcription,
                        error: e.into(),
                    })?;
                transcript
            }
        };
        progress.transcript = Some(transcript.clone());

        self.enter(job.id, PipelineState::Analysis);
        let context = match self.collaborators.knowledge.context_for(job.owner_id).await {
            Ok(context) => context,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Owner context unavailable, analyzing without it");
                progress
                    .warnings
                    .push(format!("owner context unavailable: {}", e));
                OwnerContext::empty(job.owner_id)
            }
        };
        let analyzer = &self.collaborators.analyzer;
        let analysis = self
            .call_provider(analyzer.name(), &self.settings.analysis_retry, || {
                analyzer.analyze(&transcript, &context)
            })
            .await
            .map_err(at(PipelineState::Analysis))?;

        self.enter(job.id, PipelineState::Saving);
        self.store
            .complete(job.id, lease.generation, &transcript, &analysis)
            .await
            .map_err(|e| StageError {
                stage: PipelineState::Saving,
                error: e.into(),
            })?;
        if let Err(e) = self.locks.release(lease).await {
            warn!(job_id = %job.id, error = %e, "Failed to release lock after completion");
            progress.warnings.push(format!("lock release failed: {}", e));
        }

        if let Err(e) = self
            .collaborators
            .knowledge
            .record_analysis(job.owner_id, &analysis)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to update owner context");
            progress
                .warnings
                .push(format!("owner context update failed: {}", e));
        }

        self.enter(job.id, PipelineState::Completed);
        Ok(
            ProcessResult::completed(job.id, transcript, analysis)
                .with_warnings(std::mem::take(&mut progress.warnings)),
        )
    }

    async fn transcribe(&self, job: &Job) -> Result<String> {
        let payload = self.collaborators.storage.fetch(&job.payload_ref).await?;
        let transcriber = &self.collaborators.transcriber;
        self.call_provider(
            transcriber.name(),
            &self.settings.transcription_retry,
            || transcriber.transcribe(&payload),
        )
        .await
    }

    /// Retried call, with the whole retry sequence counting as one outcome
    /// for the provider's circuit.
    async fn call_provider<T, F, Fut>(
        &self,
        key: &str,
        policy: &RetryPolicy,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = &self.retry;
        self.breaker
            .execute(key, move || async move {
                let outcome = retry.with_retry(policy, None, operation).await;
                if outcome.attempts > 1 {
                    info!(
                        provider = key,
                        attempts = outcome.attempts,
                        total_delay_ms = outcome.total_delay.as_millis() as u64,
                        success = outcome.result.is_ok(),
                        "Provider call needed retries"
                    );
                }
                outcome.result
            })
            .await
    }

    async fn fail(&self, lease: &Lease, failure: StageError, progress: Progress) -> ProcessResult {
        let StageError { stage, error: err } = failure;
        let category = classify(&err).category;
        let mut warnings = progress.warnings;
        error!(
            job_id = %lease.job_id,
            stage = %stage,
            category = %category,
            error = %err,
            "Job failed"
        );

        let released = if err.is_non_fatal() {
            self.locks.release(lease).await
        } else {
            self.locks
                .release_with_error(lease, &err.to_string(), category)
                .await
        };
        if let Err(e) = released {
            warn!(job_id = %lease.job_id, error = %e, "Failed to release lock after failure");
            warnings.push(format!("lock release failed: {}", e));
        }

        let mut result = ProcessResult::failed(lease.job_id, stage, &err).with_warnings(warnings);
        result.transcript = progress.transcript;
        result
    }
}
