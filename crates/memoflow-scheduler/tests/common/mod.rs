#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use memoflow_config::worker::DEFAULT_RETRY_KEY;
use memoflow_config::{RetrySettings, WorkerConfig};
use memoflow_core::provider::{AnalysisProvider, Payload, PayloadStorage, TranscriptionProvider};
use memoflow_core::{
    AnalysisResult, ErrorCategory, Job, JobId, NewJob, OwnerContext, OwnerId, ProcessingError,
    Result,
};
use memoflow_db::{InMemoryJobStore, InMemoryKnowledgeStore, JobStore};
use memoflow_scheduler::{BatchScheduler, CircuitBreaker, Collaborators, Orchestrator, build_scheduler};

/// Payloads keyed by reference; the bytes are the reference itself.
#[derive(Default)]
pub struct MemoryStorage {
    missing: Mutex<Vec<String>>,
}

impl MemoryStorage {
    pub fn mark_missing(&self, reference: &str) {
        self.missing.lock().unwrap().push(reference.to_string());
    }
}

#[async_trait]
impl PayloadStorage for MemoryStorage {
    async fn fetch(&self, reference: &str) -> Result<Payload> {
        if self.missing.lock().unwrap().iter().any(|r| r == reference) {
            return Err(ProcessingError::NotFound(format!("payload {}", reference)));
        }
        Ok(Payload::new(reference.as_bytes().to_vec(), "audio/wav"))
    }
}

/// Transcriber that replays scripted failures, then transcribes by echoing
/// the payload reference.
#[derive(Default)]
pub struct ScriptedTranscriber {
    script: Mutex<VecDeque<ProcessingError>>,
    always_fail: Mutex<Option<ProcessingError>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedTranscriber {
    pub fn fail_next(&self, errors: impl IntoIterator<Item = ProcessingError>) {
        self.script.lock().unwrap().extend(errors);
    }

    pub fn fail_always(&self, error: ProcessingError) {
        *self.always_fail.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.always_fail.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Payload references in call order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TranscriptionProvider for ScriptedTranscriber {
    fn name(&self) -> &'static str {
        "transcription"
    }

    async fn transcribe(&self, payload: &Payload) -> Result<String> {
        let reference = String::from_utf8_lossy(&payload.bytes).to_string();
        self.seen.lock().unwrap().push(reference.clone());
        if let Some(err) = self.always_fail.lock().unwrap().clone() {
            return Err(err);
        }
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(format!("transcript of {}", reference))
    }
}

/// Analyzer that replays scripted failures, then summarises the transcript.
#[derive(Default)]
pub struct ScriptedAnalyzer {
    script: Mutex<VecDeque<ProcessingError>>,
    calls: Mutex<Vec<(String, OwnerContext)>>,
}

impl ScriptedAnalyzer {
    pub fn fail_next(&self, errors: impl IntoIterator<Item = ProcessingError>) {
        self.script.lock().unwrap().extend(errors);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_context(&self) -> Option<OwnerContext> {
        self.calls.lock().unwrap().last().map(|(_, c)| c.clone())
    }
}

#[async_trait]
impl AnalysisProvider for ScriptedAnalyzer {
    fn name(&self) -> &'static str {
        "analysis"
    }

    async fn analyze(&self, transcript: &str, context: &OwnerContext) -> Result<AnalysisResult> {
        self.calls
            .lock()
            .unwrap()
            .push((transcript.to_string(), context.clone()));
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(AnalysisResult {
            summary: format!("summary: {}", transcript),
            topics: vec!["memo".to_string()],
            ..Default::default()
        })
    }
}

pub fn timeout() -> ProcessingError {
    ProcessingError::provider(ErrorCategory::Timeout, "request timed out")
}

pub fn auth() -> ProcessingError {
    ProcessingError::provider(ErrorCategory::Auth, "401 Unauthorized: invalid api key")
}

pub fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.lock.ttl = Duration::from_secs(60);
    config.lock.grace = Duration::from_secs(30);
    config.scheduler.base_delay = Duration::from_millis(10);
    config.scheduler.max_delay = Duration::from_millis(100);
    config.circuit_breaker.threshold = 3;
    config.retry.insert(
        DEFAULT_RETRY_KEY.to_string(),
        RetrySettings {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: Duration::ZERO,
            retryable: ErrorCategory::default_retryable(),
        },
    );
    config
}

pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub knowledge: Arc<InMemoryKnowledgeStore>,
    pub storage: Arc<MemoryStorage>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub scheduler: Arc<BatchScheduler>,
    pub owner: OwnerId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        let store = InMemoryJobStore::arc();
        let knowledge = Arc::new(InMemoryKnowledgeStore::new());
        let storage = Arc::new(MemoryStorage::default());
        let transcriber = Arc::new(ScriptedTranscriber::default());
        let analyzer = Arc::new(ScriptedAnalyzer::default());
        let collaborators = Collaborators {
            storage: storage.clone(),
            transcriber: transcriber.clone(),
            analyzer: analyzer.clone(),
            knowledge: knowledge.clone(),
        };
        let scheduler = build_scheduler(&config, store.clone(), collaborators);
        Self {
            store,
            knowledge,
            storage,
            transcriber,
            analyzer,
            scheduler,
            owner: OwnerId::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        self.scheduler.orchestrator()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.orchestrator().breaker()
    }

    pub async fn enqueue(&self, payload_ref: &str) -> Job {
        self.store
            .enqueue(NewJob::new(self.owner, payload_ref))
            .await
            .unwrap()
    }

    pub fn job(&self, id: JobId) -> Job {
        self.store.peek(id).unwrap()
    }

    /// Pretend the job's lock was taken `secs` ago.
    pub fn backdate_lock(&self, id: JobId, secs: i64) {
        let mut job = self.job(id);
        job.locked_at = Some(chrono::Utc::now() - chrono::Duration::seconds(secs));
        self.store.insert(job);
    }
}
