//! Collaborator traits.
//!
//! The pipeline talks to four external collaborators: the payload storage
//! that holds audio bytes, the transcription and analysis providers, and the
//! knowledge store that accumulates context per owner. Implementations are
//! expected to report failures as typed [`ProcessingError`] variants so the
//! classifier doesn't have to guess from message text.
//!
//! [`ProcessingError`]: crate::ProcessingError

use async_trait::async_trait;
use bytes::Bytes;

use crate::analysis::{AnalysisResult, OwnerContext};
use crate::id::OwnerId;
use crate::Result;

/// Raw audio payload.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Bytes,
    pub content_type: String,
}

impl Payload {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Fetches audio payloads by reference.
#[async_trait]
pub trait PayloadStorage: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<Payload>;
}

/// Speech-to-text.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Name used as the circuit breaker key and in logs.
    fn name(&self) -> &'static str;

    async fn transcribe(&self, payload: &Payload) -> Result<String>;
}

/// Transcript analysis.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Name used as the circuit breaker key and in logs.
    fn name(&self) -> &'static str;

    async fn analyze(&self, transcript: &str, context: &OwnerContext) -> Result<AnalysisResult>;
}

/// Accumulated per-owner context.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Context for an owner; an owner with no history gets an empty context.
    async fn context_for(&self, owner_id: OwnerId) -> Result<OwnerContext>;

    /// Fold a finished analysis into the owner's context.
    async fn record_analysis(&self, owner_id: OwnerId, analysis: &AnalysisResult) -> Result<()>;
}
