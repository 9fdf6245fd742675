//! Provider backends for memoflow.
//!
//! - HTTP transcription and analysis clients
//! - Filesystem payload storage

pub mod analysis;
mod http;
pub mod storage;
pub mod transcription;

pub use analysis::HttpAnalysisProvider;
pub use storage::FsPayloadStorage;
pub use transcription::HttpTranscriptionProvider;

pub use memoflow_core::provider::{
    AnalysisProvider, KnowledgeStore, Payload, PayloadStorage, TranscriptionProvider,
};
