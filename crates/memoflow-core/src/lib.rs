//! Core domain types and traits for memoflow.
//!
//! This crate contains:
//! - Job and owner identifiers
//! - The job record and its scheduling order
//! - Analysis results and accumulated owner context
//! - The processing error taxonomy and its classifier
//! - Collaborator traits (transcription, analysis, payload storage, knowledge)

pub mod analysis;
pub mod classify;
pub mod error;
pub mod id;
pub mod job;
pub mod provider;

pub use analysis::{AnalysisResult, OwnerContext};
pub use classify::{Classification, ErrorCategory, ErrorClassifier};
pub use error::{ProcessingError, Result};
pub use id::{JobId, OwnerId};
pub use job::{Job, NewJob};
