//! Repository traits and implementations.

pub mod job;
pub mod knowledge;
pub mod memory;

pub use job::{JobRecord, JobStats, JobStore, PgJobStore};
pub use knowledge::PgKnowledgeStore;
pub use memory::{InMemoryJobStore, InMemoryKnowledgeStore};
