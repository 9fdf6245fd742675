//! Analysis results and accumulated owner context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::OwnerId;

/// Maximum number of topics remembered per owner.
pub const MAX_CONTEXT_TOPICS: usize = 20;
/// Maximum length (in chars) of the rolling owner summary.
pub const MAX_CONTEXT_SUMMARY_CHARS: usize = 4000;

/// Structured output of the analysis provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    /// Provider-specific fields we keep but don't interpret.
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Knowledge accumulated for an owner across recordings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerContext {
    pub owner_id: OwnerId,
    pub summary: String,
    pub recent_topics: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl OwnerContext {
    pub fn empty(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            summary: String::new(),
            recent_topics: Vec::new(),
            updated_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.recent_topics.is_empty()
    }

    /// Fold a new analysis into the context.
    ///
    /// Newest topics come first and duplicates are dropped; the summary keeps
    /// its most recent tail.
    pub fn absorb(&mut self, analysis: &AnalysisResult, now: DateTime<Utc>) {
        let mut topics: Vec<String> = Vec::with_capacity(MAX_CONTEXT_TOPICS);
        for topic in analysis.topics.iter().chain(self.recent_topics.iter()) {
            let topic = topic.trim();
            if topic.is_empty() || topics.iter().any(|t| t.eq_ignore_ascii_case(topic)) {
                continue;
            }
            topics.push(topic.to_string());
            if topics.len() == MAX_CONTEXT_TOPICS {
                break;
            }
        }
        self.recent_topics = topics;

        let summary = analysis.summary.trim();
        if !summary.is_empty() && !self.summary.lines().any(|line| line == summary) {
            if !self.summary.is_empty() {
                self.summary.push('\n');
            }
            self.summary.push_str(summary);
        }
        let len = self.summary.chars().count();
        if len > MAX_CONTEXT_SUMMARY_CHARS {
            self.summary = self
                .summary
                .chars()
                .skip(len - MAX_CONTEXT_SUMMARY_CHARS)
                .collect();
        }
        self.updated_at = Some(now);
    }
}
