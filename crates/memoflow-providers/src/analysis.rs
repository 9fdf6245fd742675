//! HTTP transcript analysis client.

use async_trait::async_trait;
use memoflow_config::{EndpointSettings, ProviderSettings};
use memoflow_core::provider::AnalysisProvider;
use memoflow_core::{AnalysisResult, ErrorCategory, OwnerContext, ProcessingError, Result};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::http;

#[derive(Debug, Serialize)]
struct AnalysisRequest<'a> {
    transcript: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    context: ContextBody<'a>,
}

#[derive(Debug, Serialize)]
struct ContextBody<'a> {
    summary: &'a str,
    recent_topics: &'a [String],
}

/// Sends the transcript plus the owner's accumulated context and expects an
/// [`AnalysisResult`] as JSON.
pub struct HttpAnalysisProvider {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpAnalysisProvider {
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        api_key: Option<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            api_key,
            model,
        }
    }

    pub fn from_settings(endpoint: &EndpointSettings, providers: &ProviderSettings) -> Result<Self> {
        let url = Url::parse(&endpoint.url).map_err(|e| {
            ProcessingError::provider(
                ErrorCategory::Other,
                format!("invalid analysis url '{}': {}", endpoint.url, e),
            )
        })?;
        Ok(Self::new(
            http::build_client(providers.timeout),
            url,
            endpoint.api_key(),
            endpoint.model.clone(),
        ))
    }

    fn request_body<'a>(&'a self, transcript: &'a str, context: &'a OwnerContext) -> AnalysisRequest<'a> {
        AnalysisRequest {
            transcript,
            model: self.model.as_deref(),
            context: ContextBody {
                summary: &context.summary,
                recent_topics: &context.recent_topics,
            },
        }
    }
}

#[async_trait]
impl AnalysisProvider for HttpAnalysisProvider {
    fn name(&self) -> &'static str {
        "analysis"
    }

    async fn analyze(&self, transcript: &str, context: &OwnerContext) -> Result<AnalysisResult> {
        let request = self
            .client
            .post(self.endpoint.clone())
            .header("Accept", "application/json")
            .json(&self.request_body(transcript, context));
        let request = http::with_auth(request, self.api_key.as_deref());

        debug!(
            chars = transcript.len(),
            context_topics = context.recent_topics.len(),
            "Analyzing transcript"
        );
        let response = http::send(self.name(), request).await?;
        response
            .json::<AnalysisResult>()
            .await
            .map_err(|e| http::request_error(self.name(), e))
    }
}
