//! HTTP speech-to-text client.

use async_trait::async_trait;
use memoflow_config::{EndpointSettings, ProviderSettings};
use memoflow_core::provider::{Payload, TranscriptionProvider};
use memoflow_core::{ErrorCategory, ProcessingError, Result};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::http;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Posts the raw audio to the endpoint and reads `{"text": ...}` back.
pub struct HttpTranscriptionProvider {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpTranscriptionProvider {
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
                format!("invalid transcription url '{}': {}", endpoint.url, e),
            )
        })?;
        Ok(Self::new(
            http::build_client(providers.timeout),
            url,
            endpoint.api_key(),
            endpoint.model.clone(),
        ))
    }
}

#[async_trait]
impl TranscriptionProvider for HttpTranscriptionProvider {
    fn name(&self) -> &'static str {
        "transcription"
    }

    async fn transcribe(&self, payload: &Payload) -> Result<String> {
        if payload.is_empty() {
            return Err(ProcessingError::provider(
                ErrorCategory::Other,
                "refusing to transcribe an empty payload",
            ));
        }

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", payload.content_type.as_str())
            .header("Accept", "application/json")
            .body(payload.bytes.clone());
        if let Some(model) = &self.model {
            request = request.query(&[("model", model.as_str())]);
        }
        let request = http::with_auth(request, self.api_key.as_deref());

        debug!(bytes = payload.len(), endpoint = %self.endpoint, "Transcribing payload");
        let response = http::send(self.name(), request).await?;
        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| http::request_error(self.name(), e))?;
        Ok(body.text)
    }
}
