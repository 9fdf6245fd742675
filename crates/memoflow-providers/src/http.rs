//! Shared HTTP plumbing: client construction and error mapping.

use std::time::Duration;

use memoflow_core::{ErrorCategory, ProcessingError};
use reqwest::{RequestBuilder, Response, StatusCode};

/// Longest response body excerpt carried into an error message.
const MAX_ERROR_BODY: usize = 512;

pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("memoflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

pub(crate) fn with_auth(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request.header("Authorization", format!("Bearer {}", key)),
        None => request,
    }
}

/// Map a transport-level failure to a typed error.
pub(crate) fn request_error(provider: &str, err: reqwest::Error) -> ProcessingError {
    let category = if err.is_timeout() {
        ErrorCategory::Timeout
    } else if err.is_connect() || err.is_request() {
        ErrorCategory::Network
    } else if err.is_decode() || err.is_body() {
        ErrorCategory::Provider
    } else {
        ErrorCategory::Other
    };
    ProcessingError::provider(category, format!("{}: {}", provider, err))
}

/// Map a non-success status to a typed error.
pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str) -> ProcessingError {
    let excerpt: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = format!("{} returned {}: {}", provider, status, excerpt);
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ProcessingError::service_unavailable(message)
        }
        StatusCode::TOO_MANY_REQUESTS => ProcessingError::provider(ErrorCategory::RateLimited, message),
        StatusCode::REQUEST_TIMEOUT => ProcessingError::provider(ErrorCategory::Timeout, message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProcessingError::provider(ErrorCategory::Auth, message)
        }
        StatusCode::NOT_FOUND => ProcessingError::provider(ErrorCategory::NotFound, message),
        s if s.is_server_error() => ProcessingError::provider(ErrorCategory::Provider, message),
        _ => ProcessingError::provider(ErrorCategory::Other, message),
    }
}

/// Send a request and return the response if it succeeded.
pub(crate) async fn send(provider: &str, request: RequestBuilder) -> Result<Response, ProcessingError> {
    let response = request
        .send()
        .await
        .map_err(|e| request_error(provider, e))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(status_error(provider, status, &text));
    }
    Ok(response)
}
