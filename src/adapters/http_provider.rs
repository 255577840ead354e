//! HTTP Compute Provider Adapter
//!
//! Implements the `ComputeCapability` port against a vision-analysis
//! endpoint: the encoded image is POSTed as `application/octet-stream` and
//! the response body is an `AnalysisResult` JSON document.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, instrument, warn};

use crate::domain::ports::{AnalysisResult, ComputeCapability};
use crate::error::{Error, Result};

/// Configuration for an HTTP analysis provider
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Provenance name ("openai", "gemini", ...)
    pub name: String,
    /// Analysis endpoint URL
    pub endpoint: String,
    /// Bearer token, if the endpoint requires one
    pub api_key: Option<String>,
    /// Request timeout
    pub request_timeout: Duration,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            name: "http".to_string(),
            endpoint: "http://localhost:8000/analyze".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// `ComputeCapability` backed by an HTTP endpoint
pub struct HttpComputeProvider {
    config: HttpProviderConfig,
    client: Client,
}

impl std::fmt::Debug for HttpComputeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpComputeProvider")
            .field("name", &self.config.name)
            .field("endpoint", &self.config.endpoint)
            .field("authenticated", &self.config.api_key.is_some())
            .finish()
    }
}

impl HttpComputeProvider {
    /// Create a new provider
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpProviderConfig {
        &self.config
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::ComputeTimeout {
                timeout: self.config.request_timeout,
            }
        } else {
            Error::compute_failed(&self.config.name, e.to_string())
        }
    }
}

/// Map a non-success status to a failure reason
fn status_reason(status: StatusCode, body: &str) -> String {
    let detail: String = body.trim().chars().take(200).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => format!("rate limited (429): {}", detail),
        s if s.is_server_error() => format!("provider error ({}): {}", s.as_u16(), detail),
        s => format!("rejected ({}): {}", s.as_u16(), detail),
    }
}

#[async_trait]
impl ComputeCapability for HttpComputeProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, image), fields(provider = %self.config.name, size = image.len()))]
    async fn compute(&self, image: Bytes) -> Result<AnalysisResult> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(image);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Analysis request failed");
            return Err(Error::compute_failed(
                &self.config.name,
                status_reason(status, &body),
            ));
        }

        let mut result: AnalysisResult = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                Error::compute_failed(&self.config.name, format!("invalid response body: {}", e))
            }
        })?;
        if result.provider.is_empty() {
            result.provider = self.config.name.clone();
        }

        debug!(equipment = %result.equipment_name, "Analysis received");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_config_defaults() {
        let config = HttpProviderConfig::default();
        assert_eq!(config.name, "http");
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_status_reason() {
        assert!(status_reason(StatusCode::TOO_MANY_REQUESTS, "slow down").contains("rate limited"));
        assert!(status_reason(StatusCode::BAD_GATEWAY, "").contains("502"));
        assert!(status_reason(StatusCode::BAD_REQUEST, "bad image").contains("rejected (400)"));

        let long = "x".repeat(1000);
        assert!(status_reason(StatusCode::INTERNAL_SERVER_ERROR, &long).len() < 300);
    }

    #[test]
    fn test_debug_hides_api_key() {
        let provider = HttpComputeProvider::new(HttpProviderConfig {
            api_key: Some("secret-token".to_string()),
            ..HttpProviderConfig::default()
        })
        .unwrap();
        let debug = format!("{:?}", provider);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("authenticated: true"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_compute_failure() {
        let provider = HttpComputeProvider::new(HttpProviderConfig {
            name: "local".to_string(),
            // reserved port, nothing listens here
            endpoint: "http://127.0.0.1:9/analyze".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(2),
        })
        .unwrap();

        let result = provider.compute(Bytes::from_static(b"jpeg")).await;
        assert_matches!(
            result,
            Err(Error::ComputeFailed { .. }) | Err(Error::ComputeTimeout { .. })
        );
    }
}
