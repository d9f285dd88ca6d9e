//! Completion capability.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use keeper_core::Message;
use serde::{Deserialize, Serialize};

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during a completion call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No backend is wired up.
    #[error("no completion backend configured")]
    NotConfigured,

    /// The call did not finish within its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Rate limited by the backend.
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested retry delay in milliseconds.
        retry_after_ms: u64,
    },

    /// The backend returned an API error.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP-style status code.
        status: u16,
        /// Error description.
        message: String,
    },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Error category string for logs and events.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotConfigured => "config",
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limit",
            Self::Api { .. } => "api",
            Self::Json(_) => "parse",
            Self::Other(_) => "unknown",
        }
    }
}

/// Requested output shape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// Free text.
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
}

/// Per-call options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOptions {
    /// Output token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Output shape.
    pub response_format: ResponseFormat,
}

impl CompletionOptions {
    /// Plain-text output capped at `max_tokens`.
    #[must_use]
    pub fn text(max_tokens: u32, temperature: f32) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
            response_format: ResponseFormat::Text,
        }
    }

    /// Structured JSON output.
    #[must_use]
    pub fn json() -> Self {
        Self {
            response_format: ResponseFormat::Json,
            ..Self::default()
        }
    }
}

/// A completed response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Response text.
    pub content: String,
}

/// Chat completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Complete the conversation in `messages`.
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> ProviderResult<Completion>;
}

/// Run `fut`, failing with [`ProviderError::Timeout`] after `limit`.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> ProviderResult<T>
where
    F: Future<Output = ProviderResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(ProviderError::Timeout(limit)))
}
