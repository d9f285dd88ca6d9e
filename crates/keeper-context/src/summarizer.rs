//! Summarization of older history.
//!
//! [`LlmSummarizer`] asks a completion backend for a plain-text summary.
//! [`fallback_summary`] is the deterministic local replacement used when
//! no backend is wired up or the call fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keeper_core::Message;
use keeper_llm::{CompletionOptions, CompletionProvider, ProviderError, with_timeout};
use keeper_settings::ContextSettings;
use thiserror::Error;

use crate::constants::SUMMARIZER_SYSTEM_PROMPT;

/// Errors that can occur during summarization.
#[derive(Debug, Error)]
pub enum SummarizerError {
    /// The completion call failed or timed out.
    #[error("summarizer call failed: {0}")]
    Provider(#[from] ProviderError),

    /// The backend answered with nothing usable.
    #[error("summarizer returned an empty summary")]
    Empty,
}

/// Condenses a run of messages into one summary string.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `messages`, oldest first.
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummarizerError>;
}

/// Summarizer backed by a [`CompletionProvider`] in plain-text mode.
pub struct LlmSummarizer {
    provider: Arc<dyn CompletionProvider>,
    options: CompletionOptions,
    timeout: Duration,
}

impl LlmSummarizer {
    /// Create a summarizer with explicit output cap, temperature and deadline.
    pub fn new(provider: Arc<dyn CompletionProvider>, max_tokens: u32, temperature: f32, timeout: Duration) -> Self {
        Self {
            provider,
            options: CompletionOptions::text(max_tokens, temperature),
            timeout,
        }
    }

    /// Build from validated settings.
    pub fn from_settings(provider: Arc<dyn CompletionProvider>, settings: &ContextSettings) -> Self {
        Self::new(
            provider,
            settings.summary_max_tokens,
            settings.summary_temperature,
            Duration::from_millis(settings.call_timeout_ms),
        )
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummarizerError> {
        let request = [
            Message::system(SUMMARIZER_SYSTEM_PROMPT),
            Message::user(transcript(messages)),
        ];
        let completion = with_timeout(self.timeout, self.provider.complete(&request, &self.options)).await?;
        let summary = completion.content.trim();
        if summary.is_empty() {
            return Err(SummarizerError::Empty);
        }
        Ok(summary.to_owned())
    }
}

/// `role: content` lines, oldest first.
pub fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Each message's role and its first `snippet_chars` characters, one per line.
pub fn fallback_summary(messages: &[Message], snippet_chars: usize) -> String {
    messages
        .iter()
        .map(|m| {
            let snippet: String = m.content.chars().take(snippet_chars).collect();
            let ellipsis = if m.content.chars().nth(snippet_chars).is_some() { "..." } else { "" };
            format!("{}: {}{ellipsis}", m.role.as_str(), snippet.trim_end())
        })
        .collect::<Vec<_>>()
        .join("\n")
}
