//! Compression engine for fitting context into the token budget.
//!
//! ## Cascade
//!
//! Nothing changes at or below 80%. Above it, each stage runs only while the
//! payload still exceeds its threshold:
//!
//! 1. **Summarization** (above 90%): replace everything but the most recent
//!    messages with one synthetic summary message. Messages already marked
//!    `extracted` are kept as they are and never fed back to the summarizer.
//!    Without a working summarizer a local role+snippet digest is used.
//! 2. **Hard limit** (above 95% before or after stage 1): fold summaries
//!    into working memory, keep only the last few real messages, trim
//!    retrieved facts to their share of the ceiling, and fit working memory
//!    into what remains.
//!
//! Tier 0 is copied through unchanged. The single exception is stage 2
//! finding Tier 0 larger than the whole ceiling: it is then cut with a
//! visible marker and a warning.

use std::sync::Arc;

use keeper_core::Message;
use keeper_settings::ContextSettings;
use keeper_tokens::TokenEstimator;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::budget::{BudgetAllocator, BudgetStatus};
use crate::constants::{SUMMARY_PREFIX, TRUNCATION_MARKER};
use crate::summarizer::{Summarizer, fallback_summary};

/// A compression step that changed the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompressionAction {
    /// Retrieved facts were cut to their budget share.
    RetrievedTrimmed,
    /// Older history was replaced by a model-written summary.
    Summarized,
    /// Older history was replaced by the local fallback digest.
    FallbackSummary,
    /// The history window was shrunk to the hard-limit keep count.
    WindowShrunk,
    /// Working memory was cut to the space left after everything else.
    WorkingMemoryTrimmed,
    /// Tier 0 alone exceeded the ceiling and was cut.
    CanonTruncated,
}

/// Output of [`CompressionEngine::compress`].
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedContext {
    /// Tier 0 text.
    pub system_prompt: String,
    /// Tier 1 text, possibly carrying a folded-in summary.
    pub working_memory: String,
    /// Tier 2 text.
    pub retrieved: String,
    /// Tier 3 messages, oldest first.
    pub messages: Vec<Message>,
    /// Budget of the returned payload.
    pub status: BudgetStatus,
    /// Summary produced by this call, if any.
    pub summary: Option<String>,
    /// Steps that ran, in order.
    pub actions: Vec<CompressionAction>,
}

impl CompressedContext {
    /// Whether any step changed the input.
    #[must_use]
    pub fn was_compressed(&self) -> bool {
        !self.actions.is_empty()
    }
}

/// Tunables for the cascade.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressionConfig {
    /// Trailing messages kept verbatim by summarization.
    pub recent_keep_count: usize,
    /// Trailing messages kept at the hard limit.
    pub hard_limit_keep_count: usize,
    /// Retrieved facts' share of the ceiling.
    pub retrieved_share: f64,
    /// Characters per message in the fallback digest.
    pub fallback_snippet_chars: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            recent_keep_count: 10,
            hard_limit_keep_count: 5,
            retrieved_share: 0.15,
            fallback_snippet_chars: 150,
        }
    }
}

impl CompressionConfig {
    /// Extract the compression fields from validated settings.
    #[must_use]
    pub fn from_settings(settings: &ContextSettings) -> Self {
        Self {
            recent_keep_count: settings.recent_keep_count,
            hard_limit_keep_count: settings.hard_limit_keep_count,
            retrieved_share: settings.retrieved_share,
            fallback_snippet_chars: settings.fallback_snippet_chars,
        }
    }
}

/// Runs the compression cascade.
pub struct CompressionEngine {
    allocator: BudgetAllocator,
    config: CompressionConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
}

struct Payload {
    tier0: String,
    tier1: String,
    tier2: String,
    messages: Vec<Message>,
}

impl CompressionEngine {
    /// Create an engine with no summarizer (fallback digests only).
    pub fn new(allocator: BudgetAllocator, config: CompressionConfig) -> Self {
        Self {
            allocator,
            config,
            summarizer: None,
        }
    }

    /// Build allocator and config from validated settings.
    pub fn from_settings(settings: &ContextSettings, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self::new(
            BudgetAllocator::from_settings(settings, estimator),
            CompressionConfig::from_settings(settings),
        )
    }

    /// Use `summarizer` for stage 1.
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// The allocator used for every measurement.
    pub fn allocator(&self) -> &BudgetAllocator {
        &self.allocator
    }

    /// Fit the four tiers into the budget.
    ///
    /// Never fails. Under the compression threshold the input is returned
    /// unchanged and nothing external is called.
    pub async fn compress(&self, tier0: &str, tier1: &str, tier2: &str, messages: &[Message]) -> CompressedContext {
        let initial = self.allocator.status(tier0, tier1, tier2, messages);
        let mut payload = Payload {
            tier0: tier0.to_owned(),
            tier1: tier1.to_owned(),
            tier2: tier2.to_owned(),
            messages: messages.to_vec(),
        };
        if !initial.needs_compression {
            return payload.finish(initial, None, Vec::new());
        }

        let mut actions = Vec::new();
        let mut summary = None;
        let mut status = initial.clone();

        if status.needs_summarization {
            if let Some((text, action)) = self.summarize_older(&mut payload.messages).await {
                summary = Some(text);
                actions.push(action);
                status = self.measure(&payload);
            }
        }

        if initial.at_hard_limit || status.at_hard_limit {
            self.enforce_hard_limit(&mut payload, &mut actions);
            status = self.measure(&payload);
        }

        info!(
            tokens_before = initial.total_tokens,
            tokens_after = status.total_tokens,
            max_tokens = status.max_tokens,
            ?actions,
            "context compressed"
        );
        payload.finish(status, summary, actions)
    }

    fn measure(&self, p: &Payload) -> BudgetStatus {
        self.allocator.status(&p.tier0, &p.tier1, &p.tier2, &p.messages)
    }

    /// `Some(cut text)` if `text` exceeds `budget` tokens.
    fn fit(&self, text: &str, budget: usize) -> Option<String> {
        let estimator = self.allocator.estimator();
        if estimator.estimate(text) <= budget {
            return None;
        }
        let keep = budget.saturating_sub(estimator.estimate(TRUNCATION_MARKER));
        if keep == 0 {
            return Some(String::new());
        }
        Some(format!("{}{TRUNCATION_MARKER}", estimator.truncate(text, keep)))
    }

    async fn summarize_older(&self, messages: &mut Vec<Message>) -> Option<(String, CompressionAction)> {
        let split = messages.len().saturating_sub(self.config.recent_keep_count);
        if split == 0 {
            return None;
        }
        let recent = messages.split_off(split);
        let (prior, older): (Vec<Message>, Vec<Message>) = messages.drain(..).partition(|m| m.extracted);
        if older.is_empty() {
            messages.extend(prior);
            messages.extend(recent);
            return None;
        }

        let (text, action) = match &self.summarizer {
            Some(summarizer) => match summarizer.summarize(&older).await {
                Ok(text) => (text, CompressionAction::Summarized),
                Err(e) => {
                    warn!(error = %e, messages = older.len(), "summarization failed, using fallback digest");
                    (self.fallback(&older), CompressionAction::FallbackSummary)
                }
            },
            None => {
                warn!(messages = older.len(), "no summarizer configured, using fallback digest");
                (self.fallback(&older), CompressionAction::FallbackSummary)
            }
        };

        debug!(summarized = older.len(), kept = recent.len(), "history summarized");
        messages.extend(prior);
        messages.push(Message::summary(format!("{SUMMARY_PREFIX}{text}")));
        messages.extend(recent);
        Some((text, action))
    }

    fn fallback(&self, older: &[Message]) -> String {
        fallback_summary(older, self.config.fallback_snippet_chars)
    }

    fn enforce_hard_limit(&self, p: &mut Payload, actions: &mut Vec<CompressionAction>) {
        let estimator = self.allocator.estimator();
        let max_tokens = self.allocator.max_tokens();

        let (synthetic, mut real): (Vec<Message>, Vec<Message>) =
            std::mem::take(&mut p.messages).into_iter().partition(|m| m.extracted);
        if !synthetic.is_empty() {
            let folded: Vec<&str> = synthetic.iter().map(|m| m.content.as_str()).collect();
            p.tier1 = join_blocks(&[p.tier1.as_str(), folded.join("\n\n").as_str()]);
        }
        let keep = self.config.hard_limit_keep_count;
        if real.len() > keep {
            let _ = real.drain(..real.len() - keep);
            actions.push(CompressionAction::WindowShrunk);
        }
        p.messages = real;

        let retrieved_budget = self.allocator.share_of_budget(self.config.retrieved_share);
        if let Some(trimmed) = self.fit(&p.tier2, retrieved_budget) {
            p.tier2 = trimmed;
            actions.push(CompressionAction::RetrievedTrimmed);
        }

        let canon_tokens = estimator.estimate(&p.tier0);
        if canon_tokens > max_tokens {
            warn!(
                canon_tokens,
                max_tokens,
                "protected canon alone exceeds the context budget, truncating"
            );
            if let Some(cut) = self.fit(&p.tier0, max_tokens) {
                p.tier0 = cut;
            }
            actions.push(CompressionAction::CanonTruncated);
        }

        let used = estimator.estimate(&p.tier0)
            + estimator.estimate(&p.tier2)
            + estimator.estimate_messages(&p.messages);
        let remaining = max_tokens.saturating_sub(used);
        if let Some(cut) = self.fit(&p.tier1, remaining) {
            debug!(remaining, "working memory trimmed to remaining budget");
            p.tier1 = cut;
            actions.push(CompressionAction::WorkingMemoryTrimmed);
        }
    }
}

impl Payload {
    fn finish(self, status: BudgetStatus, summary: Option<String>, actions: Vec<CompressionAction>) -> CompressedContext {
        CompressedContext {
            system_prompt: self.tier0,
            working_memory: self.tier1,
            retrieved: self.tier2,
            messages: self.messages,
            status,
            summary,
            actions,
        }
    }
}

/// Join non-blank blocks with a blank line. Blocks are not altered.
pub(crate) fn join_blocks(blocks: &[&str]) -> String {
    blocks
        .iter()
        .copied()
        .filter(|b| !b.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
