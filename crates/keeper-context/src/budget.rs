//! Per-tier token accounting against compression thresholds.

use std::sync::Arc;

use keeper_core::Message;
use keeper_settings::ContextSettings;
use keeper_tokens::TokenEstimator;
use serde::{Deserialize, Serialize};

use crate::tier::ContextTier;

/// Usage ratios that trigger each compression stage.
///
/// Comparisons are strict: usage exactly at a threshold does not trigger it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BudgetThresholds {
    /// Trim retrieved facts.
    pub compression: f64,
    /// Summarize older history.
    pub summarization: f64,
    /// Shrink the history window.
    pub hard_limit: f64,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            compression: 0.80,
            summarization: 0.90,
            hard_limit: 0.95,
        }
    }
}

/// Token usage snapshot. Derived on every assembly, never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    /// Sum over all tiers.
    pub total_tokens: usize,
    /// Ceiling.
    pub max_tokens: usize,
    /// `total_tokens / max_tokens`.
    pub usage_percent: f64,
    /// Tokens per tier, indexed by [`ContextTier::index`].
    pub per_tier_tokens: [usize; 4],
    /// Usage above the compression threshold.
    pub needs_compression: bool,
    /// Usage above the summarization threshold.
    pub needs_summarization: bool,
    /// Usage above the hard limit.
    pub at_hard_limit: bool,
}

impl BudgetStatus {
    /// Tokens used by one tier.
    #[must_use]
    pub fn tier_tokens(&self, tier: ContextTier) -> usize {
        self.per_tier_tokens[tier.index()]
    }
}

/// Computes [`BudgetStatus`] for a candidate payload. Pure, no I/O.
#[derive(Clone)]
pub struct BudgetAllocator {
    max_tokens: usize,
    thresholds: BudgetThresholds,
    estimator: Arc<dyn TokenEstimator>,
}

impl BudgetAllocator {
    /// Create an allocator. A zero ceiling is treated as one token.
    pub fn new(max_tokens: usize, thresholds: BudgetThresholds, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
            thresholds,
            estimator,
        }
    }

    /// Build from validated settings.
    pub fn from_settings(settings: &ContextSettings, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self::new(
            settings.max_tokens,
            BudgetThresholds {
                compression: settings.compression_threshold,
                summarization: settings.summarization_threshold,
                hard_limit: settings.hard_limit_threshold,
            },
            estimator,
        )
    }

    /// Token ceiling.
    #[must_use]
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// The estimator every tier is measured with.
    #[must_use]
    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Tokens available to a block given its share of the ceiling.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn share_of_budget(&self, share: f64) -> usize {
        (self.max_tokens as f64 * share.clamp(0.0, 1.0)).floor() as usize
    }

    /// Measure the four tiers.
    pub fn status(&self, tier0: &str, tier1: &str, tier2: &str, history: &[Message]) -> BudgetStatus {
        let per_tier_tokens = [
            self.estimator.estimate(tier0),
            self.estimator.estimate(tier1),
            self.estimator.estimate(tier2),
            self.estimator.estimate_messages(history),
        ];
        let total_tokens: usize = per_tier_tokens.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        let usage_percent = total_tokens as f64 / self.max_tokens as f64;

        BudgetStatus {
            total_tokens,
            max_tokens: self.max_tokens,
            usage_percent,
            per_tier_tokens,
            needs_compression: usage_percent > self.thresholds.compression,
            needs_summarization: usage_percent > self.thresholds.summarization,
            at_hard_limit: usage_percent > self.thresholds.hard_limit,
        }
    }
}

impl std::fmt::Debug for BudgetAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetAllocator")
            .field("max_tokens", &self.max_tokens)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}
