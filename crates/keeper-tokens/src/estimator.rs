//! Token estimator trait and the character-count heuristic.

use keeper_core::Message;

/// Approximate characters per token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Maps text to an approximate token count.
///
/// Implementations must be pure and deterministic: the same text always
/// yields the same count.
pub trait TokenEstimator: Send + Sync {
    /// Estimate the tokens in `text`.
    fn estimate(&self, text: &str) -> usize;

    /// Estimate the tokens in a message list (content only).
    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate(&m.content)).sum()
    }

    /// Longest prefix of `text` whose estimate is at most `max_tokens`.
    ///
    /// The default implementation binary-searches over char boundaries.
    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        if self.estimate(text) <= max_tokens {
            return text;
        }
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = (lo + hi).div_ceil(2);
            if self.estimate(&text[..boundaries[mid]]) <= max_tokens {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        &text[..boundaries[lo]]
    }
}

/// `ceil(bytes / chars_per_token)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CharEstimator {
    chars_per_token: usize,
}

impl CharEstimator {
    /// Create an estimator. A ratio of zero is treated as one.
    #[must_use]
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    /// The configured ratio.
    #[must_use]
    pub fn chars_per_token(&self) -> usize {
        self.chars_per_token
    }
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self::new(CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.len().div_ceil(self.chars_per_token)
    }

    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        let max_bytes = max_tokens.saturating_mul(self.chars_per_token);
        if text.len() <= max_bytes {
            return text;
        }
        let mut end = max_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }
}
