//! The four context tiers.

use serde::{Deserialize, Serialize};

/// Protection level of a block of context, lowest index most protected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextTier {
    /// Base prompt plus canon. Never rewritten.
    ProtectedCanon = 0,
    /// Current task scratch state. Compressible, rarely dropped.
    WorkingMemory = 1,
    /// Just-in-time recalled facts. Rotate freely.
    Retrieved = 2,
    /// Rolling conversation history. Summarized first, then dropped.
    History = 3,
}

impl ContextTier {
    /// All tiers, most protected first.
    pub const ALL: [Self; 4] = [
        Self::ProtectedCanon,
        Self::WorkingMemory,
        Self::Retrieved,
        Self::History,
    ];

    /// Index into per-tier arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Human-readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ProtectedCanon => "protected canon",
            Self::WorkingMemory => "working memory",
            Self::Retrieved => "retrieved facts",
            Self::History => "conversation history",
        }
    }
}
