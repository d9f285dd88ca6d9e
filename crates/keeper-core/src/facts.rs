//! Fact types.
//!
//! - [`ProtectedFact`]: curated canon (lessons, rules) loaded every turn.
//! - [`ExtractedFact`]: transient candidate produced by the extraction step.
//! - [`MemoryFact`]: a candidate that passed the importance filter and was
//!   embedded; this is what gets persisted and mirrored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, FactId, MessageId, WorkspaceId};

/// Classification of a fact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactKind {
    /// A stated user preference.
    Preference,
    /// A decision that was made.
    Decision,
    /// A derived observation.
    Insight,
    /// A hard-won lesson.
    Lesson,
    /// An absolute rule.
    Rule,
    /// A recorded mistake.
    Mistake,
    /// Plain durable fact. Unknown kinds fall back here.
    #[default]
    #[serde(other)]
    Fact,
}

impl FactKind {
    /// Storage name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Decision => "decision",
            Self::Insight => "insight",
            Self::Lesson => "lesson",
            Self::Rule => "rule",
            Self::Mistake => "mistake",
        }
    }

    /// Parse a storage name. Unknown names map to [`FactKind::Fact`].
    #[must_use]
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "preference" => Self::Preference,
            "decision" => Self::Decision,
            "insight" => Self::Insight,
            "lesson" => Self::Lesson,
            "rule" => Self::Rule,
            "mistake" => Self::Mistake,
            _ => Self::Fact,
        }
    }
}

impl std::fmt::Display for FactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A never-drop fact. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedFact {
    /// Fact ID.
    pub id: FactId,
    /// Full text.
    pub content: String,
    /// One-line summary.
    pub summary: String,
    /// Lesson, rule, or mistake.
    pub kind: FactKind,
    /// 0 is the strongest protection.
    pub protection_level: u8,
    /// Money gained or lost when this was learned, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub financial_impact: Option<f64>,
    /// Ranking weight (0.0–1.0).
    pub importance: f64,
}

/// A candidate fact emitted by the extraction step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFact {
    /// Full text.
    pub content: String,
    /// One-line summary.
    #[serde(default)]
    pub summary: String,
    /// Classification.
    #[serde(default)]
    pub kind: FactKind,
    /// Free-form category (e.g. `"risk"`, `"strategy"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Importance score (0.0–1.0).
    #[serde(default)]
    pub importance: f64,
    /// Model confidence (0.0–1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Named entities mentioned by the fact.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
}

/// A persisted, embedded fact with provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryFact {
    /// Fact ID assigned by the durable store.
    pub id: FactId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Conversation the fact was mined from.
    pub conversation_id: ConversationId,
    /// Last message of the batch the fact was mined from.
    pub source_message_id: MessageId,
    /// Full text.
    pub content: String,
    /// One-line summary.
    pub summary: String,
    /// Classification.
    pub kind: FactKind,
    /// Free-form category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Importance score (0.0–1.0).
    pub importance: f64,
    /// Model confidence (0.0–1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Named entities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    /// Embedding vector.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    /// Persist time.
    pub created_at: DateTime<Utc>,
}
