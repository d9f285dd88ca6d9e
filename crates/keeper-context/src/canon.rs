//! Protected fact cache: per-workspace canon of lessons and rules.
//!
//! Canon is loaded from the durable store (protection level 0, or kind
//! lesson/rule, highest importance first), split into lessons and rules, and
//! formatted as a bulleted block for Tier 0. Results are cached per workspace
//! for a TTL; the curation path calls [`ProtectedFactCache::clear_cache`]
//! after writing new canon.
//!
//! Loading never fails. A store error or timeout yields an empty canon so a
//! chat turn is never blocked on it, and the failure is not cached.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use keeper_core::{FactKind, ProtectedFact, WorkspaceId};
use keeper_settings::CanonSettings;
use keeper_store::DurableStore;
use keeper_tokens::TokenEstimator;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{LESSONS_HEADING, RULES_HEADING, TRUNCATION_MARKER};

/// A workspace's formatted canon.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProtectedCanon {
    /// Lessons (and any other non-rule canon), importance order.
    pub lessons: Vec<ProtectedFact>,
    /// Absolute rules, importance order.
    pub rules: Vec<ProtectedFact>,
    /// Tier-0 text block.
    pub formatted_content: String,
    /// Estimate of `formatted_content`.
    pub token_estimate: usize,
    /// Whether `formatted_content` was cut to the ceiling.
    pub truncated: bool,
}

impl ProtectedCanon {
    /// Canon with nothing in it.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when there are no facts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty() && self.rules.is_empty()
    }

    /// Split and format `facts`, cutting the text (never the facts) at `max_tokens`.
    pub fn from_facts(facts: Vec<ProtectedFact>, estimator: &dyn TokenEstimator, max_tokens: usize) -> Self {
        let (rules, lessons): (Vec<_>, Vec<_>) = facts.into_iter().partition(|f| f.kind == FactKind::Rule);

        let mut sections = Vec::new();
        if !lessons.is_empty() {
            sections.push(format_section(LESSONS_HEADING, &lessons));
        }
        if !rules.is_empty() {
            sections.push(format_section(RULES_HEADING, &rules));
        }
        let mut formatted_content = sections.join("\n\n");
        let mut token_estimate = estimator.estimate(&formatted_content);
        let mut truncated = false;

        if token_estimate > max_tokens {
            warn!(
                tokens = token_estimate,
                max_tokens,
                facts = lessons.len() + rules.len(),
                "protected canon exceeds its token ceiling, truncating formatted text"
            );
            let keep = max_tokens.saturating_sub(estimator.estimate(TRUNCATION_MARKER));
            formatted_content = format!("{}{TRUNCATION_MARKER}", estimator.truncate(&formatted_content, keep));
            token_estimate = estimator.estimate(&formatted_content);
            truncated = true;
        }

        Self {
            lessons,
            rules,
            formatted_content,
            token_estimate,
            truncated,
        }
    }
}

fn format_section(heading: &str, facts: &[ProtectedFact]) -> String {
    let mut out = String::from(heading);
    for fact in facts {
        let text = if fact.content.trim().is_empty() { &fact.summary } else { &fact.content };
        out.push_str("\n- ");
        out.push_str(text.trim());
        if let Some(impact) = fact.financial_impact {
            out.push_str(&format!(" (financial impact: {})", format_money(impact)));
        }
    }
    out
}

fn format_money(amount: f64) -> String {
    let sign = if amount < 0.0 { "-" } else { "" };
    format!("{sign}${:.2}", amount.abs())
}

/// Canon cache tunables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonConfig {
    /// Entry lifetime.
    pub ttl: Duration,
    /// Facts fetched per workspace.
    pub max_facts: usize,
    /// Ceiling for the formatted block.
    pub max_tokens: usize,
    /// Deadline for the store query.
    pub call_timeout: Duration,
}

impl Default for CanonConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_facts: 50,
            max_tokens: 8000,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CanonConfig {
    /// Build from validated settings.
    #[must_use]
    pub fn from_settings(settings: &CanonSettings, call_timeout_ms: u64) -> Self {
        Self {
            ttl: Duration::from_millis(settings.cache_ttl_ms),
            max_facts: settings.max_facts,
            max_tokens: settings.max_tokens,
            call_timeout: Duration::from_millis(call_timeout_ms),
        }
    }
}

struct CacheEntry {
    canon: Arc<ProtectedCanon>,
    loaded_at: Instant,
}

/// Loads and caches canon per workspace.
pub struct ProtectedFactCache {
    store: Arc<dyn DurableStore>,
    estimator: Arc<dyn TokenEstimator>,
    config: CanonConfig,
    entries: DashMap<WorkspaceId, CacheEntry>,
}

impl ProtectedFactCache {
    /// Create an empty cache over `store`.
    pub fn new(store: Arc<dyn DurableStore>, estimator: Arc<dyn TokenEstimator>, config: CanonConfig) -> Self {
        Self {
            store,
            estimator,
            config,
            entries: DashMap::new(),
        }
    }

    /// Canon for `workspace_id`, from cache when fresh.
    pub async fn load(&self, workspace_id: &WorkspaceId) -> Arc<ProtectedCanon> {
        let fresh = self
            .entries
            .get(workspace_id)
            .filter(|entry| entry.loaded_at.elapsed() < self.config.ttl)
            .map(|entry| Arc::clone(&entry.canon));
        if let Some(canon) = fresh {
            return canon;
        }

        let query = self.store.protected_facts(workspace_id, self.config.max_facts);
        let facts = match tokio::time::timeout(self.config.call_timeout, query).await {
            Ok(Ok(facts)) => facts,
            Ok(Err(e)) => {
                warn!(workspace_id = %workspace_id, error = %e, "failed to load protected facts, using empty canon");
                return Arc::new(ProtectedCanon::empty());
            }
            Err(_) => {
                warn!(workspace_id = %workspace_id, "protected fact query timed out, using empty canon");
                return Arc::new(ProtectedCanon::empty());
            }
        };

        let canon = Arc::new(ProtectedCanon::from_facts(
            facts,
            self.estimator.as_ref(),
            self.config.max_tokens,
        ));
        debug!(
            workspace_id = %workspace_id,
            lessons = canon.lessons.len(),
            rules = canon.rules.len(),
            tokens = canon.token_estimate,
            "protected canon loaded"
        );
        let _ = self.entries.insert(
            workspace_id.clone(),
            CacheEntry {
                canon: Arc::clone(&canon),
                loaded_at: Instant::now(),
            },
        );
        canon
    }

    /// Drop one workspace's entry, or every entry when `None`.
    pub fn clear_cache(&self, workspace_id: Option<&WorkspaceId>) {
        match workspace_id {
            Some(id) => {
                let _ = self.entries.remove(id);
            }
            None => self.entries.clear(),
        }
    }

    /// Number of cached workspaces.
    #[must_use]
    pub fn cached_workspaces(&self) -> usize {
        self.entries.len()
    }
}
