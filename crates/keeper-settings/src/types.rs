//! Settings types.
//!
//! Every struct is `#[serde(default)]` so a partial settings file only needs
//! to name the values it changes. Ranges are enforced by the `validated`
//! methods, which replace bad values with defaults and log each correction.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeeperSettings {
    /// Context assembly and compression.
    pub context: ContextSettings,
    /// Protected canon loading.
    pub canon: CanonSettings,
    /// Memory extraction daemon.
    pub daemon: DaemonSettings,
    /// Database locations and pool tuning.
    pub storage: StorageSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl KeeperSettings {
    /// Return a copy with every section validated.
    #[must_use]
    pub fn validated(self) -> Self {
        Self {
            context: self.context.validated(),
            canon: self.canon.validated(),
            daemon: self.daemon.validated(),
            storage: self.storage,
            logging: self.logging,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// Token budget and compression settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    /// Model context window in tokens.
    pub max_tokens: usize,
    /// Usage ratio above which compression starts.
    pub compression_threshold: f64,
    /// Usage ratio above which older history is summarized.
    pub summarization_threshold: f64,
    /// Usage ratio above which the hard-limit cascade runs.
    pub hard_limit_threshold: f64,
    /// Most recent messages always kept verbatim.
    pub recent_keep_count: usize,
    /// Messages kept when at the hard limit.
    pub hard_limit_keep_count: usize,
    /// Nominal share of `max_tokens` for retrieved facts.
    pub retrieved_share: f64,
    /// Output cap for the summarization call.
    pub summary_max_tokens: u32,
    /// Sampling temperature for the summarization call.
    pub summary_temperature: f32,
    /// Per-message characters kept by the local fallback summary.
    pub fallback_snippet_chars: usize,
    /// Characters per token for the estimator.
    pub chars_per_token: usize,
    /// Timeout for the summarization call.
    pub call_timeout_ms: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            compression_threshold: 0.80,
            summarization_threshold: 0.90,
            hard_limit_threshold: 0.95,
            recent_keep_count: 10,
            hard_limit_keep_count: 5,
            retrieved_share: 0.15,
            summary_max_tokens: 500,
            summary_temperature: 0.3,
            fallback_snippet_chars: 150,
            chars_per_token: 4,
            call_timeout_ms: 30_000,
        }
    }
}

impl ContextSettings {
    /// Replace out-of-range values with defaults.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let d = Self::default();
        if self.max_tokens == 0 {
            warn!(value = self.max_tokens, default = d.max_tokens, "invalid context.maxTokens, using default");
            self.max_tokens = d.max_tokens;
        }
        let ordered = 0.0 < self.compression_threshold
            && self.compression_threshold <= self.summarization_threshold
            && self.summarization_threshold <= self.hard_limit_threshold
            && self.hard_limit_threshold <= 1.0;
        if !ordered {
            warn!(
                compression = self.compression_threshold,
                summarization = self.summarization_threshold,
                hard_limit = self.hard_limit_threshold,
                "context thresholds must be ordered within (0, 1], using defaults"
            );
            self.compression_threshold = d.compression_threshold;
            self.summarization_threshold = d.summarization_threshold;
            self.hard_limit_threshold = d.hard_limit_threshold;
        }
        if self.recent_keep_count == 0 {
            warn!("context.recentKeepCount must be at least 1, using default");
            self.recent_keep_count = d.recent_keep_count;
        }
        if self.hard_limit_keep_count == 0 || self.hard_limit_keep_count > self.recent_keep_count {
            let corrected = d.hard_limit_keep_count.min(self.recent_keep_count);
            warn!(
                value = self.hard_limit_keep_count,
                corrected, "context.hardLimitKeepCount out of range"
            );
            self.hard_limit_keep_count = corrected;
        }
        if !(self.retrieved_share > 0.0 && self.retrieved_share <= 1.0) {
            warn!(value = self.retrieved_share, "invalid context.retrievedShare, using default");
            self.retrieved_share = d.retrieved_share;
        }
        if self.chars_per_token == 0 {
            warn!("context.charsPerToken must be at least 1, using default");
            self.chars_per_token = d.chars_per_token;
        }
        if self.call_timeout_ms == 0 {
            self.call_timeout_ms = d.call_timeout_ms;
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Canon
// ─────────────────────────────────────────────────────────────────────────────

/// Protected canon loading settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CanonSettings {
    /// Per-workspace cache lifetime.
    pub cache_ttl_ms: u64,
    /// Maximum protected facts loaded per workspace.
    pub max_facts: usize,
    /// Token ceiling for the formatted canon block.
    pub max_tokens: usize,
}

impl Default for CanonSettings {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 5 * 60 * 1000,
            max_facts: 50,
            max_tokens: 8_000,
        }
    }
}

impl CanonSettings {
    /// Replace out-of-range values with defaults.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let d = Self::default();
        if self.max_facts == 0 {
            warn!("canon.maxFacts must be at least 1, using default");
            self.max_facts = d.max_facts;
        }
        if self.max_tokens == 0 {
            warn!("canon.maxTokens must be at least 1, using default");
            self.max_tokens = d.max_tokens;
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Daemon
// ─────────────────────────────────────────────────────────────────────────────

/// Smallest allowed daemon interval.
pub const MIN_DAEMON_INTERVAL_MS: u64 = 5_000;

/// Largest allowed extraction batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// Memory extraction daemon settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonSettings {
    /// Time between cycles.
    pub interval_ms: u64,
    /// Messages processed per conversation per cycle (1–100).
    pub batch_size: usize,
    /// Candidates below this importance are discarded (0.0–1.0).
    pub min_importance: f64,
    /// Recently active conversations fetched per cycle.
    pub conversation_page: usize,
    /// Conversations processed concurrently.
    pub max_concurrency: usize,
    /// Timeout applied to each external call.
    pub call_timeout_ms: u64,
    /// Buffered events per subscriber before it lags.
    pub event_capacity: usize,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            batch_size: 10,
            min_importance: 0.3,
            conversation_page: 10,
            max_concurrency: 3,
            call_timeout_ms: 30_000,
            event_capacity: 256,
        }
    }
}

impl DaemonSettings {
    /// Replace out-of-range values with defaults, logging each correction.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let d = Self::default();
        if self.interval_ms < MIN_DAEMON_INTERVAL_MS {
            warn!(
                value = self.interval_ms,
                minimum = MIN_DAEMON_INTERVAL_MS,
                default = d.interval_ms,
                "daemon interval below minimum, using default"
            );
            self.interval_ms = d.interval_ms;
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            warn!(value = self.batch_size, default = d.batch_size, "daemon batch size out of range, using default");
            self.batch_size = d.batch_size;
        }
        if !(0.0..=1.0).contains(&self.min_importance) {
            warn!(
                value = self.min_importance,
                default = d.min_importance,
                "daemon minimum importance out of range, using default"
            );
            self.min_importance = d.min_importance;
        }
        if self.conversation_page == 0 {
            warn!(default = d.conversation_page, "daemon conversation page must be at least 1, using default");
            self.conversation_page = d.conversation_page;
        }
        if self.max_concurrency == 0 {
            warn!(default = d.max_concurrency, "daemon concurrency must be at least 1, using default");
            self.max_concurrency = d.max_concurrency;
        }
        if self.call_timeout_ms == 0 {
            self.call_timeout_ms = d.call_timeout_ms;
        }
        if self.event_capacity == 0 {
            self.event_capacity = d.event_capacity;
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage / logging
// ─────────────────────────────────────────────────────────────────────────────

/// Database locations and pool tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Local cache database (cursor table, fact mirror). May contain `~`.
    pub local_cache_path: String,
    /// Durable store database. May contain `~`.
    pub durable_store_path: String,
    /// Maximum pooled connections per database.
    pub pool_size: u32,
    /// `SQLite` busy timeout.
    pub busy_timeout_ms: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            local_cache_path: "~/.keeper/cache.db".to_string(),
            durable_store_path: "~/.keeper/keeper.db".to_string(),
            pool_size: 8,
            busy_timeout_ms: 30_000,
        }
    }
}

impl StorageSettings {
    /// Expand a leading `~/` to the home directory.
    pub fn resolve_path(path: &str) -> String {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{home}/{rest}");
            }
        }
        path.to_string()
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_core::logging::capture_logs;
    use tracing::Level;

    #[test]
    fn defaults_match_documented_values() {
        let s = KeeperSettings::default();
        assert_eq!(s.context.max_tokens, 128_000);
        assert!((s.context.compression_threshold - 0.80).abs() < f64::EPSILON);
        assert!((s.context.summarization_threshold - 0.90).abs() < f64::EPSILON);
        assert!((s.context.hard_limit_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(s.context.recent_keep_count, 10);
        assert_eq!(s.context.hard_limit_keep_count, 5);
        assert_eq!(s.canon.cache_ttl_ms, 300_000);
        assert_eq!(s.canon.max_facts, 50);
        assert_eq!(s.canon.max_tokens, 8_000);
        assert_eq!(s.daemon.interval_ms, 30_000);
        assert_eq!(s.daemon.batch_size, 10);
        assert!((s.daemon.min_importance - 0.3).abs() < f64::EPSILON);
        assert_eq!(s.daemon.max_concurrency, 3);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: KeeperSettings = serde_json::from_str(r#"{"daemon":{"batchSize":25}}"#).unwrap();
        assert_eq!(s.daemon.batch_size, 25);
        assert_eq!(s.daemon.interval_ms, 30_000);
        assert_eq!(s.context.max_tokens, 128_000);
    }

    #[test]
    fn daemon_validation_corrects_and_logs() {
        let (logs, _guard) = capture_logs();
        let s = DaemonSettings {
            interval_ms: 100,
            batch_size: 0,
            min_importance: 1.5,
            max_concurrency: 0,
            ..DaemonSettings::default()
        }
        .validated();

        assert_eq!(s.interval_ms, 30_000);
        assert_eq!(s.batch_size, 10);
        assert!((s.min_importance - 0.3).abs() < f64::EPSILON);
        assert_eq!(s.max_concurrency, 3);
        assert!(logs.has_event(Level::WARN, "interval below minimum"));
        assert!(logs.has_event(Level::WARN, "batch size out of range"));
        assert!(logs.has_event(Level::WARN, "minimum importance out of range"));
    }

    #[test]
    fn daemon_validation_keeps_valid_values() {
        let s = DaemonSettings {
            interval_ms: 5_000,
            batch_size: 100,
            min_importance: 0.0,
            ..DaemonSettings::default()
        };
        assert_eq!(s.clone().validated(), s);
    }

    #[test]
    fn nan_importance_is_rejected() {
        let s = DaemonSettings {
            min_importance: f64::NAN,
            ..DaemonSettings::default()
        }
        .validated();
        assert!((s.min_importance - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn context_validation_restores_threshold_order() {
        let s = ContextSettings {
            compression_threshold: 0.95,
            summarization_threshold: 0.90,
            ..ContextSettings::default()
        }
        .validated();
        assert!((s.compression_threshold - 0.80).abs() < f64::EPSILON);
        assert!((s.summarization_threshold - 0.90).abs() < f64::EPSILON);
    }

    #[test]
    fn hard_limit_keep_never_exceeds_recent_keep() {
        let s = ContextSettings {
            recent_keep_count: 3,
            hard_limit_keep_count: 8,
            ..ContextSettings::default()
        }
        .validated();
        assert_eq!(s.hard_limit_keep_count, 3);
    }

    #[test]
    fn resolve_path_passthrough_for_absolute() {
        assert_eq!(StorageSettings::resolve_path("/var/db/x.db"), "/var/db/x.db");
    }
}
