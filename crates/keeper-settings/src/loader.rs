//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`KeeperSettings::default()`]
//! 2. If `~/.keeper/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `KEEPER_*` environment overrides (highest priority)
//! 4. Validate every section (out-of-range values fall back to defaults)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::KeeperSettings;

/// Resolve the path to the settings file (`~/.keeper/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".keeper").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<KeeperSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<KeeperSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings.validated())
}

fn load_file_layer(path: &Path) -> Result<KeeperSettings> {
    let defaults = serde_json::to_value(KeeperSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_env_overrides<F>(settings: &mut KeeperSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Context ─────────────────────────────────────────────────────
    if let Some(v) = env.usize_in("KEEPER_MAX_TOKENS", 1_000, 10_000_000) {
        settings.context.max_tokens = v;
    }
    if let Some(v) = env.u64_in("KEEPER_CALL_TIMEOUT_MS", 1_000, 600_000) {
        settings.context.call_timeout_ms = v;
        settings.daemon.call_timeout_ms = v;
    }

    // ── Canon ───────────────────────────────────────────────────────
    if let Some(v) = env.u64_in("KEEPER_CANON_TTL_MS", 0, 86_400_000) {
        settings.canon.cache_ttl_ms = v;
    }

    // ── Daemon ──────────────────────────────────────────────────────
    if let Some(v) = env.u64_in("KEEPER_DAEMON_INTERVAL_MS", 5_000, 86_400_000) {
        settings.daemon.interval_ms = v;
    }
    if let Some(v) = env.usize_in("KEEPER_DAEMON_BATCH_SIZE", 1, 100) {
        settings.daemon.batch_size = v;
    }
    if let Some(v) = env.f64_in("KEEPER_MIN_IMPORTANCE", 0.0, 1.0) {
        settings.daemon.min_importance = v;
    }
    if let Some(v) = env.usize_in("KEEPER_DAEMON_CONCURRENCY", 1, 64) {
        settings.daemon.max_concurrency = v;
    }

    // ── Storage / logging ───────────────────────────────────────────
    if let Some(v) = env.string("KEEPER_LOCAL_CACHE") {
        settings.storage.local_cache_path = v;
    }
    if let Some(v) = env.string("KEEPER_DURABLE_STORE") {
        settings.storage.durable_store_path = v;
    }
    if let Some(v) = env.string("KEEPER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("KEEPER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a finite `f64` within a range.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize_in(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }

    fn f64_in(&self, name: &str, min: f64, max: f64) -> Option<f64> {
        self.parsed(name, "f64", |v| parse_f64_range(v, min, max))
    }
}
