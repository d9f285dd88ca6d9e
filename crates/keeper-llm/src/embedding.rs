//! Embedding capability.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

/// Text embedding backend.
///
/// Failures are reported as `None`, never as a panic or error, so a caller
/// can drop the affected item and carry on.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text`, or `None` if the backend could not.
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// Embed with a deadline. A timeout or an empty vector counts as failure.
pub async fn embed_with_timeout(embedder: &dyn Embedder, text: &str, limit: Duration) -> Option<Vec<f32>> {
    match tokio::time::timeout(limit, embedder.embed(text)).await {
        Ok(Some(vector)) if !vector.is_empty() => Some(vector),
        Ok(_) => None,
        Err(_) => {
            warn!(timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX), "embedding call timed out");
            None
        }
    }
}
