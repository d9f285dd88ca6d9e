//! Error types for context assembly.

use thiserror::Error;

/// Errors surfaced by the context assembler.
///
/// Only request validation fails a call; every internal degradation
/// (store outage, summarizer failure) is absorbed and logged instead.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The assembly request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A component needed for this call was not wired up.
    #[error("{0} not configured")]
    NotConfigured(&'static str),
}

/// Convenience type alias for context results.
pub type Result<T> = std::result::Result<T, ContextError>;
