//! Memory daemon error types.

use std::time::Duration;

use keeper_llm::ProviderError;
use keeper_store::StoreError;

use crate::daemon::DaemonState;

/// Errors that can occur while running the extraction daemon.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Durable store or local cache failure.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Completion call failed.
    #[error("completion error: {0}")]
    Provider(#[from] ProviderError),

    /// A storage call did not finish within its deadline.
    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        /// Which call.
        operation: &'static str,
        /// The deadline.
        limit: Duration,
    },

    /// Lifecycle call made in the wrong state.
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        /// Attempted transition.
        action: &'static str,
        /// Current state.
        state: DaemonState,
    },

    /// A background task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),
}

/// Convenience type alias for memory results.
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = MemoryError::Timeout {
            operation: "message fetch",
            limit: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "message fetch timed out after 30s");

        let err = MemoryError::InvalidState {
            action: "start",
            state: DaemonState::Running,
        };
        assert_eq!(err.to_string(), "cannot start while Running");
    }

    #[test]
    fn from_store_error() {
        let err: MemoryError = StoreError::NotFound("conversation".into()).into();
        assert!(matches!(err, MemoryError::Store(_)));
    }
}
