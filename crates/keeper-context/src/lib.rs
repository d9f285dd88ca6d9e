//! # keeper-context
//!
//! Fits an unbounded conversation plus recalled facts into a fixed token
//! budget for each model call.
//!
//! - [`BudgetAllocator`]: per-tier token accounting against thresholds
//! - [`CompressionEngine`]: escalating trim, summarize, shrink cascade
//! - [`ProtectedFactCache`]: per-workspace canon with a TTL
//! - [`ContextAssembler`]: the single entry point producing the final
//!   ordered message list
//!
//! Content is organized in four [`ContextTier`]s. Tier 0 (protected canon)
//! passes through compression untouched; the only way it is ever shortened
//! is an explicit, logged truncation when it alone exceeds the budget.

#![deny(unsafe_code)]

pub mod assembler;
pub mod budget;
pub mod canon;
pub mod compression;
pub mod constants;
pub mod errors;
pub mod summarizer;
pub mod tier;

pub use assembler::{AssembledContext, AssemblyRequest, ContextAssembler};
pub use budget::{BudgetAllocator, BudgetStatus, BudgetThresholds};
pub use canon::{CanonConfig, ProtectedCanon, ProtectedFactCache};
pub use compression::{CompressedContext, CompressionAction, CompressionConfig, CompressionEngine};
pub use errors::{ContextError, Result};
pub use summarizer::{LlmSummarizer, Summarizer, SummarizerError, fallback_summary};
pub use tier::ContextTier;
