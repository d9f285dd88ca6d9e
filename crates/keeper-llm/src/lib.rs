//! # keeper-llm
//!
//! The two external model capabilities the context pipeline consumes.
//!
//! - [`CompletionProvider`]: chat completion, used for fact extraction
//!   (structured output) and history summarization (plain text)
//! - [`Embedder`]: text to vector, returning `None` on failure so callers
//!   drop the candidate instead of crashing
//!
//! Wire protocols live outside this workspace; implementors adapt a concrete
//! backend to these traits. [`with_timeout`] bounds every call.

#![deny(unsafe_code)]

pub mod embedding;
pub mod provider;

pub use embedding::{Embedder, embed_with_timeout};
pub use provider::{
    Completion, CompletionOptions, CompletionProvider, ProviderError, ProviderResult,
    ResponseFormat, with_timeout,
};
