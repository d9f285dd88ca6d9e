//! # keeper-tokens
//!
//! Token estimation for context budgeting.
//!
//! The default [`CharEstimator`] divides byte length by a fixed
//! characters-per-token constant and rounds up. It never calls out and is
//! deliberately conservative: multi-byte text is over-counted, which keeps
//! the budget allocator on the safe side of the hard limit.
//!
//! The estimator sits behind the [`TokenEstimator`] trait so a real
//! tokenizer can be dropped in without touching the allocator.

#![deny(unsafe_code)]

pub mod estimator;

pub use estimator::{CHARS_PER_TOKEN, CharEstimator, TokenEstimator};
