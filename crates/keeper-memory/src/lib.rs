//! # keeper-memory
//!
//! Background daemon that turns conversation transcripts into durable,
//! embedded facts.
//!
//! Each cycle picks the most recently active conversations and, with a
//! bounded fan-out, processes one batch per conversation:
//!
//! 1. read the cursor, fetch the next batch of messages (oldest first)
//! 2. ask the completion backend for candidate facts (JSON mode)
//! 3. keep candidates at or above the importance floor
//! 4. embed each survivor; candidates that fail to embed are dropped
//! 5. persist to the durable store, then mirror locally and advance the
//!    cursor in one local transaction
//!
//! A failure anywhere before step 5 commits leaves the cursor where it was,
//! so the batch is retried on the next tick. Persistence is at-least-once;
//! the durable store deduplicates by content per conversation.

#![deny(unsafe_code)]

pub mod daemon;
pub mod errors;
pub mod events;
pub mod extraction;

pub use daemon::{CycleReport, DaemonDeps, DaemonState, DaemonStatus, ExtractionDaemon};
pub use errors::{MemoryError, Result};
pub use events::{DaemonEvent, EventEmitter};
pub use extraction::{EXTRACTION_PROMPT, extraction_request, parse_candidates};
