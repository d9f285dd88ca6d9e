//! # keeper-core
//!
//! Foundation types shared by every keeper crate.
//!
//! - **Branded IDs**: `ConversationId`, `WorkspaceId`, `MessageId`, `FactId`
//! - **Messages**: role-tagged conversation messages, including synthetic
//!   summary messages marked `extracted`
//! - **Facts**: protected canon facts, extraction candidates, and durable
//!   memory facts
//! - **Logging**: `tracing` subscriber setup and capture helpers for tests

#![deny(unsafe_code)]

pub mod facts;
pub mod ids;
pub mod logging;
pub mod messages;

pub use facts::{ExtractedFact, FactKind, MemoryFact, ProtectedFact};
pub use ids::{ConversationId, FactId, MessageId, WorkspaceId};
pub use messages::{ConversationMessage, ConversationRef, Message, Role};
