//! # keeper-store
//!
//! Storage surfaces for the context pipeline, all on `SQLite`.
//!
//! - [`DurableStore`]: the system-of-record surface (conversations, messages,
//!   protected facts, persisted memory facts). [`SqliteDurableStore`] is the
//!   bundled implementation; other backends implement the trait.
//! - [`LocalCache`]: the embedded cache holding the extraction cursor table
//!   and a full-text-searchable mirror of persisted facts. Writes go through
//!   per-batch `IMMEDIATE` transactions so a mirror is never partial.
//!
//! Both databases are versioned with embedded SQL migrations and pooled
//! with `r2d2` (WAL, busy timeout, foreign keys).

#![deny(unsafe_code)]

pub mod codec;
pub mod connection;
pub mod cursor;
pub mod durable;
pub mod errors;
pub mod local;
pub mod migrations;
pub mod mirror;

pub use connection::{ConnectionConfig, ConnectionPool};
pub use cursor::{CursorAdvance, ExtractionState, MessageCursor};
pub use durable::{
    DurableStore, NewFact, NewProtectedFact, PROTECTION_CANON, PROTECTION_EXTRACTED, SqliteDurableStore,
};
pub use errors::{Result, StoreError};
pub use local::LocalCache;
