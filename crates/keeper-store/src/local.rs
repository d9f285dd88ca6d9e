//! Local cache: extraction cursors plus the persisted-fact mirror.
//!
//! Calls are short synchronous writes against an embedded database.
//! [`LocalCache::commit_batch`] is the only multi-table write; it mirrors a
//! batch of facts and advances the cursor inside one `IMMEDIATE` transaction.

use keeper_core::{ConversationId, MemoryFact, WorkspaceId};
use rusqlite::TransactionBehavior;
use tracing::debug;

use crate::connection::{self, ConnectionConfig, ConnectionPool};
use crate::cursor::{CursorAdvance, CursorRepo, ExtractionState, MessageCursor};
use crate::errors::Result;
use crate::migrations::{LOCAL_MIGRATIONS, run_migrations};
use crate::mirror::FactMirrorRepo;

/// Handle to the local cache database.
#[derive(Clone)]
pub struct LocalCache {
    pool: ConnectionPool,
}

impl LocalCache {
    /// Open (and migrate) a file-backed cache.
    pub fn open(path: &str, config: &ConnectionConfig) -> Result<Self> {
        Self::from_pool(connection::new_file(path, config)?)
    }

    /// Open (and migrate) an in-memory cache.
    pub fn in_memory() -> Result<Self> {
        Self::from_pool(connection::new_in_memory(&ConnectionConfig::default())?)
    }

    /// Wrap an existing pool, applying pending migrations.
    pub fn from_pool(pool: ConnectionPool) -> Result<Self> {
        {
            let conn = pool.get()?;
            let _ = run_migrations(&conn, LOCAL_MIGRATIONS)?;
        }
        Ok(Self { pool })
    }

    /// Apply pending migrations. Idempotent.
    pub fn migrate(&self) -> Result<u32> {
        let conn = self.pool.get()?;
        run_migrations(&conn, LOCAL_MIGRATIONS)
    }

    // ── Cursor ──────────────────────────────────────────────────────────

    /// Last processed message for a conversation.
    pub fn cursor(&self, conversation_id: &ConversationId) -> Result<Option<MessageCursor>> {
        let conn = self.pool.get()?;
        CursorRepo::get(&conn, conversation_id)
    }

    /// Full extraction state for a conversation.
    pub fn extraction_state(&self, conversation_id: &ConversationId) -> Result<Option<ExtractionState>> {
        let conn = self.pool.get()?;
        CursorRepo::state(&conn, conversation_id)
    }

    /// Every extraction state row.
    pub fn extraction_states(&self) -> Result<Vec<ExtractionState>> {
        let conn = self.pool.get()?;
        CursorRepo::list(&conn)
    }

    /// Advance a cursor on its own. Returns `false` if it would move backward.
    pub fn advance(&self, advance: &CursorAdvance) -> Result<bool> {
        let conn = self.pool.get()?;
        CursorRepo::advance(&conn, advance)
    }

    // ── Fact mirror ─────────────────────────────────────────────────────

    /// Mirror `facts` and advance the cursor atomically.
    ///
    /// Returns whether the cursor moved. Mirror writes are upserts by fact
    /// ID, so they commit either way.
    pub fn commit_batch(&self, facts: &[MemoryFact], advance: &CursorAdvance) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for fact in facts {
            FactMirrorRepo::upsert(&tx, fact)?;
        }
        let moved = CursorRepo::advance(&tx, advance)?;
        tx.commit()?;
        debug!(
            conversation_id = %advance.conversation_id,
            mirrored = facts.len(),
            moved,
            "batch committed"
        );
        Ok(moved)
    }

    /// Mirrored facts for a conversation, oldest first.
    pub fn facts_for_conversation(&self, conversation_id: &ConversationId) -> Result<Vec<MemoryFact>> {
        let conn = self.pool.get()?;
        FactMirrorRepo::for_conversation(&conn, conversation_id)
    }

    /// Full-text search over mirrored fact summaries.
    pub fn search_summaries(
        &self,
        workspace_id: Option<&WorkspaceId>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryFact>> {
        let conn = self.pool.get()?;
        FactMirrorRepo::search(&conn, workspace_id, query, limit)
    }

    /// Number of mirrored facts.
    pub fn fact_count(&self) -> Result<u64> {
        let conn = self.pool.get()?;
        FactMirrorRepo::count(&conn)
    }
}
