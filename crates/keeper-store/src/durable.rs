//! Durable store: the system of record for conversations, messages, and facts.
//!
//! [`DurableStore`] is the seam the context and memory layers depend on.
//! [`SqliteDurableStore`] implements it over a pooled `SQLite` file; each call
//! runs on the blocking pool so a slow disk never stalls the async runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keeper_core::{
    ConversationId, ConversationMessage, ConversationRef, ExtractedFact, FactId, FactKind,
    MemoryFact, MessageId, ProtectedFact, Role, WorkspaceId,
};
use rusqlite::{Connection, TransactionBehavior, params};
use tracing::{debug, instrument};

use crate::codec::{content_hash, f32_slice_to_blob, format_ts, parse_ts};
use crate::connection::{self, ConnectionConfig, ConnectionPool};
use crate::errors::{Result, StoreError};
use crate::migrations::{DURABLE_MIGRATIONS, run_migrations};

/// Protection level of canon facts.
pub const PROTECTION_CANON: u8 = 0;
/// Protection level assigned to extracted facts.
pub const PROTECTION_EXTRACTED: u8 = 2;

/// A fact ready to persist: an extracted candidate plus provenance and embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct NewFact {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Conversation it was mined from.
    pub conversation_id: ConversationId,
    /// Last message of the source batch.
    pub source_message_id: MessageId,
    /// The candidate itself.
    pub fact: ExtractedFact,
    /// Non-empty embedding vector.
    pub embedding: Vec<f32>,
}

impl NewFact {
    /// The persisted form, once the store has assigned an ID.
    #[must_use]
    pub fn to_memory_fact(&self, id: FactId, created_at: DateTime<Utc>) -> MemoryFact {
        MemoryFact {
            id,
            workspace_id: self.workspace_id.clone(),
            conversation_id: self.conversation_id.clone(),
            source_message_id: self.source_message_id.clone(),
            content: self.fact.content.clone(),
            summary: self.fact.summary.clone(),
            kind: self.fact.kind,
            category: self.fact.category.clone(),
            importance: self.fact.importance,
            confidence: self.fact.confidence,
            entities: self.fact.entities.clone(),
            embedding: self.embedding.clone(),
            created_at,
        }
    }
}

/// A curated canon fact, not tied to a conversation.
#[derive(Clone, Debug, PartialEq)]
pub struct NewProtectedFact {
    /// Full text.
    pub content: String,
    /// One-line summary.
    pub summary: String,
    /// Classification.
    pub kind: FactKind,
    /// 0 marks canon.
    pub protection_level: u8,
    /// Money at stake, if any.
    pub financial_impact: Option<f64>,
    /// Importance score.
    pub importance: f64,
}

/// System-of-record operations used by the pipeline.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Most recently updated conversations, newest first.
    async fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationRef>>;

    /// Messages strictly after `after` (a position), oldest first.
    async fn messages_after(
        &self,
        conversation_id: &ConversationId,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>>;

    /// Persist facts, returning one ID per input in order.
    ///
    /// Content already stored for the same conversation is not duplicated;
    /// the existing ID comes back instead.
    async fn insert_facts(&self, facts: &[NewFact]) -> Result<Vec<FactId>>;

    /// Canon for a workspace: protection level 0 or kind lesson/rule,
    /// highest importance first.
    async fn protected_facts(&self, workspace_id: &WorkspaceId, limit: usize) -> Result<Vec<ProtectedFact>>;
}

/// `SQLite` implementation of [`DurableStore`].
#[derive(Clone)]
pub struct SqliteDurableStore {
    pool: ConnectionPool,
}

impl SqliteDurableStore {
    /// Open (and migrate) a file-backed store.
    pub fn open(path: &str, config: &ConnectionConfig) -> Result<Self> {
        Self::from_pool(connection::new_file(path, config)?)
    }

    /// Open (and migrate) an in-memory store.
    pub fn in_memory() -> Result<Self> {
        Self::from_pool(connection::new_in_memory(&ConnectionConfig::default())?)
    }

    /// Wrap an existing pool, applying pending migrations.
    pub fn from_pool(pool: ConnectionPool) -> Result<Self> {
        {
            let conn = pool.get()?;
            let _ = run_migrations(&conn, DURABLE_MIGRATIONS)?;
        }
        Ok(Self { pool })
    }

    /// Create a conversation.
    pub fn create_conversation(&self, workspace_id: &WorkspaceId, title: Option<&str>) -> Result<ConversationId> {
        let id = ConversationId::new();
        let now = format_ts(&Utc::now());
        let conn = self.pool.get()?;
        let _ = conn.execute(
            "INSERT INTO conversations (id, workspace_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id.as_str(), workspace_id.as_str(), title, now],
        )?;
        Ok(id)
    }

    /// Append a message and bump the conversation's update time.
    pub fn append_message(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: &str,
    ) -> Result<ConversationMessage> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = MessageId::new();
        let created_at = Utc::now();
        let ts = format_ts(&created_at);

        let touched = tx.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![conversation_id.as_str(), ts],
        )?;
        if touched == 0 {
            return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
        }
        let position: i64 = tx.query_row(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             RETURNING position",
            params![id.as_str(), conversation_id.as_str(), role.as_str(), content, ts],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(ConversationMessage {
            id,
            conversation_id: conversation_id.clone(),
            position,
            role,
            content: content.to_owned(),
            created_at,
        })
    }

    /// Record a canon fact for a workspace.
    pub fn add_protected_fact(&self, workspace_id: &WorkspaceId, fact: &NewProtectedFact) -> Result<FactId> {
        let id = FactId::new();
        let conn = self.pool.get()?;
        let _ = conn.execute(
            "INSERT INTO facts (
                 id, workspace_id, content, summary, kind, importance,
                 protection_level, financial_impact, content_hash, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id.as_str(),
                workspace_id.as_str(),
                fact.content,
                fact.summary,
                fact.kind.as_str(),
                fact.importance,
                fact.protection_level,
                fact.financial_impact,
                content_hash(&fact.content),
                format_ts(&Utc::now()),
            ],
        )?;
        Ok(id)
    }

    /// Number of facts stored for a conversation.
    pub fn fact_count(&self, conversation_id: &ConversationId) -> Result<u64> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    #[instrument(skip(self))]
    async fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationRef>> {
        let limit = to_sql_limit(limit);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, workspace_id, updated_at FROM conversations
                 ORDER BY updated_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, workspace_id, updated_at) = row?;
                out.push(ConversationRef {
                    id: ConversationId::from(id),
                    workspace_id: WorkspaceId::from(workspace_id),
                    updated_at: parse_ts(&updated_at)?,
                });
            }
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self, conversation_id), fields(conversation_id = %conversation_id))]
    async fn messages_after(
        &self,
        conversation_id: &ConversationId,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>> {
        let conversation_id = conversation_id.clone();
        let limit = to_sql_limit(limit);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, position, role, content, created_at FROM messages
                 WHERE conversation_id = ?1 AND position > ?2
                 ORDER BY position LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![conversation_id.as_str(), after.unwrap_or(0), limit],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )?;
            let mut out = Vec::new();
            for row in rows {
                let (id, position, role, content, created_at) = row?;
                let role = Role::parse(&role)
                    .ok_or_else(|| StoreError::InvalidData(format!("message role {role:?}")))?;
                out.push(ConversationMessage {
                    id: MessageId::from(id),
                    conversation_id: conversation_id.clone(),
                    position,
                    role,
                    content,
                    created_at: parse_ts(&created_at)?,
                });
            }
            Ok(out)
        })
        .await
    }

    #[instrument(skip_all, fields(count = facts.len()))]
    async fn insert_facts(&self, facts: &[NewFact]) -> Result<Vec<FactId>> {
        if facts.is_empty() {
            return Ok(Vec::new());
        }
        let facts = facts.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = format_ts(&Utc::now());
            let mut ids = Vec::with_capacity(facts.len());
            for new in &facts {
                let id: String = tx.query_row(
                    "INSERT INTO facts (
                         id, workspace_id, conversation_id, source_message_id, content, summary,
                         kind, category, importance, confidence, entities, protection_level,
                         embedding, embedding_dims, content_hash, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                     ON CONFLICT(conversation_id, content_hash) DO UPDATE SET
                         importance = max(facts.importance, excluded.importance)
                     RETURNING id",
                    params![
                        FactId::new().as_str(),
                        new.workspace_id.as_str(),
                        new.conversation_id.as_str(),
                        new.source_message_id.as_str(),
                        new.fact.content,
                        new.fact.summary,
                        new.fact.kind.as_str(),
                        new.fact.category,
                        new.fact.importance,
                        new.fact.confidence,
                        serde_json::to_string(&new.fact.entities)?,
                        PROTECTION_EXTRACTED,
                        f32_slice_to_blob(&new.embedding),
                        i64::try_from(new.embedding.len()).unwrap_or(i64::MAX),
                        content_hash(&new.fact.content),
                        now,
                    ],
                    |row| row.get(0),
                )?;
                ids.push(FactId::from(id));
            }
            tx.commit()?;
            debug!(count = ids.len(), "facts persisted");
            Ok(ids)
        })
        .await
    }

    #[instrument(skip(self, workspace_id), fields(workspace_id = %workspace_id))]
    async fn protected_facts(&self, workspace_id: &WorkspaceId, limit: usize) -> Result<Vec<ProtectedFact>> {
        let workspace_id = workspace_id.clone();
        let limit = to_sql_limit(limit);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content, summary, kind, protection_level, financial_impact, importance
                 FROM facts
                 WHERE workspace_id = ?1 AND (protection_level = 0 OR kind IN ('lesson', 'rule'))
                 ORDER BY importance DESC, created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![workspace_id.as_str(), limit], |row| {
                Ok(ProtectedFact {
                    id: FactId::from(row.get::<_, String>(0)?),
                    content: row.get(1)?,
                    summary: row.get(2)?,
                    kind: FactKind::parse_lossy(&row.get::<_, String>(3)?),
                    protection_level: u8::try_from(row.get::<_, i64>(4)?).unwrap_or(u8::MAX),
                    financial_impact: row.get(5)?,
                    importance: row.get(6)?,
                })
            })?;
            let facts = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(facts)
        })
        .await
    }
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
