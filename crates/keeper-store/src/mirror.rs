//! Local mirror of persisted memory facts, with FTS5 search over summaries.

use keeper_core::{ConversationId, FactId, FactKind, MemoryFact, MessageId, WorkspaceId};
use rusqlite::{Connection, Row, params};

use crate::codec::{blob_to_f32_vec, f32_slice_to_blob, format_ts, parse_ts};
use crate::errors::Result;

/// Fact mirror repository. Stateless; every method takes `&Connection`.
pub struct FactMirrorRepo;

impl FactMirrorRepo {
    /// Insert or refresh a mirrored fact. The FTS index follows via triggers.
    pub fn upsert(conn: &Connection, fact: &MemoryFact) -> Result<()> {
        let entities = serde_json::to_string(&fact.entities)?;
        let dims = i64::try_from(fact.embedding.len()).unwrap_or(i64::MAX);
        let _ = conn.execute(
            "INSERT INTO memory_facts (
                 id, workspace_id, conversation_id, source_message_id, content, summary,
                 kind, category, importance, confidence, entities, embedding, embedding_dims,
                 created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                 content        = excluded.content,
                 summary        = excluded.summary,
                 kind           = excluded.kind,
                 category       = excluded.category,
                 importance     = excluded.importance,
                 confidence     = excluded.confidence,
                 entities       = excluded.entities,
                 embedding      = excluded.embedding,
                 embedding_dims = excluded.embedding_dims",
            params![
                fact.id.as_str(),
                fact.workspace_id.as_str(),
                fact.conversation_id.as_str(),
                fact.source_message_id.as_str(),
                fact.content,
                fact.summary,
                fact.kind.as_str(),
                fact.category,
                fact.importance,
                fact.confidence,
                entities,
                f32_slice_to_blob(&fact.embedding),
                dims,
                format_ts(&fact.created_at),
            ],
        )?;
        Ok(())
    }

    /// Mirrored facts for one conversation, oldest first.
    pub fn for_conversation(conn: &Connection, conversation_id: &ConversationId) -> Result<Vec<MemoryFact>> {
        let mut stmt = conn.prepare(&format!(
            "{SELECT_FACT} FROM memory_facts m WHERE m.conversation_id = ?1 ORDER BY m.created_at, m.id"
        ))?;
        let rows = stmt.query_map(params![conversation_id.as_str()], read_fact_row)?;
        collect_facts(rows)
    }

    /// Full-text search over summary and content, best match first.
    ///
    /// Each whitespace-separated term is quoted, so user input can never
    /// form FTS syntax. Terms are OR-ed; punctuation-only terms are dropped.
    /// An empty query returns nothing.
    pub fn search(
        conn: &Connection,
        workspace_id: Option<&WorkspaceId>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryFact>> {
        let Some(expr) = fts_expression(query) else {
            return Ok(Vec::new());
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "{SELECT_FACT}
             FROM memory_facts_fts
             JOIN memory_facts m ON m.id = memory_facts_fts.fact_id
             WHERE memory_facts_fts MATCH ?1
               AND (?2 IS NULL OR m.workspace_id = ?2)
             ORDER BY rank
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![expr, workspace_id.map(WorkspaceId::as_str), limit],
            read_fact_row,
        )?;
        collect_facts(rows)
    }

    /// Number of mirrored facts.
    pub fn count(conn: &Connection) -> Result<u64> {
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM memory_facts", [], |r| r.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

fn fts_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

const SELECT_FACT: &str = "SELECT m.id, m.workspace_id, m.conversation_id, m.source_message_id,
        m.content, m.summary, m.kind, m.category, m.importance, m.confidence,
        m.entities, m.embedding, m.created_at";

struct FactRow {
    id: String,
    workspace_id: String,
    conversation_id: String,
    source_message_id: String,
    content: String,
    summary: String,
    kind: String,
    category: Option<String>,
    importance: f64,
    confidence: Option<f64>,
    entities: String,
    embedding: Vec<u8>,
    created_at: String,
}

fn read_fact_row(row: &Row<'_>) -> rusqlite::Result<FactRow> {
    Ok(FactRow {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        conversation_id: row.get(2)?,
        source_message_id: row.get(3)?,
        content: row.get(4)?,
        summary: row.get(5)?,
        kind: row.get(6)?,
        category: row.get(7)?,
        importance: row.get(8)?,
        confidence: row.get(9)?,
        entities: row.get(10)?,
        embedding: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn collect_facts(
    rows: impl Iterator<Item = rusqlite::Result<FactRow>>,
) -> Result<Vec<MemoryFact>> {
    let mut out = Vec::new();
    for row in rows {
        let row = row?;
        out.push(MemoryFact {
            id: FactId::from(row.id),
            workspace_id: WorkspaceId::from(row.workspace_id),
            conversation_id: ConversationId::from(row.conversation_id),
            source_message_id: MessageId::from(row.source_message_id),
            content: row.content,
            summary: row.summary,
            kind: FactKind::parse_lossy(&row.kind),
            category: row.category,
            importance: row.importance,
            confidence: row.confidence,
            entities: serde_json::from_str(&row.entities)?,
            embedding: blob_to_f32_vec(&row.embedding),
            created_at: parse_ts(&row.created_at)?,
        });
    }
    Ok(out)
}
