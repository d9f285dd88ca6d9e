//! Per-conversation extraction cursor.
//!
//! One row per conversation records the newest message already handed to
//! extraction. Advancing is an upsert guarded on position, so a cursor can
//! only move forward; a stale or replayed advance leaves the row untouched.

use chrono::{DateTime, Utc};
use keeper_core::{ConversationId, MessageId, WorkspaceId};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{format_ts, parse_ts};
use crate::errors::Result;

/// Identity and arrival order of the last processed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCursor {
    /// Message ID.
    pub message_id: MessageId,
    /// Arrival position in the durable store.
    pub position: i64,
}

/// Stored extraction progress for one conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionState {
    /// Conversation this row tracks.
    pub conversation_id: ConversationId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Newest processed message.
    pub last_processed: MessageCursor,
    /// When the cursor last moved.
    pub last_extraction_time: DateTime<Utc>,
    /// Total messages processed across all batches.
    pub messages_processed_count: u64,
}

/// A requested cursor move.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorAdvance {
    /// Conversation to advance.
    pub conversation_id: ConversationId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// New cursor value.
    pub last_processed: MessageCursor,
    /// Messages covered by this batch.
    pub processed: u64,
    /// Batch completion time.
    pub at: DateTime<Utc>,
}

/// Cursor repository. Stateless; every method takes `&Connection`.
pub struct CursorRepo;

impl CursorRepo {
    /// Current cursor, or `None` if the conversation was never processed.
    pub fn get(conn: &Connection, conversation_id: &ConversationId) -> Result<Option<MessageCursor>> {
        let cursor = conn
            .query_row(
                "SELECT last_processed_message_id, last_processed_position
                 FROM extraction_state WHERE conversation_id = ?1",
                params![conversation_id.as_str()],
                |row| {
                    Ok(MessageCursor {
                        message_id: MessageId::from(row.get::<_, String>(0)?),
                        position: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    /// Full state row for a conversation.
    pub fn state(conn: &Connection, conversation_id: &ConversationId) -> Result<Option<ExtractionState>> {
        let raw = conn
            .query_row(
                &format!("{SELECT_STATE} WHERE conversation_id = ?1"),
                params![conversation_id.as_str()],
                read_state_row,
            )
            .optional()?;
        raw.map(StateRow::into_state).transpose()
    }

    /// All state rows, most recently advanced first.
    pub fn list(conn: &Connection) -> Result<Vec<ExtractionState>> {
        let mut stmt = conn.prepare(&format!("{SELECT_STATE} ORDER BY last_extraction_time DESC"))?;
        let rows = stmt.query_map([], read_state_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_state()?);
        }
        Ok(out)
    }

    /// Move the cursor forward. Returns `false` when the request would move
    /// it backward and was ignored.
    pub fn advance(conn: &Connection, advance: &CursorAdvance) -> Result<bool> {
        let processed = i64::try_from(advance.processed).unwrap_or(i64::MAX);
        let changed = conn.execute(
            "INSERT INTO extraction_state (
                 conversation_id, workspace_id, last_processed_message_id,
                 last_processed_position, last_extraction_time, messages_processed_count
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(conversation_id) DO UPDATE SET
                 last_processed_message_id = excluded.last_processed_message_id,
                 last_processed_position   = excluded.last_processed_position,
                 last_extraction_time      = excluded.last_extraction_time,
                 messages_processed_count  = extraction_state.messages_processed_count
                                             + excluded.messages_processed_count
             WHERE excluded.last_processed_position > extraction_state.last_processed_position",
            params![
                advance.conversation_id.as_str(),
                advance.workspace_id.as_str(),
                advance.last_processed.message_id.as_str(),
                advance.last_processed.position,
                format_ts(&advance.at),
                processed,
            ],
        )?;
        if changed == 0 {
            warn!(
                conversation_id = %advance.conversation_id,
                position = advance.last_processed.position,
                "cursor advance rejected, not past stored position"
            );
        }
        Ok(changed > 0)
    }
}

const SELECT_STATE: &str = "SELECT conversation_id, workspace_id, last_processed_message_id,
        last_processed_position, last_extraction_time, messages_processed_count
 FROM extraction_state";

struct StateRow {
    conversation_id: String,
    workspace_id: String,
    message_id: String,
    position: i64,
    time: String,
    count: i64,
}

fn read_state_row(row: &Row<'_>) -> rusqlite::Result<StateRow> {
    Ok(StateRow {
        conversation_id: row.get(0)?,
        workspace_id: row.get(1)?,
        message_id: row.get(2)?,
        position: row.get(3)?,
        time: row.get(4)?,
        count: row.get(5)?,
    })
}

impl StateRow {
    fn into_state(self) -> Result<ExtractionState> {
        Ok(ExtractionState {
            conversation_id: ConversationId::from(self.conversation_id),
            workspace_id: WorkspaceId::from(self.workspace_id),
            last_processed: MessageCursor {
                message_id: MessageId::from(self.message_id),
                position: self.position,
            },
            last_extraction_time: parse_ts(&self.time)?,
            messages_processed_count: u64::try_from(self.count).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{LOCAL_MIGRATIONS, run_migrations};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn, LOCAL_MIGRATIONS).unwrap();
        conn
    }

    fn advance_to(conv: &ConversationId, position: i64, processed: u64) -> CursorAdvance {
        CursorAdvance {
            conversation_id: conv.clone(),
            workspace_id: WorkspaceId::from("ws-1"),
            last_processed: MessageCursor {
                message_id: MessageId::from(format!("msg-{position}")),
                position,
            },
            processed,
            at: Utc::now(),
        }
    }

    #[test]
    fn absent_cursor_is_none() {
        let conn = setup();
        assert!(CursorRepo::get(&conn, &ConversationId::from("c")).unwrap().is_none());
        assert!(CursorRepo::state(&conn, &ConversationId::from("c")).unwrap().is_none());
    }

    #[test]
    fn advance_creates_then_accumulates() {
        let conn = setup();
        let conv = ConversationId::from("c");
        assert!(CursorRepo::advance(&conn, &advance_to(&conv, 5, 5)).unwrap());
        assert!(CursorRepo::advance(&conn, &advance_to(&conv, 8, 3)).unwrap());

        let state = CursorRepo::state(&conn, &conv).unwrap().unwrap();
        assert_eq!(state.last_processed.position, 8);
        assert_eq!(state.last_processed.message_id.as_str(), "msg-8");
        assert_eq!(state.messages_processed_count, 8);
    }

    #[test]
    fn backward_advance_is_rejected() {
        let conn = setup();
        let conv = ConversationId::from("c");
        assert!(CursorRepo::advance(&conn, &advance_to(&conv, 10, 10)).unwrap());
        assert!(!CursorRepo::advance(&conn, &advance_to(&conv, 4, 4)).unwrap());
        assert!(!CursorRepo::advance(&conn, &advance_to(&conv, 10, 1)).unwrap());

        let state = CursorRepo::state(&conn, &conv).unwrap().unwrap();
        assert_eq!(state.last_processed.position, 10);
        assert_eq!(state.messages_processed_count, 10);
    }

    #[test]
    fn list_returns_all_rows() {
        let conn = setup();
        let _ = CursorRepo::advance(&conn, &advance_to(&ConversationId::from("a"), 1, 1)).unwrap();
        let _ = CursorRepo::advance(&conn, &advance_to(&ConversationId::from("b"), 2, 1)).unwrap();
        assert_eq!(CursorRepo::list(&conn).unwrap().len(), 2);
    }
}
