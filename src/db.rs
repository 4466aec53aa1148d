//! Persistence for conversations and messages.
//!
//! Also home to the subagent directory: the mapping from
//! `(parent conversation, slug)` to a child conversation. Slug uniqueness per
//! parent is enforced by a unique index, so concurrent binders race on the
//! insert and the loser adopts the winner's row.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> DbResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ==================== Conversation Operations ====================

    /// Create a new conversation
    pub fn create_conversation(
        &self,
        id: &str,
        cwd: &str,
        model: &str,
        user_initiated: bool,
        parent_id: Option<&str>,
        slug: Option<&str>,
    ) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        Self::insert_conversation(&conn, id, cwd, model, user_initiated, parent_id, slug)
    }

    fn insert_conversation(
        conn: &Connection,
        id: &str,
        cwd: &str,
        model: &str,
        user_initiated: bool,
        parent_id: Option<&str>,
        slug: Option<&str>,
    ) -> DbResult<Conversation> {
        let now = Utc::now();
        conn.execute(
            "INSERT INTO conversations (id, slug, cwd, model, parent_conversation_id, user_initiated, state, state_updated_at, created_at, updated_at, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'idle', ?7, ?7, ?7, 0)",
            params![id, slug, cwd, model, parent_id, user_initiated, now.to_rfc3339()],
        )?;

        Ok(Conversation {
            id: id.to_string(),
            slug: slug.map(String::from),
            cwd: cwd.to_string(),
            model: model.to_string(),
            parent_conversation_id: parent_id.map(String::from),
            user_initiated,
            state: ConversationState::Idle,
            state_updated_at: now,
            created_at: now,
            updated_at: now,
            archived: false,
        })
    }

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
        ))?;

        stmt.query_row(params![id], row_to_conversation)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::ConversationNotFound(id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// List active (non-archived) user-initiated conversations
    pub fn list_conversations(&self) -> DbResult<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE archived = 0 AND user_initiated = 1
             ORDER BY updated_at DESC"
        ))?;

        let rows = stmt.query_map([], row_to_conversation)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Update conversation state
    pub fn update_conversation_state(&self, id: &str, state: ConversationState) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        let updated = conn.execute(
            "UPDATE conversations SET state = ?1, state_updated_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![state.to_string(), now.to_rfc3339(), id],
        )?;

        if updated == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Archive a conversation
    pub fn archive_conversation(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        let updated = conn.execute(
            "UPDATE conversations SET archived = 1, updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), id],
        )?;

        if updated == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Reset all conversations to idle, used on server startup
    pub fn reset_all_to_idle(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "UPDATE conversations SET state = 'idle', state_updated_at = ?1, updated_at = ?1
             WHERE state != 'idle'",
            params![now.to_rfc3339()],
        )?;
        Ok(())
    }

    // ==================== Subagent Directory ====================

    /// Resolve `(parent_id, slug)` to a child conversation, creating one if
    /// no binding exists.
    ///
    /// Returns `(child_id, actual_slug)`. With `force_new` false (the normal
    /// path) an existing binding is reused unconditionally and `actual_slug`
    /// equals the requested slug. With `force_new` true a fresh child is
    /// always allocated; if the slug is taken, the first free numeric suffix
    /// (`-2`, `-3`, …) is used and returned as `actual_slug`.
    ///
    /// The child inherits the parent's model at allocation time and captures
    /// `cwd` permanently; a later parent directory change does not migrate
    /// existing children.
    pub fn resolve_or_create_subagent(
        &self,
        parent_id: &str,
        slug: &str,
        cwd: &str,
        force_new: bool,
    ) -> DbResult<(String, String)> {
        let conn = self.conn.lock().unwrap();

        // The parent must already exist; it is never implicitly created.
        let parent = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
            ))?;
            stmt.query_row(params![parent_id], row_to_conversation)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        DbError::ConversationNotFound(parent_id.to_string())
                    }
                    other => DbError::Sqlite(other),
                })?
        };

        loop {
            let candidate = if force_new {
                Self::first_free_slug(&conn, parent_id, slug)?
            } else {
                if let Some(child_id) = Self::find_binding(&conn, parent_id, slug)? {
                    return Ok((child_id, slug.to_string()));
                }
                slug.to_string()
            };

            let child_id = uuid::Uuid::new_v4().to_string();
            match Self::insert_conversation(
                &conn,
                &child_id,
                cwd,
                &parent.model,
                false,
                Some(parent_id),
                Some(&candidate),
            ) {
                Ok(_) => return Ok((child_id, candidate)),
                // Unique-index conflict: a concurrent binder won the slug.
                // Retry resolution; on the normal path that adopts the
                // winner's binding rather than suffixing.
                Err(DbError::Sqlite(e)) if is_constraint_violation(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn find_binding(
        conn: &Connection,
        parent_id: &str,
        slug: &str,
    ) -> DbResult<Option<String>> {
        let mut stmt = conn.prepare(
            "SELECT id FROM conversations WHERE parent_conversation_id = ?1 AND slug = ?2",
        )?;
        let mut rows = stmt.query(params![parent_id, slug])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    // First free slug in the sequence `base`, `base-2`, `base-3`, …
    fn first_free_slug(conn: &Connection, parent_id: &str, base: &str) -> DbResult<String> {
        if Self::find_binding(conn, parent_id, base)?.is_none() {
            return Ok(base.to_string());
        }
        for n in 2u32.. {
            let candidate = format!("{base}-{n}");
            if Self::find_binding(conn, parent_id, &candidate)?.is_none() {
                return Ok(candidate);
            }
        }
        unreachable!("suffix sequence is unbounded")
    }

    /// List a conversation's subagent children, oldest first
    pub fn list_subagents(&self, parent_id: &str) -> DbResult<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE parent_conversation_id = ?1
             ORDER BY created_at ASC"
        ))?;

        let rows = stmt.query_map(params![parent_id], row_to_conversation)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Message Operations ====================

    /// Add a message to a conversation
    pub fn add_message(
        &self,
        id: &str,
        conversation_id: &str,
        msg_type: MessageType,
        content: &serde_json::Value,
        display_data: Option<&serde_json::Value>,
        usage_data: Option<&UsageData>,
    ) -> DbResult<Message> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        let sequence_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        let content_str = content.to_string();
        let display_str = display_data.map(ToString::to_string);
        let usage_str = usage_data.and_then(|u| serde_json::to_string(u).ok());

        conn.execute(
            "INSERT INTO messages (id, conversation_id, sequence_id, message_type, content, display_data, usage_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                conversation_id,
                sequence_id,
                msg_type.to_string(),
                content_str,
                display_str,
                usage_str,
                now.to_rfc3339(),
            ],
        )?;

        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;

        Ok(Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sequence_id,
            message_type: msg_type,
            content: content.clone(),
            display_data: display_data.cloned(),
            usage_data: usage_data.cloned(),
            created_at: now,
        })
    }

    /// Get messages for a conversation
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sequence_id, message_type, content, display_data, usage_data, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok(Message {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sequence_id: row.get(2)?,
                message_type: MessageType::parse(&row.get::<_, String>(3)?),
                content: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
                display_data: row
                    .get::<_, Option<String>>(5)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                usage_data: row
                    .get::<_, Option<String>>(6)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                created_at: parse_datetime(&row.get::<_, String>(7)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Get the last sequence ID for a conversation
    pub fn get_last_sequence_id(&self, conversation_id: &str) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }
}

const CONVERSATION_COLUMNS: &str = "id, slug, cwd, model, parent_conversation_id, user_initiated, state, state_updated_at, created_at, updated_at, archived";

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        slug: row.get(1)?,
        cwd: row.get(2)?,
        model: row.get(3)?,
        parent_conversation_id: row.get(4)?,
        user_initiated: row.get(5)?,
        state: ConversationState::parse(row.get::<_, String>(6)?.as_str()),
        state_updated_at: parse_datetime(&row.get::<_, String>(7)?),
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
        archived: row.get(10)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
