//! Database schema and record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization.
///
/// Subagent bindings live on the conversations table itself: a child row
/// carries its parent id and slug, and the unique index on
/// `(parent_conversation_id, slug)` is the consistency boundary for slug
/// allocation. Top-level conversations have a NULL slug, which SQLite treats
/// as distinct, so the index constrains children only.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    slug TEXT,
    cwd TEXT NOT NULL,
    model TEXT NOT NULL,
    parent_conversation_id TEXT,
    user_initiated BOOLEAN NOT NULL,
    state TEXT NOT NULL DEFAULT 'idle',
    state_updated_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    archived BOOLEAN NOT NULL DEFAULT 0,

    FOREIGN KEY (parent_conversation_id)
        REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_parent_slug
    ON conversations(parent_conversation_id, slug);
CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    message_type TEXT NOT NULL,
    content TEXT NOT NULL,
    display_data TEXT,
    usage_data TEXT,
    created_at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, sequence_id);
";

/// Conversation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub slug: Option<String>,
    pub cwd: String,
    pub model: String,
    pub parent_conversation_id: Option<String>,
    pub user_initiated: bool,
    pub state: ConversationState,
    pub state_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
}

impl Conversation {
    /// Check if the agent is currently working
    pub fn is_agent_working(&self) -> bool {
        matches!(self.state, ConversationState::Working)
    }
}

/// Conversation lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Ready for input, no pending operations
    Idle,
    /// A turn is in flight
    Working,
    /// The last turn ended in an error
    Error,
}

impl ConversationState {
    pub fn parse(s: &str) -> Self {
        match s {
            "working" => ConversationState::Working,
            "error" => ConversationState::Error,
            _ => ConversationState::Idle,
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationState::Idle => write!(f, "idle"),
            ConversationState::Working => write!(f, "working"),
            ConversationState::Error => write!(f, "error"),
        }
    }
}

/// Message record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sequence_id: i64,
    pub message_type: MessageType,
    pub content: serde_json::Value,
    pub display_data: Option<serde_json::Value>,
    pub usage_data: Option<UsageData>,
    pub created_at: DateTime<Utc>,
}

/// Message type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Agent,
    Tool,
    Error,
}

impl MessageType {
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => MessageType::User,
            "agent" => MessageType::Agent,
            "tool" => MessageType::Tool,
            _ => MessageType::Error,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::User => write!(f, "user"),
            MessageType::Agent => write!(f, "agent"),
            MessageType::Tool => write!(f, "tool"),
            MessageType::Error => write!(f, "error"),
        }
    }
}

/// Token usage persisted alongside agent messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}
