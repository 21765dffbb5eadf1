//! Session and message records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId, UserId};
use crate::llm::types::TokenUsage;

/// Title given to new sessions until one is derived or set.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// Author of a stored message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// End user input.
    User,
    /// Provider output.
    Assistant,
    /// Fixed instruction.
    System,
}

impl MessageRole {
    /// Stable string form for storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(value.to_string()),
        }
    }
}

/// A conversation owned by one user.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Owning user.
    #[serde(skip)]
    pub owner: UserId,
    /// Display title.
    pub title: String,
    /// Hidden from session listings when set.
    pub is_archived: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last activity time.
    pub updated_at: DateTime<Utc>,
    /// Number of stored messages.
    pub message_count: u64,
}

/// One stored message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Session this message belongs to.
    pub session_id: SessionId,
    /// Author role.
    pub role: MessageRole,
    /// Full text.
    pub content: String,
    /// Append time.
    pub created_at: DateTime<Utc>,
    /// Model that produced an assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Prompt tokens reported for an assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    /// Completion tokens reported for an assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
}

/// Metadata stored alongside an assistant message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssistantMeta {
    /// Model name used for the completion.
    pub model: String,
    /// Provider-reported token usage.
    pub usage: TokenUsage,
}

/// One page of a user's sessions, most recently active first.
#[derive(Clone, Debug, Default)]
pub struct SessionPage {
    /// Sessions on this page.
    pub sessions: Vec<Session>,
    /// Total sessions owned by the user.
    pub total: u64,
}

/// A chronological slice of a session's messages.
#[derive(Clone, Debug, Default)]
pub struct MessagePage {
    /// Messages, oldest first.
    pub messages: Vec<Message>,
    /// Whether older messages exist before this slice.
    pub has_more: bool,
}
