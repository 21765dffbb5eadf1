//! Error types for the conversation store.

use thiserror::Error;

use crate::ids::SessionId;

/// Conversation store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No session with this id exists.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    /// The session exists but belongs to another user.
    #[error("access to session {0} denied")]
    AccessDenied(SessionId),
    /// A stored row could not be decoded.
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
}

/// Convenience result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
