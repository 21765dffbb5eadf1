//! Conversation store: sessions and their ordered messages.
//!
//! Messages carry an insertion sequence next to their timestamp, so replay
//! order is total even when two appends land in the same millisecond.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::config::StorageConfig;
use crate::ids::{MessageId, SessionId, UserId};
use crate::store::errors::{StoreError, StoreResult};
use crate::store::types::{
    AssistantMeta, DEFAULT_SESSION_TITLE, Message, MessagePage, MessageRole, Session, SessionPage,
};

/// Boxed future type for store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Mutable session fields; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default)]
pub struct SessionUpdate {
    /// New title.
    pub title: Option<String>,
    /// New archived flag.
    pub archived: Option<bool>,
}

/// Conversation store trait.
///
/// Every operation taking an owner enforces ownership: a missing session is
/// `SessionNotFound`, a session owned by someone else is `AccessDenied`.
pub trait ConversationStore: Send + Sync {
    /// Check that the backing database answers.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn ping(&self) -> StoreFuture<'_, StoreResult<()>>;

    /// Create a session; `None` or a blank title uses the placeholder.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn create_session(
        &self,
        owner: UserId,
        title: Option<String>,
    ) -> StoreFuture<'_, StoreResult<Session>>;

    /// List the owner's non-archived sessions, most recently active first.
    ///
    /// `page` is one-based.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn list_sessions(
        &self,
        owner: UserId,
        page: u32,
        limit: u32,
    ) -> StoreFuture<'_, StoreResult<SessionPage>>;

    /// Resolve a session and verify ownership.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `AccessDenied`, or a storage error.
    fn get_session(
        &self,
        session_id: SessionId,
        owner: UserId,
    ) -> StoreFuture<'_, StoreResult<Session>>;

    /// Update mutable session fields.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `AccessDenied`, or a storage error.
    fn update_session(
        &self,
        session_id: SessionId,
        owner: UserId,
        update: SessionUpdate,
    ) -> StoreFuture<'_, StoreResult<Session>>;

    /// Delete a session together with its messages.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `AccessDenied`, or a storage error.
    fn delete_session(&self, session_id: SessionId, owner: UserId)
    -> StoreFuture<'_, StoreResult<()>>;

    /// Append a message in one transaction. User messages bump `updated_at`.
    ///
    /// # Errors
    /// Returns `SessionNotFound` or a storage error.
    fn append_message(
        &self,
        session_id: SessionId,
        role: MessageRole,
        content: String,
        meta: Option<AssistantMeta>,
    ) -> StoreFuture<'_, StoreResult<Message>>;

    /// The most recent `limit` messages, oldest first.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn list_recent_messages(
        &self,
        session_id: SessionId,
        limit: usize,
    ) -> StoreFuture<'_, StoreResult<Vec<Message>>>;

    /// A page of history: the `limit` most recent messages strictly older than
    /// `before` (or the latest ones without a cursor), oldest first.
    ///
    /// An unknown cursor is ignored.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn list_messages(
        &self,
        session_id: SessionId,
        limit: usize,
        before: Option<MessageId>,
    ) -> StoreFuture<'_, StoreResult<MessagePage>>;

    /// Set the title only while it is still the placeholder.
    ///
    /// Returns whether the title changed.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn rename_session_if_default(
        &self,
        session_id: SessionId,
        title: String,
    ) -> StoreFuture<'_, StoreResult<bool>>;
}

/// `SQLite` implementation of the conversation store.
#[derive(Clone)]
pub struct SqliteConversationStore {
    conn: Connection,
    sessions: String,
    messages: String,
}

impl SqliteConversationStore {
    /// Open (or create) the database at the configured path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn new(config: &StorageConfig) -> StoreResult<Self> {
        let conn = Connection::open(&config.sqlite_path).await?;
        Self::with_connection(conn, config).await
    }

    /// Open a private in-memory database with default table names.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn, &StorageConfig::default()).await
    }

    async fn with_connection(conn: Connection, config: &StorageConfig) -> StoreResult<Self> {
        let sessions = config.session_table.clone();
        let messages = config.message_table.clone();
        let (s, m) = (sessions.clone(), messages.clone());

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                CREATE TABLE IF NOT EXISTS {s} (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    is_archived INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS {s}_owner_updated_idx
                    ON {s}(owner_id, updated_at DESC);
                CREATE TABLE IF NOT EXISTS {m} (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    session_id TEXT NOT NULL REFERENCES {s}(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    model TEXT,
                    prompt_tokens INTEGER,
                    completion_tokens INTEGER,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS {m}_session_seq_idx
                    ON {m}(session_id, seq);"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            sessions,
            messages,
        })
    }

    fn session_select(&self) -> String {
        let (s, m) = (&self.sessions, &self.messages);
        format!(
            "SELECT s.id, s.owner_id, s.title, s.is_archived, s.created_at, s.updated_at,
                    (SELECT COUNT(*) FROM {m} WHERE {m}.session_id = s.id)
             FROM {s} s"
        )
    }

    fn message_select(&self) -> String {
        format!(
            "SELECT id, session_id, role, content, created_at, model, prompt_tokens, completion_tokens
             FROM {}",
            self.messages
        )
    }

    async fn load_session(&self, session_id: SessionId) -> StoreResult<Option<Session>> {
        let sql = format!("{} WHERE s.id = ?1", self.session_select());
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(&sql, rusqlite::params![session_id], SessionRow::read)
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(SessionRow::into_session).transpose()
    }

    async fn owned_session(&self, session_id: SessionId, owner: &UserId) -> StoreResult<Session> {
        let session = self
            .load_session(session_id)
            .await?
            .ok_or(StoreError::SessionNotFound(session_id))?;
        if &session.owner != owner {
            return Err(StoreError::AccessDenied(session_id));
        }
        Ok(session)
    }

    async fn query_messages(
        &self,
        sql: String,
        session_id: SessionId,
        bound: i64,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![session_id, bound, limit], MessageRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }
}

impl ConversationStore for SqliteConversationStore {
    fn ping(&self) -> StoreFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.conn
                .call(|conn| {
                    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn create_session(
        &self,
        owner: UserId,
        title: Option<String>,
    ) -> StoreFuture<'_, StoreResult<Session>> {
        Box::pin(async move {
            let table = self.sessions.clone();
            let id = SessionId::new();
            let now = now_millis();
            let title = title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION_TITLE.to_string());
            let (owner_raw, title_raw) = (owner.as_str().to_string(), title.clone());

            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!(
                            "INSERT INTO {table} (id, owner_id, title, is_archived, created_at, updated_at)
                             VALUES (?1, ?2, ?3, 0, ?4, ?4)"
                        ),
                        rusqlite::params![id, owner_raw, title_raw, now],
                    )?;
                    Ok(())
                })
                .await?;

            debug!(session_id = %id, owner = %owner, "session created");
            let created_at = timestamp(now)?;
            Ok(Session {
                id,
                owner,
                title,
                is_archived: false,
                created_at,
                updated_at: created_at,
                message_count: 0,
            })
        })
    }

    fn list_sessions(
        &self,
        owner: UserId,
        page: u32,
        limit: u32,
    ) -> StoreFuture<'_, StoreResult<SessionPage>> {
        Box::pin(async move {
            let table = self.sessions.clone();
            let sql = format!(
                "{} WHERE s.owner_id = ?1 AND s.is_archived = 0
                 ORDER BY s.updated_at DESC, s.rowid DESC
                 LIMIT ?2 OFFSET ?3",
                self.session_select()
            );
            let owner_raw = owner.as_str().to_string();
            let limit = i64::from(limit);
            let offset = i64::from(page.max(1) - 1) * limit;

            let (rows, total) = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map(rusqlite::params![owner_raw, limit, offset], SessionRow::read)?
                        .collect::<Result<Vec<_>, _>>()?;
                    let total: i64 = conn.query_row(
                        &format!(
                            "SELECT COUNT(*) FROM {table} WHERE owner_id = ?1 AND is_archived = 0"
                        ),
                        rusqlite::params![owner_raw],
                        |row| row.get(0),
                    )?;
                    Ok((rows, total))
                })
                .await?;

            let sessions = rows
                .into_iter()
                .map(SessionRow::into_session)
                .collect::<StoreResult<Vec<_>>>()?;
            let total = u64::try_from(total)
                .map_err(|_| StoreError::InvalidRow("invalid session count".to_string()))?;
            Ok(SessionPage { sessions, total })
        })
    }

    fn get_session(
        &self,
        session_id: SessionId,
        owner: UserId,
    ) -> StoreFuture<'_, StoreResult<Session>> {
        Box::pin(async move { self.owned_session(session_id, &owner).await })
    }

    fn update_session(
        &self,
        session_id: SessionId,
        owner: UserId,
        update: SessionUpdate,
    ) -> StoreFuture<'_, StoreResult<Session>> {
        Box::pin(async move {
            self.owned_session(session_id, &owner).await?;

            let table = self.sessions.clone();
            let now = now_millis();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!(
                            "UPDATE {table}
                             SET title = COALESCE(?2, title),
                                 is_archived = COALESCE(?3, is_archived),
                                 updated_at = ?4
                             WHERE id = ?1"
                        ),
                        rusqlite::params![session_id, update.title, update.archived, now],
                    )?;
                    Ok(())
                })
                .await?;

            self.owned_session(session_id, &owner).await
        })
    }

    fn delete_session(
        &self,
        session_id: SessionId,
        owner: UserId,
    ) -> StoreFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.owned_session(session_id, &owner).await?;

            let (s, m) = (self.sessions.clone(), self.messages.clone());
            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    tx.execute(
                        &format!("DELETE FROM {m} WHERE session_id = ?1"),
                        rusqlite::params![session_id],
                    )?;
                    tx.execute(
                        &format!("DELETE FROM {s} WHERE id = ?1"),
                        rusqlite::params![session_id],
                    )?;
                    tx.commit()?;
                    Ok(())
                })
                .await?;

            debug!(session_id = %session_id, "session deleted");
            Ok(())
        })
    }

    fn append_message(
        &self,
        session_id: SessionId,
        role: MessageRole,
        content: String,
        meta: Option<AssistantMeta>,
    ) -> StoreFuture<'_, StoreResult<Message>> {
        Box::pin(async move {
            let (s, m) = (self.sessions.clone(), self.messages.clone());
            let id = MessageId::new();
            let now = now_millis();
            let model = meta.as_ref().map(|meta| meta.model.clone());
            let prompt_tokens = meta.as_ref().map(|meta| meta.usage.prompt_tokens);
            let completion_tokens = meta.as_ref().map(|meta| meta.usage.completion_tokens);
            let row_content = content.clone();
            let row_model = model.clone();

            let inserted = self
                .conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    let exists: bool = tx.query_row(
                        &format!("SELECT EXISTS(SELECT 1 FROM {s} WHERE id = ?1)"),
                        rusqlite::params![session_id],
                        |row| row.get(0),
                    )?;
                    if !exists {
                        return Ok(false);
                    }
                    tx.execute(
                        &format!(
                            "INSERT INTO {m}
                                (id, session_id, role, content, model, prompt_tokens, completion_tokens, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                        ),
                        rusqlite::params![
                            id,
                            session_id,
                            role.as_str(),
                            row_content,
                            row_model,
                            prompt_tokens,
                            completion_tokens,
                            now
                        ],
                    )?;
                    if role == MessageRole::User {
                        tx.execute(
                            &format!("UPDATE {s} SET updated_at = ?2 WHERE id = ?1"),
                            rusqlite::params![session_id, now],
                        )?;
                    }
                    tx.commit()?;
                    Ok(true)
                })
                .await?;

            if !inserted {
                return Err(StoreError::SessionNotFound(session_id));
            }

            debug!(session_id = %session_id, message_id = %id, role = %role, "message appended");
            Ok(Message {
                id,
                session_id,
                role,
                content,
                created_at: timestamp(now)?,
                model,
                prompt_tokens,
                completion_tokens,
            })
        })
    }

    fn list_recent_messages(
        &self,
        session_id: SessionId,
        limit: usize,
    ) -> StoreFuture<'_, StoreResult<Vec<Message>>> {
        Box::pin(async move {
            let sql = format!(
                "{} WHERE session_id = ?1 AND seq < ?2 ORDER BY seq DESC LIMIT ?3",
                self.message_select()
            );
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut messages = self
                .query_messages(sql, session_id, i64::MAX, limit)
                .await?;
            messages.reverse();
            Ok(messages)
        })
    }

    fn list_messages(
        &self,
        session_id: SessionId,
        limit: usize,
        before: Option<MessageId>,
    ) -> StoreFuture<'_, StoreResult<MessagePage>> {
        Box::pin(async move {
            let table = self.messages.clone();
            let bound = match before {
                Some(cursor) => self
                    .conn
                    .call(move |conn| {
                        let seq = conn
                            .query_row(
                                &format!(
                                    "SELECT seq FROM {table} WHERE id = ?1 AND session_id = ?2"
                                ),
                                rusqlite::params![cursor, session_id],
                                |row| row.get::<_, i64>(0),
                            )
                            .optional()?;
                        Ok(seq)
                    })
                    .await?
                    .unwrap_or(i64::MAX),
                None => i64::MAX,
            };

            let sql = format!(
                "{} WHERE session_id = ?1 AND seq < ?2 ORDER BY seq DESC LIMIT ?3",
                self.message_select()
            );
            let fetch = i64::try_from(limit).unwrap_or(i64::MAX - 1) + 1;
            let mut messages = self.query_messages(sql, session_id, bound, fetch).await?;

            let has_more = messages.len() > limit;
            messages.truncate(limit);
            messages.reverse();
            Ok(MessagePage { messages, has_more })
        })
    }

    fn rename_session_if_default(
        &self,
        session_id: SessionId,
        title: String,
    ) -> StoreFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            let table = self.sessions.clone();
            let changed = self
                .conn
                .call(move |conn| {
                    let changed = conn.execute(
                        &format!("UPDATE {table} SET title = ?2 WHERE id = ?1 AND title = ?3"),
                        rusqlite::params![session_id, title, DEFAULT_SESSION_TITLE],
                    )?;
                    Ok(changed)
                })
                .await?;
            Ok(changed > 0)
        })
    }
}

struct SessionRow {
    id: SessionId,
    owner: String,
    title: String,
    is_archived: bool,
    created_at: i64,
    updated_at: i64,
    message_count: i64,
}

impl SessionRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            title: row.get(2)?,
            is_archived: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            message_count: row.get(6)?,
        })
    }

    fn into_session(self) -> StoreResult<Session> {
        Ok(Session {
            id: self.id,
            owner: UserId::new(self.owner),
            title: self.title,
            is_archived: self.is_archived,
            created_at: timestamp(self.created_at)?,
            updated_at: timestamp(self.updated_at)?,
            message_count: u64::try_from(self.message_count)
                .map_err(|_| StoreError::InvalidRow("invalid message count".to_string()))?,
        })
    }
}

struct MessageRow {
    id: MessageId,
    session_id: SessionId,
    role: String,
    content: String,
    created_at: i64,
    model: Option<String>,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
}

impl MessageRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
            model: row.get(5)?,
            prompt_tokens: row.get(6)?,
            completion_tokens: row.get(7)?,
        })
    }

    fn into_message(self) -> StoreResult<Message> {
        let role = self
            .role
            .parse::<MessageRole>()
            .map_err(|role| StoreError::InvalidRow(format!("unknown role {role:?}")))?;
        Ok(Message {
            id: self.id,
            session_id: self.session_id,
            role,
            content: self.content,
            created_at: timestamp(self.created_at)?,
            model: self.model,
            prompt_tokens: token_count(self.prompt_tokens)?,
            completion_tokens: token_count(self.completion_tokens)?,
        })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn timestamp(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::InvalidRow("invalid timestamp".to_string()))
}

fn token_count(value: Option<i64>) -> StoreResult<Option<u32>> {
    value
        .map(|v| {
            u32::try_from(v).map_err(|_| StoreError::InvalidRow("invalid token count".to_string()))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::TokenUsage;

    async fn store() -> SqliteConversationStore {
        SqliteConversationStore::open_in_memory().await.unwrap()
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    #[tokio::test]
    async fn test_create_session_uses_placeholder_title() {
        let store = store().await;
        let session = store.create_session(alice(), None).await.unwrap();
        assert_eq!(session.title, DEFAULT_SESSION_TITLE);

        let blank = store
            .create_session(alice(), Some("   ".to_string()))
            .await
            .unwrap();
        assert_eq!(blank.title, DEFAULT_SESSION_TITLE);

        let named = store
            .create_session(alice(), Some("Trip".to_string()))
            .await
            .unwrap();
        assert_eq!(named.title, "Trip");
    }

    #[tokio::test]
    async fn test_get_session_checks_owner() {
        let store = store().await;
        let session = store.create_session(alice(), None).await.unwrap();

        let found = store.get_session(session.id, alice()).await.unwrap();
        assert_eq!(found.id, session.id);

        let denied = store.get_session(session.id, UserId::new("bob")).await;
        assert!(matches!(denied, Err(StoreError::AccessDenied(_))));

        let missing = store.get_session(SessionId::new(), alice()).await;
        assert!(matches!(missing, Err(StoreError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_append_counts_messages_and_keeps_meta() {
        let store = store().await;
        let session = store.create_session(alice(), None).await.unwrap();

        store
            .append_message(session.id, MessageRole::User, "Hello".to_string(), None)
            .await
            .unwrap();
        let meta = AssistantMeta {
            model: "gpt-4o-mini".to_string(),
            usage: TokenUsage::new(5, 3),
        };
        let reply = store
            .append_message(
                session.id,
                MessageRole::Assistant,
                "Hi there!".to_string(),
                Some(meta),
            )
            .await
            .unwrap();
        assert_eq!(reply.prompt_tokens, Some(5));

        let reloaded = store.get_session(session.id, alice()).await.unwrap();
        assert_eq!(reloaded.message_count, 2);

        let history = store.list_recent_messages(session.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(history[1].completion_tokens, Some(3));
    }

    #[tokio::test]
    async fn test_append_to_missing_session_fails() {
        let store = store().await;
        let result = store
            .append_message(SessionId::new(), MessageRole::User, "x".to_string(), None)
            .await;
        assert!(matches!(result, Err(StoreError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_recent_messages_are_chronological_and_bounded() {
        let store = store().await;
        let session = store.create_session(alice(), None).await.unwrap();
        for i in 0..5 {
            store
                .append_message(session.id, MessageRole::User, format!("m{i}"), None)
                .await
                .unwrap();
        }

        let recent = store.list_recent_messages(session.id, 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_message_pages_walk_backwards() {
        let store = store().await;
        let session = store.create_session(alice(), None).await.unwrap();
        for i in 0..5 {
            store
                .append_message(session.id, MessageRole::User, format!("m{i}"), None)
                .await
                .unwrap();
        }

        let latest = store.list_messages(session.id, 2, None).await.unwrap();
        let contents: Vec<&str> = latest.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert!(latest.has_more);

        let older = store
            .list_messages(session.id, 10, Some(latest.messages[0].id))
            .await
            .unwrap();
        let contents: Vec<&str> = older.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2"]);
        assert!(!older.has_more);

        let unknown = store
            .list_messages(session.id, 10, Some(MessageId::new()))
            .await
            .unwrap();
        assert_eq!(unknown.messages.len(), 5);
    }

    #[tokio::test]
    async fn test_rename_if_default_only_once() {
        let store = store().await;
        let session = store.create_session(alice(), None).await.unwrap();

        assert!(
            store
                .rename_session_if_default(session.id, "First".to_string())
                .await
                .unwrap()
        );
        assert!(
            !store
                .rename_session_if_default(session.id, "Second".to_string())
                .await
                .unwrap()
        );
        let reloaded = store.get_session(session.id, alice()).await.unwrap();
        assert_eq!(reloaded.title, "First");
    }

    #[tokio::test]
    async fn test_list_sessions_pages_and_skips_archived() {
        let store = store().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.create_session(alice(), None).await.unwrap().id);
        }
        store
            .create_session(UserId::new("bob"), None)
            .await
            .unwrap();
        store
            .update_session(
                ids[0],
                alice(),
                SessionUpdate {
                    archived: Some(true),
                    ..SessionUpdate::default()
                },
            )
            .await
            .unwrap();

        let first = store.list_sessions(alice(), 1, 1).await.unwrap();
        assert_eq!(first.total, 2);
        assert_eq!(first.sessions.len(), 1);
        let second = store.list_sessions(alice(), 2, 1).await.unwrap();
        assert_eq!(second.sessions.len(), 1);
        assert_ne!(first.sessions[0].id, second.sessions[0].id);
        assert!(second.sessions.iter().all(|s| s.id != ids[0]));
    }

    #[tokio::test]
    async fn test_user_message_moves_session_to_front() {
        let store = store().await;
        let older = store.create_session(alice(), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = store.create_session(alice(), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        store
            .append_message(older.id, MessageRole::User, "bump".to_string(), None)
            .await
            .unwrap();

        let page = store.list_sessions(alice(), 1, 10).await.unwrap();
        assert_eq!(page.sessions[0].id, older.id);
        assert_eq!(page.sessions[1].id, newer.id);
    }

    #[tokio::test]
    async fn test_delete_removes_messages_and_checks_owner() {
        let store = store().await;
        let session = store.create_session(alice(), None).await.unwrap();
        store
            .append_message(session.id, MessageRole::User, "x".to_string(), None)
            .await
            .unwrap();

        let denied = store.delete_session(session.id, UserId::new("bob")).await;
        assert!(matches!(denied, Err(StoreError::AccessDenied(_))));

        store.delete_session(session.id, alice()).await.unwrap();
        assert!(matches!(
            store.get_session(session.id, alice()).await,
            Err(StoreError::SessionNotFound(_))
        ));
        assert!(
            store
                .list_recent_messages(session.id, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_update_session_renames() {
        let store = store().await;
        let session = store.create_session(alice(), None).await.unwrap();
        let updated = store
            .update_session(
                session.id,
                alice(),
                SessionUpdate {
                    title: Some("Renamed".to_string()),
                    ..SessionUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "Renamed");
        assert!(!updated.is_archived);
    }
}
