//! HTTP route handlers for the chat relay API.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ids::{MessageId, SessionId};
use crate::relay::orchestrator::TurnRequest;
use crate::server::auth::VerifiedIdentity;
use crate::server::error::ApiError;
use crate::server::state::AppState;
use crate::store::sqlite::SessionUpdate;
use crate::store::types::{Message, Session};
use crate::transport::sse::stream_response;

/// Maximum session title length in characters.
const MAX_TITLE_CHARS: usize = 255;
/// Default and maximum page size for session listings.
const DEFAULT_SESSION_LIMIT: u32 = 20;
const MAX_SESSION_LIMIT: u32 = 100;
/// Default and maximum page size for message history.
const DEFAULT_MESSAGE_LIMIT: usize = 50;
const MAX_MESSAGE_LIMIT: usize = 100;

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/chat/sessions",
            get(list_sessions).post(create_session),
        )
        .route(
            "/api/chat/sessions/{session_id}",
            get(get_session).patch(update_session).delete(delete_session),
        )
        .route(
            "/api/chat/sessions/{session_id}/messages",
            get(list_messages),
        )
        .route(
            "/api/chat/sessions/{session_id}/messages/stream",
            post(stream_message),
        )
        .fallback(route_not_found)
        .with_state(state)
}

/// Success envelope.
#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::invalid_field("sessionId", "Invalid session ID"))
}

async fn route_not_found() -> ApiError {
    ApiError::not_found("NOT_FOUND", "Route not found")
}

/// Health check endpoint.
async fn health_check(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    if let Err(err) = state.store().ping().await {
        warn!("health check failed: {err}");
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Database disconnected",
        ));
    }
    Ok(ok(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
        "database": "connected",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response())
}

/// Session listing query.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    /// One-based page number.
    pub page: Option<u32>,
    /// Page size.
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    page: u32,
    limit: u32,
    total: u64,
    total_pages: u64,
}

#[derive(Debug, Serialize)]
struct SessionList {
    sessions: Vec<Session>,
    pagination: Pagination,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    identity: VerifiedIdentity,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Envelope<SessionList>>, ApiError> {
    let Query(query) = query?;
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(DEFAULT_SESSION_LIMIT);
    if page == 0 {
        return Err(ApiError::invalid_field("page", "Page must be at least 1"));
    }
    if limit == 0 || limit > MAX_SESSION_LIMIT {
        return Err(ApiError::invalid_field(
            "limit",
            format!("Limit must be between 1 and {MAX_SESSION_LIMIT}"),
        ));
    }

    let result = state
        .store()
        .list_sessions(identity.user_id, page, limit)
        .await?;
    let total_pages = result.total.div_ceil(u64::from(limit));
    Ok(ok(SessionList {
        sessions: result.sessions,
        pagination: Pagination {
            page,
            limit,
            total: result.total,
            total_pages,
        },
    }))
}

/// Session creation body.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    /// Optional initial title.
    pub title: Option<String>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    identity: VerifiedIdentity,
    body: Result<Json<CreateSessionBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<Session>>), ApiError> {
    let Json(body) = body?;
    if let Some(title) = &body.title {
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(ApiError::invalid_field(
                "title",
                format!("Title must be at most {MAX_TITLE_CHARS} characters"),
            ));
        }
    }

    let session = state
        .store()
        .create_session(identity.user_id, body.title)
        .await?;
    info!(session_id = %session.id, "session created");
    Ok((StatusCode::CREATED, ok(session)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    identity: VerifiedIdentity,
    Path(session_id): Path<String>,
) -> Result<Json<Envelope<Session>>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    let session = state
        .store()
        .get_session(session_id, identity.user_id)
        .await?;
    Ok(ok(session))
}

/// Session update body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionBody {
    /// New title, 1 to 255 characters.
    pub title: Option<String>,
    /// Archive or restore the session.
    pub is_archived: Option<bool>,
}

async fn update_session(
    State(state): State<Arc<AppState>>,
    identity: VerifiedIdentity,
    Path(session_id): Path<String>,
    body: Result<Json<UpdateSessionBody>, JsonRejection>,
) -> Result<Json<Envelope<Session>>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    let Json(body) = body?;

    let title = match body.title {
        Some(title) => {
            let title = title.trim().to_string();
            let len = title.chars().count();
            if len == 0 || len > MAX_TITLE_CHARS {
                return Err(ApiError::invalid_field(
                    "title",
                    format!("Title must be between 1 and {MAX_TITLE_CHARS} characters"),
                ));
            }
            Some(title)
        }
        None => None,
    };
    if title.is_none() && body.is_archived.is_none() {
        return Err(ApiError::validation("Nothing to update", None));
    }

    let session = state
        .store()
        .update_session(
            session_id,
            identity.user_id,
            SessionUpdate {
                title,
                archived: body.is_archived,
            },
        )
        .await?;
    Ok(ok(session))
}

#[derive(Debug, Serialize)]
struct Deleted {
    success: bool,
    message: &'static str,
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    identity: VerifiedIdentity,
    Path(session_id): Path<String>,
) -> Result<Json<Deleted>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    state
        .store()
        .delete_session(session_id, identity.user_id)
        .await?;
    info!(session_id = %session_id, "session deleted");
    Ok(Json(Deleted {
        success: true,
        message: "Session deleted successfully",
    }))
}

/// Message history query.
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Page size.
    pub limit: Option<usize>,
    /// Return messages older than this message id.
    pub before: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageHistory {
    messages: Vec<Message>,
    has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    oldest_message_id: Option<MessageId>,
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    identity: VerifiedIdentity,
    Path(session_id): Path<String>,
    query: Result<Query<MessagesQuery>, QueryRejection>,
) -> Result<Json<Envelope<MessageHistory>>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    if limit == 0 || limit > MAX_MESSAGE_LIMIT {
        return Err(ApiError::invalid_field(
            "limit",
            format!("Limit must be between 1 and {MAX_MESSAGE_LIMIT}"),
        ));
    }
    let before = query
        .before
        .as_deref()
        .map(str::parse::<MessageId>)
        .transpose()
        .map_err(|_| ApiError::invalid_field("before", "Invalid message ID"))?;

    let store = state.store();
    store.get_session(session_id, identity.user_id).await?;
    let page = store.list_messages(session_id, limit, before).await?;
    let oldest_message_id = page.messages.first().map(|message| message.id);
    Ok(ok(MessageHistory {
        messages: page.messages,
        has_more: page.has_more,
        oldest_message_id,
    }))
}

/// Streaming message body.
#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    /// User message text.
    pub content: String,
    /// Requested model.
    pub model: Option<String>,
}

async fn stream_message(
    State(state): State<Arc<AppState>>,
    identity: VerifiedIdentity,
    Path(session_id): Path<String>,
    body: Result<Json<SendMessageBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    if !state.limiter.try_acquire(&identity.user_id) {
        warn!(user_id = %identity.user_id, "stream rate limit exceeded");
        return Err(ApiError::rate_limited());
    }
    let session_id = parse_session_id(&session_id)?;
    let Json(body) = body?;

    let turn = state
        .orchestrator
        .handle_turn(TurnRequest {
            session_id,
            owner: identity.user_id,
            content: body.content,
            model: body.model,
        })
        .await?;

    Ok(stream_response(turn.events))
}
