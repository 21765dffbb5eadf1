//! HTTP server for the chat relay API.
//!
//! Provides REST endpoints for:
//! - Session management
//! - Message history
//! - Streaming assistant turns over SSE

pub mod auth;
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use auth::{AuthError, JwtVerifier, VerifiedIdentity};
pub use error::ApiError;
pub use rate_limit::RateLimiter;
pub use routes::create_router;
pub use state::AppState;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let Some(origin) = config.cors_origin.as_deref() else {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    };
    match HeaderValue::from_str(origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_credentials(true)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([ACCEPT, AUTHORIZATION, CONTENT_TYPE]),
        Err(err) => {
            tracing::warn!("ignoring invalid CORS origin {origin:?}: {err}");
            CorsLayer::new()
        }
    }
}

/// Build the router with CORS and request tracing layers.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server);
    create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already bound listener until `shutdown_signal` completes.
///
/// # Errors
/// Returns an error if the server fails.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_signal: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    Ok(())
}

/// Start the HTTP server.
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>, port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    run_server_with_shutdown(state, port, std::future::pending()).await
}

/// Start the HTTP server with graceful shutdown support.
///
/// The server will stop accepting new connections when `shutdown_signal` completes.
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn run_server_with_shutdown<F>(
    state: Arc<AppState>,
    port: u16,
    shutdown_signal: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Chat relay listening on http://{}", addr);
    serve(listener, state, shutdown_signal).await
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::ChatRelayConfig;
    use crate::llm::replay::ReplayProvider;
    use crate::llm::types::TokenUsage;
    use crate::relay::events::StreamEvent;
    use crate::relay::orchestrator::RelayBackends;
    use crate::server::auth::issue_token;
    use crate::store::sqlite::SqliteConversationStore;
    use crate::transport::client::{ClientError, RelayClient};

    async fn spawn_server() -> (String, oneshot::Sender<()>) {
        let mut config = ChatRelayConfig::default();
        config.auth.jwt_secret = "loopback-secret".to_string();
        let store = Arc::new(SqliteConversationStore::open_in_memory().await.unwrap());
        let state = AppState::with_backends(
            config,
            RelayBackends {
                store,
                provider: Arc::new(
                    ReplayProvider::completing(["Hi", " there", "!"], TokenUsage::new(5, 3))
                        .with_title("Greeting"),
                ),
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, state, async {
            let _ = stopped.await;
        }));
        (format!("http://{addr}"), stop)
    }

    #[tokio::test]
    async fn test_loopback_turn_with_client() {
        let (base_url, _stop) = spawn_server().await;
        let client = RelayClient::new(base_url)
            .unwrap()
            .with_access_token(issue_token("loopback-secret", "alice", "alice"));

        let session_id = client.create_session(None).await.unwrap();
        let events: Vec<StreamEvent> = client
            .stream_message(session_id, "Hello", None)
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        let StreamEvent::Start(start) = &events[0] else {
            panic!("first event should be start");
        };
        assert_eq!(start.message_id.to_string().len(), 36);
        let text: String = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Delta(delta) => Some(delta.content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hi there!");
        let Some(StreamEvent::Done(done)) = events.last() else {
            panic!("last event should be done");
        };
        assert_eq!(done.usage, TokenUsage::new(5, 3));
    }

    #[tokio::test]
    async fn test_loopback_refusal_surfaces_api_error() {
        let (base_url, _stop) = spawn_server().await;
        let client = RelayClient::new(base_url).unwrap();
        let Err(ClientError::Api { status, code, .. }) = client.create_session(None).await else {
            panic!("unauthenticated create should fail");
        };
        assert_eq!(status, 401);
        assert_eq!(code, "NO_TOKEN");
    }
}
