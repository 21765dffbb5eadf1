//! Application state shared across all request handlers.

use std::sync::Arc;

use crate::config::ChatRelayConfig;
use crate::relay::error::RelayError;
use crate::relay::orchestrator::{RelayBackends, RelayOrchestrator};
use crate::server::auth::JwtVerifier;
use crate::server::rate_limit::RateLimiter;
use crate::store::sqlite::ConversationStore;

/// Shared application state.
pub struct AppState {
    /// Loaded configuration.
    pub config: ChatRelayConfig,
    /// Turn orchestrator.
    pub orchestrator: Arc<RelayOrchestrator>,
    /// Access token verifier.
    pub auth: JwtVerifier,
    /// Stream endpoint limiter.
    pub limiter: RateLimiter,
}

impl AppState {
    /// Create state backed by `SQLite` and the configured provider.
    ///
    /// # Errors
    /// Returns an error if the store or the provider client cannot be created.
    pub async fn new(config: ChatRelayConfig) -> Result<Arc<Self>, RelayError> {
        let backends = RelayBackends::sqlite(&config).await?;
        Ok(Self::with_backends(config, backends))
    }

    /// Create state from explicit backends.
    #[must_use]
    pub fn with_backends(config: ChatRelayConfig, backends: RelayBackends) -> Arc<Self> {
        let orchestrator = Arc::new(RelayOrchestrator::new(backends, config.relay.clone()));
        let auth = JwtVerifier::new(&config.auth);
        let limiter = RateLimiter::new(&config.rate_limit);
        Arc::new(Self {
            config,
            orchestrator,
            auth,
            limiter,
        })
    }

    /// Conversation store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        self.orchestrator.store()
    }
}
