//! Configuration for the chat relay server.
//!
//! Every section has sensible defaults; `ChatRelayConfig::from_env` applies
//! `CHAT_RELAY_*` overrides on top of them and validates the result.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::llm::types::ChatModel;

/// Environment variable for the listening port.
pub const PORT_ENV: &str = "CHAT_RELAY_PORT";
/// Environment variable for the allowed CORS origin.
pub const CORS_ORIGIN_ENV: &str = "CHAT_RELAY_CORS_ORIGIN";
/// Environment variable for the provider base URL.
pub const PROVIDER_URL_ENV: &str = "CHAT_RELAY_PROVIDER_URL";
/// Environment variable for the provider API key.
pub const API_KEY_ENV: &str = "CHAT_RELAY_API_KEY";
/// Environment variable for the `SQLite` database path.
pub const DB_PATH_ENV: &str = "CHAT_RELAY_DB";
/// Environment variable for the JWT verification secret.
pub const JWT_SECRET_ENV: &str = "CHAT_RELAY_JWT_SECRET";
/// Environment variable for the context window size.
pub const CONTEXT_WINDOW_ENV: &str = "CHAT_RELAY_CONTEXT_WINDOW";
/// Environment variable for the per-turn stream timeout in seconds.
pub const STREAM_TIMEOUT_ENV: &str = "CHAT_RELAY_STREAM_TIMEOUT_SECS";
/// Environment variable for the default chat model.
pub const DEFAULT_MODEL_ENV: &str = "CHAT_RELAY_DEFAULT_MODEL";

/// Fixed system instruction prepended to every provider context.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Give clear and accurate answers.
Keep responses concise but complete, and say so when you are not sure about something.
Use markdown formatting where it helps readability.";

/// Configuration loading or validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range or otherwise unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// An environment override could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv {
        /// Environment variable name.
        key: &'static str,
        /// Raw value that failed to parse.
        value: String,
    },
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatRelayConfig {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Completion provider settings.
    pub provider: ProviderConfig,
    /// Turn orchestration settings.
    pub relay: RelayConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Token verification settings.
    pub auth: AuthConfig,
    /// Stream endpoint rate limiting.
    pub rate_limit: RateLimitConfig,
}

impl ChatRelayConfig {
    /// Build the configuration from defaults and `CHAT_RELAY_*` variables.
    ///
    /// # Errors
    /// Returns an error if an override cannot be parsed or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    ///
    /// # Errors
    /// Returns an error if a present value cannot be parsed.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, PORT_ENV, &mut self.server.port)?;
        override_parsed(&lookup, CONTEXT_WINDOW_ENV, &mut self.relay.context_window)?;
        override_parsed(&lookup, STREAM_TIMEOUT_ENV, &mut self.relay.stream_timeout_secs)?;
        override_parsed(&lookup, DEFAULT_MODEL_ENV, &mut self.relay.default_model)?;

        if let Some(origin) = lookup(CORS_ORIGIN_ENV) {
            self.server.cors_origin = Some(origin);
        }
        if let Some(url) = lookup(PROVIDER_URL_ENV) {
            self.provider.base_url = url;
        }
        if let Some(key) = lookup(API_KEY_ENV) {
            self.provider.api_key = key;
        }
        if let Some(path) = lookup(DB_PATH_ENV) {
            self.storage.sqlite_path = PathBuf::from(path);
        }
        if let Some(secret) = lookup(JWT_SECRET_ENV) {
            self.auth.jwt_secret = secret;
        }
        Ok(())
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.context_window == 0 {
            return Err(ConfigError::Invalid(
                "relay.context_window must be > 0".to_string(),
            ));
        }

        if self.relay.max_content_chars == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_content_chars must be > 0".to_string(),
            ));
        }

        if self.relay.stream_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "relay.stream_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.relay.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "relay.event_buffer must be > 0".to_string(),
            ));
        }

        if self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_requests and rate_limit.window_secs must be > 0".to_string(),
            ));
        }

        if self.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "auth.jwt_secret must be set (use {JWT_SECRET_ENV})"
            )));
        }

        if self.provider.title_max_tokens == 0 {
            return Err(ConfigError::Invalid(
                "provider.title_max_tokens must be > 0".to_string(),
            ));
        }

        Url::parse(&self.provider.base_url)?;

        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { key, value })?;
    }
    Ok(())
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listening port.
    pub port: u16,
    /// Allowed browser origin; `None` allows any origin without credentials.
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            cors_origin: None,
        }
    }
}

/// Completion provider settings (OpenAI-compatible chat completions API).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer credential sent to the provider.
    pub api_key: String,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Timeout for non-streaming calls (title derivation) in seconds.
    pub request_timeout_secs: u64,
    /// Model used for title derivation.
    pub title_model: String,
    /// Output bound for title derivation.
    pub title_max_tokens: u32,
}

impl ProviderConfig {
    /// Connection timeout as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Non-streaming request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            title_model: ChatModel::Gpt4oMini.as_str().to_string(),
            title_max_tokens: 20,
        }
    }
}

/// Turn orchestration settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Number of most recent messages sent to the provider.
    pub context_window: usize,
    /// Maximum user message length in characters.
    pub max_content_chars: usize,
    /// Model used when the request does not name one.
    pub default_model: ChatModel,
    /// Upper bound on one turn's provider stream, in seconds.
    pub stream_timeout_secs: u64,
    /// Capacity of the per-turn event channel.
    pub event_buffer: usize,
    /// Fixed system instruction.
    pub system_prompt: String,
}

impl RelayConfig {
    /// Stream timeout as a `Duration`.
    #[must_use]
    pub const fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            context_window: 20,
            max_content_chars: 10_000,
            default_model: ChatModel::Gpt4oMini,
            stream_timeout_secs: 300,
            event_buffer: 64,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `SQLite` database path.
    pub sqlite_path: PathBuf,
    /// Session table name.
    pub session_table: String,
    /// Message table name.
    pub message_table: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("chat_relay.sqlite"),
            session_table: "chat_sessions".to_string(),
            message_table: "chat_messages".to_string(),
        }
    }
}

/// Access token verification settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer.
    pub jwt_secret: String,
    /// Cookie carrying the access token.
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            cookie_name: "accessToken".to_string(),
        }
    }
}

/// Per-user rate limit on the stream endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in seconds.
    pub window_secs: u64,
    /// Requests allowed per window.
    pub max_requests: u32,
}

impl RateLimitConfig {
    /// Window as a `Duration`.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests: 20,
        }
    }
}
