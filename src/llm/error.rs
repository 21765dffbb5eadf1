//! Error types for completion providers.

use thiserror::Error;

/// Errors produced while talking to a completion provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP transport failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with a non-success status.
    #[error("provider returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Provider reported an error inside the stream.
    #[error("provider reported an error: {0}")]
    Upstream(String),

    /// A payload could not be decoded.
    #[error("malformed provider payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The event source failed to parse or connect.
    #[error("provider event stream failed: {0}")]
    EventSource(String),

    /// The event stream ended before the end-of-stream marker.
    #[error("provider stream ended before completion")]
    Truncated,

    /// Client configuration error.
    #[error("provider client error: {0}")]
    Config(String),
}
