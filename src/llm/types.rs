//! Shared types for completion providers.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::llm::error::ProviderError;
use crate::store::types::MessageRole;

/// Chat models accepted by the relay.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ChatModel {
    /// `gpt-4o`.
    #[serde(rename = "gpt-4o")]
    Gpt4o,
    /// `gpt-4o-mini`.
    #[default]
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
    /// `gpt-4-turbo`.
    #[serde(rename = "gpt-4-turbo")]
    Gpt4Turbo,
    /// `gpt-3.5-turbo`.
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
}

impl ChatModel {
    /// Every accepted model, in display order.
    pub const ALL: [Self; 4] = [Self::Gpt4o, Self::Gpt4oMini, Self::Gpt4Turbo, Self::Gpt35Turbo];

    /// Provider-facing model name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gpt4o => "gpt-4o",
            Self::Gpt4oMini => "gpt-4o-mini",
            Self::Gpt4Turbo => "gpt-4-turbo",
            Self::Gpt35Turbo => "gpt-3.5-turbo",
        }
    }
}

impl fmt::Display for ChatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatModel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|model| model.as_str() == value)
            .ok_or_else(|| value.to_string())
    }
}

/// Token accounting reported by the provider at the end of a stream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens produced by the completion.
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Build a usage record.
    #[must_use]
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// One message of the context sent to the provider.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    /// Message role.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
}

impl ContextMessage {
    /// Build a context message.
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Item of a provider stream.
///
/// A well-formed stream is zero or more `Delta`s followed by exactly one
/// `Finished`; a failing stream ends with an `Err` item instead.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CompletionChunk {
    /// Incremental text, in provider emission order.
    Delta(String),
    /// Terminal usage summary.
    Finished(TokenUsage),
}

/// Lazy sequence of provider chunks.
pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<CompletionChunk, ProviderError>> + Send>>;
