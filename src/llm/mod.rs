//! Completion provider clients.
//!
//! - `provider`: the `CompletionProvider` trait
//! - `openai`: OpenAI-compatible streaming client
//! - `replay`: scripted provider without network access
//! - `title`: session title cleanup

pub mod error;
pub mod openai;
pub mod provider;
pub mod replay;
pub mod title;
pub mod types;

pub use error::ProviderError;
pub use openai::OpenAiClient;
pub use provider::{CompletionProvider, ProviderFuture};
pub use replay::{ReplayProvider, ReplayStep};
pub use types::{ChatModel, CompletionChunk, CompletionStream, ContextMessage, TokenUsage};
