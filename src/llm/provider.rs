//! Completion provider abstraction.

use std::future::Future;
use std::pin::Pin;

use crate::llm::error::ProviderError;
use crate::llm::types::{ChatModel, CompletionStream, ContextMessage};

/// Boxed future type for provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A streaming chat completion backend.
pub trait CompletionProvider: Send + Sync {
    /// Open a token stream for `messages`.
    ///
    /// The returned stream yields chunks as soon as they are decoded and ends
    /// with a usage summary, or with an error and no usage summary.
    ///
    /// # Errors
    /// Returns an error if the request cannot be sent or is rejected.
    fn stream_completion(
        &self,
        messages: Vec<ContextMessage>,
        model: ChatModel,
    ) -> ProviderFuture<'_, Result<CompletionStream, ProviderError>>;

    /// Derive a short session title from the first user message.
    ///
    /// Best effort: any failure yields the default session title.
    fn derive_title(&self, seed: &str) -> ProviderFuture<'_, String>;
}
