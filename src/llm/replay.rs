//! Scripted completion provider.
//!
//! Replays a fixed sequence of steps without network access and records what
//! it was asked, so relay behaviour can be exercised deterministically.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;

use crate::llm::error::ProviderError;
use crate::llm::provider::{CompletionProvider, ProviderFuture};
use crate::llm::title::fallback_title;
use crate::llm::types::{ChatModel, CompletionChunk, CompletionStream, ContextMessage, TokenUsage};

/// One scripted step of a replayed stream.
#[derive(Clone, Debug)]
pub enum ReplayStep {
    /// Yield a text delta.
    Chunk(String),
    /// Wait before the next step.
    Pause(Duration),
    /// End the stream abnormally.
    Fail(String),
    /// End the stream with a usage summary.
    Finish(TokenUsage),
    /// Never yield again.
    Hang,
}

/// Provider that replays a script for every call.
#[derive(Debug)]
pub struct ReplayProvider {
    steps: Vec<ReplayStep>,
    open_error: Option<String>,
    title: Option<String>,
    contexts: Mutex<Vec<(ChatModel, Vec<ContextMessage>)>>,
    seeds: Mutex<Vec<String>>,
}

impl ReplayProvider {
    /// Replay `steps` on every stream request.
    #[must_use]
    pub fn new(steps: Vec<ReplayStep>) -> Self {
        Self {
            steps,
            open_error: None,
            title: None,
            contexts: Mutex::new(Vec::new()),
            seeds: Mutex::new(Vec::new()),
        }
    }

    /// Stream `chunks` and finish with `usage`.
    #[must_use]
    pub fn completing<I, S>(chunks: I, usage: TokenUsage) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut steps: Vec<ReplayStep> = chunks
            .into_iter()
            .map(|chunk| ReplayStep::Chunk(chunk.into()))
            .collect();
        steps.push(ReplayStep::Finish(usage));
        Self::new(steps)
    }

    /// Reject every stream request before any chunk.
    #[must_use]
    pub fn failing_open(message: impl Into<String>) -> Self {
        let mut provider = Self::new(Vec::new());
        provider.open_error = Some(message.into());
        provider
    }

    /// Title returned by `derive_title`; without one the fallback is used.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Contexts received so far, with the requested model.
    #[must_use]
    pub fn contexts(&self) -> Vec<(ChatModel, Vec<ContextMessage>)> {
        self.contexts
            .lock()
            .map(|contexts| contexts.clone())
            .unwrap_or_default()
    }

    /// Seeds passed to `derive_title` so far.
    #[must_use]
    pub fn title_seeds(&self) -> Vec<String> {
        self.seeds
            .lock()
            .map(|seeds| seeds.clone())
            .unwrap_or_default()
    }
}

impl CompletionProvider for ReplayProvider {
    fn stream_completion(
        &self,
        messages: Vec<ContextMessage>,
        model: ChatModel,
    ) -> ProviderFuture<'_, Result<CompletionStream, ProviderError>> {
        Box::pin(async move {
            if let Ok(mut contexts) = self.contexts.lock() {
                contexts.push((model, messages));
            }
            if let Some(message) = &self.open_error {
                return Err(ProviderError::Status {
                    status: 503,
                    body: message.clone(),
                });
            }

            let steps: VecDeque<ReplayStep> = self.steps.iter().cloned().collect();
            let stream = futures::stream::unfold(steps, |mut steps| async move {
                loop {
                    match steps.pop_front()? {
                        ReplayStep::Chunk(text) => {
                            return Some((Ok(CompletionChunk::Delta(text)), steps));
                        }
                        ReplayStep::Pause(delay) => tokio::time::sleep(delay).await,
                        ReplayStep::Fail(message) => {
                            steps.clear();
                            return Some((Err(ProviderError::Upstream(message)), steps));
                        }
                        ReplayStep::Finish(usage) => {
                            steps.clear();
                            return Some((Ok(CompletionChunk::Finished(usage)), steps));
                        }
                        ReplayStep::Hang => futures::future::pending::<()>().await,
                    }
                }
            });
            Ok(stream.boxed())
        })
    }

    fn derive_title(&self, seed: &str) -> ProviderFuture<'_, String> {
        if let Ok(mut seeds) = self.seeds.lock() {
            seeds.push(seed.to_string());
        }
        let title = self
            .title
            .clone()
            .unwrap_or_else(|| fallback_title().to_string());
        Box::pin(async move { title })
    }
}
