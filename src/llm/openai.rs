//! OpenAI-compatible chat completions client.
//!
//! Behaviour:
//! - `stream_completion` posts with `stream: true` and
//!   `stream_options.include_usage`, then reads the response as an event
//!   source, yielding each content delta as soon as its event arrives.
//! - The stream finishes on the `[DONE]` marker with the last usage report
//!   seen; a source that ends without the marker is reported as truncated.
//! - `derive_title` is a bounded non-streaming call that never fails.

use std::collections::VecDeque;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::llm::error::ProviderError;
use crate::llm::provider::{CompletionProvider, ProviderFuture};
use crate::llm::title::{TITLE_SYSTEM_PROMPT, clean_title, fallback_title, seed_excerpt};
use crate::llm::types::{
    ChatModel, CompletionChunk, CompletionStream, ContextMessage, TokenUsage,
};
use crate::store::types::MessageRole;

/// End-of-stream marker sent as the final `data:` payload.
const DONE_MARKER: &str = "[DONE]";

/// Maximum error body kept in `ProviderError::Status`.
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ContextMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<UsagePayload>,
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Chat completions client bound to one set of credentials.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    endpoint: String,
    api_key: String,
    title_model: String,
    title_max_tokens: u32,
    request_timeout: std::time::Duration,
}

impl OpenAiClient {
    /// Create a client from provider settings.
    ///
    /// No total request timeout is set on the HTTP client: streams are bounded
    /// by the relay instead.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        let endpoint = format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        );
        Ok(Self {
            http,
            endpoint,
            api_key: config.api_key.clone(),
            title_model: config.title_model.clone(),
            title_max_tokens: config.title_max_tokens,
            request_timeout: config.request_timeout(),
        })
    }

    fn post(&self, body: &ChatCompletionRequest<'_>) -> reqwest::RequestBuilder {
        let request = self.http.post(&self.endpoint).json(body);
        if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        }
    }

    async fn open_stream(
        &self,
        messages: Vec<ContextMessage>,
        model: ChatModel,
    ) -> Result<CompletionStream, ProviderError> {
        let body = ChatCompletionRequest {
            model: model.as_str(),
            messages: &messages,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            max_tokens: None,
        };

        debug!(model = %model, messages = messages.len(), "opening completion stream");
        let request = self
            .post(&body)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let mut source = EventSource::new(request)
            .map_err(|err| ProviderError::Config(err.to_string()))?;

        // The first item settles whether the request was accepted.
        let first = match source.next().await {
            Some(Ok(Event::Open)) => None,
            Some(Ok(Event::Message(message))) => Some(Ok(Event::Message(message))),
            Some(Err(err)) => {
                source.close();
                return Err(open_error(err).await);
            }
            None => return Err(ProviderError::Truncated),
        };

        let events = stream::iter(first).chain(source).boxed();
        Ok(decode_completion_stream(events))
    }

    async fn request_title(&self, seed: &str) -> Result<String, ProviderError> {
        let messages = [
            ContextMessage::new(MessageRole::System, TITLE_SYSTEM_PROMPT),
            ContextMessage::new(MessageRole::User, seed_excerpt(seed)),
        ];
        let body = ChatCompletionRequest {
            model: &self.title_model,
            messages: &messages,
            stream: false,
            stream_options: None,
            max_tokens: Some(self.title_max_tokens),
        };

        let response = self
            .post(&body)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let payload: CompletionResponse = response.json().await?;

        Ok(payload
            .choices
            .into_iter()
            .find_map(|choice| choice.message.and_then(|message| message.content))
            .unwrap_or_default())
    }
}

impl CompletionProvider for OpenAiClient {
    fn stream_completion(
        &self,
        messages: Vec<ContextMessage>,
        model: ChatModel,
    ) -> ProviderFuture<'_, Result<CompletionStream, ProviderError>> {
        Box::pin(self.open_stream(messages, model))
    }

    fn derive_title(&self, seed: &str) -> ProviderFuture<'_, String> {
        let seed = seed.to_string();
        Box::pin(async move {
            match self.request_title(&seed).await {
                Ok(raw) => clean_title(&raw).unwrap_or_else(|| fallback_title().to_string()),
                Err(err) => {
                    warn!("title derivation failed: {err}");
                    fallback_title().to_string()
                }
            }
        })
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    })
}

async fn open_error(err: reqwest_eventsource::Error) -> ProviderError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            ProviderError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            }
        }
        other => stream_error(other),
    }
}

fn stream_error(err: reqwest_eventsource::Error) -> ProviderError {
    match err {
        reqwest_eventsource::Error::Transport(err) => ProviderError::Http(err),
        reqwest_eventsource::Error::StreamEnded => ProviderError::Truncated,
        other => ProviderError::EventSource(other.to_string()),
    }
}

/// Decoder state threaded through the chunk stream.
struct StreamState {
    events: BoxStream<'static, Result<Event, reqwest_eventsource::Error>>,
    pending: VecDeque<Result<CompletionChunk, ProviderError>>,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl StreamState {
    fn accept_data(&mut self, data: &str) {
        if self.finished {
            return;
        }

        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == DONE_MARKER {
            self.finished = true;
            self.pending.push_back(Ok(CompletionChunk::Finished(
                self.usage.unwrap_or_default(),
            )));
            return;
        }

        let payload: ChunkPayload = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(err) => {
                self.fail(ProviderError::Malformed(err));
                return;
            }
        };

        if let Some(error) = payload.error {
            self.fail(ProviderError::Upstream(error.message));
            return;
        }

        for choice in payload.choices {
            if let Some(content) = choice.delta.and_then(|delta| delta.content) {
                if !content.is_empty() {
                    self.pending.push_back(Ok(CompletionChunk::Delta(content)));
                }
            }
        }

        if let Some(usage) = payload.usage {
            self.usage = Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }
    }

    fn fail(&mut self, err: ProviderError) {
        self.finished = true;
        self.pending.push_back(Err(err));
    }
}

/// Turn provider events into a lazy chunk stream.
///
/// The source is never polled again once the stream has finished, so an
/// event source does not get the chance to reconnect.
pub(crate) fn decode_completion_stream(
    events: BoxStream<'static, Result<Event, reqwest_eventsource::Error>>,
) -> CompletionStream {
    let state = StreamState {
        events,
        pending: VecDeque::new(),
        usage: None,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.events.next().await {
                Some(Ok(Event::Open)) => {}
                Some(Ok(Event::Message(message))) => state.accept_data(&message.data),
                Some(Err(err)) => state.fail(stream_error(err)),
                None => state.fail(ProviderError::Truncated),
            }
        }
    }))
}
