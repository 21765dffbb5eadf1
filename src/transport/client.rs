//! Consuming side of the relay: decode a live event stream into events.

use std::collections::VecDeque;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::SessionId;
use crate::llm::types::ChatModel;
use crate::relay::events::{EventDecodeError, StreamEvent};
use crate::transport::frame::{Frame, FrameDecoder};

/// Errors seen by a relay consumer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Server refused the request with an error envelope.
    #[error("server returned {status} {code}: {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Envelope error code.
        code: String,
        /// Envelope error message.
        message: String,
    },
    /// A frame could not be turned into an event.
    #[error("invalid event: {0}")]
    Decode(#[from] EventDecodeError),
    /// A success envelope did not have the expected shape.
    #[error("unexpected response body: {0}")]
    Body(#[from] serde_json::Error),
    /// The stream ended before a terminal event.
    #[error("event stream ended before a terminal event")]
    Truncated,
}

/// Incremental decoder from raw bytes to events.
#[derive(Debug, Default)]
pub struct EventDecoder {
    frames: FrameDecoder,
}

impl EventDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<StreamEvent, EventDecodeError>> {
        self.frames.push(bytes).into_iter().map(frame_event).collect()
    }

    /// Flush an unterminated trailing frame.
    pub fn finish(&mut self) -> Option<Result<StreamEvent, EventDecodeError>> {
        self.frames.finish().map(frame_event)
    }
}

fn frame_event(frame: Frame) -> Result<StreamEvent, EventDecodeError> {
    let name = frame.event.ok_or(EventDecodeError::MissingName)?;
    StreamEvent::decode(&name, &frame.data)
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'static str>,
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct CreatedSession {
    id: SessionId,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// HTTP consumer of the relay API.
#[derive(Clone, Debug)]
pub struct RelayClient {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl RelayClient {
    /// Create a client for a server at `base_url` (e.g. `http://127.0.0.1:3000`).
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self {
            http: Client::builder().build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: None,
        })
    }

    /// Authenticate requests with a bearer access token.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(format!("{}{path}", self.base_url));
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Create a session and return its id.
    ///
    /// # Errors
    /// Returns an error on transport failure or an error envelope.
    pub async fn create_session(&self, title: Option<&str>) -> Result<SessionId, ClientError> {
        let response = self
            .request("/api/chat/sessions")
            .json(&CreateSessionBody { title })
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body = response.bytes().await?;
        let envelope: Envelope<CreatedSession> = serde_json::from_slice(&body)?;
        Ok(envelope.data.id)
    }

    /// Send a message and stream the turn's events.
    ///
    /// The returned stream ends after the terminal event.
    ///
    /// # Errors
    /// Returns an error if the request is refused before streaming starts.
    pub async fn stream_message(
        &self,
        session_id: SessionId,
        content: &str,
        model: Option<ChatModel>,
    ) -> Result<BoxStream<'static, Result<StreamEvent, ClientError>>, ClientError> {
        let response = self
            .request(&format!("/api/chat/sessions/{session_id}/messages/stream"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&SendMessageBody {
                content,
                model: model.map(ChatModel::as_str),
            })
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let body = response.bytes_stream().map_err(ClientError::from).boxed();
        Ok(decode_event_stream(body))
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let (code, message) = match serde_json::from_slice::<ErrorEnvelope>(&body) {
        Ok(envelope) => (envelope.error.code, envelope.error.message),
        Err(_) => (
            "UNKNOWN".to_string(),
            String::from_utf8_lossy(&body).into_owned(),
        ),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

struct ConsumerState {
    body: BoxStream<'static, Result<bytes::Bytes, ClientError>>,
    decoder: EventDecoder,
    pending: VecDeque<Result<StreamEvent, ClientError>>,
    finished: bool,
}

impl ConsumerState {
    fn accept(&mut self, decoded: Result<StreamEvent, EventDecodeError>) {
        if self.finished {
            return;
        }
        match decoded {
            Ok(event) => {
                self.finished = event.is_terminal();
                self.pending.push_back(Ok(event));
            }
            Err(err) => {
                self.finished = true;
                self.pending.push_back(Err(err.into()));
            }
        }
    }
}

/// Decode a byte stream into events, ending after the terminal event.
pub fn decode_event_stream(
    body: BoxStream<'static, Result<bytes::Bytes, ClientError>>,
) -> BoxStream<'static, Result<StreamEvent, ClientError>> {
    let state = ConsumerState {
        body,
        decoder: EventDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for decoded in state.decoder.push(&bytes) {
                        state.accept(decoded);
                    }
                }
                Some(Err(err)) => {
                    state.finished = true;
                    state.pending.push_back(Err(err));
                }
                None => {
                    if let Some(decoded) = state.decoder.finish() {
                        state.accept(decoded);
                    }
                    if !state.finished {
                        state.finished = true;
                        state.pending.push_back(Err(ClientError::Truncated));
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::ids::MessageId;
    use crate::llm::types::TokenUsage;
    use crate::relay::events::{DonePayload, StartPayload};
    use crate::transport::sse::encode_event;

    fn body_from(chunks: Vec<Vec<u8>>) -> BoxStream<'static, Result<bytes::Bytes, ClientError>> {
        stream::iter(chunks.into_iter().map(|chunk| Ok(bytes::Bytes::from(chunk)))).boxed()
    }

    fn sample_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start(StartPayload {
                message_id: MessageId::new(),
                session_id: SessionId::new(),
            }),
            StreamEvent::Delta(crate::relay::events::DeltaPayload {
                content: "héllo".to_string(),
                index: 0,
            }),
            StreamEvent::Done(DonePayload {
                message_id: MessageId::new(),
                usage: TokenUsage::new(5, 3),
            }),
        ]
    }

    #[tokio::test]
    async fn test_events_survive_arbitrary_chunking() {
        let events = sample_events();
        let wire: Vec<u8> = events
            .iter()
            .flat_map(|event| encode_event(event).into_bytes())
            .collect();
        let chunks: Vec<Vec<u8>> = wire.chunks(3).map(<[u8]>::to_vec).collect();

        let decoded: Vec<StreamEvent> = decode_event_stream(body_from(chunks))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(decoded, events);
    }

    #[tokio::test]
    async fn test_nothing_read_after_terminal_event() {
        let mut wire = String::new();
        for event in sample_events() {
            wire.push_str(&encode_event(&event));
        }
        wire.push_str("event: delta\ndata: {\"content\":\"late\",\"index\":9}\n\n");

        let decoded: Vec<_> = decode_event_stream(body_from(vec![wire.into_bytes()]))
            .collect()
            .await;
        assert_eq!(decoded.len(), 3);
        assert!(decoded.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_stream_without_terminal_is_truncated() {
        let wire = encode_event(&sample_events()[0]);
        let decoded: Vec<_> = decode_event_stream(body_from(vec![wire.into_bytes()]))
            .collect()
            .await;
        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded[1], Err(ClientError::Truncated)));
    }

    #[test]
    fn test_frame_without_name_is_rejected() {
        let mut decoder = EventDecoder::new();
        let decoded = decoder.push(b"data: {}\n\n");
        assert!(matches!(decoded[0], Err(EventDecodeError::MissingName)));
    }
}
