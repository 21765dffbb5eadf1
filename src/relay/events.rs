//! Events emitted during one streaming turn.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{MessageId, SessionId};
use crate::llm::types::TokenUsage;

/// Provider stream broke after it was opened.
pub const STREAM_ERROR: &str = "STREAM_ERROR";
/// Provider rejected the request before any chunk.
pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
/// The turn exceeded its total stream timeout.
pub const STREAM_TIMEOUT: &str = "STREAM_TIMEOUT";
/// The assistant message could not be stored after a complete stream.
pub const PERSISTENCE_ERROR: &str = "PERSISTENCE_ERROR";

/// Payload of `start`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    /// Persisted user message id.
    pub message_id: MessageId,
    /// Session id.
    pub session_id: SessionId,
}

/// Payload of `delta`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    /// Text fragment.
    pub content: String,
    /// Zero-based position within the turn.
    pub index: u64,
}

/// Payload of `done`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    /// Persisted assistant message id.
    pub message_id: MessageId,
    /// Provider-reported usage.
    pub usage: TokenUsage,
}

/// Payload of `error`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorPayload {
    /// Build an error payload.
    #[must_use]
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// One event of a turn.
///
/// A turn emits `Start`, then `Delta`s with increasing index, then exactly
/// one of `Done` or `Error`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamEvent {
    /// Turn accepted and user message stored.
    Start(StartPayload),
    /// Incremental assistant text.
    Delta(DeltaPayload),
    /// Assistant message stored.
    Done(DonePayload),
    /// Turn failed.
    Error(ErrorPayload),
}

/// Error decoding an event from its wire name and payload.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    /// Frame had no event name.
    #[error("frame has no event name")]
    MissingName,
    /// Event name is not one of the known events.
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
    /// Payload did not match the event.
    #[error("invalid event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl StreamEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Delta(_) => "delta",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
        }
    }

    /// Whether no event may follow this one.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }

    /// JSON payload of the event.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Start(payload) => serde_json::to_string(payload),
            Self::Delta(payload) => serde_json::to_string(payload),
            Self::Done(payload) => serde_json::to_string(payload),
            Self::Error(payload) => serde_json::to_string(payload),
        }
    }

    /// Rebuild an event from its wire name and JSON payload.
    ///
    /// # Errors
    /// Returns an error for unknown names or mismatched payloads.
    pub fn decode(name: &str, data: &str) -> Result<Self, EventDecodeError> {
        match name {
            "start" => Ok(Self::Start(serde_json::from_str(data)?)),
            "delta" => Ok(Self::Delta(serde_json::from_str(data)?)),
            "done" => Ok(Self::Done(serde_json::from_str(data)?)),
            "error" => Ok(Self::Error(serde_json::from_str(data)?)),
            other => Err(EventDecodeError::UnknownEvent(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_payload_shape() {
        let event = StreamEvent::Done(DonePayload {
            message_id: MessageId::new(),
            usage: TokenUsage::new(5, 3),
        });
        let json: serde_json::Value = serde_json::from_str(&event.payload_json().unwrap()).unwrap();
        assert!(json["messageId"].is_string());
        assert_eq!(json["usage"]["promptTokens"], 5);
        assert_eq!(json["usage"]["completionTokens"], 3);
        assert!(event.is_terminal());
    }

    #[test]
    fn test_decode_matches_name() {
        let event = StreamEvent::decode("delta", r#"{"content":"Hi","index":0}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Delta(DeltaPayload {
                content: "Hi".to_string(),
                index: 0,
            })
        );
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_decode_rejects_unknown_and_mismatched() {
        assert!(matches!(
            StreamEvent::decode("ping", "{}"),
            Err(EventDecodeError::UnknownEvent(_))
        ));
        assert!(matches!(
            StreamEvent::decode("start", r#"{"content":"x"}"#),
            Err(EventDecodeError::Payload(_))
        ));
    }
}
