//! Event-stream HTTP responses.

use axum::http::header::{CONNECTION, HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::relay::events::StreamEvent;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Render one turn event as a named SSE event with a JSON payload.
///
/// # Errors
/// Returns an error if the payload cannot be serialized.
pub fn sse_event(event: &StreamEvent) -> Result<Event, axum::Error> {
    let named = Event::default().event(event.name());
    match event {
        StreamEvent::Start(payload) => named.json_data(payload),
        StreamEvent::Delta(payload) => named.json_data(payload),
        StreamEvent::Done(payload) => named.json_data(payload),
        StreamEvent::Error(payload) => named.json_data(payload),
    }
}

/// Build a streaming response that writes each event as soon as it is received.
///
/// Dropping the response body (client disconnect) drops `events`, which the
/// producing turn observes as a closed sink.
pub fn stream_response(events: mpsc::Receiver<StreamEvent>) -> Response {
    let stream = ReceiverStream::new(events).map(|event| sse_event(&event));

    (
        [(CONNECTION, "keep-alive"), (X_ACCEL_BUFFERING, "no")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// Encode one event the way it appears on the wire.
#[cfg(test)]
pub(crate) fn encode_event(event: &StreamEvent) -> String {
    format!(
        "event: {}\ndata: {}\n\n",
        event.name(),
        event.payload_json().unwrap()
    )
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
    use http_body_util::BodyExt;

    use super::*;
    use crate::ids::{MessageId, SessionId};
    use crate::relay::events::{DeltaPayload, StartPayload};
    use crate::transport::client::EventDecoder;

    #[tokio::test]
    async fn test_response_headers_and_frames() {
        let (tx, rx) = mpsc::channel(4);
        let start = StreamEvent::Start(StartPayload {
            message_id: MessageId::new(),
            session_id: SessionId::new(),
        });
        let delta = StreamEvent::Delta(DeltaPayload {
            content: "Hi\nthere".to_string(),
            index: 0,
        });
        tx.send(start.clone()).await.unwrap();
        tx.send(delta.clone()).await.unwrap();
        drop(tx);

        let response = stream_response(rx);
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[CACHE_CONTROL], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("event: start\ndata: {"));

        let decoded: Vec<StreamEvent> = EventDecoder::new()
            .push(&body)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(decoded, vec![start, delta]);
    }

    #[test]
    fn test_wire_encoding_matches_event_names() {
        let delta = StreamEvent::Delta(DeltaPayload {
            content: "Hi".to_string(),
            index: 0,
        });
        assert_eq!(
            encode_event(&delta),
            "event: delta\ndata: {\"content\":\"Hi\",\"index\":0}\n\n"
        );
    }
}
