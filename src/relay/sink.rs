//! Ordered event sink for one turn.
//!
//! The sink is a small state machine over the turn's event channel:
//! `Pending --start--> Streaming --done/error--> Closed`, with `error` also
//! allowed straight from `Pending`. Out-of-order sends are refused, so
//! nothing can follow a terminal event.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::relay::events::{
    DeltaPayload, DonePayload, ErrorPayload, StartPayload, StreamEvent,
};

/// Sink refusal.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SinkError {
    /// The receiving side is gone.
    #[error("event receiver dropped")]
    TransportClosed,
    /// The event is not allowed in the current phase.
    #[error("{event} not allowed in phase {phase:?}")]
    OutOfOrder {
        /// Refused event name.
        event: &'static str,
        /// Phase at the time of the send.
        phase: Phase,
    },
}

/// Sink phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Nothing sent yet.
    Pending,
    /// `start` sent.
    Streaming,
    /// Terminal event sent or receiver dropped.
    Closed,
}

/// Sending half of a turn's event channel.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    phase: Phase,
    next_index: u64,
}

impl EventSink {
    /// Create a sink and its receiver with `capacity` buffered events.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                phase: Phase::Pending,
                next_index: 0,
            },
            rx,
        )
    }

    #[cfg(test)]
    const fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of deltas sent so far.
    #[must_use]
    pub const fn deltas_sent(&self) -> u64 {
        self.next_index
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiver has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    /// Resolves once the next event can be sent without waiting.
    ///
    /// The sink is the channel's only sender, so a slot seen free here stays
    /// free until the next send.
    ///
    /// # Errors
    /// Fails if the receiver is gone.
    pub async fn ready(&mut self) -> Result<(), SinkError> {
        if self.tx.reserve().await.is_err() {
            self.phase = Phase::Closed;
            return Err(SinkError::TransportClosed);
        }
        Ok(())
    }

    /// Send `start`.
    ///
    /// # Errors
    /// Refused unless pending, or if the receiver is gone.
    pub async fn start(&mut self, payload: StartPayload) -> Result<(), SinkError> {
        self.expect(Phase::Pending, "start")?;
        self.send(StreamEvent::Start(payload)).await?;
        self.phase = Phase::Streaming;
        Ok(())
    }

    /// Send the next `delta`, returning its index.
    ///
    /// # Errors
    /// Refused unless streaming, or if the receiver is gone.
    pub async fn delta(&mut self, content: String) -> Result<u64, SinkError> {
        self.expect(Phase::Streaming, "delta")?;
        let index = self.next_index;
        self.send(StreamEvent::Delta(DeltaPayload { content, index }))
            .await?;
        self.next_index += 1;
        Ok(index)
    }

    /// Send `done` and close.
    ///
    /// # Errors
    /// Refused unless streaming, or if the receiver is gone.
    pub async fn done(&mut self, payload: DonePayload) -> Result<(), SinkError> {
        self.expect(Phase::Streaming, "done")?;
        let sent = self.send(StreamEvent::Done(payload)).await;
        self.phase = Phase::Closed;
        sent
    }

    /// Send `error` and close.
    ///
    /// # Errors
    /// Refused once closed, or if the receiver is gone.
    pub async fn error(&mut self, payload: ErrorPayload) -> Result<(), SinkError> {
        if self.phase == Phase::Closed {
            return Err(SinkError::OutOfOrder {
                event: "error",
                phase: self.phase,
            });
        }
        let sent = self.send(StreamEvent::Error(payload)).await;
        self.phase = Phase::Closed;
        sent
    }

    fn expect(&self, phase: Phase, event: &'static str) -> Result<(), SinkError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(SinkError::OutOfOrder {
                event,
                phase: self.phase,
            })
        }
    }

    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkError> {
        if self.tx.send(event).await.is_err() {
            self.phase = Phase::Closed;
            return Err(SinkError::TransportClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{MessageId, SessionId};
    use crate::llm::types::TokenUsage;

    fn start_payload() -> StartPayload {
        StartPayload {
            message_id: MessageId::new(),
            session_id: SessionId::new(),
        }
    }

    #[tokio::test]
    async fn test_happy_path_assigns_indices() {
        let (mut sink, mut rx) = EventSink::channel(8);
        sink.start(start_payload()).await.unwrap();
        assert_eq!(sink.delta("a".to_string()).await.unwrap(), 0);
        assert_eq!(sink.delta("b".to_string()).await.unwrap(), 1);
        sink.done(DonePayload {
            message_id: MessageId::new(),
            usage: TokenUsage::default(),
        })
        .await
        .unwrap();
        drop(sink);

        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            names.push(event.name());
        }
        assert_eq!(names, vec!["start", "delta", "delta", "done"]);
    }

    #[tokio::test]
    async fn test_nothing_after_terminal() {
        let (mut sink, _rx) = EventSink::channel(8);
        sink.start(start_payload()).await.unwrap();
        sink.error(ErrorPayload::new("STREAM_ERROR", "x")).await.unwrap();

        assert!(matches!(
            sink.delta("late".to_string()).await,
            Err(SinkError::OutOfOrder { event: "delta", .. })
        ));
        assert!(sink.error(ErrorPayload::new("X", "y")).await.is_err());
        assert_eq!(sink.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_delta_before_start_is_refused() {
        let (mut sink, _rx) = EventSink::channel(8);
        assert!(matches!(
            sink.delta("early".to_string()).await,
            Err(SinkError::OutOfOrder { event: "delta", phase: Phase::Pending })
        ));
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_sink() {
        let (mut sink, rx) = EventSink::channel(8);
        drop(rx);
        assert!(sink.is_closed());
        sink.closed().await;
        assert_eq!(
            sink.start(start_payload()).await,
            Err(SinkError::TransportClosed)
        );
        assert_eq!(sink.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_ready_waits_for_a_free_slot() {
        let (mut sink, mut rx) = EventSink::channel(1);
        sink.start(start_payload()).await.unwrap();

        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), sink.ready()).await;
        assert!(blocked.is_err());

        assert_eq!(rx.recv().await.map(|event| event.name()), Some("start"));
        sink.ready().await.unwrap();
        assert_eq!(sink.delta("now".to_string()).await.unwrap(), 0);
    }
}
