//! Streaming turn orchestration.
//!
//! A turn is split in two phases:
//! - `prepare_turn` validates, authorizes, stores the user message and
//!   assembles the provider context. Its errors become HTTP errors.
//! - `relay_turn` runs in its own task once the response is committed. Its
//!   failures are reported only as a terminal `error` event.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::config::{ChatRelayConfig, RelayConfig};
use crate::ids::{MessageId, SessionId, UserId};
use crate::llm::openai::OpenAiClient;
use crate::llm::provider::CompletionProvider;
use crate::llm::types::{ChatModel, CompletionChunk, ContextMessage, TokenUsage};
use crate::relay::context::build_context;
use crate::relay::error::RelayError;
use crate::relay::events::{
    DonePayload, ErrorPayload, PERSISTENCE_ERROR, PROVIDER_ERROR, STREAM_ERROR, STREAM_TIMEOUT,
    StartPayload, StreamEvent,
};
use crate::relay::sink::{EventSink, SinkError};
use crate::store::sqlite::{ConversationStore, SqliteConversationStore};
use crate::store::types::{AssistantMeta, DEFAULT_SESSION_TITLE, Message, MessageRole};

/// Backend dependencies for the orchestrator.
pub struct RelayBackends {
    /// Conversation store implementation.
    pub store: Arc<dyn ConversationStore>,
    /// Completion provider implementation.
    pub provider: Arc<dyn CompletionProvider>,
}

impl RelayBackends {
    /// Build the `SQLite` store and the OpenAI-compatible client from config.
    ///
    /// # Errors
    /// Returns an error if either backend cannot be initialized.
    pub async fn sqlite(config: &ChatRelayConfig) -> Result<Self, RelayError> {
        let store = Arc::new(SqliteConversationStore::new(&config.storage).await?);
        let provider = Arc::new(OpenAiClient::new(&config.provider)?);
        Ok(Self { store, provider })
    }
}

/// One incoming turn.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    /// Target session.
    pub session_id: SessionId,
    /// Verified requester.
    pub owner: UserId,
    /// User message text.
    pub content: String,
    /// Requested model name; the configured default when absent.
    pub model: Option<String>,
}

/// A turn whose user message is stored and whose context is ready.
#[derive(Clone, Debug)]
pub struct PreparedTurn {
    /// Target session.
    pub session_id: SessionId,
    /// Stored user message.
    pub user_message: Message,
    /// Resolved model.
    pub model: ChatModel,
    /// Provider context, preamble first.
    pub context: Vec<ContextMessage>,
    /// Whether this turn should derive the session title.
    pub derive_title: bool,
}

/// How a relayed turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// Assistant message stored and `done` sent.
    Completed {
        /// Stored assistant message id.
        assistant_message_id: MessageId,
        /// Provider-reported usage.
        usage: TokenUsage,
        /// Background title derivation, when triggered.
        title_task: Option<JoinHandle<()>>,
    },
    /// Provider failed or timed out; `error` sent.
    ProviderFailed {
        /// Code carried by the `error` event.
        code: &'static str,
    },
    /// Client went away; nothing stored for the assistant.
    Abandoned,
    /// Complete stream but the assistant message could not be stored.
    PersistenceFailed,
}

/// Events of a running turn and the task driving it.
#[derive(Debug)]
pub struct TurnStream {
    /// Ordered turn events.
    pub events: tokio::sync::mpsc::Receiver<StreamEvent>,
    /// Resolves once the turn has ended.
    pub outcome: JoinHandle<TurnOutcome>,
}

enum Step<T> {
    Disconnected,
    TimedOut,
    Ready(T),
}

/// Drives streaming turns against a store and a provider.
pub struct RelayOrchestrator {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn CompletionProvider>,
    config: RelayConfig,
}

impl RelayOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(backends: RelayBackends, config: RelayConfig) -> Self {
        Self {
            store: backends.store,
            provider: backends.provider,
            config,
        }
    }

    /// The store this orchestrator writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Check content and resolve the model.
    ///
    /// # Errors
    /// Returns `ValidationFailed` for blank or oversized content and for
    /// models outside the allow-list.
    pub fn validate(&self, content: &str, model: Option<&str>) -> Result<ChatModel, RelayError> {
        if content.trim().is_empty() {
            return Err(RelayError::invalid_field("content", "Message cannot be empty"));
        }
        if content.chars().count() > self.config.max_content_chars {
            return Err(RelayError::invalid_field(
                "content",
                format!(
                    "Message too long (max {} characters)",
                    self.config.max_content_chars
                ),
            ));
        }
        match model {
            None => Ok(self.config.default_model),
            Some(name) => name.parse::<ChatModel>().map_err(|name| {
                let allowed: Vec<&str> = ChatModel::ALL.iter().map(|m| m.as_str()).collect();
                RelayError::invalid_field(
                    "model",
                    format!("Unsupported model {name:?}; expected one of {}", allowed.join(", ")),
                )
            }),
        }
    }

    /// Validate, authorize, store the user message and build the context.
    ///
    /// # Errors
    /// Returns `ValidationFailed`, `NotFound`, `Forbidden`, or a store error.
    pub async fn prepare_turn(&self, request: TurnRequest) -> Result<PreparedTurn, RelayError> {
        let model = self.validate(&request.content, request.model.as_deref())?;

        let session = self
            .store
            .get_session(request.session_id, request.owner.clone())
            .await?;
        let derive_title = session.message_count == 0 && session.title == DEFAULT_SESSION_TITLE;

        let user_message = self
            .store
            .append_message(session.id, MessageRole::User, request.content, None)
            .await?;

        let history = self
            .store
            .list_recent_messages(session.id, self.config.context_window)
            .await?;
        let context = build_context(&self.config.system_prompt, &history, self.config.context_window);

        debug!(
            session_id = %session.id,
            message_id = %user_message.id,
            context = context.len(),
            "prepared turn"
        );

        Ok(PreparedTurn {
            session_id: session.id,
            user_message,
            model,
            context,
            derive_title,
        })
    }

    /// Relay a prepared turn to `sink` and reconcile storage.
    pub async fn relay_turn(&self, turn: PreparedTurn, mut sink: EventSink) -> TurnOutcome {
        let session_id = turn.session_id;
        let start = StartPayload {
            message_id: turn.user_message.id,
            session_id,
        };
        if sink.start(start).await.is_err() {
            debug!(session_id = %session_id, "client gone before start");
            return TurnOutcome::Abandoned;
        }

        let deadline = Instant::now() + self.config.stream_timeout();

        let opened = tokio::select! {
            biased;
            () = sink.closed() => Step::Disconnected,
            opened = timeout_at(deadline, self.provider.stream_completion(turn.context, turn.model)) => {
                match opened {
                    Ok(opened) => Step::Ready(opened),
                    Err(_) => Step::TimedOut,
                }
            }
        };
        let mut stream = match opened {
            Step::Disconnected => {
                info!(session_id = %session_id, "client disconnected before provider answered");
                return TurnOutcome::Abandoned;
            }
            Step::TimedOut => return self.timed_out(&mut sink, session_id, deadline).await,
            Step::Ready(Err(err)) => {
                warn!(session_id = %session_id, model = %turn.model, "provider rejected request: {err}");
                return fail(
                    &mut sink,
                    deadline,
                    PROVIDER_ERROR,
                    "The AI provider could not handle the request",
                )
                .await;
            }
            Step::Ready(Ok(stream)) => stream,
        };

        let mut buffer = String::new();
        let usage = loop {
            let next = tokio::select! {
                biased;
                () = sink.closed() => Step::Disconnected,
                item = timeout_at(deadline, stream.next()) => match item {
                    Ok(item) => Step::Ready(item),
                    Err(_) => Step::TimedOut,
                },
            };

            match next {
                Step::Disconnected => {
                    info!(
                        session_id = %session_id,
                        deltas = sink.deltas_sent(),
                        "client disconnected mid-stream"
                    );
                    return TurnOutcome::Abandoned;
                }
                Step::TimedOut => return self.timed_out(&mut sink, session_id, deadline).await,
                Step::Ready(Some(Ok(CompletionChunk::Delta(text)))) => {
                    buffer.push_str(&text);
                    match send_by(deadline, sink.delta(text)).await {
                        Step::Ready(_) => {}
                        Step::Disconnected => {
                            info!(session_id = %session_id, "client disconnected mid-stream");
                            return TurnOutcome::Abandoned;
                        }
                        Step::TimedOut => {
                            info!(session_id = %session_id, "client stopped reading");
                            return self.timed_out(&mut sink, session_id, deadline).await;
                        }
                    }
                }
                Step::Ready(Some(Ok(CompletionChunk::Finished(usage)))) => break usage,
                Step::Ready(Some(Err(err))) => {
                    warn!(
                        session_id = %session_id,
                        deltas = sink.deltas_sent(),
                        "provider stream failed: {err}"
                    );
                    return fail(
                        &mut sink,
                        deadline,
                        STREAM_ERROR,
                        "An error occurred while generating the response",
                    )
                    .await;
                }
                Step::Ready(None) => {
                    warn!(session_id = %session_id, "provider stream ended without usage");
                    return fail(
                        &mut sink,
                        deadline,
                        STREAM_ERROR,
                        "An error occurred while generating the response",
                    )
                    .await;
                }
            }
        };
        drop(stream);

        // Room for the terminal event is secured before anything is stored.
        match send_by(deadline, sink.ready()).await {
            Step::Ready(()) => {}
            Step::Disconnected => {
                info!(session_id = %session_id, "client disconnected before completion was stored");
                return TurnOutcome::Abandoned;
            }
            Step::TimedOut => {
                info!(session_id = %session_id, "client stopped reading");
                return self.timed_out(&mut sink, session_id, deadline).await;
            }
        }

        let meta = AssistantMeta {
            model: turn.model.as_str().to_string(),
            usage,
        };
        let assistant = match self
            .store
            .append_message(session_id, MessageRole::Assistant, buffer, Some(meta))
            .await
        {
            Ok(message) => message,
            Err(err) => {
                warn!(session_id = %session_id, "failed to store assistant message: {err}");
                let _ = sink
                    .error(ErrorPayload::new(
                        PERSISTENCE_ERROR,
                        "The response could not be saved",
                    ))
                    .await;
                return TurnOutcome::PersistenceFailed;
            }
        };

        let title_task = turn
            .derive_title
            .then(|| self.spawn_title_task(session_id, turn.user_message.content));

        let _ = sink
            .done(DonePayload {
                message_id: assistant.id,
                usage,
            })
            .await;

        info!(
            session_id = %session_id,
            message_id = %assistant.id,
            model = %turn.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "turn completed"
        );

        TurnOutcome::Completed {
            assistant_message_id: assistant.id,
            usage,
            title_task,
        }
    }

    /// Prepare a turn and relay it from a spawned task.
    ///
    /// # Errors
    /// Returns the pre-stream errors of `prepare_turn`.
    pub async fn handle_turn(self: &Arc<Self>, request: TurnRequest) -> Result<TurnStream, RelayError> {
        let turn = self.prepare_turn(request).await?;
        let (sink, events) = EventSink::channel(self.config.event_buffer);
        let orchestrator = Arc::clone(self);
        let outcome = tokio::spawn(async move { orchestrator.relay_turn(turn, sink).await });
        Ok(TurnStream { events, outcome })
    }

    fn spawn_title_task(&self, session_id: SessionId, seed: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let provider = Arc::clone(&self.provider);
        tokio::spawn(async move {
            let title = provider.derive_title(&seed).await;
            if title == DEFAULT_SESSION_TITLE {
                return;
            }
            match store.rename_session_if_default(session_id, title).await {
                Ok(true) => debug!(session_id = %session_id, "session title derived"),
                Ok(false) => debug!(session_id = %session_id, "session title already set"),
                Err(err) => warn!(session_id = %session_id, "failed to store derived title: {err}"),
            }
        })
    }

    async fn timed_out(
        &self,
        sink: &mut EventSink,
        session_id: SessionId,
        deadline: Instant,
    ) -> TurnOutcome {
        warn!(
            session_id = %session_id,
            timeout_secs = self.config.stream_timeout_secs,
            "turn timed out"
        );
        fail(sink, deadline, STREAM_TIMEOUT, "The response took too long to generate").await
    }
}

/// Await a sink send, giving up at `deadline`.
async fn send_by<T>(
    deadline: Instant,
    send: impl Future<Output = Result<T, SinkError>>,
) -> Step<T> {
    match timeout_at(deadline, send).await {
        Ok(Ok(value)) => Step::Ready(value),
        Ok(Err(_)) => Step::Disconnected,
        Err(_) => Step::TimedOut,
    }
}

/// Send the terminal `error`. Past `deadline` it is only sent if a slot is free.
async fn fail(
    sink: &mut EventSink,
    deadline: Instant,
    code: &'static str,
    message: &str,
) -> TurnOutcome {
    let _ = send_by(deadline, sink.error(ErrorPayload::new(code, message))).await;
    TurnOutcome::ProviderFailed { code }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::llm::replay::{ReplayProvider, ReplayStep};
    use crate::store::errors::{StoreError, StoreResult};
    use crate::store::sqlite::{SessionUpdate, SqliteConversationStore, StoreFuture};
    use crate::store::types::{MessagePage, Session, SessionPage};

    /// Delegates to `SQLite` but refuses to store assistant messages.
    struct RefusingAssistantStore {
        inner: Arc<SqliteConversationStore>,
    }

    impl ConversationStore for RefusingAssistantStore {
        fn ping(&self) -> StoreFuture<'_, StoreResult<()>> {
            self.inner.ping()
        }

        fn create_session(
            &self,
            owner: UserId,
            title: Option<String>,
        ) -> StoreFuture<'_, StoreResult<Session>> {
            self.inner.create_session(owner, title)
        }

        fn list_sessions(
            &self,
            owner: UserId,
            page: u32,
            limit: u32,
        ) -> StoreFuture<'_, StoreResult<SessionPage>> {
            self.inner.list_sessions(owner, page, limit)
        }

        fn get_session(
            &self,
            session_id: SessionId,
            owner: UserId,
        ) -> StoreFuture<'_, StoreResult<Session>> {
            self.inner.get_session(session_id, owner)
        }

        fn update_session(
            &self,
            session_id: SessionId,
            owner: UserId,
            update: SessionUpdate,
        ) -> StoreFuture<'_, StoreResult<Session>> {
            self.inner.update_session(session_id, owner, update)
        }

        fn delete_session(
            &self,
            session_id: SessionId,
            owner: UserId,
        ) -> StoreFuture<'_, StoreResult<()>> {
            self.inner.delete_session(session_id, owner)
        }

        fn append_message(
            &self,
            session_id: SessionId,
            role: MessageRole,
            content: String,
            meta: Option<AssistantMeta>,
        ) -> StoreFuture<'_, StoreResult<Message>> {
            if role == MessageRole::Assistant {
                return Box::pin(async { Err(StoreError::InvalidRow("disk full".to_string())) });
            }
            self.inner.append_message(session_id, role, content, meta)
        }

        fn list_recent_messages(
            &self,
            session_id: SessionId,
            limit: usize,
        ) -> StoreFuture<'_, StoreResult<Vec<Message>>> {
            self.inner.list_recent_messages(session_id, limit)
        }

        fn list_messages(
            &self,
            session_id: SessionId,
            limit: usize,
            before: Option<MessageId>,
        ) -> StoreFuture<'_, StoreResult<MessagePage>> {
            self.inner.list_messages(session_id, limit, before)
        }

        fn rename_session_if_default(
            &self,
            session_id: SessionId,
            title: String,
        ) -> StoreFuture<'_, StoreResult<bool>> {
            self.inner.rename_session_if_default(session_id, title)
        }
    }

    struct Harness {
        orchestrator: Arc<RelayOrchestrator>,
        store: Arc<SqliteConversationStore>,
        provider: Arc<ReplayProvider>,
    }

    async fn harness(provider: ReplayProvider, config: RelayConfig) -> Harness {
        let store = Arc::new(SqliteConversationStore::open_in_memory().await.unwrap());
        let provider = Arc::new(provider);
        let orchestrator = Arc::new(RelayOrchestrator::new(
            RelayBackends {
                store: store.clone(),
                provider: provider.clone(),
            },
            config,
        ));
        Harness {
            orchestrator,
            store,
            provider,
        }
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn request(session_id: SessionId, content: &str) -> TurnRequest {
        TurnRequest {
            session_id,
            owner: alice(),
            content: content.to_string(),
            model: None,
        }
    }

    async fn drain(mut stream: TurnStream) -> (Vec<StreamEvent>, TurnOutcome) {
        let mut events = Vec::new();
        while let Some(event) = stream.events.recv().await {
            events.push(event);
        }
        (events, stream.outcome.await.unwrap())
    }

    #[tokio::test]
    async fn test_hello_turn_streams_stores_and_titles() {
        let h = harness(
            ReplayProvider::completing(["Hi", " there", "!"], TokenUsage::new(5, 3))
                .with_title("Friendly greeting"),
            RelayConfig::default(),
        )
        .await;
        let session = h.store.create_session(alice(), None).await.unwrap();

        let stream = h
            .orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await
            .unwrap();
        let (events, outcome) = drain(stream).await;

        let names: Vec<&str> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["start", "delta", "delta", "delta", "done"]);

        let text: String = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Delta(delta) => Some(delta.content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hi there!");

        let indices: Vec<u64> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Delta(delta) => Some(delta.index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let TurnOutcome::Completed {
            assistant_message_id,
            usage,
            title_task,
        } = outcome
        else {
            panic!("expected completed turn");
        };
        assert_eq!(usage, TokenUsage::new(5, 3));
        title_task.unwrap().await.unwrap();

        let messages = h.store.list_recent_messages(session.id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].id, assistant_message_id);
        assert_eq!(messages[1].content, "Hi there!");
        assert_eq!(messages[1].prompt_tokens, Some(5));
        assert_eq!(messages[1].model.as_deref(), Some("gpt-4o-mini"));

        let StreamEvent::Start(start) = &events[0] else {
            panic!("first event must be start");
        };
        assert_eq!(start.message_id, messages[0].id);
        assert_eq!(start.session_id, session.id);
        let StreamEvent::Done(done) = &events[4] else {
            panic!("last event must be done");
        };
        assert_eq!(done.message_id, assistant_message_id);

        let reloaded = h.store.get_session(session.id, alice()).await.unwrap();
        assert_eq!(reloaded.title, "Friendly greeting");
        assert_eq!(h.provider.title_seeds(), vec!["Hello".to_string()]);
    }

    #[tokio::test]
    async fn test_error_after_first_delta_keeps_only_user_message() {
        let h = harness(
            ReplayProvider::new(vec![
                ReplayStep::Chunk("Hi".to_string()),
                ReplayStep::Fail("upstream reset".to_string()),
            ])
            .with_title("Never"),
            RelayConfig::default(),
        )
        .await;
        let session = h.store.create_session(alice(), None).await.unwrap();

        let stream = h
            .orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await
            .unwrap();
        let (events, outcome) = drain(stream).await;

        let names: Vec<&str> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["start", "delta", "error"]);
        let StreamEvent::Error(error) = &events[2] else {
            panic!("last event must be error");
        };
        assert_eq!(error.code, STREAM_ERROR);
        assert!(matches!(outcome, TurnOutcome::ProviderFailed { code: STREAM_ERROR }));

        let messages = h.store.list_recent_messages(session.id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);

        let reloaded = h.store.get_session(session.id, alice()).await.unwrap();
        assert_eq!(reloaded.title, DEFAULT_SESSION_TITLE);
        assert!(h.provider.title_seeds().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_request_reports_provider_error() {
        let h = harness(ReplayProvider::failing_open("down"), RelayConfig::default()).await;
        let session = h.store.create_session(alice(), None).await.unwrap();

        let stream = h
            .orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await
            .unwrap();
        let (events, outcome) = drain(stream).await;

        let names: Vec<&str> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["start", "error"]);
        assert!(matches!(outcome, TurnOutcome::ProviderFailed { code: PROVIDER_ERROR }));
    }

    #[tokio::test]
    async fn test_stream_without_usage_is_an_error() {
        let h = harness(
            ReplayProvider::new(vec![ReplayStep::Chunk("partial".to_string())]),
            RelayConfig::default(),
        )
        .await;
        let session = h.store.create_session(alice(), None).await.unwrap();

        let stream = h
            .orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await
            .unwrap();
        let (_, outcome) = drain(stream).await;
        assert!(matches!(outcome, TurnOutcome::ProviderFailed { code: STREAM_ERROR }));
        assert_eq!(
            h.store.list_recent_messages(session.id, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_foreign_session_is_forbidden_without_mutation() {
        let h = harness(
            ReplayProvider::completing(["x"], TokenUsage::default()),
            RelayConfig::default(),
        )
        .await;
        let session = h
            .store
            .create_session(UserId::new("bob"), None)
            .await
            .unwrap();

        let result = h
            .orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await;
        assert!(matches!(result, Err(RelayError::Forbidden(id)) if id == session.id));
        assert!(
            h.store
                .list_recent_messages(session.id, 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(h.provider.contexts().is_empty());
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let h = harness(
            ReplayProvider::completing(["x"], TokenUsage::default()),
            RelayConfig::default(),
        )
        .await;
        let result = h
            .orchestrator
            .handle_turn(request(SessionId::new(), "Hello"))
            .await;
        assert!(matches!(result, Err(RelayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_validation_rejects_blank_long_and_unknown_model() {
        let h = harness(
            ReplayProvider::completing(["x"], TokenUsage::default()),
            RelayConfig::default(),
        )
        .await;
        let orchestrator = &h.orchestrator;

        assert!(matches!(
            orchestrator.validate("   ", None),
            Err(RelayError::ValidationFailed { .. })
        ));
        assert!(orchestrator.validate(&"a".repeat(10_000), None).is_ok());
        assert!(orchestrator.validate(&"a".repeat(10_001), None).is_err());
        assert!(orchestrator.validate("hi", Some("gpt-5")).is_err());
        assert_eq!(
            orchestrator.validate("hi", Some("gpt-4o")).unwrap(),
            ChatModel::Gpt4o
        );
        assert_eq!(orchestrator.validate("hi", None).unwrap(), ChatModel::Gpt4oMini);
    }

    #[tokio::test]
    async fn test_context_is_bounded_by_window() {
        let config = RelayConfig {
            context_window: 4,
            ..RelayConfig::default()
        };
        let h = harness(
            ReplayProvider::completing(["ok"], TokenUsage::default()),
            config,
        )
        .await;
        let session = h.store.create_session(alice(), None).await.unwrap();
        for i in 0..6 {
            h.store
                .append_message(session.id, MessageRole::User, format!("old{i}"), None)
                .await
                .unwrap();
        }

        let stream = h
            .orchestrator
            .handle_turn(request(session.id, "latest"))
            .await
            .unwrap();
        drain(stream).await;

        let contexts = h.provider.contexts();
        let (model, context) = &contexts[0];
        assert_eq!(*model, ChatModel::Gpt4oMini);
        assert_eq!(context.len(), 5);
        assert_eq!(context[0].role, MessageRole::System);
        let tail: Vec<&str> = context[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(tail, vec!["old3", "old4", "old5", "latest"]);
    }

    #[tokio::test]
    async fn test_no_title_on_later_turns() {
        let h = harness(
            ReplayProvider::completing(["ok"], TokenUsage::default()).with_title("Derived"),
            RelayConfig::default(),
        )
        .await;
        let session = h.store.create_session(alice(), None).await.unwrap();
        h.store
            .append_message(session.id, MessageRole::User, "earlier".to_string(), None)
            .await
            .unwrap();

        let stream = h
            .orchestrator
            .handle_turn(request(session.id, "again"))
            .await
            .unwrap();
        let (_, outcome) = drain(stream).await;
        assert!(matches!(
            outcome,
            TurnOutcome::Completed {
                title_task: None,
                ..
            }
        ));
        let reloaded = h.store.get_session(session.id, alice()).await.unwrap();
        assert_eq!(reloaded.title, DEFAULT_SESSION_TITLE);
    }

    #[tokio::test]
    async fn test_client_disconnect_abandons_turn() {
        let h = harness(
            ReplayProvider::new(vec![ReplayStep::Chunk("Hi".to_string()), ReplayStep::Hang]),
            RelayConfig::default(),
        )
        .await;
        let session = h.store.create_session(alice(), None).await.unwrap();

        let mut stream = h
            .orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await
            .unwrap();
        assert_eq!(stream.events.recv().await.map(|e| e.name()), Some("start"));
        assert_eq!(stream.events.recv().await.map(|e| e.name()), Some("delta"));
        drop(stream.events);

        let outcome = stream.outcome.await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Abandoned));
        assert_eq!(
            h.store.list_recent_messages(session.id, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stalled_provider_times_out() {
        let config = RelayConfig {
            stream_timeout_secs: 1,
            ..RelayConfig::default()
        };
        let h = harness(
            ReplayProvider::new(vec![ReplayStep::Chunk("Hi".to_string()), ReplayStep::Hang]),
            config,
        )
        .await;
        let session = h.store.create_session(alice(), None).await.unwrap();

        let stream = h
            .orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await
            .unwrap();
        let (events, outcome) = drain(stream).await;

        let StreamEvent::Error(error) = events.last().unwrap() else {
            panic!("expected a terminal error");
        };
        assert_eq!(error.code, STREAM_TIMEOUT);
        assert!(matches!(outcome, TurnOutcome::ProviderFailed { code: STREAM_TIMEOUT }));
        assert_eq!(
            h.store.list_recent_messages(session.id, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unread_stream_ends_at_deadline() {
        let config = RelayConfig {
            event_buffer: 1,
            stream_timeout_secs: 1,
            ..RelayConfig::default()
        };
        let chunks: Vec<String> = (0..10).map(|i| format!("chunk{i}")).collect();
        let h = harness(
            ReplayProvider::completing(chunks, TokenUsage::new(1, 10)),
            config,
        )
        .await;
        let session = h.store.create_session(alice(), None).await.unwrap();

        let TurnStream { events, outcome } = h
            .orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await
            .unwrap();

        // The receiver stays alive but is never read.
        let outcome = tokio::time::timeout(Duration::from_secs(4), outcome)
            .await
            .expect("turn outlived its deadline")
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::ProviderFailed { code: STREAM_TIMEOUT }));
        assert_eq!(
            h.store.list_recent_messages(session.id, 10).await.unwrap().len(),
            1
        );
        drop(events);
    }

    #[tokio::test]
    async fn test_unstorable_completion_reports_persistence_error() {
        let sqlite = Arc::new(SqliteConversationStore::open_in_memory().await.unwrap());
        let orchestrator = Arc::new(RelayOrchestrator::new(
            RelayBackends {
                store: Arc::new(RefusingAssistantStore {
                    inner: sqlite.clone(),
                }),
                provider: Arc::new(
                    ReplayProvider::completing(["Hi", "!"], TokenUsage::new(2, 2))
                        .with_title("Never"),
                ),
            },
            RelayConfig::default(),
        ));
        let session = sqlite.create_session(alice(), None).await.unwrap();

        let stream = orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await
            .unwrap();
        let (events, outcome) = drain(stream).await;

        let names: Vec<&str> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["start", "delta", "delta", "error"]);
        let StreamEvent::Error(error) = &events[3] else {
            panic!("last event must be error");
        };
        assert_eq!(error.code, PERSISTENCE_ERROR);
        assert!(matches!(outcome, TurnOutcome::PersistenceFailed));

        let messages = sqlite.list_recent_messages(session.id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_custom_title_is_never_derived() {
        let h = harness(
            ReplayProvider::completing(["ok"], TokenUsage::default()).with_title("Derived"),
            RelayConfig::default(),
        )
        .await;
        let session = h
            .store
            .create_session(alice(), Some("Trip planning".to_string()))
            .await
            .unwrap();

        let stream = h
            .orchestrator
            .handle_turn(request(session.id, "Hello"))
            .await
            .unwrap();
        let (_, outcome) = drain(stream).await;
        assert!(matches!(
            outcome,
            TurnOutcome::Completed {
                title_task: None,
                ..
            }
        ));
        assert!(h.provider.title_seeds().is_empty());
        let reloaded = h.store.get_session(session.id, alice()).await.unwrap();
        assert_eq!(reloaded.title, "Trip planning");
    }
}
