//! Streaming completion relay.
//!
//! - `orchestrator`: one turn from validation to terminal persistence
//! - `sink`: ordered event delivery for a turn
//! - `events`: the events and their stable error codes
//! - `context`: bounded provider context

pub mod context;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod sink;

pub use context::build_context;
pub use error::RelayError;
pub use events::{
    DeltaPayload, DonePayload, ErrorPayload, EventDecodeError, StartPayload, StreamEvent,
};
pub use orchestrator::{
    PreparedTurn, RelayBackends, RelayOrchestrator, TurnOutcome, TurnRequest, TurnStream,
};
pub use sink::{EventSink, Phase, SinkError};
