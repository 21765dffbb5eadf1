//! Client transport: event frames over a long-lived HTTP response.

pub mod client;
pub mod frame;
pub mod sse;

pub use client::{ClientError, EventDecoder, RelayClient, decode_event_stream};
pub use frame::{Frame, FrameDecoder};
pub use sse::{sse_event, stream_response};
