//! Streaming chat completion relay.
//!
//! Accepts a user message for a stored conversation, relays it with recent
//! history to an upstream LLM provider, and streams the reply back as
//! server-sent events while persisting both sides of the turn.

// Strict rules for unsafe or non-idiomatic code
#![deny(warnings)]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(dead_code)]
#![deny(non_camel_case_types)]
#![deny(unused_imports)]
#![deny(unused_variables)]
#![deny(unused_must_use)]
#![deny(non_snake_case)]
#![deny(non_upper_case_globals)]
#![deny(nonstandard_style)]
#![forbid(unsafe_op_in_unsafe_fn)]
// Clippy discipline
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::missing_const_for_fn)]
#![deny(clippy::unwrap_in_result)]
#![deny(clippy::module_inception)]
#![deny(clippy::redundant_clone)]
#![deny(clippy::shadow_unrelated)]
#![deny(clippy::too_many_arguments)]
#![deny(clippy::cognitive_complexity)]
// Robustness
#![deny(overflowing_literals)]
// Tests assert with unwrap and panic on unexpected shapes
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::too_many_lines,
        clippy::shadow_unrelated,
        clippy::significant_drop_tightening
    )
)]

/// Configuration loading and validation.
#[allow(clippy::missing_errors_doc, clippy::doc_markdown)]
pub mod config;
/// Identifier newtypes.
pub mod ids;
/// Upstream LLM provider access.
#[allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::doc_markdown,
    clippy::option_if_let_else,
    clippy::cast_possible_truncation,
    clippy::future_not_send,
    clippy::missing_const_for_fn,
    clippy::too_many_lines
)]
pub mod llm;
/// Turn orchestration and the stream event protocol.
#[allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::cognitive_complexity,
    clippy::significant_drop_tightening,
    clippy::option_if_let_else,
    clippy::cast_possible_truncation,
    clippy::future_not_send
)]
pub mod relay;
/// HTTP server and API routes.
#[allow(
    clippy::missing_errors_doc,
    clippy::missing_const_for_fn,
    clippy::unused_async,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines
)]
pub mod server;
/// Entry helpers to start the relay server.
pub mod start_chat_relay;
/// Conversation persistence.
#[allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::too_many_lines,
    clippy::significant_drop_tightening
)]
pub mod store;
/// SSE framing and the HTTP client.
#[allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::missing_const_for_fn
)]
pub mod transport;
