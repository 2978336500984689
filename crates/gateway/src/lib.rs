//! Clerk gateway — the HTTP surface and agent runtime.
//!
//! Accepts user messages over HTTP, drives the LLM tool-use loop, streams
//! progress back over SSE, and manages per-chat lifecycle: cancellation,
//! supersession, persistence, and configuration-change tracking.

pub mod api;
pub mod knowledge;
pub mod runtime;
pub mod skills;
pub mod state;
