//! LLM provider adapters for Clerk.
//!
//! The runtime talks to the model through the [`LlmProvider`] trait; the only
//! shipped adapter targets the Anthropic Messages API (streaming SSE, tool
//! use, extended thinking, prompt caching).

pub mod anthropic;
mod sse;
mod traits;

pub use anthropic::AnthropicProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
