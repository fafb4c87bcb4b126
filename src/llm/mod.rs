//! Model backend integration.
//!
//! Two layers:
//!
//! - [`LlmProvider`]: one request, one backend call. [`LiteLlmClient`] talks to
//!   any OpenAI-compatible `/chat/completions` endpoint (Ollama, LiteLLM, vLLM).
//! - [`ModelClient`]: the capability agents use. Adds per-call timeouts, bounded
//!   retries with exponential backoff and an in-flight limit.
//!
//! ```ignore
//! use debate_arena::llm::{LiteLlmClient, ModelClient, RetryPolicy, GenerationRequest, Message};
//! use std::sync::Arc;
//!
//! let provider = Arc::new(LiteLlmClient::from_env()?);
//! let client = ModelClient::new(provider, RetryPolicy::new(2), 4);
//! let completion = client
//!     .complete(GenerationRequest::new("llama3.2", vec![Message::user("Hello")]))
//!     .await?;
//! println!("{} ({} attempts)", completion.text, completion.attempts);
//! ```

pub mod client;
pub mod litellm;

pub use client::{Completion, ModelClient, RetryPolicy};
pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_API_BASE, DEFAULT_MODEL,
};
