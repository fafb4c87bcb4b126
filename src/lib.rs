//! debate_arena: multi-agent debate tournaments between LLM-backed agents.
//!
//! Agents argue a topic over several rounds, a voting panel judges each
//! transcript, and a tournament manager schedules matches and keeps an
//! append-only log of results.

// Core modules
pub mod agents;
pub mod cli;
pub mod error;
pub mod llm;
pub mod storage;
pub mod tournament;

// Re-export commonly used error types
pub use error::{ConfigError, ExhaustedRetries, ModelError, StorageError, TournamentError};
