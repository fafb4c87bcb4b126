//! Error types for debate agents, sessions and voting panels.

use thiserror::Error;

use crate::error::ModelError;

/// Errors that can occur during agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A judge answered, but not with a decision about the debate's candidates.
    #[error("Protocol violation by judge '{judge}': {reason}")]
    ProtocolViolation { judge: String, reason: String },

    /// Error parsing an LLM response.
    #[error("Failed to parse LLM response: {0}")]
    ResponseParseError(String),

    /// Model call failed after all retries.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// The agent was asked to act in a role it does not hold.
    #[error("Agent '{agent}' cannot act as {role}")]
    WrongRole { agent: String, role: String },

    /// Invalid session or panel setup.
    #[error("Agent configuration error: {0}")]
    ConfigurationError(String),

    /// A transcript that is not complete was handed to the voting panel.
    #[error("Transcript '{0}' is not complete and cannot be adjudicated")]
    IncompleteTranscript(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
