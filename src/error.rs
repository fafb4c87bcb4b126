//! Error types for debate-arena operations.
//!
//! Defines error types for the subsystems that surface failures:
//! - Model backend calls (the four failure kinds of the model client)
//! - Result store persistence
//! - Tournament configuration
//! - Tournament scheduling and execution

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that a single model backend call can fail with.
///
/// Every variant is retryable by the model client. The split between
/// infrastructure and model failures decides how an aborted debate is
/// attributed (see [`ModelError::is_infrastructure`]).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ModelError {
    #[error("Model call timed out after {millis} ms")]
    Timeout { millis: u64 },

    #[error("Connection to model backend failed: {0}")]
    ConnectionError(String),

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("Rate limited by model backend: {0}")]
    RateLimited(String),
}

impl ModelError {
    /// Returns true when the failure is caused by the backend rather than
    /// the model output itself.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ConnectionError(_) | Self::RateLimited(_) => true,
            Self::MalformedResponse(_) => false,
        }
    }

    /// Short machine-friendly label for logs and records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::ConnectionError(_) => "connection_error",
            Self::MalformedResponse(_) => "malformed_response",
            Self::RateLimited(_) => "rate_limited",
        }
    }
}

/// A model call that failed on every allowed attempt.
#[derive(Debug, Clone, Error)]
#[error("Model call failed after {attempts} attempt(s): {last_error}")]
pub struct ExhaustedRetries {
    /// Number of attempts made (always `max_retries + 1`).
    pub attempts: u32,
    /// The error returned by the final attempt.
    pub last_error: ModelError,
    /// Time spent on all attempts and backoff delays.
    pub elapsed: Duration,
}

/// Errors that can occur while persisting or reading match records.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to create storage directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("Corrupted record at line {line}: {reason}")]
    CorruptedRecord { line: usize, reason: String },

    /// A freshly played match collided with a record already in the log.
    #[error("Match '{0}' is already recorded")]
    DuplicateRecord(String),
}

/// Errors that can occur while loading or validating a tournament configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Duplicate identifier '{0}'")]
    DuplicateId(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced to the tournament manager.
///
/// Transport and model failures never reach this level: they are retried by
/// the model client and then recorded as failed turns or abstentions.
#[derive(Debug, Error)]
pub enum TournamentError {
    /// The bracket could not resolve a tied or undetermined match.
    /// Fatal to that match only.
    #[error("Schedule inconsistency in match '{match_id}': {reason}")]
    ScheduleInconsistency { match_id: String, reason: String },

    /// The result store could not durably append. Fatal to the whole run.
    #[error("Result store failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Agent error: {0}")]
    Agent(#[from] crate::agents::AgentError),
}
