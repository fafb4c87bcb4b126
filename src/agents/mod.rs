//! Debate agents, sessions and voting panels.
//!
//! - [`Agent`]: one model-backed participant; debaters and judges share the type.
//! - [`DebateSession`]: runs the rounds of one debate and produces a [`Transcript`].
//! - [`VotingPanel`]: collects independent judge [`Vote`]s and tallies a [`Verdict`].

pub mod debate_agents;
pub mod debate_session;
pub mod error;
pub mod transcript;
pub mod voting_panel;

pub use debate_agents::{
    Agent, AgentDefinition, AgentMetrics, AgentRole, GenerationSettings, JudgeCorrection,
    PeerContext, PeerStatement, RoundKind,
};
pub use debate_session::{DebateEvent, DebateSession, SessionConfig, SessionState, Visibility};
pub use error::{AgentError, AgentResult};
pub use transcript::{
    AbortCause, Topic, Transcript, TranscriptStatus, Turn, TurnFailure, TurnStatus,
};
pub use voting_panel::{TieBreak, Verdict, VerdictOutcome, Vote, VoteChoice, VotingPanel};
