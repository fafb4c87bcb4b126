//! Tournament scheduling, match records and standings.
//!
//! [`TournamentManager`] drives a whole run: it schedules pairings
//! (round-robin or an elimination [`Bracket`]), plays each debate, has it
//! judged, and appends a [`MatchRecord`] to the result store. Standings are
//! always derived from stored records with [`compute_standings`].

pub mod config;
pub mod manager;
pub mod record;
pub mod schedule;
pub mod standings;

pub use config::{BackoffConfig, EndpointConfig, TiePolicy, TournamentConfig, TournamentShape};
pub use manager::{StopHandle, TournamentManager, TournamentSummary};
pub use record::{match_id, record_uuid, MatchOutcome, MatchRecord};
pub use schedule::{
    bracket_topic, coin_flip, round_robin, Bracket, BracketRound, Pairing, Resolution,
};
pub use standings::{
    aggregate_metrics, compute_standings, AgentStanding, POINTS_PER_TIE, POINTS_PER_WIN,
};
