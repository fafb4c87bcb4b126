//! Debate session: drives a fixed set of agents through the rounds of one debate.
//!
//! Lifecycle: `Pending -> InProgress(1..N) -> Complete | Aborted`. Each round
//! collects exactly one turn per participant, in a rotated speaking order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::debate_agents::{Agent, AgentRole, PeerContext, PeerStatement};
use super::error::{AgentError, AgentResult};
use super::transcript::{AbortCause, Topic, Transcript, TranscriptStatus, Turn, TurnStatus};
use crate::llm::ModelClient;

// ============================================================================
// Configuration
// ============================================================================

/// What a speaker may see of the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Only earlier rounds are visible; a round's turns are requested together.
    #[default]
    Simultaneous,
    /// Earlier speakers of the same round are visible too.
    Sequential,
}

/// Configuration for a debate session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Number of rounds to run.
    pub rounds: u32,
    /// A participant whose consecutive failed turns exceed this aborts the session.
    pub max_consecutive_failures: u32,
    /// Session-level retries of a failed turn, on top of the model client's own.
    pub turn_retries: u32,
    pub visibility: Visibility,
    /// Stop once every participant has repeated itself for two rounds running.
    pub early_stop: bool,
    /// Offset applied to the speaking-order rotation.
    pub rotation_seed: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            max_consecutive_failures: 2,
            turn_retries: 0,
            visibility: Visibility::default(),
            early_stop: false,
            rotation_seed: 0,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of rounds (at least 1).
    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds.max(1);
        self
    }

    /// Sets the consecutive-failure threshold (at least 1).
    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max.max(1);
        self
    }

    pub fn with_turn_retries(mut self, retries: u32) -> Self {
        self.turn_retries = retries;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_early_stop(mut self, enabled: bool) -> Self {
        self.early_stop = enabled;
        self
    }

    pub fn with_rotation_seed(mut self, seed: u64) -> Self {
        self.rotation_seed = seed;
        self
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    InProgress { round: u32 },
    Complete,
    Aborted,
}

// ============================================================================
// Debate Events
// ============================================================================

/// Progress events emitted while a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DebateEvent {
    /// The session has started.
    SessionStarted {
        match_id: String,
        topic_id: String,
        participants: Vec<String>,
        planned_rounds: u32,
        timestamp: DateTime<Utc>,
    },
    /// A round has started.
    RoundStarted {
        round: u32,
        speaking_order: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A turn was recorded in the transcript.
    TurnRecorded {
        speaker: String,
        round: u32,
        status: TurnStatus,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// Every participant has produced a turn for the round.
    RoundCompleted {
        round: u32,
        failed_turns: usize,
        timestamp: DateTime<Utc>,
    },
    /// The session has ended.
    SessionFinished {
        status: TranscriptStatus,
        rounds_completed: u32,
        abort: Option<AbortCause>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl DebateEvent {
    pub fn session_started(transcript: &Transcript) -> Self {
        Self::SessionStarted {
            match_id: transcript.match_id.clone(),
            topic_id: transcript.topic.id.clone(),
            participants: transcript.participants.clone(),
            planned_rounds: transcript.planned_rounds,
            timestamp: Utc::now(),
        }
    }

    pub fn round_started(round: u32, speaking_order: Vec<String>) -> Self {
        Self::RoundStarted {
            round,
            speaking_order,
            timestamp: Utc::now(),
        }
    }

    pub fn turn_recorded(turn: &Turn) -> Self {
        Self::TurnRecorded {
            speaker: turn.speaker.clone(),
            round: turn.round,
            status: turn.status,
            latency_ms: turn.latency_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn round_completed(round: u32, failed_turns: usize) -> Self {
        Self::RoundCompleted {
            round,
            failed_turns,
            timestamp: Utc::now(),
        }
    }

    pub fn session_finished(transcript: &Transcript, duration_ms: u64) -> Self {
        Self::SessionFinished {
            status: transcript.status,
            rounds_completed: transcript.rounds_completed,
            abort: transcript.abort.clone(),
            duration_ms,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Failure streak of one participant.
#[derive(Debug, Clone, Copy)]
struct FailureStreak {
    count: u32,
    infrastructure: bool,
}

impl Default for FailureStreak {
    fn default() -> Self {
        Self {
            count: 0,
            infrastructure: true,
        }
    }
}

/// One debate between a fixed set of participants.
pub struct DebateSession {
    match_id: String,
    topic: Topic,
    config: SessionConfig,
    client: ModelClient,
    participants: Vec<Agent>,
    state: SessionState,
    stop: Option<Arc<AtomicBool>>,
    events: Option<mpsc::Sender<DebateEvent>>,
}

impl DebateSession {
    /// Creates a session. Requires at least two debaters with distinct ids.
    pub fn new(
        match_id: impl Into<String>,
        topic: Topic,
        participants: Vec<Agent>,
        client: ModelClient,
        config: SessionConfig,
    ) -> AgentResult<Self> {
        if participants.len() < 2 {
            return Err(AgentError::ConfigurationError(format!(
                "A debate needs at least 2 participants, got {}",
                participants.len()
            )));
        }

        let mut seen = HashSet::new();
        for agent in &participants {
            if agent.role() != AgentRole::Debater {
                return Err(AgentError::WrongRole {
                    agent: agent.id().to_string(),
                    role: AgentRole::Debater.to_string(),
                });
            }
            if !seen.insert(agent.id().to_string()) {
                return Err(AgentError::ConfigurationError(format!(
                    "Participant '{}' appears twice",
                    agent.id()
                )));
            }
        }

        Ok(Self {
            match_id: match_id.into(),
            topic,
            config,
            client,
            participants,
            state: SessionState::Pending,
            stop: None,
            events: None,
        })
    }

    /// Attaches a stop signal checked before every round.
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Attaches a channel receiving progress events.
    pub fn with_events(mut self, events: mpsc::Sender<DebateEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn participants(&self) -> &[Agent] {
        &self.participants
    }

    /// Consumes the session, returning its agents (with their metrics).
    pub fn into_participants(self) -> Vec<Agent> {
        self.participants
    }

    /// Speaking order for `round`: declared order rotated left by
    /// `(rotation_seed + round - 1) mod n`. Returns participant indices.
    pub fn speaking_order(&self, round: u32) -> Vec<usize> {
        let n = self.participants.len();
        let shift = ((self.config.rotation_seed % n as u64)
            + u64::from(round.saturating_sub(1)))
            % n as u64;
        let mut order: Vec<usize> = (0..n).collect();
        order.rotate_left(shift as usize);
        order
    }

    /// Runs the debate to completion or abort and returns the transcript.
    ///
    /// An aborted transcript is still returned (not an error): it is kept
    /// for audit and carries the abort cause.
    pub async fn run(&mut self) -> AgentResult<Transcript> {
        if self.state != SessionState::Pending {
            return Err(AgentError::ConfigurationError(format!(
                "Session '{}' has already been run",
                self.match_id
            )));
        }

        let started = Instant::now();
        let planned_rounds = self.config.rounds.max(1);
        for agent in &mut self.participants {
            agent.join_debate(&self.topic, planned_rounds);
        }

        let mut transcript = Transcript {
            match_id: self.match_id.clone(),
            topic: self.topic.clone(),
            participants: self.participants.iter().map(|a| a.id().to_string()).collect(),
            planned_rounds,
            rounds_completed: 0,
            speaking_orders: Vec::new(),
            turns: Vec::new(),
            status: TranscriptStatus::Complete,
            abort: None,
        };

        info!(
            match_id = %self.match_id,
            topic = %self.topic.id,
            participants = ?transcript.participants,
            rounds = planned_rounds,
            "Starting debate session"
        );
        self.send_event(DebateEvent::session_started(&transcript)).await;

        let mut streaks: HashMap<String, FailureStreak> = HashMap::new();
        let mut stable_rounds = 0u32;

        for round in 1..=planned_rounds {
            if self.stop_requested() {
                info!(match_id = %self.match_id, round, "Stop requested, cancelling session");
                transcript.abort = Some(AbortCause::Cancelled);
                break;
            }

            self.state = SessionState::InProgress { round };
            let order = self.speaking_order(round);
            let order_ids: Vec<String> = order
                .iter()
                .map(|&i| self.participants[i].id().to_string())
                .collect();
            transcript.speaking_orders.push(order_ids.clone());
            self.send_event(DebateEvent::round_started(round, order_ids)).await;

            let abort = match self.config.visibility {
                Visibility::Simultaneous => {
                    let turns = self.simultaneous_round(&transcript, round, &order).await;
                    let mut abort = None;
                    for turn in turns {
                        let result = self.record_turn(&mut transcript, &mut streaks, turn).await;
                        abort = abort.or(result);
                    }
                    abort
                }
                Visibility::Sequential => {
                    self.sequential_round(&mut transcript, &mut streaks, round, &order)
                        .await
                }
            };

            if let Some(cause) = abort {
                warn!(match_id = %self.match_id, round, cause = ?cause, "Aborting debate session");
                transcript.abort = Some(cause);
                break;
            }

            transcript.rounds_completed = round;
            let failed = transcript.turns_in_round(round).filter(|t| t.is_failed()).count();
            self.send_event(DebateEvent::round_completed(round, failed)).await;

            if self.config.early_stop && round < planned_rounds {
                if Self::round_repeats_previous(&transcript, round) {
                    stable_rounds += 1;
                } else {
                    stable_rounds = 0;
                }
                if stable_rounds >= 2 {
                    info!(match_id = %self.match_id, round, "Positions stable, ending debate early");
                    break;
                }
            }
        }

        if transcript.abort.is_some() {
            transcript.status = TranscriptStatus::Aborted;
            self.state = SessionState::Aborted;
        } else {
            transcript.status = TranscriptStatus::Complete;
            self.state = SessionState::Complete;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            match_id = %self.match_id,
            status = ?transcript.status,
            rounds_completed = transcript.rounds_completed,
            turns = transcript.turns.len(),
            duration_ms,
            "Debate session finished"
        );
        self.send_event(DebateEvent::session_finished(&transcript, duration_ms))
            .await;

        Ok(transcript)
    }

    /// Requests every turn of the round at once; nobody sees a same-round turn.
    async fn simultaneous_round(
        &mut self,
        transcript: &Transcript,
        round: u32,
        order: &[usize],
    ) -> Vec<Turn> {
        let mut slots = vec![0usize; self.participants.len()];
        for (slot, &idx) in order.iter().enumerate() {
            slots[idx] = slot;
        }
        let contexts: Vec<PeerContext> = self
            .participants
            .iter()
            .map(|agent| Self::peer_context(transcript, agent.id(), round))
            .collect();

        let client = &self.client;
        let retries = self.config.turn_retries;
        let futures = self
            .participants
            .iter_mut()
            .zip(contexts.iter())
            .enumerate()
            .map(|(idx, (agent, context))| {
                obtain_turn(agent, client, round, slots[idx], context, retries)
            });

        let mut turns = join_all(futures).await;
        turns.sort_by_key(|t| t.slot);
        turns
    }

    /// Requests turns one by one; each speaker sees earlier same-round turns.
    async fn sequential_round(
        &mut self,
        transcript: &mut Transcript,
        streaks: &mut HashMap<String, FailureStreak>,
        round: u32,
        order: &[usize],
    ) -> Option<AbortCause> {
        for (slot, &idx) in order.iter().enumerate() {
            let context =
                Self::peer_context(transcript, self.participants[idx].id(), round + 1);
            let turn = obtain_turn(
                &mut self.participants[idx],
                &self.client,
                round,
                slot,
                &context,
                self.config.turn_retries,
            )
            .await;
            if let Some(cause) = self.record_turn(transcript, streaks, turn).await {
                return Some(cause);
            }
        }
        None
    }

    /// Appends a turn and updates the speaker's failure streak.
    async fn record_turn(
        &self,
        transcript: &mut Transcript,
        streaks: &mut HashMap<String, FailureStreak>,
        turn: Turn,
    ) -> Option<AbortCause> {
        debug!(
            match_id = %self.match_id,
            speaker = %turn.speaker,
            round = turn.round,
            status = ?turn.status,
            "Turn recorded"
        );
        self.send_event(DebateEvent::turn_recorded(&turn)).await;

        let streak = streaks.entry(turn.speaker.clone()).or_default();
        let cause = if turn.is_failed() {
            streak.count += 1;
            let infrastructure = turn.failure.as_ref().is_some_and(|f| f.infrastructure);
            streak.infrastructure = streak.infrastructure && infrastructure;
            (streak.count > self.config.max_consecutive_failures).then(|| {
                AbortCause::ParticipantFailures {
                    agent_id: turn.speaker.clone(),
                    consecutive_failures: streak.count,
                    infrastructure: streak.infrastructure,
                }
            })
        } else {
            *streak = FailureStreak::default();
            None
        };

        transcript.turns.push(turn);
        cause
    }

    /// Public statements by other speakers from rounds before `before_round`.
    fn peer_context(transcript: &Transcript, speaker: &str, before_round: u32) -> PeerContext {
        PeerContext {
            statements: transcript
                .turns
                .iter()
                .filter(|t| t.round < before_round && t.speaker != speaker)
                .map(|t| PeerStatement {
                    speaker: t.speaker.clone(),
                    round: t.round,
                    content: t.public_content().to_string(),
                })
                .collect(),
        }
    }

    /// True when the round had no failures and every speaker repeated its
    /// previous round's content.
    fn round_repeats_previous(transcript: &Transcript, round: u32) -> bool {
        if round < 2 {
            return false;
        }
        transcript.turns_in_round(round).all(|turn| {
            !turn.is_failed()
                && transcript
                    .turns_by(&turn.speaker)
                    .find(|prev| prev.round == round - 1)
                    .is_some_and(|prev| !prev.is_failed() && normalize(&prev.content) == normalize(&turn.content))
        })
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    async fn send_event(&self, event: DebateEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// Requests a turn, retrying a failed one up to `retries` more times.
async fn obtain_turn(
    agent: &mut Agent,
    client: &ModelClient,
    round: u32,
    slot: usize,
    context: &PeerContext,
    retries: u32,
) -> Turn {
    let mut spent = 0u32;
    let mut turn = agent.propose_turn(client, round, slot, context).await;
    for _ in 0..retries {
        if !turn.is_failed() {
            break;
        }
        spent += turn.attempts;
        debug!(agent = %agent.id(), round, "Retrying failed turn");
        turn = agent.propose_turn(client, round, slot, context).await;
    }
    if spent > 0 {
        turn.attempts += spent;
        if turn.status == TurnStatus::Ok {
            turn.status = TurnStatus::Retried;
        }
    }
    turn
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
