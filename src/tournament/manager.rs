//! Tournament manager: schedules matches, runs debates, persists results.
//!
//! Every match is run to completion (or abort) and appended to the result
//! store before any match that depends on it is scheduled. Independent
//! matches, meaning the whole round-robin or one bracket round, run
//! concurrently up to the configured limit.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use super::config::{TiePolicy, TournamentConfig, TournamentShape};
use super::record::{match_id, record_uuid, MatchOutcome, MatchRecord};
use super::schedule::{bracket_topic, coin_flip, round_robin, Bracket, Pairing, Resolution};
use super::standings::{aggregate_metrics, compute_standings, AgentStanding};
use crate::agents::{
    AbortCause, Agent, AgentDefinition, AgentMetrics, DebateSession, Transcript, VotingPanel,
};
use crate::error::{ConfigError, StorageError, TournamentError};
use crate::llm::{LlmProvider, ModelClient};
use crate::storage::{AppendOutcome, ResultStore};

// ============================================================================
// Stop Handle
// ============================================================================

/// Requests a graceful stop: in-flight model calls finish, running debates
/// are recorded as cancelled, and no new match is started.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("Stop requested, finishing in-flight matches");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn signal(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Outcome of a tournament run, also written to `standings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentSummary {
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<TournamentShape>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records that belong to this tournament, reused ones included.
    pub matches_recorded: usize,
    /// Matches whose debate completed and was adjudicated.
    pub completed: usize,
    /// Matches whose debate was aborted by participant failures.
    pub aborted: usize,
    pub undetermined: usize,
    pub cancelled: usize,
    pub forfeits: usize,
    /// Records taken from an earlier run instead of being replayed.
    pub reused: usize,
    /// False when the run was stopped, a bracket stalled, or a match stayed
    /// undetermined after its infrastructure reschedule.
    pub schedule_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub champion: Option<String>,
    #[serde(default)]
    pub inconsistencies: Vec<String>,
    pub standings: Vec<AgentStanding>,
    pub agent_metrics: BTreeMap<String, AgentMetrics>,
}

impl TournamentSummary {
    /// Builds a summary from stored records alone.
    pub fn from_records(
        run_id: Uuid,
        shape: Option<TournamentShape>,
        agents: &[String],
        records: &[MatchRecord],
        started_at: DateTime<Utc>,
    ) -> Self {
        let count = |pred: fn(&MatchRecord) -> bool| records.iter().filter(|r| pred(r)).count();

        let infrastructure_undetermined = count(|r| {
            matches!(r.outcome, MatchOutcome::Undetermined { .. }) && !r.transcript.is_complete()
        });
        let cancelled = count(|r| r.outcome == MatchOutcome::Cancelled);

        Self {
            run_id,
            shape,
            started_at,
            finished_at: Utc::now(),
            matches_recorded: records.len(),
            completed: count(|r| r.transcript.is_complete()),
            aborted: count(|r| !r.transcript.is_complete() && r.outcome != MatchOutcome::Cancelled),
            undetermined: count(|r| matches!(r.outcome, MatchOutcome::Undetermined { .. })),
            cancelled,
            forfeits: count(|r| matches!(r.outcome, MatchOutcome::Forfeit { .. })),
            reused: 0,
            schedule_complete: cancelled == 0 && infrastructure_undetermined == 0,
            champion: None,
            inconsistencies: Vec::new(),
            standings: compute_standings(agents, records),
            agent_metrics: aggregate_metrics(records),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Result of playing one pairing, including any infrastructure reschedule.
struct PairingRun {
    records: Vec<MatchRecord>,
    reused: usize,
    /// Attempt number the next replay of this pairing must use.
    next_attempt: u32,
}

impl PairingRun {
    fn last(&self) -> Option<&MatchRecord> {
        self.records.last()
    }
}

/// What a bracket match contributed to the run.
struct BracketMatch {
    runs: Vec<PairingRun>,
    resolution: Option<Resolution>,
    inconsistency: Option<String>,
}

/// Runs a whole tournament against one model backend and one result store.
pub struct TournamentManager {
    config: TournamentConfig,
    client: ModelClient,
    panel: VotingPanel,
    store: Arc<dyn ResultStore>,
    definitions: HashMap<String, AgentDefinition>,
    limiter: Arc<Semaphore>,
    stop: StopHandle,
    summary_path: Option<PathBuf>,
}

impl TournamentManager {
    /// Creates a manager. The configuration is validated first.
    pub fn new(
        config: TournamentConfig,
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self, TournamentError> {
        config.validate()?;

        let client = ModelClient::new(provider, config.retry_policy(), config.concurrency_limit);
        let definitions = config
            .agents
            .iter()
            .map(|a| (a.id.clone(), a.clone()))
            .collect();

        Ok(Self {
            panel: VotingPanel::new(client.clone()),
            client,
            store,
            definitions,
            limiter: Arc::new(Semaphore::new(config.concurrency_limit)),
            stop: StopHandle::default(),
            summary_path: None,
            config,
        })
    }

    /// Also writes the summary as pretty JSON to `path` when the run ends.
    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &TournamentConfig {
        &self.config
    }

    /// Handle for stopping the run from elsewhere (e.g. a Ctrl-C handler).
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs the configured tournament.
    ///
    /// Records already present in the store under the same identifiers are
    /// reused, so an interrupted run can be resumed.
    ///
    /// # Errors
    ///
    /// Fails only when the result store cannot append; match-level problems
    /// are recorded and reported in the summary. The first storage failure
    /// drops every match still pending, so no further model calls are made.
    pub async fn run(&self) -> Result<TournamentSummary, TournamentError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let existing: HashMap<String, MatchRecord> = self
            .store
            .read_all()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        info!(
            %run_id,
            shape = ?self.config.tournament_shape,
            topics = self.config.topics.len(),
            debaters = self.debater_ids().len(),
            stored_records = existing.len(),
            "Starting tournament"
        );

        let mut runs = Vec::new();
        let mut champion = None;
        let mut inconsistencies = Vec::new();
        let mut stalled = false;

        match Bracket::new(self.config.tournament_shape, self.debater_ids()) {
            None => {
                let pairings = round_robin(&self.config.topics, &self.debater_ids());
                let results =
                    try_join_all(pairings.iter().map(|p| self.play_limited(p, &existing))).await?;
                runs.extend(results.into_iter().flatten());
            }
            Some(mut bracket) => {
                let mut ordinal = 0usize;
                while let Some(round) = bracket.next_round() {
                    if self.stop.is_stopped() {
                        break;
                    }
                    let Some(topic) = bracket_topic(&self.config.topics, round.round) else {
                        break;
                    };
                    info!(
                        round = round.round,
                        matches = round.pairings.len(),
                        byes = ?round.byes,
                        "Starting bracket round"
                    );

                    let pairings: Vec<Pairing> = round
                        .pairings
                        .iter()
                        .map(|(a, b)| {
                            ordinal += 1;
                            Pairing {
                                topic: topic.clone(),
                                agent_a: a.clone(),
                                agent_b: b.clone(),
                                bracket_round: round.round,
                                ordinal: ordinal - 1,
                            }
                        })
                        .collect();

                    let results = try_join_all(
                        pairings.iter().map(|p| self.settle_bracket_match(p, &existing)),
                    )
                    .await?;
                    for settled in results {
                        if let Some(resolution) = &settled.resolution {
                            bracket.apply(resolution);
                        }
                        inconsistencies.extend(settled.inconsistency);
                        runs.extend(settled.runs);
                    }
                }

                if bracket.is_stalled() {
                    let err = TournamentError::ScheduleInconsistency {
                        match_id: format!("bracket-round-{}", bracket.rounds_played()),
                        reason: "bracket did not produce a champion within the round limit"
                            .to_string(),
                    };
                    error!(error = %err, alive = ?bracket.alive(), "Bracket stalled");
                    inconsistencies.push(err.to_string());
                    stalled = true;
                }
                champion = bracket.champion().map(str::to_string);
            }
        }

        let reused: usize = runs.iter().map(|r| r.reused).sum();
        let records: Vec<MatchRecord> = runs.into_iter().flat_map(|r| r.records).collect();

        let mut summary = TournamentSummary::from_records(
            run_id,
            Some(self.config.tournament_shape),
            &self.debater_ids(),
            &records,
            started_at,
        );
        summary.reused = reused;
        summary.champion = champion;
        summary.inconsistencies = inconsistencies;
        summary.schedule_complete = summary.schedule_complete && !stalled && !self.stop.is_stopped();

        info!(
            %run_id,
            matches = summary.matches_recorded,
            completed = summary.completed,
            aborted = summary.aborted,
            undetermined = summary.undetermined,
            cancelled = summary.cancelled,
            schedule_complete = summary.schedule_complete,
            "Tournament finished"
        );

        if let Some(path) = &self.summary_path {
            let json = serde_json::to_string_pretty(&summary)
                .map_err(StorageError::from)?;
            tokio::fs::write(path, json)
                .await
                .map_err(StorageError::from)?;
        }

        Ok(summary)
    }

    /// Plays one independent pairing behind the concurrency limiter.
    async fn play_limited(
        &self,
        pairing: &Pairing,
        existing: &HashMap<String, MatchRecord>,
    ) -> Result<Option<PairingRun>, TournamentError> {
        let _permit = self.limiter.acquire().await.map_err(|e| {
            TournamentError::Config(ConfigError::ValidationFailed(format!(
                "Concurrency limiter closed: {}",
                e
            )))
        })?;
        let run = self.play_pairing(pairing, 1, existing).await?;
        Ok((!run.records.is_empty()).then_some(run))
    }

    /// Plays a bracket match and turns its outcome into a bracket resolution,
    /// applying the tie policy when the match is tied or undetermined.
    async fn settle_bracket_match(
        &self,
        pairing: &Pairing,
        existing: &HashMap<String, MatchRecord>,
    ) -> Result<BracketMatch, TournamentError> {
        let mut settled = BracketMatch {
            runs: Vec::new(),
            resolution: None,
            inconsistency: None,
        };

        let Some(first) = self.play_limited(pairing, existing).await? else {
            return Ok(settled);
        };
        let first_outcome = first.last().map(|r| (r.id.clone(), r.outcome.clone()));
        let next_attempt = first.next_attempt;
        settled.runs.push(first);

        let Some((first_id, outcome)) = first_outcome else {
            return Ok(settled);
        };
        if let Some(resolution) = decided(pairing, &outcome) {
            settled.resolution = Some(resolution);
            return Ok(settled);
        }
        if !outcome.is_unresolved() {
            // Cancelled.
            return Ok(settled);
        }

        let policy = self.config.tie_policy;
        settled.resolution = match policy {
            TiePolicy::BothAdvance => Some(Resolution::BothAdvance),
            TiePolicy::CoinFlip => Some(self.flip(pairing, &first_id)),
            TiePolicy::Rematch | TiePolicy::RematchThenCoinFlip => {
                info!(match_id = %first_id, "Unresolved bracket match, playing rematch");
                let _permit = self.limiter.acquire().await.map_err(|e| {
                    TournamentError::Config(ConfigError::ValidationFailed(format!(
                        "Concurrency limiter closed: {}",
                        e
                    )))
                })?;
                let rematch = self.play_pairing(pairing, next_attempt, existing).await?;
                let rematch_outcome = rematch.last().map(|r| (r.id.clone(), r.outcome.clone()));
                settled.runs.push(rematch);

                match rematch_outcome {
                    None => None,
                    Some((_, outcome)) if !outcome.is_final() => None,
                    Some((id, outcome)) => match decided(pairing, &outcome) {
                        Some(resolution) => Some(resolution),
                        None if policy == TiePolicy::RematchThenCoinFlip => {
                            Some(self.flip(pairing, &id))
                        }
                        None => {
                            let err = TournamentError::ScheduleInconsistency {
                                match_id: id,
                                reason: format!(
                                    "still {} after a rematch; both participants take a loss",
                                    outcome.label()
                                ),
                            };
                            error!(error = %err, "Bracket match could not be resolved");
                            settled.inconsistency = Some(err.to_string());
                            Some(Resolution::BothLose {
                                a: pairing.agent_a.clone(),
                                b: pairing.agent_b.clone(),
                            })
                        }
                    },
                }
            }
        };
        Ok(settled)
    }

    fn flip(&self, pairing: &Pairing, match_id: &str) -> Resolution {
        let winner = coin_flip(self.config.seed, match_id, &pairing.agent_a, &pairing.agent_b);
        let loser = if winner == pairing.agent_a {
            &pairing.agent_b
        } else {
            &pairing.agent_a
        };
        info!(match_id, winner, "Coin flip decides bracket match");
        Resolution::Winner {
            winner: winner.to_string(),
            loser: loser.clone(),
        }
    }

    /// Plays a pairing from `first_attempt`, reusing stored records and
    /// rescheduling once after an infrastructure abort.
    async fn play_pairing(
        &self,
        pairing: &Pairing,
        first_attempt: u32,
        existing: &HashMap<String, MatchRecord>,
    ) -> Result<PairingRun, TournamentError> {
        let mut run = PairingRun {
            records: Vec::new(),
            reused: 0,
            next_attempt: first_attempt,
        };
        let mut rescheduled = false;

        loop {
            let attempt = run.next_attempt;
            let id = match_id(
                &pairing.topic.id,
                &pairing.agent_a,
                &pairing.agent_b,
                pairing.bracket_round,
                attempt,
            );
            run.next_attempt += 1;

            let record = match existing.get(&id) {
                // A cancelled attempt from an earlier run is replayed under the next attempt.
                Some(stored) if stored.outcome == MatchOutcome::Cancelled => continue,
                Some(stored) => {
                    info!(match_id = %id, outcome = stored.outcome.label(), "Reusing stored result");
                    run.reused += 1;
                    stored.clone()
                }
                None => {
                    if self.stop.is_stopped() {
                        return Ok(run);
                    }
                    let record = self.run_match(pairing, &id, attempt, !rescheduled).await?;
                    match self.store.append(record.clone()).await? {
                        AppendOutcome::Appended { sequence } => {
                            info!(match_id = %id, sequence, outcome = record.outcome.label(), "Match recorded");
                        }
                        AppendOutcome::Duplicate => {
                            error!(match_id = %id, "Match id collides with a stored record");
                            return Err(StorageError::DuplicateRecord(id).into());
                        }
                    }
                    record
                }
            };

            let again = matches!(record.outcome, MatchOutcome::Rescheduled { .. }) && !rescheduled;
            run.records.push(record);
            if !again {
                return Ok(run);
            }
            rescheduled = true;
        }
    }

    /// Runs one debate and its adjudication, producing the match record.
    async fn run_match(
        &self,
        pairing: &Pairing,
        id: &str,
        attempt: u32,
        allow_reschedule: bool,
    ) -> Result<MatchRecord, TournamentError> {
        let span = info_span!("match", match_id = %id, attempt);
        self.play_match(pairing, id, attempt, allow_reschedule)
            .instrument(span)
            .await
    }

    async fn play_match(
        &self,
        pairing: &Pairing,
        id: &str,
        attempt: u32,
        allow_reschedule: bool,
    ) -> Result<MatchRecord, TournamentError> {
        let started_at = Utc::now();
        let debaters = vec![self.agent(&pairing.agent_a)?, self.agent(&pairing.agent_b)?];
        let mut session = DebateSession::new(
            id,
            pairing.topic.clone(),
            debaters,
            self.client.clone(),
            self.config
                .session_config()
                .with_rotation_seed(self.config.seed),
        )?
        .with_stop_signal(self.stop.signal());

        let transcript = session.run().await?;
        let mut agent_metrics: BTreeMap<String, AgentMetrics> = session
            .participants()
            .iter()
            .map(|a| (a.id().to_string(), a.metrics().clone()))
            .collect();

        let (votes, verdict, outcome) = if transcript.is_complete() {
            let mut judges = self.panel_for(pairing)?;
            let (votes, verdict) = self.panel.adjudicate(&transcript, &mut judges).await?;
            for judge in &judges {
                agent_metrics
                    .entry(judge.id().to_string())
                    .or_default()
                    .merge(judge.metrics());
            }
            let outcome = MatchOutcome::from_verdict(&verdict);
            (votes, Some(verdict), outcome)
        } else {
            (Vec::new(), None, abort_outcome(&transcript, allow_reschedule))
        };

        Ok(MatchRecord {
            id: id.to_string(),
            record_uuid: record_uuid(id),
            sequence: 0,
            topic: pairing.topic.clone(),
            participants: transcript.participants.clone(),
            bracket_round: pairing.bracket_round,
            attempt,
            transcript,
            votes,
            verdict,
            outcome,
            agent_metrics,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Judges for a match: configured judges, or otherwise the debaters not
    /// taking part. The pool rotates by one position per scheduled match.
    fn panel_for(&self, pairing: &Pairing) -> Result<Vec<Agent>, TournamentError> {
        let judges: Vec<&AgentDefinition> = self.config.judges().collect();
        let pool: Vec<&AgentDefinition> = if judges.is_empty() {
            self.config
                .debaters()
                .filter(|d| d.id != pairing.agent_a && d.id != pairing.agent_b)
                .collect()
        } else {
            judges
        };

        let size = self.config.panel_size as usize;
        if pool.len() < size {
            return Err(TournamentError::Config(ConfigError::invalid(
                "panel_size",
                format!("only {} judges available for a panel of {}", pool.len(), size),
            )));
        }

        let settings = self.config.generation_settings();
        Ok((0..size)
            .map(|i| pool[(pairing.ordinal + i) % pool.len()])
            .map(|def| Agent::new(def.clone(), settings))
            .collect())
    }

    fn agent(&self, id: &str) -> Result<Agent, TournamentError> {
        let definition = self.definitions.get(id).ok_or_else(|| {
            TournamentError::Config(ConfigError::ValidationFailed(format!("unknown agent '{}'", id)))
        })?;
        Ok(Agent::new(definition.clone(), self.config.generation_settings()))
    }

    fn debater_ids(&self) -> Vec<String> {
        self.config.debaters().map(|d| d.id.clone()).collect()
    }
}

/// Resolution for a match that has a winner.
fn decided(pairing: &Pairing, outcome: &MatchOutcome) -> Option<Resolution> {
    let winner = outcome.winner()?;
    let loser = if winner == pairing.agent_a {
        &pairing.agent_b
    } else {
        &pairing.agent_a
    };
    Some(Resolution::Winner {
        winner: winner.to_string(),
        loser: loser.clone(),
    })
}

/// Outcome of an aborted debate: a forfeit for a responsible participant,
/// a reschedule (once) for infrastructure trouble, or a cancellation.
fn abort_outcome(transcript: &Transcript, allow_reschedule: bool) -> MatchOutcome {
    let Some(cause) = &transcript.abort else {
        return MatchOutcome::Cancelled;
    };
    match cause {
        AbortCause::Cancelled => MatchOutcome::Cancelled,
        AbortCause::ParticipantFailures {
            agent_id,
            consecutive_failures,
            ..
        } => {
            if let Some(loser) = cause.responsible_agent() {
                let winner = transcript
                    .participants
                    .iter()
                    .find(|p| p.as_str() != loser)
                    .cloned()
                    .unwrap_or_default();
                return MatchOutcome::Forfeit {
                    winner,
                    loser: loser.to_string(),
                };
            }
            let reason = format!(
                "{} consecutive infrastructure failures for '{}'",
                consecutive_failures, agent_id
            );
            if allow_reschedule {
                MatchOutcome::Rescheduled { reason }
            } else {
                MatchOutcome::Undetermined { reason }
            }
        }
    }
}
