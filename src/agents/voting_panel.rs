//! Voting panel: independent judge votes aggregated into a deterministic verdict.

use std::collections::BTreeMap;

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::debate_agents::{Agent, JudgeCorrection};
use super::error::{AgentError, AgentResult};
use super::transcript::Transcript;
use crate::llm::ModelClient;

// ============================================================================
// Votes
// ============================================================================

/// What a judge decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VoteChoice {
    /// A vote for one participant.
    Candidate(String),
    /// An explicit "tie" decision. Effective, but counts for no candidate.
    Tie,
    /// The judge produced no usable decision.
    Abstain { reason: String },
}

/// One judge's vote on one transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub judge_id: String,
    pub match_id: String,
    pub choice: VoteChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub rationale: String,
    /// The judge had to be re-prompted after a protocol violation.
    #[serde(default)]
    pub reprompted: bool,
}

impl Vote {
    pub fn is_abstention(&self) -> bool {
        matches!(self.choice, VoteChoice::Abstain { .. })
    }

    fn abstain(judge_id: &str, match_id: &str, reason: String, reprompted: bool) -> Self {
        Self {
            judge_id: judge_id.to_string(),
            match_id: match_id.to_string(),
            choice: VoteChoice::Abstain { reason },
            score: None,
            rationale: String::new(),
            reprompted,
        }
    }
}

// ============================================================================
// Verdict
// ============================================================================

/// Aggregate result of a panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerdictOutcome {
    Winner { agent_id: String },
    Tie,
    /// No effective votes at all.
    Undetermined,
}

/// Tie-break rule applied when several candidates shared the top tally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum TieBreak {
    /// Highest average numeric score among the votes each candidate received.
    HighestAverageScore { averages: BTreeMap<String, f64> },
}

/// Deterministic aggregation of a set of votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub match_id: String,
    /// Votes per candidate, zero-vote candidates included.
    pub tally: BTreeMap<String, u32>,
    pub tie_votes: u32,
    pub outcome: VerdictOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tie_break: Option<TieBreak>,
    pub abstentions: u32,
    pub effective_votes: u32,
}

impl Verdict {
    /// Aggregates votes. Pure: the same inputs always give the same verdict.
    ///
    /// Plurality among candidates wins. If "tie" votes are at least as many
    /// as the top candidate's, the verdict is a tie. Candidates sharing the
    /// top tally are separated by their average score; equal or missing
    /// averages leave a tie.
    pub fn tally(match_id: &str, candidates: &[String], votes: &[Vote]) -> Self {
        let mut tally: BTreeMap<String, u32> =
            candidates.iter().map(|c| (c.clone(), 0)).collect();
        let mut scores: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        let mut tie_votes = 0u32;
        let mut abstentions = 0u32;

        for vote in votes {
            match &vote.choice {
                VoteChoice::Candidate(id) => match tally.get_mut(id) {
                    Some(count) => {
                        *count += 1;
                        if let Some(score) = vote.score.filter(|s| s.is_finite()) {
                            scores.entry(id.as_str()).or_default().push(score);
                        }
                    }
                    None => abstentions += 1,
                },
                VoteChoice::Tie => tie_votes += 1,
                VoteChoice::Abstain { .. } => abstentions += 1,
            }
        }

        let candidate_votes: u32 = tally.values().sum();
        let effective_votes = candidate_votes + tie_votes;
        let top = tally.values().copied().max().unwrap_or(0);
        let leaders: Vec<&String> = tally
            .iter()
            .filter(|(_, &count)| count == top && top > 0)
            .map(|(id, _)| id)
            .collect();

        let mut tie_break = None;
        let outcome = if effective_votes == 0 {
            VerdictOutcome::Undetermined
        } else if top == 0 || tie_votes >= top {
            VerdictOutcome::Tie
        } else if leaders.len() == 1 {
            VerdictOutcome::Winner {
                agent_id: leaders[0].clone(),
            }
        } else {
            let averages: BTreeMap<String, f64> = leaders
                .iter()
                .filter_map(|id| {
                    scores.get(id.as_str()).map(|s| {
                        (id.to_string(), s.iter().sum::<f64>() / s.len() as f64)
                    })
                })
                .collect();
            let best = averages.values().copied().fold(f64::NEG_INFINITY, f64::max);
            let best_ids: Vec<&String> = averages
                .iter()
                .filter(|(_, &avg)| avg == best)
                .map(|(id, _)| id)
                .collect();
            let outcome = if averages.len() == leaders.len() && best_ids.len() == 1 {
                VerdictOutcome::Winner {
                    agent_id: best_ids[0].clone(),
                }
            } else {
                VerdictOutcome::Tie
            };
            tie_break = Some(TieBreak::HighestAverageScore { averages });
            outcome
        };

        Self {
            match_id: match_id.to_string(),
            tally,
            tie_votes,
            outcome,
            tie_break,
            abstentions,
            effective_votes,
        }
    }

    /// The winning participant, if any.
    pub fn winner(&self) -> Option<&str> {
        match &self.outcome {
            VerdictOutcome::Winner { agent_id } => Some(agent_id),
            _ => None,
        }
    }

    pub fn is_undetermined(&self) -> bool {
        self.outcome == VerdictOutcome::Undetermined
    }
}

// ============================================================================
// Panel
// ============================================================================

/// A decision parsed from a judge's reply.
#[derive(Debug, Clone, PartialEq)]
struct Decision {
    choice: VoteChoice,
    score: Option<f64>,
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    winner: String,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    rationale: String,
}

/// Queries judges on a complete transcript and aggregates their votes.
pub struct VotingPanel {
    client: ModelClient,
    winner_line: Regex,
}

impl VotingPanel {
    pub fn new(client: ModelClient) -> Self {
        Self {
            client,
            winner_line: Regex::new(r#"(?im)^[\s*#>-]*winner[\s*]*[:=][\s*"']*([^\s:#]+)"#)
                .expect("Invalid regex for winner line"),
        }
    }

    /// Collects one vote per judge and aggregates them.
    ///
    /// Judges are queried concurrently; each prompt holds only the transcript.
    pub async fn adjudicate(
        &self,
        transcript: &Transcript,
        judges: &mut [Agent],
    ) -> AgentResult<(Vec<Vote>, Verdict)> {
        if !transcript.is_complete() {
            return Err(AgentError::IncompleteTranscript(transcript.match_id.clone()));
        }
        if judges.is_empty() {
            return Err(AgentError::ConfigurationError(
                "A voting panel needs at least one judge".to_string(),
            ));
        }
        if let Some(judge) = judges
            .iter()
            .find(|j| transcript.participants.iter().any(|p| p == j.id()))
        {
            return Err(AgentError::ConfigurationError(format!(
                "Judge '{}' is a participant of '{}'",
                judge.id(),
                transcript.match_id
            )));
        }

        let votes = join_all(
            judges
                .iter_mut()
                .map(|judge| self.collect_vote(judge, transcript)),
        )
        .await;

        let verdict = Verdict::tally(&transcript.match_id, &transcript.participants, &votes);
        info!(
            match_id = %transcript.match_id,
            outcome = ?verdict.outcome,
            effective_votes = verdict.effective_votes,
            abstentions = verdict.abstentions,
            "Verdict reached"
        );
        Ok((votes, verdict))
    }

    /// Obtains one judge's vote, re-prompting once after a protocol violation.
    async fn collect_vote(&self, judge: &mut Agent, transcript: &Transcript) -> Vote {
        let match_id = transcript.match_id.as_str();
        let mut correction: Option<JudgeCorrection> = None;

        loop {
            let reprompted = correction.is_some();
            let completion = match judge.judge(&self.client, transcript, correction.as_ref()).await {
                Ok(completion) => completion,
                Err(exhausted) => {
                    warn!(judge = %judge.id(), match_id, error = %exhausted, "Judge abstains");
                    return Vote::abstain(judge.id(), match_id, exhausted.to_string(), reprompted);
                }
            };

            match self.parse_decision(judge.id(), &completion.text, &transcript.participants) {
                Ok(decision) => {
                    debug!(judge = %judge.id(), match_id, choice = ?decision.choice, "Vote cast");
                    return Vote {
                        judge_id: judge.id().to_string(),
                        match_id: match_id.to_string(),
                        choice: decision.choice,
                        score: decision.score,
                        rationale: decision.rationale,
                        reprompted,
                    };
                }
                Err(err) if !reprompted => {
                    warn!(judge = %judge.id(), match_id, error = %err, "Re-prompting judge");
                    correction = Some(JudgeCorrection {
                        previous_answer: completion.text,
                        problem: match err {
                            AgentError::ProtocolViolation { reason, .. } => reason,
                            other => other.to_string(),
                        },
                    });
                }
                Err(err) => {
                    warn!(judge = %judge.id(), match_id, error = %err, "Judge abstains after correction");
                    return Vote::abstain(judge.id(), match_id, err.to_string(), true);
                }
            }
        }
    }

    /// Parses a judge reply into a decision about `candidates`.
    fn parse_decision(&self, judge_id: &str, text: &str, candidates: &[String]) -> AgentResult<Decision> {
        let violation = |reason: String| AgentError::ProtocolViolation {
            judge: judge_id.to_string(),
            reason,
        };

        let json = extract_json(text);
        let (winner, score, rationale) = match serde_json::from_str::<RawDecision>(&json) {
            Ok(raw) => (raw.winner, raw.score, raw.rationale),
            Err(_) => {
                let caps = self
                    .winner_line
                    .captures(text)
                    .ok_or_else(|| violation("no decision found in the answer".to_string()))?;
                (caps[1].to_string(), None, text.trim().chars().take(500).collect())
            }
        };

        let choice = match_candidate(&winner, candidates)
            .ok_or_else(|| violation(format!("unknown candidate '{}'", winner.trim())))?;

        Ok(Decision {
            choice,
            score: score.filter(|s| s.is_finite()),
            rationale,
        })
    }
}

/// Maps a judge's winner text to a vote choice. Case-insensitive; a
/// trailing sentence punctuation mark is dropped when the exact name is unknown.
fn match_candidate(winner: &str, candidates: &[String]) -> Option<VoteChoice> {
    let name = winner.trim().trim_matches(|c| c == '"' || c == '\'' || c == '*');
    let bare = name.trim_end_matches(|c| matches!(c, '.' | ',' | ';' | '!'));
    [name, bare].into_iter().find_map(|name| {
        if name.eq_ignore_ascii_case("tie") || name.eq_ignore_ascii_case("draw") {
            return Some(VoteChoice::Tie);
        }
        candidates
            .iter()
            .find(|c| c.eq_ignore_ascii_case(name))
            .map(|c| VoteChoice::Candidate(c.clone()))
    })
}

/// Extracts JSON from a potentially markdown-wrapped response.
fn extract_json(content: &str) -> String {
    if let Some(start) = content.find("```json") {
        let body = &content[start + 7..];
        if let Some(end) = body.find("```") {
            return body[..end].trim().to_string();
        }
    }

    if let Some(start) = content.find('{') {
        if let Some(end) = content.rfind('}') {
            if end >= start {
                return content[start..=end].to_string();
            }
        }
    }

    content.trim().to_string()
}
