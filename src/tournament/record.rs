//! Match records: what the result store persists for every finished match.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::{AgentMetrics, Topic, Transcript, Verdict, VerdictOutcome, Vote};

/// Builds the stable match identifier
/// `{topic}:{a}-vs-{b}:r{bracket_round}`, suffixed `#{attempt}` after the first attempt.
pub fn match_id(topic_id: &str, agent_a: &str, agent_b: &str, bracket_round: u32, attempt: u32) -> String {
    let base = format!("{}:{}-vs-{}:r{}", topic_id, agent_a, agent_b, bracket_round);
    if attempt > 1 {
        format!("{}#{}", base, attempt)
    } else {
        base
    }
}

/// Deterministic record UUID derived from a match identifier.
pub fn record_uuid(match_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, match_id.as_bytes())
}

/// Final result of one match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MatchOutcome {
    /// The panel picked a winner.
    Decided { winner: String },
    Tie,
    /// No usable verdict: no effective votes, or a repeated infrastructure abort.
    Undetermined { reason: String },
    /// A participant aborted the debate through its own failures.
    Forfeit { winner: String, loser: String },
    /// Infrastructure abort; the match was scheduled again under a new attempt.
    Rescheduled { reason: String },
    /// The run was stopped while the match was in progress.
    Cancelled,
}

impl MatchOutcome {
    /// Outcome of an adjudicated match.
    pub fn from_verdict(verdict: &Verdict) -> Self {
        match &verdict.outcome {
            VerdictOutcome::Winner { agent_id } => Self::Decided {
                winner: agent_id.clone(),
            },
            VerdictOutcome::Tie => Self::Tie,
            VerdictOutcome::Undetermined => Self::Undetermined {
                reason: format!("no effective votes ({} abstentions)", verdict.abstentions),
            },
        }
    }

    /// The participant credited with a win, if any.
    pub fn winner(&self) -> Option<&str> {
        match self {
            Self::Decided { winner } | Self::Forfeit { winner, .. } => Some(winner),
            _ => None,
        }
    }

    /// True when the match produced a result that counts in the standings.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Rescheduled { .. } | Self::Cancelled)
    }

    /// A tie or undetermined result, which a bracket has to resolve.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Tie | Self::Undetermined { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Decided { .. } => "decided",
            Self::Tie => "tie",
            Self::Undetermined { .. } => "undetermined",
            Self::Forfeit { .. } => "forfeit",
            Self::Rescheduled { .. } => "rescheduled",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One persisted match, complete or aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: String,
    pub record_uuid: Uuid,
    /// Position in the result log, assigned on append.
    #[serde(default)]
    pub sequence: u64,
    pub topic: Topic,
    pub participants: Vec<String>,
    pub bracket_round: u32,
    pub attempt: u32,
    pub transcript: Transcript,
    #[serde(default)]
    pub votes: Vec<Vote>,
    /// Present only for complete transcripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub outcome: MatchOutcome,
    /// Per-agent performance in this match, judges included.
    #[serde(default)]
    pub agent_metrics: BTreeMap<String, AgentMetrics>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MatchRecord {
    /// Recomputes the verdict from the stored votes.
    pub fn recompute_verdict(&self) -> Option<Verdict> {
        self.verdict
            .as_ref()
            .map(|_| Verdict::tally(&self.id, &self.participants, &self.votes))
    }

    /// Replaces the stored verdict and outcome with the ones the votes give.
    /// Returns true when anything changed. Records without a verdict are
    /// left alone.
    pub fn reconcile_verdict(&mut self) -> bool {
        let Some(verdict) = self.recompute_verdict() else {
            return false;
        };
        let outcome = MatchOutcome::from_verdict(&verdict);
        if self.verdict.as_ref() == Some(&verdict) && self.outcome == outcome {
            return false;
        }
        self.verdict = Some(verdict);
        self.outcome = outcome;
        true
    }

    /// The participant other than `agent_id`, for two-participant matches.
    pub fn opponent_of(&self, agent_id: &str) -> Option<&str> {
        self.participants
            .iter()
            .find(|p| p.as_str() != agent_id)
            .map(String::as_str)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{TranscriptStatus, VoteChoice};

    fn vote(judge: &str, winner: &str) -> Vote {
        Vote {
            judge_id: judge.to_string(),
            match_id: "m".to_string(),
            choice: VoteChoice::Candidate(winner.to_string()),
            score: None,
            rationale: String::new(),
            reprompted: false,
        }
    }

    fn adjudicated(votes: Vec<Vote>) -> MatchRecord {
        let participants = vec!["a".to_string(), "b".to_string()];
        let verdict = Verdict::tally("m", &participants, &votes);
        MatchRecord {
            id: "m".to_string(),
            record_uuid: record_uuid("m"),
            sequence: 0,
            topic: Topic::new("t", "p"),
            participants: participants.clone(),
            bracket_round: 0,
            attempt: 1,
            transcript: Transcript {
                match_id: "m".to_string(),
                topic: Topic::new("t", "p"),
                participants,
                planned_rounds: 1,
                rounds_completed: 1,
                speaking_orders: vec![],
                turns: vec![],
                status: TranscriptStatus::Complete,
                abort: None,
            },
            votes,
            outcome: MatchOutcome::from_verdict(&verdict),
            verdict: Some(verdict),
            agent_metrics: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_match_id_format() {
        assert_eq!(match_id("ethics", "alice", "bob", 0, 1), "ethics:alice-vs-bob:r0");
        assert_eq!(match_id("ethics", "alice", "bob", 2, 2), "ethics:alice-vs-bob:r2#2");
    }

    #[test]
    fn test_record_uuid_is_deterministic() {
        let a = record_uuid("ethics:alice-vs-bob:r0");
        assert_eq!(a, record_uuid("ethics:alice-vs-bob:r0"));
        assert_ne!(a, record_uuid("ethics:alice-vs-bob:r1"));
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn test_outcome_helpers() {
        let forfeit = MatchOutcome::Forfeit {
            winner: "a".into(),
            loser: "b".into(),
        };
        assert_eq!(forfeit.winner(), Some("a"));
        assert!(forfeit.is_final());
        assert!(!MatchOutcome::Cancelled.is_final());
        assert!(MatchOutcome::Tie.is_unresolved());
        assert!(!MatchOutcome::Rescheduled { reason: "x".into() }.is_final());

        let json = serde_json::to_string(&MatchOutcome::Decided { winner: "a".into() })
            .expect("serialize");
        assert_eq!(json, r#"{"result":"decided","winner":"a"}"#);
    }

    #[test]
    fn test_reconcile_applies_recomputed_outcome() {
        let mut record = adjudicated(vec![vote("j1", "a"), vote("j2", "a")]);
        assert!(!record.reconcile_verdict());
        assert_eq!(record.outcome.winner(), Some("a"));

        // The stored votes were edited after the fact: b now has the majority.
        record.votes = vec![vote("j1", "b"), vote("j2", "b")];
        assert!(record.reconcile_verdict());
        assert_eq!(
            record.outcome,
            MatchOutcome::Decided {
                winner: "b".into()
            }
        );
        assert_eq!(record.verdict.as_ref().map(|v| v.tally["b"]), Some(2));

        let mut forfeit = adjudicated(vec![]);
        forfeit.verdict = None;
        forfeit.outcome = MatchOutcome::Forfeit {
            winner: "a".into(),
            loser: "b".into(),
        };
        assert!(!forfeit.reconcile_verdict());
        assert_eq!(forfeit.outcome.winner(), Some("a"));
    }
}
