//! Topics, turns and debate transcripts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A debate topic. Immutable once scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Stable identifier, part of every match identifier.
    pub id: String,
    /// The question or motion put to the debaters.
    pub prompt: String,
    /// What a stance on this topic is called in prompts ("ideal society",
    /// "stance on AI regulation", ...).
    #[serde(default = "default_position_label")]
    pub position_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
}

fn default_position_label() -> String {
    "position".to_string()
}

impl Topic {
    /// Creates a topic with the default position label.
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            position_label: default_position_label(),
            category: None,
            difficulty: None,
        }
    }

    /// Sets the position label.
    pub fn with_position_label(mut self, label: impl Into<String>) -> Self {
        self.position_label = label.into();
        self
    }

    /// Sets the category metadata.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Sets the difficulty metadata.
    pub fn with_difficulty(mut self, difficulty: impl Into<String>) -> Self {
        self.difficulty = Some(difficulty.into());
        self
    }
}

/// Outcome of one attempt to obtain a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// First model attempt succeeded.
    Ok,
    /// Succeeded after at least one retry.
    Retried,
    /// Every attempt failed; content is empty. Doubles as the abstention marker.
    Failed,
}

/// Why a turn failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnFailure {
    /// Failure kind of the final attempt (`timeout`, `rate_limited`, ...).
    pub kind: String,
    pub message: String,
    /// True when the backend, not the agent's model output, caused it.
    pub infrastructure: bool,
}

/// One participant's contribution to one round. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: String,
    /// 1-based round index.
    pub round: u32,
    /// 0-based position in the round's speaking order.
    pub slot: usize,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
    /// Model attempts spent on this turn, across session-level retries.
    pub attempts: u32,
    #[serde(default)]
    pub tokens: u32,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TurnFailure>,
}

impl Turn {
    pub fn is_failed(&self) -> bool {
        self.status == TurnStatus::Failed
    }

    /// Content as shown to peers and judges; failed turns render as an
    /// explicit abstention.
    pub fn public_content(&self) -> &str {
        if self.is_failed() {
            "(no response)"
        } else {
            &self.content
        }
    }
}

/// Final state of a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptStatus {
    Complete,
    Aborted,
}

/// Why a session was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AbortCause {
    /// A participant exceeded the consecutive-failure threshold.
    ParticipantFailures {
        agent_id: String,
        consecutive_failures: u32,
        /// Every failure in the streak was infrastructure-caused.
        infrastructure: bool,
    },
    /// An external stop was requested.
    Cancelled,
}

impl AbortCause {
    /// The participant held responsible, unless the failures were the
    /// backend's fault or the run was cancelled.
    pub fn responsible_agent(&self) -> Option<&str> {
        match self {
            Self::ParticipantFailures {
                agent_id,
                infrastructure: false,
                ..
            } => Some(agent_id),
            _ => None,
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::ParticipantFailures {
                infrastructure: true,
                ..
            }
        )
    }
}

/// The ordered record of one debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub match_id: String,
    pub topic: Topic,
    /// Participants in declared order.
    pub participants: Vec<String>,
    pub planned_rounds: u32,
    pub rounds_completed: u32,
    /// Speaking order used in each round, index 0 = round 1.
    pub speaking_orders: Vec<Vec<String>>,
    pub turns: Vec<Turn>,
    pub status: TranscriptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortCause>,
}

impl Transcript {
    pub fn is_complete(&self) -> bool {
        self.status == TranscriptStatus::Complete
    }

    /// Turns recorded for a round, in speaking order.
    pub fn turns_in_round(&self, round: u32) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(move |t| t.round == round)
    }

    /// Turns spoken by one participant, in round order.
    pub fn turns_by(&self, speaker: &str) -> impl Iterator<Item = &Turn> + '_ {
        let speaker = speaker.to_string();
        self.turns.iter().filter(move |t| t.speaker == speaker)
    }

    pub fn failed_turns(&self) -> usize {
        self.turns.iter().filter(|t| t.is_failed()).count()
    }

    /// Hex SHA-256 over speaker, round and content of every turn.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.match_id.as_bytes());
        for turn in &self.turns {
            hasher.update(turn.speaker.as_bytes());
            hasher.update(turn.round.to_le_bytes());
            hasher.update([0u8]);
            hasher.update(turn.content.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Renders the public transcript for judges. Contains turns only.
    pub fn render_for_judging(&self) -> String {
        let mut out = format!(
            "Topic: {}\nDebaters: {}\n",
            self.topic.prompt,
            self.participants.join(", ")
        );
        for round in 1..=self.rounds_completed {
            out.push_str(&format!("\n=== Round {} ===\n", round));
            for turn in self.turns_in_round(round) {
                out.push_str(&format!("[{}]: {}\n", turn.speaker, turn.public_content()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(speaker: &str, round: u32, content: &str, status: TurnStatus) -> Turn {
        Turn {
            speaker: speaker.to_string(),
            round,
            slot: 0,
            content: content.to_string(),
            timestamp: Utc::now(),
            latency_ms: 3,
            attempts: 1,
            tokens: 0,
            status,
            failure: None,
        }
    }

    fn transcript(turns: Vec<Turn>) -> Transcript {
        Transcript {
            match_id: "t1:a-vs-b:r0".to_string(),
            topic: Topic::new("t1", "Is tea better than coffee?"),
            participants: vec!["a".to_string(), "b".to_string()],
            planned_rounds: 2,
            rounds_completed: 2,
            speaking_orders: vec![],
            turns,
            status: TranscriptStatus::Complete,
            abort: None,
        }
    }

    #[test]
    fn test_topic_defaults_position_label() {
        let topic: Topic =
            serde_json::from_str(r#"{"id":"x","prompt":"Why?"}"#).expect("deserialize");
        assert_eq!(topic.position_label, "position");
        assert!(topic.category.is_none());
    }

    #[test]
    fn test_failed_turn_renders_as_abstention() {
        let t = transcript(vec![
            turn("a", 1, "Tea soothes.", TurnStatus::Ok),
            turn("b", 1, "", TurnStatus::Failed),
        ]);
        let rendered = t.render_for_judging();
        assert!(rendered.contains("[a]: Tea soothes."));
        assert!(rendered.contains("[b]: (no response)"));
        assert_eq!(t.failed_turns(), 1);
    }

    #[test]
    fn test_digest_is_stable_and_content_sensitive() {
        let base = transcript(vec![turn("a", 1, "x", TurnStatus::Ok)]);
        let same = base.clone();
        let other = transcript(vec![turn("a", 1, "y", TurnStatus::Ok)]);
        assert_eq!(base.digest(), same.digest());
        assert_ne!(base.digest(), other.digest());
        assert_eq!(base.digest().len(), 64);
    }

    #[test]
    fn test_abort_cause_attribution() {
        let agent_fault = AbortCause::ParticipantFailures {
            agent_id: "a".into(),
            consecutive_failures: 2,
            infrastructure: false,
        };
        assert_eq!(agent_fault.responsible_agent(), Some("a"));
        assert!(!agent_fault.is_infrastructure());

        let infra = AbortCause::ParticipantFailures {
            agent_id: "a".into(),
            consecutive_failures: 2,
            infrastructure: true,
        };
        assert_eq!(infra.responsible_agent(), None);
        assert!(infra.is_infrastructure());
        assert_eq!(AbortCause::Cancelled.responsible_agent(), None);
    }
}
