//! Standings, recomputable from stored match records alone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::record::{MatchOutcome, MatchRecord};
use crate::agents::AgentMetrics;

pub const POINTS_PER_WIN: u32 = 3;
pub const POINTS_PER_TIE: u32 = 1;

/// One agent's line in the standings table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStanding {
    pub rank: u32,
    pub agent_id: String,
    pub played: u32,
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
    pub undetermined: u32,
    /// Losses caused by the agent's own aborted debates (subset of `losses`).
    pub forfeits: u32,
    pub points: u32,
}

impl AgentStanding {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            ..Default::default()
        }
    }
}

/// Computes ranked standings.
///
/// `agents` are always listed, even without a match; agents that only appear
/// in `records` are added. Ranking: points, then wins, then fewest losses,
/// then identifier.
pub fn compute_standings(agents: &[String], records: &[MatchRecord]) -> Vec<AgentStanding> {
    let mut table: BTreeMap<String, AgentStanding> = agents
        .iter()
        .map(|id| (id.clone(), AgentStanding::new(id)))
        .collect();

    for record in records.iter().filter(|r| r.outcome.is_final()) {
        for participant in &record.participants {
            let row = table
                .entry(participant.clone())
                .or_insert_with(|| AgentStanding::new(participant));
            row.played += 1;
            match &record.outcome {
                MatchOutcome::Decided { winner } if winner == participant => row.wins += 1,
                MatchOutcome::Decided { .. } => row.losses += 1,
                MatchOutcome::Forfeit { winner, .. } if winner == participant => row.wins += 1,
                MatchOutcome::Forfeit { loser, .. } if loser == participant => {
                    row.losses += 1;
                    row.forfeits += 1;
                }
                MatchOutcome::Forfeit { .. } => {}
                MatchOutcome::Tie => row.ties += 1,
                MatchOutcome::Undetermined { .. } => row.undetermined += 1,
                MatchOutcome::Rescheduled { .. } | MatchOutcome::Cancelled => {}
            }
        }
    }

    let mut rows: Vec<AgentStanding> = table
        .into_values()
        .map(|mut row| {
            row.points = row.wins * POINTS_PER_WIN + row.ties * POINTS_PER_TIE;
            row
        })
        .collect();

    rows.sort_by(|a, b| {
        b.points
            .cmp(&a.points)
            .then(b.wins.cmp(&a.wins))
            .then(a.losses.cmp(&b.losses))
            .then(a.agent_id.cmp(&b.agent_id))
    });
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = i as u32 + 1;
    }
    rows
}

/// Merges per-match agent metrics into totals per agent identity.
pub fn aggregate_metrics(records: &[MatchRecord]) -> BTreeMap<String, AgentMetrics> {
    let mut totals: BTreeMap<String, AgentMetrics> = BTreeMap::new();
    for record in records {
        for (agent_id, metrics) in &record.agent_metrics {
            totals.entry(agent_id.clone()).or_default().merge(metrics);
        }
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Topic, Transcript, TranscriptStatus};
    use crate::tournament::record::record_uuid;
    use chrono::Utc;

    fn record(a: &str, b: &str, outcome: MatchOutcome) -> MatchRecord {
        let id = format!("t:{}-vs-{}:r0", a, b);
        MatchRecord {
            record_uuid: record_uuid(&id),
            id: id.clone(),
            sequence: 0,
            topic: Topic::new("t", "p"),
            participants: vec![a.into(), b.into()],
            bracket_round: 0,
            attempt: 1,
            transcript: Transcript {
                match_id: id,
                topic: Topic::new("t", "p"),
                participants: vec![a.into(), b.into()],
                planned_rounds: 1,
                rounds_completed: 1,
                speaking_orders: vec![],
                turns: vec![],
                status: TranscriptStatus::Complete,
                abort: None,
            },
            votes: vec![],
            verdict: None,
            outcome,
            agent_metrics: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_points_and_ranking() {
        let records = vec![
            record("a", "b", MatchOutcome::Decided { winner: "a".into() }),
            record("a", "c", MatchOutcome::Tie),
            record("b", "c", MatchOutcome::Forfeit {
                winner: "c".into(),
                loser: "b".into(),
            }),
        ];
        let agents = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let standings = compute_standings(&agents, &records);

        assert_eq!(standings[0].agent_id, "a");
        assert_eq!(standings[0].points, 4);
        assert_eq!(standings[1].agent_id, "c");
        assert_eq!(standings[1].points, 4);
        assert_eq!(standings[2].agent_id, "d");
        assert_eq!(standings[2].played, 0);
        assert_eq!(standings[3].agent_id, "b");
        assert_eq!(standings[3].losses, 2);
        assert_eq!(standings[3].forfeits, 1);
        assert_eq!(standings[3].rank, 4);
    }

    #[test]
    fn test_non_final_records_are_ignored() {
        let records = vec![
            record("a", "b", MatchOutcome::Rescheduled { reason: "timeout".into() }),
            record("a", "b", MatchOutcome::Undetermined { reason: "timeout".into() }),
            record("a", "b", MatchOutcome::Cancelled),
        ];
        let standings = compute_standings(&[], &records);
        assert_eq!(standings.len(), 2);
        assert!(standings.iter().all(|s| s.played == 1 && s.undetermined == 1));
    }

    #[test]
    fn test_aggregate_metrics() {
        let mut first = record("a", "b", MatchOutcome::Tie);
        first.agent_metrics.insert(
            "a".into(),
            AgentMetrics {
                total_responses: 2,
                total_latency_ms: 40,
                min_latency_ms: Some(10),
                max_latency_ms: Some(30),
                ..Default::default()
            },
        );
        let mut second = record("a", "c", MatchOutcome::Tie);
        second.agent_metrics.insert(
            "a".into(),
            AgentMetrics {
                total_responses: 1,
                total_latency_ms: 5,
                min_latency_ms: Some(5),
                max_latency_ms: Some(5),
                ..Default::default()
            },
        );

        let totals = aggregate_metrics(&[first, second]);
        let a = &totals["a"];
        assert_eq!(a.total_responses, 3);
        assert_eq!(a.min_latency_ms, Some(5));
        assert_eq!(a.max_latency_ms, Some(30));
    }
}
