//! Match scheduling: round-robin pairings and elimination brackets.

use std::collections::HashMap;

use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use super::config::TournamentShape;
use crate::agents::Topic;

/// Two debaters meeting on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    pub topic: Topic,
    pub agent_a: String,
    pub agent_b: String,
    /// 0 for round-robin; bracket rounds count from 1.
    pub bracket_round: u32,
    /// Position in the overall schedule; drives judge panel rotation.
    pub ordinal: usize,
}

/// Every topic with every unordered pair of debaters, in declared order.
pub fn round_robin(topics: &[Topic], debaters: &[String]) -> Vec<Pairing> {
    let mut pairings = Vec::new();
    for topic in topics {
        for (i, a) in debaters.iter().enumerate() {
            for b in &debaters[i + 1..] {
                pairings.push(Pairing {
                    topic: topic.clone(),
                    agent_a: a.clone(),
                    agent_b: b.clone(),
                    bracket_round: 0,
                    ordinal: pairings.len(),
                });
            }
        }
    }
    pairings
}

/// Topic used by a bracket round: rounds cycle through the topic list.
pub fn bracket_topic(topics: &[Topic], bracket_round: u32) -> Option<&Topic> {
    if topics.is_empty() {
        return None;
    }
    let index = bracket_round.saturating_sub(1) as usize % topics.len();
    topics.get(index)
}

/// Deterministic coin flip between `a` and `b` for one match.
///
/// The generator is seeded from the tournament seed and a SHA-256 of the
/// match identifier, so reruns and resumes flip the same way.
pub fn coin_flip<'a>(seed: u64, match_id: &str, a: &'a str, b: &'a str) -> &'a str {
    let digest = Sha256::digest(match_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ u64::from_le_bytes(bytes));
    if rng.random_bool(0.5) {
        a
    } else {
        b
    }
}

/// How a bracket match was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// One participant advances, the other takes a loss.
    Winner { winner: String, loser: String },
    /// Neither could be advanced; both take a loss.
    BothLose { a: String, b: String },
    /// Neither takes a loss.
    BothAdvance,
}

/// The pairings of one bracket round.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketRound {
    pub round: u32,
    pub pairings: Vec<(String, String)>,
    /// Agents without an opponent this round; they advance untouched.
    pub byes: Vec<String>,
}

/// Elimination bracket state: loss counts per entrant in seed order.
#[derive(Debug, Clone)]
pub struct Bracket {
    entrants: Vec<String>,
    losses: HashMap<String, u32>,
    elimination_losses: u32,
    round: u32,
    max_rounds: u32,
}

impl Bracket {
    /// Creates a bracket for an elimination shape. Round-robin has none.
    pub fn new(shape: TournamentShape, entrants: Vec<String>) -> Option<Self> {
        let elimination_losses = match shape {
            TournamentShape::RoundRobin => return None,
            TournamentShape::SingleElimination => 1,
            TournamentShape::DoubleElimination => 2,
        };
        let n = entrants.len() as u32;
        Some(Self {
            losses: entrants.iter().map(|e| (e.clone(), 0)).collect(),
            entrants,
            elimination_losses,
            round: 0,
            max_rounds: 4 * n.max(1) + 4,
        })
    }

    /// Entrants still in the tournament, in seed order.
    pub fn alive(&self) -> Vec<&str> {
        self.entrants
            .iter()
            .filter(|e| self.losses_of(e) < self.elimination_losses)
            .map(String::as_str)
            .collect()
    }

    pub fn losses_of(&self, agent_id: &str) -> u32 {
        self.losses.get(agent_id).copied().unwrap_or(0)
    }

    /// Rounds played so far.
    pub fn rounds_played(&self) -> u32 {
        self.round
    }

    /// The last entrant standing, once the bracket has finished.
    pub fn champion(&self) -> Option<&str> {
        match self.alive().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// True once fewer than two entrants remain.
    pub fn is_finished(&self) -> bool {
        self.alive().len() < 2
    }

    /// True when the round guard has been reached without a champion.
    pub fn is_stalled(&self) -> bool {
        !self.is_finished() && self.round >= self.max_rounds
    }

    /// Plans the next round, or `None` when the bracket is finished or stalled.
    ///
    /// Single elimination pairs the alive entrants in seed order. Double
    /// elimination pairs the winners' bracket (no losses) and the losers'
    /// bracket (one loss) separately, and sends the two bracket leaders to a
    /// final once each bracket holds a single entrant.
    pub fn next_round(&mut self) -> Option<BracketRound> {
        if self.is_finished() || self.is_stalled() {
            return None;
        }
        self.round += 1;

        let mut pairings = Vec::new();
        let mut byes = Vec::new();

        if self.elimination_losses == 1 {
            pair_adjacent(&self.alive(), &mut pairings, &mut byes);
        } else {
            let alive = self.alive();
            let winners: Vec<&str> = alive.iter().copied().filter(|e| self.losses_of(e) == 0).collect();
            let losers: Vec<&str> = alive.iter().copied().filter(|e| self.losses_of(e) > 0).collect();
            if winners.len() == 1 && losers.len() == 1 {
                pairings.push((winners[0].to_string(), losers[0].to_string()));
            } else {
                pair_adjacent(&winners, &mut pairings, &mut byes);
                pair_adjacent(&losers, &mut pairings, &mut byes);
            }
        }

        Some(BracketRound {
            round: self.round,
            pairings,
            byes,
        })
    }

    /// Applies the settlement of one match of the current round.
    pub fn apply(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::Winner { loser, .. } => self.add_loss(loser),
            Resolution::BothLose { a, b } => {
                self.add_loss(a);
                self.add_loss(b);
            }
            Resolution::BothAdvance => {}
        }
    }

    fn add_loss(&mut self, agent_id: &str) {
        if let Some(count) = self.losses.get_mut(agent_id) {
            *count += 1;
        }
    }
}

fn pair_adjacent(group: &[&str], pairings: &mut Vec<(String, String)>, byes: &mut Vec<String>) {
    let mut chunks = group.chunks_exact(2);
    for pair in &mut chunks {
        pairings.push((pair[0].to_string(), pair[1].to_string()));
    }
    byes.extend(chunks.remainder().iter().map(|e| e.to_string()));
}
