//! Debate agents.
//!
//! A single [`Agent`] type serves both debaters and judges: the persona is
//! data (position text), the role only selects the prompt templates.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::transcript::{Topic, Transcript, Turn, TurnFailure, TurnStatus};
use crate::error::ExhaustedRetries;
use crate::llm::{Completion, GenerationRequest, Message, ModelClient};

// ============================================================================
// Roles and Definitions
// ============================================================================

/// What an agent does in the tournament.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Argues a position in debates.
    Debater,
    /// Reads transcripts and casts votes.
    Judge,
}

impl AgentRole {
    /// Returns the display name for this role.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Debater => "Debater",
            Self::Judge => "Judge",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Static description of an agent, as written in the tournament configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    /// Model identity sent to the backend.
    pub model: String,
    #[serde(default = "default_role")]
    pub role: AgentRole,
    /// Position or persona text. When absent, a debater's opening turn
    /// becomes its stance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

fn default_role() -> AgentRole {
    AgentRole::Debater
}

impl AgentDefinition {
    pub fn debater(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            role: AgentRole::Debater,
            persona: None,
        }
    }

    pub fn judge(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            role: AgentRole::Judge,
            persona: None,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }
}

/// Sampling parameters applied to every request an agent makes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 600,
        }
    }
}

// ============================================================================
// Round Kinds
// ============================================================================

/// The phase a round plays in the debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind {
    /// Round 1: state a position.
    Opening,
    /// Middle rounds: attack the opponents' positions.
    Rebuttal,
    /// Final round of a multi-round debate: defend against criticism.
    Closing,
}

impl RoundKind {
    /// Phase of `round` (1-based) in a debate of `total_rounds`.
    pub fn for_round(round: u32, total_rounds: u32) -> Self {
        if round <= 1 {
            Self::Opening
        } else if round >= total_rounds {
            Self::Closing
        } else {
            Self::Rebuttal
        }
    }
}

// ============================================================================
// Peer Context
// ============================================================================

/// A statement by another participant that an agent is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatement {
    pub speaker: String,
    pub round: u32,
    pub content: String,
}

/// The public transcript slice visible to one speaker, already filtered by
/// the session's visibility barrier. Never contains judge deliberations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerContext {
    pub statements: Vec<PeerStatement>,
}

impl PeerContext {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Formats the statements as `[speaker, round N]: text` lines.
    pub fn render(&self) -> String {
        if self.statements.is_empty() {
            return "(no statements yet)".to_string();
        }
        self.statements
            .iter()
            .map(|s| format!("[{}, round {}]: {}", s.speaker, s.round, s.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Response-time and token accounting for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub total_responses: u32,
    pub failed_responses: u32,
    pub total_latency_ms: u64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub total_tokens: u64,
}

impl AgentMetrics {
    fn record_success(&mut self, latency: Duration, tokens: u32) {
        let ms = latency.as_millis() as u64;
        self.total_responses += 1;
        self.total_latency_ms += ms;
        self.total_tokens += u64::from(tokens);
        self.min_latency_ms = Some(self.min_latency_ms.map_or(ms, |m| m.min(ms)));
        self.max_latency_ms = Some(self.max_latency_ms.map_or(ms, |m| m.max(ms)));
    }

    fn record_failure(&mut self) {
        self.failed_responses += 1;
    }

    /// Average latency of successful responses in milliseconds.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_responses == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / f64::from(self.total_responses)
    }

    /// Folds another agent instance's metrics into this one.
    pub fn merge(&mut self, other: &AgentMetrics) {
        self.total_responses += other.total_responses;
        self.failed_responses += other.failed_responses;
        self.total_latency_ms += other.total_latency_ms;
        self.total_tokens += other.total_tokens;
        self.min_latency_ms = match (self.min_latency_ms, other.min_latency_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_latency_ms = match (self.max_latency_ms, other.max_latency_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

// ============================================================================
// Agent
// ============================================================================

/// Correction sent to a judge whose first answer broke the voting protocol.
#[derive(Debug, Clone)]
pub struct JudgeCorrection {
    pub previous_answer: String,
    pub problem: String,
}

/// A model-backed participant with its own private conversation history.
#[derive(Debug, Clone)]
pub struct Agent {
    definition: AgentDefinition,
    settings: GenerationSettings,
    topic: Option<Topic>,
    total_rounds: u32,
    stance: Option<String>,
    history: Vec<Message>,
    metrics: AgentMetrics,
}

impl Agent {
    /// Creates an agent from its definition.
    pub fn new(definition: AgentDefinition, settings: GenerationSettings) -> Self {
        let stance = definition.persona.clone();
        Self {
            definition,
            settings,
            topic: None,
            total_rounds: 1,
            stance,
            history: Vec::new(),
            metrics: AgentMetrics::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn model(&self) -> &str {
        &self.definition.model
    }

    pub fn role(&self) -> AgentRole {
        self.definition.role
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    /// Current stance: the configured persona, or the opening statement.
    pub fn stance(&self) -> Option<&str> {
        self.stance.as_deref()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    /// Binds the agent to a debate, clearing any earlier conversation.
    pub fn join_debate(&mut self, topic: &Topic, total_rounds: u32) {
        self.topic = Some(topic.clone());
        self.total_rounds = total_rounds.max(1);
        self.stance = self.definition.persona.clone();
        self.history.clear();
    }

    /// Produces this agent's turn for `round`.
    ///
    /// Never fails: a model call that exhausts its retries yields a `failed`
    /// turn with empty content, and the session decides what happens next.
    pub async fn propose_turn(
        &mut self,
        client: &ModelClient,
        round: u32,
        slot: usize,
        peer_context: &PeerContext,
    ) -> Turn {
        let kind = RoundKind::for_round(round, self.total_rounds);
        let instruction = self.build_instruction(kind, peer_context);
        let request = self.build_request(&instruction);

        debug!(agent = %self.id(), round, ?kind, "Requesting turn");

        match client.complete(request).await {
            Ok(completion) => {
                self.metrics
                    .record_success(completion.latency, completion.usage.total_tokens);
                self.history.push(Message::user(instruction));
                self.history.push(Message::assistant(completion.text.clone()));
                if kind == RoundKind::Opening && self.stance.is_none() {
                    self.stance = Some(completion.text.clone());
                }
                self.turn_from_completion(round, slot, completion)
            }
            Err(exhausted) => {
                self.metrics.record_failure();
                self.failed_turn(round, slot, exhausted)
            }
        }
    }

    /// Asks the agent to adjudicate a transcript.
    ///
    /// The prompt holds the system template, the rendered transcript and the
    /// candidates, plus an optional correction of an earlier invalid answer.
    /// It never contains other judges' votes. Judging leaves the agent's
    /// debate history untouched.
    pub async fn judge(
        &mut self,
        client: &ModelClient,
        transcript: &Transcript,
        correction: Option<&JudgeCorrection>,
    ) -> Result<Completion, ExhaustedRetries> {
        let request = self.build_judge_request(transcript, correction);
        let result = client.complete(request).await;
        match &result {
            Ok(completion) => self
                .metrics
                .record_success(completion.latency, completion.usage.total_tokens),
            Err(_) => self.metrics.record_failure(),
        }
        result
    }

    /// Builds the judging request for a transcript.
    pub fn build_judge_request(
        &self,
        transcript: &Transcript,
        correction: Option<&JudgeCorrection>,
    ) -> GenerationRequest {
        let candidates = transcript.participants.join(", ");
        let user_prompt = JUDGE_PROMPT_TEMPLATE
            .replace("{label}", &transcript.topic.position_label)
            .replace("{transcript}", &transcript.render_for_judging())
            .replace("{candidates}", &candidates);

        let mut messages = vec![
            Message::system(JUDGE_SYSTEM_PROMPT.replace("{id}", self.id())),
            Message::user(user_prompt),
        ];
        if let Some(correction) = correction {
            messages.push(Message::assistant(correction.previous_answer.clone()));
            messages.push(Message::user(
                JUDGE_CORRECTION_TEMPLATE
                    .replace("{problem}", &correction.problem)
                    .replace("{candidates}", &candidates),
            ));
        }

        GenerationRequest::new(self.model(), messages)
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens)
    }

    fn system_prompt(&self) -> String {
        let (label, prompt) = self
            .topic
            .as_ref()
            .map(|t| (t.position_label.as_str(), t.prompt.as_str()))
            .unwrap_or(("position", ""));

        let mut system = DEBATER_SYSTEM_PROMPT
            .replace("{id}", self.id())
            .replace("{label}", label)
            .replace("{topic}", prompt);
        if let Some(stance) = &self.stance {
            system.push_str(&format!("\nYour stance is: {}", stance));
        }
        system
    }

    fn build_instruction(&self, kind: RoundKind, peer_context: &PeerContext) -> String {
        let (label, prompt) = self
            .topic
            .as_ref()
            .map(|t| (t.position_label.as_str(), t.prompt.as_str()))
            .unwrap_or(("position", ""));

        let template = match kind {
            RoundKind::Opening if self.definition.persona.is_some() => OPENING_WITH_PERSONA_TEMPLATE,
            RoundKind::Opening => OPENING_TEMPLATE,
            RoundKind::Rebuttal => REBUTTAL_TEMPLATE,
            RoundKind::Closing => CLOSING_TEMPLATE,
        };

        template
            .replace("{topic}", prompt)
            .replace("{label}", label)
            .replace("{peers}", &peer_context.render())
    }

    fn build_request(&self, instruction: &str) -> GenerationRequest {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(Message::system(self.system_prompt()));
        messages.extend(self.history.iter().cloned());
        messages.push(Message::user(instruction));

        GenerationRequest::new(self.model(), messages)
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens)
    }

    fn turn_from_completion(&self, round: u32, slot: usize, completion: Completion) -> Turn {
        Turn {
            speaker: self.id().to_string(),
            round,
            slot,
            content: completion.text,
            timestamp: Utc::now(),
            latency_ms: completion.latency.as_millis() as u64,
            attempts: completion.attempts,
            tokens: completion.usage.total_tokens,
            status: if completion.attempts > 1 {
                TurnStatus::Retried
            } else {
                TurnStatus::Ok
            },
            failure: None,
        }
    }

    fn failed_turn(&self, round: u32, slot: usize, exhausted: ExhaustedRetries) -> Turn {
        Turn {
            speaker: self.id().to_string(),
            round,
            slot,
            content: String::new(),
            timestamp: Utc::now(),
            latency_ms: exhausted.elapsed.as_millis() as u64,
            attempts: exhausted.attempts,
            tokens: 0,
            status: TurnStatus::Failed,
            failure: Some(TurnFailure {
                kind: exhausted.last_error.kind().to_string(),
                message: exhausted.last_error.to_string(),
                infrastructure: exhausted.last_error.is_infrastructure(),
            }),
        }
    }
}

// ============================================================================
// Prompt Templates
// ============================================================================

const DEBATER_SYSTEM_PROMPT: &str = "You are {id}, a member of a round table discussing {label}. \
The question under debate is: {topic}";

const OPENING_TEMPLATE: &str = r#"{topic}

State your {label} clearly and specifically. Be concrete and internally consistent.
Keep response under 200 words."#;

const OPENING_WITH_PERSONA_TEMPLATE: &str = r#"{topic}

Present your {label} as described by your stance. Be concrete and internally consistent.
Keep response under 200 words."#;

const REBUTTAL_TEMPLATE: &str = r#"Your opponents have said:
{peers}

Point out specific weaknesses, contradictions, or problems with their {label}.
Be analytical and precise. Keep response under 150 words."#;

const CLOSING_TEMPLATE: &str = r#"Your opponents have said:
{peers}

Address their criticisms directly and explain why your {label} still holds.
Keep response under 100 words."#;

const JUDGE_SYSTEM_PROMPT: &str = "You are {id}, an impartial judge of a structured debate. \
You decide which debater argued more convincingly, based only on the transcript you are given.";

const JUDGE_PROMPT_TEMPLATE: &str = r#"Judge this debate about {label}s.

{transcript}
Based on the strength of arguments and rebuttals, which {label} is more convincing?
Candidates: {candidates}

Respond with a JSON object only:
{"winner": "<one candidate id, or \"tie\">", "score": <0-10 strength of the winner's case>, "rationale": "<one sentence>"}"#;

const JUDGE_CORRECTION_TEMPLATE: &str = r#"Your answer could not be accepted: {problem}
The winner must be exactly one of: {candidates}, or "tie".
Respond again with the JSON object only."#;
