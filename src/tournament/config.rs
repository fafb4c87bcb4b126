//! Tournament configuration.
//!
//! Loaded from YAML (or JSON, which YAML accepts) with defaults for every
//! optional field, then checked with [`TournamentConfig::validate`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::{AgentDefinition, AgentRole, GenerationSettings, SessionConfig, Topic, Visibility};
use crate::error::ConfigError;
use crate::llm::{RetryPolicy, DEFAULT_API_BASE};

/// Scheduling topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TournamentShape {
    /// Every topic, every pair of debaters.
    #[default]
    RoundRobin,
    /// Out at the first loss.
    SingleElimination,
    /// Out at the second loss.
    DoubleElimination,
}

impl TournamentShape {
    pub fn is_bracket(&self) -> bool {
        !matches!(self, Self::RoundRobin)
    }
}

/// How a bracket advances past a tied or undetermined match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// One rematch, then a seeded coin flip.
    #[default]
    RematchThenCoinFlip,
    /// One rematch; still unresolved is a schedule inconsistency.
    Rematch,
    /// Seeded coin flip straight away.
    CoinFlip,
    /// Neither participant takes a loss.
    BothAdvance,
}

/// Model backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL of an OpenAI-compatible API.
    pub api_base: String,
    /// Environment variable holding the API key, if the endpoint needs one.
    pub api_key_env: Option<String>,
    /// Maximum wait for a single model call.
    pub request_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            request_timeout_secs: 120,
        }
    }
}

impl EndpointConfig {
    /// Reads the API key from the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Backoff timings for model call retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// Complete tournament configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TournamentConfig {
    pub topics: Vec<Topic>,
    pub agents: Vec<AgentDefinition>,
    pub rounds_per_debate: u32,
    /// Votes collected per debate.
    pub panel_size: u32,
    pub tournament_shape: TournamentShape,
    /// Model client retries per call (attempts are `max_retries + 1`).
    pub max_retries: u32,
    pub max_consecutive_failures: u32,
    /// Debates running at once; also bounds in-flight model calls.
    pub concurrency_limit: usize,
    pub endpoint: EndpointConfig,
    pub retry: BackoffConfig,
    pub turn_retries: u32,
    pub visibility: Visibility,
    pub early_stop: bool,
    pub tie_policy: TiePolicy,
    /// Seeds speaking-order rotation and coin flips.
    pub seed: u64,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Directory receiving `results.jsonl` and `standings.json`.
    pub output_dir: PathBuf,
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            agents: Vec::new(),
            rounds_per_debate: 3,
            panel_size: 1,
            tournament_shape: TournamentShape::default(),
            max_retries: 2,
            max_consecutive_failures: 2,
            concurrency_limit: 2,
            endpoint: EndpointConfig::default(),
            retry: BackoffConfig::default(),
            turn_retries: 0,
            visibility: Visibility::default(),
            early_stop: false,
            tie_policy: TiePolicy::default(),
            seed: 42,
            temperature: 0.7,
            max_tokens: 600,
            output_dir: PathBuf::from("tournament-output"),
        }
    }
}

impl TournamentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and parses a configuration file. Does not validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parses a configuration from YAML or JSON text.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one topic is required".to_string(),
            ));
        }
        let mut topic_ids = HashSet::new();
        for topic in &self.topics {
            check_identifier("topics.id", &topic.id)?;
            if topic.prompt.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "topics.prompt",
                    format!("topic '{}' has an empty prompt", topic.id),
                ));
            }
            if !topic_ids.insert(topic.id.as_str()) {
                return Err(ConfigError::DuplicateId(topic.id.clone()));
            }
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            check_identifier("agents.id", &agent.id)?;
            if agent.model.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "agents.model",
                    format!("agent '{}' has no model", agent.id),
                ));
            }
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(ConfigError::DuplicateId(agent.id.clone()));
            }
        }

        let debaters = self.debaters().count();
        if debaters < 2 {
            return Err(ConfigError::ValidationFailed(format!(
                "at least 2 debaters are required, found {}",
                debaters
            )));
        }

        if self.rounds_per_debate == 0 {
            return Err(ConfigError::invalid("rounds_per_debate", "must be at least 1"));
        }
        if self.panel_size == 0 {
            return Err(ConfigError::invalid("panel_size", "must be at least 1"));
        }
        let judges = self.judges().count();
        if judges > 0 {
            if self.panel_size as usize > judges {
                return Err(ConfigError::invalid(
                    "panel_size",
                    format!("{} exceeds the {} configured judges", self.panel_size, judges),
                ));
            }
        } else if self.panel_size as usize > debaters - 2 {
            return Err(ConfigError::invalid(
                "panel_size",
                format!(
                    "no judges configured and only {} debaters can judge a match between the other two",
                    debaters - 2
                ),
            ));
        }

        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid("max_consecutive_failures", "must be at least 1"));
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::invalid("concurrency_limit", "must be at least 1"));
        }
        if self.endpoint.api_base.trim().is_empty() {
            return Err(ConfigError::invalid("endpoint.api_base", "cannot be empty"));
        }
        if self.endpoint.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("endpoint.request_timeout_secs", "must be greater than 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "cannot be smaller than retry.base_delay_ms",
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::invalid("temperature", "must be between 0.0 and 2.0"));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::invalid("max_tokens", "must be greater than 0"));
        }

        Ok(())
    }

    /// Debaters in declared order.
    pub fn debaters(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter().filter(|a| a.role == AgentRole::Debater)
    }

    /// Judges in declared order.
    pub fn judges(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter().filter(|a| a.role == AgentRole::Judge)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_call_timeout(self.endpoint.request_timeout())
            .with_backoff(
                Duration::from_millis(self.retry.base_delay_ms),
                Duration::from_millis(self.retry.max_delay_ms),
            )
    }

    /// Session settings; the rotation seed is supplied per match.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new()
            .with_rounds(self.rounds_per_debate)
            .with_max_consecutive_failures(self.max_consecutive_failures)
            .with_turn_retries(self.turn_retries)
            .with_visibility(self.visibility)
            .with_early_stop(self.early_stop)
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn results_path(&self) -> PathBuf {
        self.output_dir.join("results.jsonl")
    }

    pub fn standings_path(&self) -> PathBuf {
        self.output_dir.join("standings.json")
    }

    pub fn with_topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_agents(mut self, agents: Vec<AgentDefinition>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_rounds_per_debate(mut self, rounds: u32) -> Self {
        self.rounds_per_debate = rounds;
        self
    }

    pub fn with_panel_size(mut self, size: u32) -> Self {
        self.panel_size = size;
        self
    }

    pub fn with_shape(mut self, shape: TournamentShape) -> Self {
        self.tournament_shape = shape;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.endpoint.api_base = api_base.into();
        self
    }

    /// Sets both backoff delays in milliseconds.
    pub fn with_backoff_ms(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.retry = BackoffConfig {
            base_delay_ms,
            max_delay_ms,
        };
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

    pub fn with_tie_policy(mut self, policy: TiePolicy) -> Self {
        self.tie_policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }
}

/// Identifiers end up inside match ids, so they must not contain the
/// separators used there.
fn check_identifier(key: &str, id: &str) -> Result<(), ConfigError> {
    if id.trim().is_empty() {
        return Err(ConfigError::invalid(key, "identifier cannot be empty"));
    }
    if id.contains(|c: char| c == ':' || c == '#' || c.is_whitespace()) || id.contains("-vs-") {
        return Err(ConfigError::invalid(
            key,
            format!("'{}' must not contain ':', '#', '-vs-' or whitespace", id),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TournamentConfig {
        TournamentConfig::new()
            .with_topics(vec![Topic::new("t1", "Is open source sustainable?")])
            .with_agents(vec![
                AgentDefinition::debater("alice", "llama3.2"),
                AgentDefinition::debater("bob", "mistral"),
                AgentDefinition::judge("judge", "qwen2.5"),
            ])
    }

    #[test]
    fn test_default_config() {
        let config = TournamentConfig::default();
        assert_eq!(config.rounds_per_debate, 3);
        assert_eq!(config.panel_size, 1);
        assert_eq!(config.tournament_shape, TournamentShape::RoundRobin);
        assert_eq!(config.tie_policy, TiePolicy::RematchThenCoinFlip);
        assert_eq!(config.visibility, Visibility::Simultaneous);
        assert!(!config.early_stop);
    }

    #[test]
    fn test_parse_yaml_with_defaults() {
        let yaml = r#"
topics:
  - id: society
    prompt: Describe your ideal society.
    position_label: ideal society
agents:
  - id: alice
    model: llama3.2
    persona: A libertarian economist.
  - id: bob
    model: mistral
  - id: referee
    model: qwen2.5
    role: judge
tournament_shape: double_elimination
tie_policy: coin_flip
rounds_per_debate: 2
"#;
        let config = TournamentConfig::from_yaml(yaml).expect("parse");
        assert_eq!(config.topics[0].position_label, "ideal society");
        assert_eq!(config.agents[2].role, AgentRole::Judge);
        assert_eq!(config.tournament_shape, TournamentShape::DoubleElimination);
        assert_eq!(config.tie_policy, TiePolicy::CoinFlip);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.endpoint.api_base, DEFAULT_API_BASE);
        config.validate().expect("valid");
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"topics":[{"id":"t","prompt":"p"}],"agents":[{"id":"a","model":"m"},{"id":"b","model":"m"},{"id":"j","model":"m","role":"judge"}],"panel_size":1}"#;
        let config = TournamentConfig::from_yaml(json).expect("parse");
        assert_eq!(config.agents.len(), 3);
        config.validate().expect("valid");
    }

    #[test]
    fn test_load_missing_file() {
        let err = TournamentConfig::load("/nonexistent/tournament.yaml").expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validation_requires_two_debaters() {
        let config = valid().with_agents(vec![AgentDefinition::debater("alice", "m")]);
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_validation_duplicate_ids() {
        let config = valid().with_agents(vec![
            AgentDefinition::debater("alice", "m"),
            AgentDefinition::debater("alice", "m"),
            AgentDefinition::judge("judge", "m"),
        ]);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateId(id)) if id == "alice"));
    }

    #[test]
    fn test_validation_panel_size() {
        assert!(valid().with_panel_size(0).validate().is_err());
        assert!(valid().with_panel_size(2).validate().is_err());

        // Peer voting: three debaters leave one judge per match.
        let peers = TournamentConfig::new()
            .with_topics(vec![Topic::new("t", "p")])
            .with_agents(vec![
                AgentDefinition::debater("a", "m"),
                AgentDefinition::debater("b", "m"),
                AgentDefinition::debater("c", "m"),
            ]);
        assert!(peers.clone().with_panel_size(1).validate().is_ok());
        assert!(peers.with_panel_size(2).validate().is_err());
    }

    #[test]
    fn test_validation_rejects_separator_in_ids() {
        let config = valid().with_topics(vec![Topic::new("a:b", "p")]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validation_rejects_pairing_separator_in_agent_ids() {
        // (a-vs-b, c) and (a, b-vs-c) would share one match id.
        let config = valid().with_agents(vec![
            AgentDefinition::debater("a-vs-b", "m"),
            AgentDefinition::debater("c", "m"),
            AgentDefinition::debater("a", "m"),
            AgentDefinition::debater("b-vs-c", "m"),
        ]);
        let err = config.validate().expect_err("ambiguous ids");
        assert!(err.to_string().contains("a-vs-b"));

        let plain = valid().with_agents(vec![
            AgentDefinition::debater("vs", "m"),
            AgentDefinition::debater("a-vs", "m"),
            AgentDefinition::judge("vs-judge", "m"),
        ]);
        assert!(plain.validate().is_ok());
    }

    #[test]
    fn test_validation_numeric_bounds() {
        assert!(valid().with_rounds_per_debate(0).validate().is_err());
        assert!(valid().with_concurrency_limit(0).validate().is_err());
        assert!(valid().with_max_consecutive_failures(0).validate().is_err());
        assert!(valid().with_backoff_ms(500, 100).validate().is_err());
        assert!(valid().with_max_retries(0).validate().is_ok());
    }

    #[test]
    fn test_derived_settings() {
        let config = valid().with_max_retries(4).with_output_dir("/tmp/out");
        assert_eq!(config.retry_policy().max_retries, 4);
        assert_eq!(config.results_path(), PathBuf::from("/tmp/out/results.jsonl"));
        assert_eq!(config.session_config().rounds, 3);
    }
}
