//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use debate_arena::agents::{AgentDefinition, Topic};
use debate_arena::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use debate_arena::tournament::{StopHandle, TournamentConfig};
use debate_arena::ModelError;

/// Scripted model backend.
///
/// Debaters answer with a numbered argument; judge models return their
/// configured answer. Models can be set to fail, and the provider can trip a
/// stop handle on its next call.
#[derive(Default)]
pub struct ArenaProvider {
    answers: HashMap<String, String>,
    failures: HashMap<String, ModelError>,
    stop_on_next_call: Mutex<Option<StopHandle>>,
    requests: Mutex<Vec<GenerationRequest>>,
    call_count: AtomicUsize,
}

impl ArenaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The judge `judge_id` votes for `winner` with a rationale naming itself.
    pub fn vote(mut self, judge_id: &str, winner: &str) -> Self {
        self.answers.insert(
            judge_model(judge_id),
            format!(
                r#"{{"winner": "{}", "score": 8, "rationale": "rationale-from-{}"}}"#,
                winner, judge_id
            ),
        );
        self
    }

    /// Every call for the agent's model fails with `error`.
    pub fn fail(mut self, model: &str, error: ModelError) -> Self {
        self.failures.insert(model.to_string(), error);
        self
    }

    /// Trips `handle` on the next call.
    pub fn stop_on_next_call(&self, handle: StopHandle) {
        *self.stop_on_next_call.lock().expect("lock") = Some(handle);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests sent to `model`, in order.
    pub fn requests_for(&self, model: &str) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .expect("lock")
            .iter()
            .filter(|r| r.model == model)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LlmProvider for ArenaProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, ModelError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.stop_on_next_call.lock().expect("lock").take() {
            handle.stop();
        }
        self.requests.lock().expect("lock").push(request.clone());

        if let Some(error) = self.failures.get(&request.model) {
            return Err(error.clone());
        }
        let content = self
            .answers
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| format!("{} argues point {}", request.model, n));

        Ok(GenerationResponse {
            id: format!("resp-{}", n),
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        })
    }
}

pub fn debater_model(id: &str) -> String {
    format!("debater-{}", id)
}

pub fn judge_model(id: &str) -> String {
    format!("judge-{}", id)
}

/// A fast configuration: no retries, no backoff.
pub fn config(debaters: &[&str], judges: &[&str]) -> TournamentConfig {
    let agents = debaters
        .iter()
        .map(|id| AgentDefinition::debater(*id, debater_model(id)))
        .chain(
            judges
                .iter()
                .map(|id| AgentDefinition::judge(*id, judge_model(id))),
        )
        .collect();

    TournamentConfig::new()
        .with_topics(vec![Topic::new("society", "Describe your ideal society.")
            .with_position_label("ideal society")])
        .with_agents(agents)
        .with_max_retries(0)
        .with_backoff_ms(0, 0)
}
