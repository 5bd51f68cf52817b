//! Model provider abstraction with a blocking and a streaming call.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::metrics::{GENERATIONS_TOTAL, GENERATION_DURATION_SECONDS};
use crate::models::{ModelConfig, MOCK_PROVIDER};
use crate::session::{ChatMessage, MessageRole};

pub mod mock;
pub mod openai;

pub use mock::MockGateway;
pub use openai::OpenAiCompatible;

/// Inserted when a conversation has no turns; some providers reject system-only prompts.
pub const EMPTY_HISTORY_TURN: &str = "Generate based on the above instructions.";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("network error: {0}")]
    Network(String),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed provider payload: {0}")]
    Decode(String),
    #[error("provider returned no choices")]
    EmptyChoices,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("model misconfigured: {0}")]
    Misconfigured(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

impl From<&ChatMessage> for ChatTurn {
    fn from(m: &ChatMessage) -> Self {
        Self { role: m.role, content: m.content.clone() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub instruction: &'a str,
    pub model: &'a ModelConfig,
    pub history: &'a [ChatTurn],
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl<'a> GenerationRequest<'a> {
    pub fn new(instruction: &'a str, model: &'a ModelConfig, history: &'a [ChatTurn]) -> Self {
        Self { instruction, model, history, temperature: None, max_tokens: None }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = Some(temperature);
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Provider-facing turns: the instruction as one system turn, then history.
    pub fn turns(&self) -> Vec<ChatTurn> {
        let mut out = Vec::with_capacity(self.history.len() + 2);
        if !self.instruction.trim().is_empty() {
            out.push(ChatTurn::new(MessageRole::System, self.instruction));
        }
        if self.history.is_empty() {
            out.push(ChatTurn::new(MessageRole::User, EMPTY_HISTORY_TURN));
        } else {
            out.extend(self.history.iter().cloned());
        }
        out
    }
}

/// Streaming callback, called as `(content_delta, reasoning_delta)`.
pub type ChunkFn<'a> = dyn FnMut(&str, &str) + Send + 'a;

#[async_trait]
pub trait GenerationGateway: Send + Sync {
    async fn generate(&self, req: GenerationRequest<'_>) -> Result<String, GenerationError>;

    /// Calls `on_chunk(content_delta, reasoning_delta)` in arrival order before returning.
    async fn stream_generate(
        &self,
        req: GenerationRequest<'_>,
        on_chunk: &mut ChunkFn<'_>,
    ) -> Result<(), GenerationError>;
}

/// Routes mock-provider models, and real models without a key, to the stub.
pub struct RouterGateway {
    http: OpenAiCompatible,
    mock: MockGateway,
}

impl RouterGateway {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self { http: OpenAiCompatible::new(timeout)?, mock: MockGateway })
    }

    fn use_mock(model: &ModelConfig) -> bool {
        if model.is_mock() {
            return true;
        }
        if !model.has_api_key() {
            warn!(model = %model.id, provider = %model.provider, "missing api key, falling back to mock");
            return true;
        }
        false
    }
}

fn record_outcome<T>(provider: &str, started: Instant, res: &Result<T, GenerationError>) {
    let outcome = if res.is_ok() { "ok" } else { "error" };
    counter!(GENERATIONS_TOTAL, "provider" => provider.to_string(), "outcome" => outcome).increment(1);
    histogram!(GENERATION_DURATION_SECONDS, "provider" => provider.to_string())
        .record(started.elapsed().as_secs_f64());
}

#[async_trait]
impl GenerationGateway for RouterGateway {
    async fn generate(&self, req: GenerationRequest<'_>) -> Result<String, GenerationError> {
        let started = Instant::now();
        let (provider, res) = if Self::use_mock(req.model) {
            (MOCK_PROVIDER, self.mock.generate(req).await)
        } else {
            (req.model.provider.as_str(), self.http.generate(req).await)
        };
        record_outcome(provider, started, &res);
        res
    }

    async fn stream_generate(
        &self,
        req: GenerationRequest<'_>,
        on_chunk: &mut ChunkFn<'_>,
    ) -> Result<(), GenerationError> {
        let started = Instant::now();
        let (provider, res) = if Self::use_mock(req.model) {
            (MOCK_PROVIDER, self.mock.stream_generate(req, on_chunk).await)
        } else {
            (req.model.provider.as_str(), self.http.stream_generate(req, on_chunk).await)
        };
        record_outcome(provider, started, &res);
        res
    }
}
