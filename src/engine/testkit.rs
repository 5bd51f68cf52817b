//! Shared fixtures for engine tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tempfile::TempDir;

use super::{Collaborators, EngineOptions, SessionEngine};
use crate::cache::InMemoryReplyCache;
use crate::llm::{ChatTurn, ChunkFn, GenerationError, GenerationGateway, GenerationRequest};
use crate::models::ModelConfig;
use crate::persona::Persona;
use crate::session::MessageRole;
use crate::storage::SqliteStore;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub instruction: String,
    pub model_id: String,
    pub turns: Vec<ChatTurn>,
    pub temperature: Option<f32>,
}

type Hook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Deterministic gateway that records every request.
pub struct ScriptedGateway {
    fail: bool,
    fail_summaries: bool,
    summary_delay: Duration,
    before_reply: Option<Hook>,
    replies: AtomicUsize,
    summaries: AtomicUsize,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGateway {
    pub fn echo() -> Self {
        Self {
            fail: false,
            fail_summaries: false,
            summary_delay: Duration::ZERO,
            before_reply: None,
            replies: AtomicUsize::new(0),
            summaries: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::echo() }
    }

    /// Chat replies succeed; every summary call errors.
    pub fn failing_summaries() -> Self {
        Self { fail_summaries: true, ..Self::echo() }
    }

    /// Every summary call takes `delay` before answering.
    pub fn slow_summaries(delay: Duration) -> Self {
        Self { summary_delay: delay, ..Self::echo() }
    }

    /// Runs `hook` after the provider "answers" but before the reply is returned.
    pub fn with_hook(hook: Hook) -> Self {
        Self { before_reply: Some(hook), ..Self::echo() }
    }

    pub fn chat_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().iter().filter(|c| !is_summary(c)).cloned().collect()
    }

    pub fn summary_calls(&self) -> usize {
        self.summaries.load(Ordering::SeqCst)
    }

    async fn answer(&self, req: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        let call = RecordedCall {
            instruction: req.instruction.to_string(),
            model_id: req.model.id.clone(),
            turns: req.history.to_vec(),
            temperature: req.temperature,
        };
        let summary = is_summary(&call);
        self.calls.lock().unwrap().push(call);
        if summary {
            tokio::time::sleep(self.summary_delay).await;
            let n = self.summaries.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_summaries {
                return Err(GenerationError::Status { status: 500, body: "summary backend down".into() });
            }
            return Ok(format!("S{n}"));
        }
        if self.fail {
            return Err(GenerationError::Status { status: 503, body: "overloaded".into() });
        }
        if let Some(hook) = &self.before_reply {
            hook().await;
        }
        let n = self.replies.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = req
            .history
            .iter()
            .rev()
            .find(|t| t.role == MessageRole::User)
            .map(|t| t.content.as_str())
            .unwrap_or_default();
        Ok(format!("reply {n} to {latest}"))
    }
}

fn is_summary(call: &RecordedCall) -> bool {
    call.instruction.starts_with("Summarize the following conversation")
}

#[async_trait]
impl GenerationGateway for ScriptedGateway {
    async fn generate(&self, req: GenerationRequest<'_>) -> Result<String, GenerationError> {
        self.answer(&req).await
    }

    async fn stream_generate(
        &self,
        req: GenerationRequest<'_>,
        on_chunk: &mut ChunkFn<'_>,
    ) -> Result<(), GenerationError> {
        let reply = self.answer(&req).await?;
        let mid = reply.char_indices().nth(reply.chars().count() / 2).map(|(i, _)| i).unwrap_or(0);
        on_chunk("", "thinking...");
        on_chunk(&reply[..mid], "");
        on_chunk(&reply[mid..], "");
        Ok(())
    }
}

pub fn nova() -> Persona {
    Persona {
        id: "nova".into(),
        creator_id: "creator-nova".into(),
        name: "Nova".into(),
        description: "A starship pilot.".into(),
        ..Default::default()
    }
}

pub fn paid_model(id: &str, price: i64) -> ModelConfig {
    ModelConfig {
        id: id.into(),
        name: id.to_uppercase(),
        provider: "openai".into(),
        model_name: format!("{id}-upstream"),
        api_key: Some("sk-test".into()),
        price_coins: price,
        share_role_pct: 0.35,
        share_preset_pct: 0.2,
        ..ModelConfig::mock_fallback()
    }
}

pub struct Harness {
    _dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub engine: Arc<SessionEngine>,
}

impl Harness {
    pub async fn new(gateway: ScriptedGateway) -> Self {
        Self::build(|_| gateway).await
    }

    /// Lets the gateway hold a handle to the store.
    pub async fn build(make_gateway: impl FnOnce(Arc<SqliteStore>) -> ScriptedGateway) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("engine.db").to_string_lossy());
        let store = Arc::new(SqliteStore::initialize(Some(url)).await.unwrap());
        store.upsert_persona(&nova()).await.unwrap();
        let gateway = Arc::new(make_gateway(store.clone()));
        let collab = Collaborators::from_store(store.clone(), Arc::new(InMemoryReplyCache::new()));
        let engine = Arc::new(SessionEngine::new(collab, gateway.clone(), EngineOptions::default()));
        Self { _dir: dir, store, gateway, engine }
    }

    pub async fn add_model(&self, m: ModelConfig) {
        self.store.save_model(&m).await.unwrap();
    }

    /// Waits for background work to produce `expected` as the session summary.
    pub async fn wait_for_summary(&self, session_id: uuid::Uuid, expected: &str) -> String {
        use crate::storage::SessionStore;
        let mut last = String::new();
        for _ in 0..100 {
            last = self.store.find_session(session_id).await.unwrap().unwrap().summary;
            if last == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        last
    }
}
