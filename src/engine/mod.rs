//! Conversation orchestration: session lifecycle, the send/retry pipeline and
//! background summarization.
//!
//! A send persists the user turn first, then checks the caller's balance,
//! composes the prompt and calls the gateway. The reply write and the charge
//! then run together on a spawned task, so a dropped request cannot store a
//! reply without billing it. Failures before that point leave the balance
//! untouched; the user turn stays recorded either way.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::billing::BillingLedger;
use crate::cache::ReplyCache;
use crate::config::AppConfig;
use crate::error::{ChatError, ChatResult};
use crate::llm::GenerationGateway;
use crate::models::{ModelConfig, ModelResolver};
use crate::persona::{Persona, WorldSummary};
use crate::session::{ChatMessage, ChatSession, SessionStatus};
use crate::settings::{SessionMode, SettingsPatch};
use crate::storage::{
    ContextRetriever, MemoryStore, ModelConfigStore, PersonaStore, SessionStore, WalletStore, WorldStore,
};

mod send;
pub mod summarize;

pub use summarize::SummarizationWorker;

/// Messages loaded as conversation context and returned by history reads.
pub const HISTORY_WINDOW: u32 = 100;
pub const SESSION_LIST_LIMIT: u32 = 20;

/// The stores the engine reads and writes.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub personas: Arc<dyn PersonaStore>,
    pub worlds: Arc<dyn WorldStore>,
    pub memories: Arc<dyn MemoryStore>,
    pub retriever: Arc<dyn ContextRetriever>,
    pub models: Arc<dyn ModelConfigStore>,
    pub wallets: Arc<dyn WalletStore>,
    pub cache: Arc<dyn ReplyCache>,
}

impl Collaborators {
    /// Uses one backing store for everything except the cache.
    pub fn from_store<S>(store: Arc<S>, cache: Arc<dyn ReplyCache>) -> Self
    where
        S: SessionStore
            + PersonaStore
            + WorldStore
            + MemoryStore
            + ContextRetriever
            + ModelConfigStore
            + WalletStore
            + 'static,
    {
        Self {
            sessions: store.clone(),
            personas: store.clone(),
            worlds: store.clone(),
            memories: store.clone(),
            retriever: store.clone(),
            models: store.clone(),
            wallets: store,
            cache,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub default_model: Option<String>,
    /// Log composed prompts and history at debug level.
    pub debug_prompt: bool,
    pub reply_cache_ttl: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for EngineOptions {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            default_model: cfg.default_model.clone(),
            debug_prompt: cfg.debug_prompt,
            reply_cache_ttl: cfg.reply_cache_ttl(),
        }
    }
}

/// Read-only composite used to render a chat screen.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session: ChatSession,
    pub persona: Persona,
    pub world: Option<WorldSummary>,
    pub messages: Vec<ChatMessage>,
}

pub struct SessionEngine {
    store: Collaborators,
    resolver: ModelResolver,
    gateway: Arc<dyn GenerationGateway>,
    ledger: BillingLedger,
    summarizer: SummarizationWorker,
    options: EngineOptions,
}

impl SessionEngine {
    pub fn new(store: Collaborators, gateway: Arc<dyn GenerationGateway>, options: EngineOptions) -> Self {
        let resolver = ModelResolver::new(store.models.clone(), options.default_model.clone());
        let ledger = BillingLedger::new(store.wallets.clone());
        let summarizer = SummarizationWorker::new(store.sessions.clone(), resolver.clone(), gateway.clone());
        Self { store, resolver, gateway, ledger, summarizer, options }
    }

    pub async fn start_session(
        &self,
        user_id: &str,
        persona_id: &str,
        model_key: &str,
        title: &str,
    ) -> ChatResult<ChatSession> {
        let persona = self.persona(persona_id).await?;
        let model = match self.resolver.resolve(model_key).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "model resolution failed, using mock provider");
                ModelConfig::mock_fallback()
            }
        };
        let title = match title.trim() {
            "" => format!("Chat with {}", persona.name),
            t => t.to_string(),
        };
        let session = ChatSession::new(user_id, &persona.id, &model.id, title);
        self.store.sessions.create_session(&session).await?;
        info!(session_id = %session.id, user_id = %user_id, persona_id = %persona.id, model = %model.id, "session started");
        Ok(session)
    }

    pub async fn list_sessions(&self, user_id: &str) -> ChatResult<Vec<ChatSession>> {
        Ok(self.store.sessions.list_sessions(user_id, SESSION_LIST_LIMIT).await?)
    }

    pub async fn count_sessions(&self, user_id: &str) -> ChatResult<i64> {
        Ok(self.store.sessions.count_sessions(user_id).await?)
    }

    pub async fn history(&self, user_id: &str, session_id: Uuid) -> ChatResult<Vec<ChatMessage>> {
        let session = self.owned_session(user_id, session_id).await?;
        Ok(self.store.sessions.list_messages(session.id, HISTORY_WINDOW).await?)
    }

    pub async fn session_overview(&self, user_id: &str, session_id: Uuid) -> ChatResult<SessionView> {
        let session = self.owned_session(user_id, session_id).await?;
        let persona = self.persona(&session.persona_id).await?;
        let world = self.world(&persona.id).await;
        let messages = self.store.sessions.list_messages(session.id, HISTORY_WINDOW).await?;
        Ok(SessionView { session, persona, world, messages })
    }

    pub async fn list_models(&self) -> ChatResult<Vec<ModelConfig>> {
        self.resolver.list_active().await
    }

    /// Blank `mode` or `model_key` keep the current values. A new model key
    /// only takes effect when it resolves to an active model.
    pub async fn update_settings(
        &self,
        user_id: &str,
        session_id: Uuid,
        mode: &str,
        model_key: &str,
        patch: &SettingsPatch,
    ) -> ChatResult<ChatSession> {
        let session = self.owned_session(user_id, session_id).await?;
        let mode = match mode.trim() {
            "" => session.mode,
            m => m.parse::<SessionMode>()?,
        };
        let mut settings = session.settings.clone();
        settings.apply_patch(patch)?;
        settings.enforce_mode(mode);

        let mut target_model = session.model_key.clone();
        let requested = model_key.trim();
        if !requested.is_empty() && requested != session.model_key {
            match self.resolver.resolve_explicit(requested).await? {
                Some(cfg) => target_model = cfg.id,
                None => debug!(session_id = %session.id, model = %requested, "requested model not active, keeping current"),
            }
        }

        self.store
            .sessions
            .update_settings(session.id, mode, &target_model, &settings)
            .await?
            .ok_or(ChatError::NotFound("session"))
    }

    pub async fn set_session_status(&self, user_id: &str, session_id: Uuid, status: &str) -> ChatResult<ChatSession> {
        let status: SessionStatus = status.parse()?;
        let session = self.owned_session(user_id, session_id).await?;
        self.store
            .sessions
            .update_status(session.id, status)
            .await?
            .ok_or(ChatError::NotFound("session"))
    }

    pub async fn update_message(&self, user_id: &str, message_id: Uuid, content: &str) -> ChatResult<()> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("content required".into()));
        }
        let session = self.owned_session_by_message(user_id, message_id).await?;
        if !self.store.sessions.update_message_content(session.id, message_id, content).await? {
            return Err(ChatError::NotFound("message"));
        }
        Ok(())
    }

    pub async fn delete_message(&self, user_id: &str, message_id: Uuid) -> ChatResult<()> {
        let session = self.owned_session_by_message(user_id, message_id).await?;
        if !self.store.sessions.delete_message(session.id, message_id).await? {
            return Err(ChatError::NotFound("message"));
        }
        Ok(())
    }

    /// Removes every message but keeps the session.
    pub async fn clear_session(&self, user_id: &str, session_id: Uuid) -> ChatResult<u64> {
        let session = self.owned_session(user_id, session_id).await?;
        Ok(self.store.sessions.delete_messages(session.id).await?)
    }

    pub async fn delete_session(&self, user_id: &str, session_id: Uuid) -> ChatResult<()> {
        let session = self.owned_session(user_id, session_id).await?;
        self.store.sessions.delete_session(session.id).await?;
        info!(session_id = %session.id, user_id = %user_id, "session deleted");
        Ok(())
    }

    async fn owned_session(&self, user_id: &str, session_id: Uuid) -> ChatResult<ChatSession> {
        let session = self.store.sessions.find_session(session_id).await?.ok_or(ChatError::NotFound("session"))?;
        session.ensure_owner(user_id)?;
        Ok(session)
    }

    async fn owned_session_by_message(&self, user_id: &str, message_id: Uuid) -> ChatResult<ChatSession> {
        let session = self
            .store
            .sessions
            .find_session_by_message(message_id)
            .await?
            .ok_or(ChatError::NotFound("message"))?;
        session.ensure_owner(user_id)?;
        Ok(session)
    }

    async fn persona(&self, persona_id: &str) -> ChatResult<Persona> {
        self.store.personas.find_persona(persona_id).await?.ok_or(ChatError::NotFound("persona"))
    }

    async fn world(&self, persona_id: &str) -> Option<WorldSummary> {
        match self.store.worlds.find_world(persona_id).await {
            Ok(w) => w,
            Err(e) => {
                debug!(persona_id = %persona_id, error = %e, "world lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit;
