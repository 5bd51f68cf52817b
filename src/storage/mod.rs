//! Collaborator interfaces consumed by the session engine, plus the SQLite
//! implementation used by the binary and the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ModelConfig;
use crate::persona::{MemoryCapsule, Persona, WorldSummary};
use crate::session::{ChatMessage, ChatSession, SessionStatus};
use crate::settings::{ChatSessionSettings, SessionMode};

mod sqlite;

pub use sqlite::{SeedData, SeedDocument, SeedWorld, SqliteStore};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &ChatSession) -> anyhow::Result<()>;
    async fn find_session(&self, id: Uuid) -> anyhow::Result<Option<ChatSession>>;
    async fn find_session_by_message(&self, message_id: Uuid) -> anyhow::Result<Option<ChatSession>>;
    /// Most recently updated first.
    async fn list_sessions(&self, user_id: &str, limit: u32) -> anyhow::Result<Vec<ChatSession>>;
    async fn count_sessions(&self, user_id: &str) -> anyhow::Result<i64>;
    /// Appends and touches the session's `updated_at`.
    async fn append_message(&self, msg: &ChatMessage) -> anyhow::Result<()>;
    /// The latest `limit` messages in creation order.
    async fn list_messages(&self, session_id: Uuid, limit: u32) -> anyhow::Result<Vec<ChatMessage>>;
    async fn count_messages(&self, session_id: Uuid) -> anyhow::Result<i64>;
    async fn update_message_content(&self, session_id: Uuid, message_id: Uuid, content: &str) -> anyhow::Result<bool>;
    /// Overwrites content and metadata of the stored message with `msg.id`.
    async fn replace_message(&self, msg: &ChatMessage) -> anyhow::Result<bool>;
    async fn delete_message(&self, session_id: Uuid, message_id: Uuid) -> anyhow::Result<bool>;
    async fn delete_messages(&self, session_id: Uuid) -> anyhow::Result<u64>;
    /// Removes the session and its messages.
    async fn delete_session(&self, id: Uuid) -> anyhow::Result<bool>;
    async fn update_settings(
        &self,
        id: Uuid,
        mode: SessionMode,
        model_key: &str,
        settings: &ChatSessionSettings,
    ) -> anyhow::Result<Option<ChatSession>>;
    async fn update_status(&self, id: Uuid, status: SessionStatus) -> anyhow::Result<Option<ChatSession>>;
    async fn update_summary(&self, id: Uuid, summary: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PersonaStore: Send + Sync {
    async fn find_persona(&self, id: &str) -> anyhow::Result<Option<Persona>>;
}

#[async_trait]
pub trait WorldStore: Send + Sync {
    async fn find_world(&self, persona_id: &str) -> anyhow::Result<Option<WorldSummary>>;
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn list_memories(&self, user_id: &str, persona_id: &str) -> anyhow::Result<Vec<MemoryCapsule>>;
    async fn append_memory(&self, user_id: &str, persona_id: &str, content: &str) -> anyhow::Result<MemoryCapsule>;
}

/// Supplies an opaque reference-context blob for a persona.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve_context(&self, persona_id: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait ModelConfigStore: Send + Sync {
    async fn find_model(&self, id: &str) -> anyhow::Result<Option<ModelConfig>>;
    async fn default_model(&self) -> anyhow::Result<Option<ModelConfig>>;
    async fn list_models(&self, include_disabled: bool) -> anyhow::Result<Vec<ModelConfig>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CreatorWallet {
    pub creator_id: String,
    pub available_balance: i64,
    pub total_earned: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevenueEvent {
    pub id: Uuid,
    pub creator_id: String,
    pub user_id: String,
    pub persona_id: String,
    pub event_type: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Missing users have a zero balance.
    async fn balance(&self, user_id: &str) -> anyhow::Result<i64>;
    async fn set_balance(&self, user_id: &str, balance: i64) -> anyhow::Result<()>;
    /// Atomically subtracts `amount` only if the balance covers it.
    /// Returns the new balance, or `None` when the balance was too low.
    async fn debit_if_sufficient(&self, user_id: &str, amount: i64) -> anyhow::Result<Option<i64>>;
    /// Inserts the event and credits the creator wallet in one transaction.
    async fn record_revenue(&self, event: &RevenueEvent) -> anyhow::Result<CreatorWallet>;
    async fn creator_wallet(&self, creator_id: &str) -> anyhow::Result<CreatorWallet>;
    async fn list_revenue_events(&self, creator_id: &str, limit: u32) -> anyhow::Result<Vec<RevenueEvent>>;
}
