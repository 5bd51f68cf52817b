use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use super::{
    ContextRetriever, CreatorWallet, MemoryStore, ModelConfigStore, PersonaStore, RevenueEvent, SessionStore,
    WalletStore, WorldStore,
};
use crate::models::ModelConfig;
use crate::persona::{MemoryCapsule, Persona, PersonaData, WorldSummary};
use crate::session::{ChatMessage, ChatSession, MessageRole, SessionStatus};
use crate::settings::{ChatSessionSettings, SessionMode};

/// Document chunks handed to the prompt as reference context.
const RETRIEVAL_CHUNKS: i64 = 5;
const RETRIEVAL_SEPARATOR: &str = "\n---\n";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_millis(5000))
            .foreign_keys(true);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn upsert_persona(&self, p: &Persona) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO personas (id, creator_id, name, description, tags_json, abilities_json, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET creator_id = excluded.creator_id, name = excluded.name,
               description = excluded.description, tags_json = excluded.tags_json,
               abilities_json = excluded.abilities_json, data_json = excluded.data_json",
        )
        .bind(&p.id)
        .bind(&p.creator_id)
        .bind(&p.name)
        .bind(&p.description)
        .bind(serde_json::to_string(&p.tags)?)
        .bind(serde_json::to_string(&p.abilities)?)
        .bind(serde_json::to_string(&p.data)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_world(&self, persona_id: &str, world: &WorldSummary) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO worlds (persona_id, world_json) VALUES (?1, ?2)
             ON CONFLICT(persona_id) DO UPDATE SET world_json = excluded.world_json",
        )
        .bind(persona_id)
        .bind(serde_json::to_string(world)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts or replaces a model. Marking one default clears the flag elsewhere.
    pub async fn save_model(&self, m: &ModelConfig) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        if m.is_default {
            sqlx::query("UPDATE model_configs SET is_default = 0 WHERE id != ?1")
                .bind(&m.id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO model_configs (id, name, description, provider, base_url, model_name, api_key,
               temperature, max_tokens, is_default, is_enabled, status, price_coins, share_role_pct, share_preset_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description,
               provider = excluded.provider, base_url = excluded.base_url, model_name = excluded.model_name,
               api_key = excluded.api_key, temperature = excluded.temperature, max_tokens = excluded.max_tokens,
               is_default = excluded.is_default, is_enabled = excluded.is_enabled, status = excluded.status,
               price_coins = excluded.price_coins, share_role_pct = excluded.share_role_pct,
               share_preset_pct = excluded.share_preset_pct",
        )
        .bind(&m.id)
        .bind(&m.name)
        .bind(&m.description)
        .bind(&m.provider)
        .bind(&m.base_url)
        .bind(&m.model_name)
        .bind(&m.api_key)
        .bind(m.temperature.map(f64::from))
        .bind(m.max_tokens.map(i64::from))
        .bind(m.is_default)
        .bind(m.is_enabled)
        .bind(&m.status)
        .bind(m.price_coins)
        .bind(m.share_role_pct)
        .bind(m.share_preset_pct)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_document(&self, persona_id: &str, content: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO documents (persona_id, content, created_at) VALUES (?1, ?2, ?3)")
            .bind(persona_id)
            .bind(content)
            .bind(ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_seed(&self, seed: &SeedData) -> anyhow::Result<()> {
        for p in &seed.personas {
            self.upsert_persona(p).await.with_context(|| format!("persona {}", p.id))?;
        }
        for w in &seed.worlds {
            self.upsert_world(&w.persona_id, &w.world).await?;
        }
        for m in &seed.models {
            self.save_model(m).await.with_context(|| format!("model {}", m.id))?;
        }
        for d in &seed.documents {
            self.add_document(&d.persona_id, &d.content).await?;
        }
        for (user, balance) in &seed.balances {
            self.set_balance(user, *balance).await?;
        }
        Ok(())
    }

    async fn fetch_session(&self, sql: &str, key: String) -> anyhow::Result<Option<ChatSession>> {
        let row = sqlx::query(sql).bind(key).fetch_optional(&self.pool).await?;
        row.as_ref().map(session_from_row).transpose()
    }
}

/// Admin-side fixture file for `nebula-chat seed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedData {
    pub personas: Vec<Persona>,
    pub worlds: Vec<SeedWorld>,
    pub models: Vec<ModelConfig>,
    pub documents: Vec<SeedDocument>,
    pub balances: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedWorld {
    pub persona_id: String,
    #[serde(flatten)]
    pub world: WorldSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedDocument {
    pub persona_id: String,
    pub content: String,
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("nebula_chat");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("nebula.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

// Fixed-width timestamps so text ordering matches time ordering.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn parse_uuid(row: &SqliteRow, col: &str) -> anyhow::Result<Uuid> {
    let raw: String = row.try_get(col)?;
    Uuid::parse_str(&raw).with_context(|| format!("bad uuid in {col}: {raw}"))
}

const SESSION_COLUMNS: &str =
    "s.id, s.user_id, s.persona_id, s.model_key, s.title, s.summary, s.mode, s.status, s.settings_json, s.created_at, s.updated_at";

fn session_from_row(r: &SqliteRow) -> anyhow::Result<ChatSession> {
    let settings_json: String = r.try_get("settings_json")?;
    let settings: ChatSessionSettings = serde_json::from_str(&settings_json)?;
    let mode: String = r.try_get("mode")?;
    let status: String = r.try_get("status")?;
    Ok(ChatSession {
        id: parse_uuid(r, "id")?,
        user_id: r.try_get("user_id")?,
        persona_id: r.try_get("persona_id")?,
        model_key: r.try_get("model_key")?,
        title: r.try_get("title")?,
        summary: r.try_get("summary")?,
        mode: mode.parse().unwrap_or_default(),
        status: status.parse().unwrap_or_default(),
        settings,
        created_at: parse_ts(&r.try_get::<String, _>("created_at")?),
        updated_at: parse_ts(&r.try_get::<String, _>("updated_at")?),
    })
}

fn message_from_row(r: &SqliteRow) -> anyhow::Result<ChatMessage> {
    let role: String = r.try_get("role")?;
    let metadata_json: String = r.try_get("metadata_json")?;
    Ok(ChatMessage {
        id: parse_uuid(r, "id")?,
        session_id: parse_uuid(r, "session_id")?,
        role: MessageRole::parse_lenient(&role),
        content: r.try_get("content")?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: parse_ts(&r.try_get::<String, _>("created_at")?),
    })
}

fn model_from_row(r: &SqliteRow) -> anyhow::Result<ModelConfig> {
    Ok(ModelConfig {
        id: r.try_get("id")?,
        name: r.try_get("name")?,
        description: r.try_get("description")?,
        provider: r.try_get("provider")?,
        base_url: r.try_get("base_url")?,
        model_name: r.try_get("model_name")?,
        api_key: r.try_get("api_key")?,
        temperature: r.try_get::<Option<f64>, _>("temperature")?.map(|t| t as f32),
        max_tokens: r.try_get::<Option<i64>, _>("max_tokens")?.and_then(|m| u32::try_from(m).ok()),
        is_default: r.try_get("is_default")?,
        is_enabled: r.try_get("is_enabled")?,
        status: r.try_get("status")?,
        price_coins: r.try_get("price_coins")?,
        share_role_pct: r.try_get("share_role_pct")?,
        share_preset_pct: r.try_get("share_preset_pct")?,
    })
}

fn revenue_event_from_row(r: &SqliteRow) -> anyhow::Result<RevenueEvent> {
    Ok(RevenueEvent {
        id: parse_uuid(r, "id")?,
        creator_id: r.try_get("creator_id")?,
        user_id: r.try_get("user_id")?,
        persona_id: r.try_get("persona_id")?,
        event_type: r.try_get("event_type")?,
        amount: r.try_get("amount")?,
        created_at: parse_ts(&r.try_get::<String, _>("created_at")?),
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, s: &ChatSession) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO chat_sessions (id, user_id, persona_id, model_key, title, summary, mode, status, settings_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(s.id.to_string())
        .bind(&s.user_id)
        .bind(&s.persona_id)
        .bind(&s.model_key)
        .bind(&s.title)
        .bind(&s.summary)
        .bind(s.mode.as_str())
        .bind(s.status.as_str())
        .bind(serde_json::to_string(&s.settings)?)
        .bind(ts(s.created_at))
        .bind(ts(s.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_session(&self, id: Uuid) -> anyhow::Result<Option<ChatSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM chat_sessions s WHERE s.id = ?1");
        self.fetch_session(&sql, id.to_string()).await
    }

    async fn find_session_by_message(&self, message_id: Uuid) -> anyhow::Result<Option<ChatSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions s JOIN chat_messages m ON m.session_id = s.id WHERE m.id = ?1"
        );
        self.fetch_session(&sql, message_id.to_string()).await
    }

    async fn list_sessions(&self, user_id: &str, limit: u32) -> anyhow::Result<Vec<ChatSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions s WHERE s.user_id = ?1 ORDER BY s.updated_at DESC LIMIT ?2"
        );
        let rows = sqlx::query(&sql).bind(user_id).bind(i64::from(limit)).fetch_all(&self.pool).await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn count_sessions(&self, user_id: &str) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM chat_sessions WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn append_message(&self, msg: &ChatMessage) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, role, content, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(msg.id.to_string())
        .bind(msg.session_id.to_string())
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(serde_json::to_string(&msg.metadata)?)
        .bind(ts(msg.created_at))
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(ts(Utc::now()))
            .bind(msg.session_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_messages(&self, session_id: Uuid, limit: u32) -> anyhow::Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM (
               SELECT seq, id, session_id, role, content, metadata_json, created_at
               FROM chat_messages WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )
        .bind(session_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn count_messages(&self, session_id: Uuid) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM chat_messages WHERE session_id = ?1")
            .bind(session_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn update_message_content(&self, session_id: Uuid, message_id: Uuid, content: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE chat_messages SET content = ?1 WHERE id = ?2 AND session_id = ?3")
            .bind(content)
            .bind(message_id.to_string())
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn replace_message(&self, msg: &ChatMessage) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE chat_messages SET content = ?1, metadata_json = ?2 WHERE id = ?3 AND session_id = ?4")
            .bind(&msg.content)
            .bind(serde_json::to_string(&msg.metadata)?)
            .bind(msg.id.to_string())
            .bind(msg.session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_message(&self, session_id: Uuid, message_id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM chat_messages WHERE id = ?1 AND session_id = ?2")
            .bind(message_id.to_string())
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_messages(&self, session_id: Uuid) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM chat_messages WHERE session_id = ?1")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn delete_session(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chat_messages WHERE session_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("DELETE FROM chat_sessions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }

    async fn update_settings(
        &self,
        id: Uuid,
        mode: SessionMode,
        model_key: &str,
        settings: &ChatSessionSettings,
    ) -> anyhow::Result<Option<ChatSession>> {
        let res = sqlx::query(
            "UPDATE chat_sessions SET mode = ?1, model_key = ?2, settings_json = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(mode.as_str())
        .bind(model_key)
        .bind(serde_json::to_string(settings)?)
        .bind(ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_session(id).await
    }

    async fn update_status(&self, id: Uuid, status: SessionStatus) -> anyhow::Result<Option<ChatSession>> {
        let res = sqlx::query("UPDATE chat_sessions SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_session(id).await
    }

    async fn update_summary(&self, id: Uuid, summary: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE chat_sessions SET summary = ?1 WHERE id = ?2")
            .bind(summary)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PersonaStore for SqliteStore {
    async fn find_persona(&self, id: &str) -> anyhow::Result<Option<Persona>> {
        let row = sqlx::query(
            "SELECT id, creator_id, name, description, tags_json, abilities_json, data_json FROM personas WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(r) = row else { return Ok(None) };
        let tags: String = r.try_get("tags_json")?;
        let abilities: String = r.try_get("abilities_json")?;
        let data: String = r.try_get("data_json")?;
        let data = serde_json::from_str::<serde_json::Value>(&data)
            .map(|v| PersonaData::from_value(&v))
            .unwrap_or_default();
        Ok(Some(Persona {
            id: r.try_get("id")?,
            creator_id: r.try_get("creator_id")?,
            name: r.try_get("name")?,
            description: r.try_get("description")?,
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            abilities: serde_json::from_str(&abilities).unwrap_or_default(),
            data,
        }))
    }
}

#[async_trait]
impl WorldStore for SqliteStore {
    async fn find_world(&self, persona_id: &str) -> anyhow::Result<Option<WorldSummary>> {
        let row = sqlx::query("SELECT world_json FROM worlds WHERE persona_id = ?1")
            .bind(persona_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let raw: String = r.try_get("world_json")?;
        let v: serde_json::Value = serde_json::from_str(&raw)?;
        Ok(Some(WorldSummary::from_value(&v)).filter(|w| !w.is_empty()))
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn list_memories(&self, user_id: &str, persona_id: &str) -> anyhow::Result<Vec<MemoryCapsule>> {
        let rows = sqlx::query(
            "SELECT id, user_id, persona_id, content, created_at FROM memories
             WHERE user_id = ?1 AND persona_id = ?2 ORDER BY seq ASC",
        )
        .bind(user_id)
        .bind(persona_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(MemoryCapsule {
                    id: parse_uuid(r, "id")?,
                    user_id: r.try_get("user_id")?,
                    persona_id: r.try_get("persona_id")?,
                    content: r.try_get("content")?,
                    created_at: parse_ts(&r.try_get::<String, _>("created_at")?),
                })
            })
            .collect()
    }

    async fn append_memory(&self, user_id: &str, persona_id: &str, content: &str) -> anyhow::Result<MemoryCapsule> {
        let capsule = MemoryCapsule {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO memories (id, user_id, persona_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)")
            .bind(capsule.id.to_string())
            .bind(&capsule.user_id)
            .bind(&capsule.persona_id)
            .bind(&capsule.content)
            .bind(ts(capsule.created_at))
            .execute(&self.pool)
            .await?;
        Ok(capsule)
    }
}

#[async_trait]
impl ContextRetriever for SqliteStore {
    async fn retrieve_context(&self, persona_id: &str) -> anyhow::Result<String> {
        let rows = sqlx::query("SELECT content FROM documents WHERE persona_id = ?1 ORDER BY seq DESC LIMIT ?2")
            .bind(persona_id)
            .bind(RETRIEVAL_CHUNKS)
            .fetch_all(&self.pool)
            .await?;
        let chunks = rows
            .iter()
            .map(|r| r.try_get::<String, _>("content"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks.join(RETRIEVAL_SEPARATOR))
    }
}

const MODEL_COLUMNS: &str = "id, name, description, provider, base_url, model_name, api_key, temperature, max_tokens,
    is_default, is_enabled, status, price_coins, share_role_pct, share_preset_pct";

#[async_trait]
impl ModelConfigStore for SqliteStore {
    async fn find_model(&self, id: &str) -> anyhow::Result<Option<ModelConfig>> {
        let sql = format!("SELECT {MODEL_COLUMNS} FROM model_configs WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(model_from_row).transpose()
    }

    async fn default_model(&self) -> anyhow::Result<Option<ModelConfig>> {
        let sql = format!("SELECT {MODEL_COLUMNS} FROM model_configs WHERE is_default = 1 ORDER BY id LIMIT 1");
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(model_from_row).transpose()
    }

    async fn list_models(&self, include_disabled: bool) -> anyhow::Result<Vec<ModelConfig>> {
        let sql = if include_disabled {
            format!("SELECT {MODEL_COLUMNS} FROM model_configs ORDER BY name, id")
        } else {
            format!("SELECT {MODEL_COLUMNS} FROM model_configs WHERE is_enabled = 1 ORDER BY name, id")
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(model_from_row).collect()
    }
}

#[async_trait]
impl WalletStore for SqliteStore {
    async fn balance(&self, user_id: &str) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT balance FROM user_assets WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => r.try_get("balance")?,
            None => 0,
        })
    }

    async fn set_balance(&self, user_id: &str, balance: i64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO user_assets (user_id, balance) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET balance = excluded.balance",
        )
        .bind(user_id)
        .bind(balance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn debit_if_sufficient(&self, user_id: &str, amount: i64) -> anyhow::Result<Option<i64>> {
        let row = sqlx::query(
            "UPDATE user_assets SET balance = balance - ?1 WHERE user_id = ?2 AND balance >= ?1 RETURNING balance",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<i64, _>("balance")).transpose().map_err(Into::into)
    }

    async fn record_revenue(&self, e: &RevenueEvent) -> anyhow::Result<CreatorWallet> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO revenue_events (id, creator_id, user_id, persona_id, event_type, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(e.id.to_string())
        .bind(&e.creator_id)
        .bind(&e.user_id)
        .bind(&e.persona_id)
        .bind(&e.event_type)
        .bind(e.amount)
        .bind(ts(e.created_at))
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query(
            "INSERT INTO creator_wallets (creator_id, available_balance, total_earned) VALUES (?1, ?2, ?2)
             ON CONFLICT(creator_id) DO UPDATE SET
               available_balance = available_balance + excluded.available_balance,
               total_earned = total_earned + excluded.total_earned
             RETURNING available_balance, total_earned",
        )
        .bind(&e.creator_id)
        .bind(e.amount)
        .fetch_one(&mut *tx)
        .await?;
        let wallet = CreatorWallet {
            creator_id: e.creator_id.clone(),
            available_balance: row.try_get("available_balance")?,
            total_earned: row.try_get("total_earned")?,
        };
        tx.commit().await?;
        Ok(wallet)
    }

    async fn creator_wallet(&self, creator_id: &str) -> anyhow::Result<CreatorWallet> {
        let row = sqlx::query("SELECT available_balance, total_earned FROM creator_wallets WHERE creator_id = ?1")
            .bind(creator_id)
            .fetch_optional(&self.pool)
            .await?;
        let mut wallet = CreatorWallet { creator_id: creator_id.to_string(), ..Default::default() };
        if let Some(r) = row {
            wallet.available_balance = r.try_get("available_balance")?;
            wallet.total_earned = r.try_get("total_earned")?;
        }
        Ok(wallet)
    }

    async fn list_revenue_events(&self, creator_id: &str, limit: u32) -> anyhow::Result<Vec<RevenueEvent>> {
        let rows = sqlx::query(
            "SELECT id, creator_id, user_id, persona_id, event_type, amount, created_at FROM revenue_events
             WHERE creator_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )
        .bind(creator_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(revenue_event_from_row).collect()
    }
}
