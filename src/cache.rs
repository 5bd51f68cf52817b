use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Key under which the latest assistant reply of a session is kept.
pub fn last_reply_key(session_id: impl std::fmt::Display) -> String {
    format!("chat:last:{session_id}")
}

/// Best-effort key/value cache with per-entry expiry.
#[async_trait]
pub trait ReplyCache: Send + Sync {
    /// Empty values are not stored.
    async fn remember(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn fetch(&self, key: &str) -> anyhow::Result<Option<String>>;
}

#[derive(Default)]
pub struct InMemoryReplyCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl InMemoryReplyCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplyCache for InMemoryReplyCache {
    async fn remember(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn fetch(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(v, _)| v.clone()))
    }
}
