use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;
use crate::settings::{ChatSessionSettings, SessionMode};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    /// Unknown stored roles are treated as user turns.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "assistant" => MessageRole::Assistant,
            "system" => MessageRole::System,
            _ => MessageRole::User,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Archived => "archived",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "archived" => Ok(SessionStatus::Archived),
            other => Err(ChatError::Validation(format!("unsupported status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(session_id: Uuid, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.into(),
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: String,
    pub persona_id: String,
    pub model_key: String,
    pub title: String,
    pub summary: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub settings: ChatSessionSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(user_id: impl Into<String>, persona_id: impl Into<String>, model_key: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            persona_id: persona_id.into(),
            model_key: model_key.into(),
            title: title.into(),
            summary: String::new(),
            mode: SessionMode::Sfw,
            status: SessionStatus::Active,
            settings: ChatSessionSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn ensure_owner(&self, user_id: &str) -> Result<(), ChatError> {
        if self.user_id == user_id { Ok(()) } else { Err(ChatError::Forbidden) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_defaults() {
        let s = ChatSession::new("u1", "nova", "gpt", "Chat with Nova");
        assert_eq!(s.mode, SessionMode::Sfw);
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.settings, ChatSessionSettings::default());
        assert!(s.summary.is_empty());
        assert!(s.ensure_owner("u1").is_ok());
        assert!(matches!(s.ensure_owner("u2"), Err(ChatError::Forbidden)));
    }

    #[test]
    fn message_json_omits_empty_metadata() {
        let m = ChatMessage::new(Uuid::new_v4(), MessageRole::Assistant, "hi");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "assistant");
        assert!(v.get("metadata").is_none());
    }

    #[test]
    fn status_parsing() {
        assert_eq!("Archived".parse::<SessionStatus>().unwrap(), SessionStatus::Archived);
        assert!("deleted".parse::<SessionStatus>().is_err());
    }
}
