use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub const TEMPERATURE_RANGE: (f32, f32) = (0.1, 1.5);
pub const MAX_TOKENS_RANGE: (u32, u32) = (128, 2048);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeFocus {
    Dialogue,
    #[default]
    Balanced,
    Narrative,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionRichness {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Sfw,
    Nsfw,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Sfw => "sfw",
            SessionMode::Nsfw => "nsfw",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sfw" => Ok(SessionMode::Sfw),
            "nsfw" => Ok(SessionMode::Nsfw),
            other => Err(ChatError::Validation(format!("unsupported mode: {other}"))),
        }
    }
}

/// Per-session knobs that shape the composed prompt and the sampling parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatSessionSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub narrative_focus: NarrativeFocus,
    pub action_richness: ActionRichness,
    pub sfw_mode: bool,
    pub immersive: bool,
}

impl Default for ChatSessionSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
            narrative_focus: NarrativeFocus::Balanced,
            action_richness: ActionRichness::Medium,
            sfw_mode: true,
            immersive: true,
        }
    }
}

/// Partial update; only `Some` fields overwrite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SettingsPatch {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub narrative_focus: Option<NarrativeFocus>,
    pub action_richness: Option<ActionRichness>,
    pub sfw_mode: Option<bool>,
    pub immersive: Option<bool>,
}

impl ChatSessionSettings {
    pub fn apply_patch(&mut self, patch: &SettingsPatch) -> Result<(), ChatError> {
        if let Some(t) = patch.temperature {
            if !t.is_finite() {
                return Err(ChatError::Validation("temperature must be a finite number".into()));
            }
            self.temperature = t.clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1);
        }
        if let Some(m) = patch.max_tokens {
            self.max_tokens = m.clamp(MAX_TOKENS_RANGE.0, MAX_TOKENS_RANGE.1);
        }
        if let Some(f) = patch.narrative_focus {
            self.narrative_focus = f;
        }
        if let Some(a) = patch.action_richness {
            self.action_richness = a;
        }
        if let Some(s) = patch.sfw_mode {
            self.sfw_mode = s;
        }
        if let Some(i) = patch.immersive {
            self.immersive = i;
        }
        Ok(())
    }

    /// SFW sessions always carry the sfw flag regardless of what a patch asked for.
    pub fn enforce_mode(&mut self, mode: SessionMode) {
        if mode == SessionMode::Sfw {
            self.sfw_mode = true;
        }
    }
}
