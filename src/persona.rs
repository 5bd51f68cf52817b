//! Read-only inputs to prompt composition: personas, their optional structured
//! data, world summaries, presets and memory capsules.
//!
//! Persona data arrives as free-form JSON authored by creators. Extraction is
//! lenient: a field with the wrong shape is treated as absent.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Persona {
    pub id: String,
    #[serde(default)]
    pub creator_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub abilities: Vec<String>,
    #[serde(default, deserialize_with = "lenient_persona_data")]
    pub data: PersonaData,
}

fn lenient_persona_data<'de, D: Deserializer<'de>>(d: D) -> Result<PersonaData, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(PersonaData::from_value(&v))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PersonaData {
    pub persona: Option<String>,
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<String>,
    pub scenario: Option<String>,
    pub world: Option<WorldSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preset: Vec<PresetBlock>,
}

impl PersonaData {
    pub fn from_value(v: &Value) -> Self {
        let Some(obj) = v.as_object() else { return Self::default() };
        Self {
            persona: non_blank_str(obj.get("persona")),
            identity: non_blank_str(obj.get("identity")),
            traits: obj.get("traits").map(string_list).unwrap_or_default(),
            scenario: non_blank_str(obj.get("scenario")),
            world: obj.get("world").filter(|w| w.is_object()).map(WorldSummary::from_value),
            preset: obj
                .get("preset")
                .and_then(|p| p.get("blocks").unwrap_or(p).as_array())
                .map(|blocks| blocks.iter().filter_map(PresetBlock::from_value).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorldSummary {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub scene: String,
    #[serde(default)]
    pub timeline: String,
    #[serde(default)]
    pub npcs: Vec<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<String>>,
}

impl WorldSummary {
    pub fn from_value(v: &Value) -> Self {
        let Some(obj) = v.as_object() else { return Self::default() };
        let mut entries = BTreeMap::new();
        if let Some(raw) = obj.get("entries").and_then(Value::as_object) {
            for (key, val) in raw {
                let vals = match val {
                    Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
                    Value::Array(_) => string_list(val),
                    _ => Vec::new(),
                };
                if !vals.is_empty() {
                    entries.insert(key.clone(), vals);
                }
            }
        }
        Self {
            summary: non_blank_str(obj.get("summary")).unwrap_or_default(),
            scene: non_blank_str(obj.get("scene")).unwrap_or_default(),
            timeline: non_blank_str(obj.get("timeline")).unwrap_or_default(),
            npcs: obj.get("npcs").map(string_list).unwrap_or_default(),
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
            && self.scene.is_empty()
            && self.timeline.is_empty()
            && self.npcs.is_empty()
            && self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PresetBlock {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub marker: bool,
}

impl PresetBlock {
    fn from_value(v: &Value) -> Option<Self> {
        serde_json::from_value(v.clone()).ok()
    }
}

/// A caller-supplied preset. Its creator is a revenue beneficiary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Preset {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub creator_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub blocks: Vec<PresetBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryCapsule {
    pub id: Uuid,
    pub user_id: String,
    pub persona_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

fn non_blank_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
