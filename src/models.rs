use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ChatResult;
use crate::storage::ModelConfigStore;

pub const MOCK_PROVIDER: &str = "mock";
pub const MOCK_MODEL_ID: &str = "mock-fallback";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub price_coins: i64,
    #[serde(default)]
    pub share_role_pct: f64,
    #[serde(default)]
    pub share_preset_pct: f64,
}

fn default_true() -> bool {
    true
}

fn default_status() -> String {
    "active".into()
}

impl ModelConfig {
    /// Always-usable stand-in when nothing else resolves.
    pub fn mock_fallback() -> Self {
        Self {
            id: MOCK_MODEL_ID.into(),
            name: "Mock Model".into(),
            description: String::new(),
            provider: MOCK_PROVIDER.into(),
            base_url: String::new(),
            model_name: String::new(),
            api_key: None,
            temperature: None,
            max_tokens: None,
            is_default: false,
            is_enabled: true,
            status: "active".into(),
            price_coins: 0,
            share_role_pct: 0.0,
            share_preset_pct: 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_enabled && self.status.trim().eq_ignore_ascii_case("active")
    }

    pub fn is_mock(&self) -> bool {
        self.provider.trim().eq_ignore_ascii_case(MOCK_PROVIDER)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key().is_some()
    }

    /// Per-call price; negative prices bill nothing.
    pub fn price(&self) -> i64 {
        self.price_coins.max(0)
    }

    /// (persona creator share, preset creator share), each in [0,1] and summing to at most 1.
    pub fn revenue_shares(&self) -> (f64, f64) {
        let role = clamp_unit(self.share_role_pct);
        let preset = clamp_unit(self.share_preset_pct).min(1.0 - role);
        (role, preset)
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }
}

/// Picks the model for a session: explicit key, then the process default key,
/// then the store's default-marked model, then the mock provider.
#[derive(Clone)]
pub struct ModelResolver {
    store: Arc<dyn ModelConfigStore>,
    default_key: Option<String>,
}

impl ModelResolver {
    pub fn new(store: Arc<dyn ModelConfigStore>, default_key: Option<String>) -> Self {
        let default_key = default_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
        Self { store, default_key }
    }

    pub fn select(requested: &str, process_default: Option<&str>) -> Option<String> {
        let requested = requested.trim();
        if !requested.is_empty() {
            return Some(requested.to_string());
        }
        process_default.map(str::to_string)
    }

    pub async fn resolve(&self, requested: &str) -> ChatResult<ModelConfig> {
        if let Some(key) = Self::select(requested, self.default_key.as_deref()) {
            if let Some(cfg) = self.resolve_explicit(&key).await? {
                return Ok(cfg);
            }
            debug!(model = %key, "requested model unavailable, trying default");
        }
        match self.store.default_model().await? {
            Some(cfg) if cfg.is_active() => Ok(cfg),
            _ => {
                warn!(requested = %requested, "no active model configured, using mock provider");
                Ok(ModelConfig::mock_fallback())
            }
        }
    }

    /// Resolves only the given key; `None` if missing or inactive.
    pub async fn resolve_explicit(&self, key: &str) -> ChatResult<Option<ModelConfig>> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self.store.find_model(key).await?.filter(ModelConfig::is_active))
    }

    pub async fn list_active(&self) -> ChatResult<Vec<ModelConfig>> {
        Ok(self.store.list_models(false).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedModels(Vec<ModelConfig>);

    #[async_trait]
    impl ModelConfigStore for FixedModels {
        async fn find_model(&self, id: &str) -> anyhow::Result<Option<ModelConfig>> {
            Ok(self.0.iter().find(|m| m.id == id).cloned())
        }
        async fn default_model(&self) -> anyhow::Result<Option<ModelConfig>> {
            Ok(self.0.iter().find(|m| m.is_default).cloned())
        }
        async fn list_models(&self, include_disabled: bool) -> anyhow::Result<Vec<ModelConfig>> {
            Ok(self.0.iter().filter(|m| include_disabled || m.is_enabled).cloned().collect())
        }
    }

    fn model(id: &str, is_default: bool, status: &str) -> ModelConfig {
        ModelConfig {
            id: id.into(),
            provider: "openai".into(),
            is_default,
            status: status.into(),
            ..ModelConfig::mock_fallback()
        }
    }

    fn resolver(models: Vec<ModelConfig>, default_key: Option<&str>) -> ModelResolver {
        ModelResolver::new(Arc::new(FixedModels(models)), default_key.map(String::from))
    }

    #[tokio::test]
    async fn explicit_key_wins_when_active() {
        let r = resolver(vec![model("a", false, "active"), model("b", true, "active")], None);
        assert_eq!(r.resolve("a").await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn inactive_explicit_falls_back_to_default_marked() {
        let r = resolver(vec![model("a", false, "disabled"), model("b", true, "active")], None);
        assert_eq!(r.resolve("a").await.unwrap().id, "b");
        assert_eq!(r.resolve("").await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn process_default_key_used_for_empty_request() {
        let r = resolver(vec![model("a", false, "active"), model("b", true, "active")], Some("a"));
        assert_eq!(r.resolve("  ").await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn nothing_configured_yields_mock() {
        let r = resolver(vec![], None);
        let cfg = r.resolve("").await.unwrap();
        assert!(cfg.is_mock());
        assert!(cfg.is_active());
        assert_eq!(cfg.id, MOCK_MODEL_ID);

        let r = resolver(vec![model("b", true, "archived")], None);
        assert!(r.resolve("missing").await.unwrap().is_mock());
    }

    #[test]
    fn revenue_shares_are_clamped() {
        let mut m = ModelConfig::mock_fallback();
        m.share_role_pct = 0.7;
        m.share_preset_pct = 0.6;
        let (role, preset) = m.revenue_shares();
        assert_eq!(role, 0.7);
        assert!((preset - 0.3).abs() < 1e-9);
        m.share_role_pct = 1.4;
        m.share_preset_pct = -0.2;
        assert_eq!(m.revenue_shares(), (1.0, 0.0));
        m.share_role_pct = f64::NAN;
        assert_eq!(m.revenue_shares().0, 0.0);
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut m = ModelConfig::mock_fallback();
        m.api_key = Some("sk-secret".into());
        let v = serde_json::to_string(&m).unwrap();
        assert!(!v.contains("sk-secret"));
        m.api_key = Some("   ".into());
        assert!(!m.has_api_key());
    }
}
