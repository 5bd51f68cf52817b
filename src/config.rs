use std::time::Duration;

use clap::Args;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7171";
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 150;
pub const DEFAULT_REPLY_CACHE_TTL_SECS: u64 = 3600;

/// Process-wide settings. Precedence: command-line flag, then environment, then default.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct AppConfig {
    /// Address the HTTP API binds to.
    #[arg(long, env = "NEBULA_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,
    /// SQLite URL; defaults to a file under the XDG data directory.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
    /// Model used when a session names none or an unknown one.
    #[arg(long, env = "DEFAULT_MODEL_ID")]
    pub default_model: Option<String>,
    /// Log composed prompts and history at debug level.
    #[arg(long, env = "NEBULA_DEBUG_PROMPT")]
    pub debug_prompt: bool,
    #[arg(long = "provider-timeout-secs", env = "NEBULA_PROVIDER_TIMEOUT_SECS", default_value_t = DEFAULT_PROVIDER_TIMEOUT_SECS)]
    pub provider_timeout_secs: u64,
    #[arg(long = "reply-cache-ttl-secs", env = "NEBULA_REPLY_CACHE_TTL_SECS", default_value_t = DEFAULT_REPLY_CACHE_TTL_SECS)]
    pub reply_cache_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.into(),
            database_url: None,
            default_model: None,
            debug_prompt: false,
            provider_timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            reply_cache_ttl_secs: DEFAULT_REPLY_CACHE_TTL_SECS,
        }
    }
}

impl AppConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn reply_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.reply_cache_ttl_secs)
    }
}
