use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use nebula_chat::cache::InMemoryReplyCache;
use nebula_chat::config::AppConfig;
use nebula_chat::engine::{Collaborators, EngineOptions, SessionEngine};
use nebula_chat::llm::RouterGateway;
use nebula_chat::server::{self, AppState};
use nebula_chat::storage::{SeedData, SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "nebula-chat")]
#[command(about = "Persona chat orchestration server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API.
    Start {
        #[command(flatten)]
        config: AppConfig,
    },
    /// Load personas, worlds, models, documents and balances from a JSON file.
    Seed {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { config: cfg } => {
            let addr: SocketAddr = cfg.listen.parse().with_context(|| format!("invalid listen address {}", cfg.listen))?;

            let store = Arc::new(SqliteStore::initialize(cfg.database_url.clone()).await?);
            let metrics = nebula_chat::metrics::install_recorder()?;
            let gateway = Arc::new(RouterGateway::new(cfg.provider_timeout())?);
            let collab = Collaborators::from_store(store, Arc::new(InMemoryReplyCache::new()));
            let engine = SessionEngine::new(collab, gateway, EngineOptions::from(&cfg));
            let state = AppState { engine: Arc::new(engine), metrics: Some(metrics) };
            server::serve(addr, state).await?;
        }
        Commands::Seed { file, database_url } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let seed: SeedData = serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
            let store = SqliteStore::initialize(database_url).await?;
            store.load_seed(&seed).await?;
            info!(
                personas = seed.personas.len(),
                models = seed.models.len(),
                documents = seed.documents.len(),
                "seed loaded"
            );
        }
    }
    Ok(())
}
