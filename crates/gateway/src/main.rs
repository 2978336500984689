use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use clerk_domain::config::Config;
use clerk_gateway::api;
use clerk_gateway::knowledge::KnowledgeBase;
use clerk_gateway::runtime::registry::ChatRegistry;
use clerk_gateway::skills::SkillsRegistry;
use clerk_gateway::state::AppState;
use clerk_history::{CommitStore, SnapshotStore};
use clerk_providers::AnthropicProvider;
use clerk_store::kv::{KvStore, MemoryKv, RedisKv};
use clerk_store::ChatStore;

use clerk_gateway::api::ratelimit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ──────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,clerk_gateway=debug")),
        )
        .json()
        .init();

    tracing::info!("Clerk starting");

    // ── Config ───────────────────────────────────────────────────────
    let config_path = std::env::var("CLERK_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let mut config: Config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {config_path}"))?;
        toml::from_str(&raw).with_context(|| format!("parsing {config_path}"))?
    } else {
        tracing::warn!(path = %config_path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_env().context("applying environment overrides")?;
    let config = Arc::new(config);

    // ── Persistence ──────────────────────────────────────────────────
    let kv: Arc<dyn KvStore> = match RedisKv::connect(&config.store.url()).await {
        Ok(redis) => Arc::new(redis),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "redis unavailable — falling back to in-memory store \
                 (chats and commits will not survive a restart)"
            );
            Arc::new(MemoryKv::new())
        }
    };
    let chats = Arc::new(ChatStore::new(kv.clone(), config.store.chat_ttl_secs));
    let commits = Arc::new(CommitStore::new(kv.clone()));
    let snapshots = Arc::new(SnapshotStore::with_ttl(
        kv.clone(),
        config.store.snapshot_ttl_secs,
    ));

    // ── LLM provider ─────────────────────────────────────────────────
    let provider = Arc::new(
        AnthropicProvider::from_config(&config.llm).context("initializing LLM provider")?,
    );
    tracing::info!(model = %config.llm.model, "LLM provider ready");

    // ── Workspace ────────────────────────────────────────────────────
    std::fs::create_dir_all(&config.workspace.output_dir)
        .context("creating output directory")?;
    let skills = Arc::new(
        SkillsRegistry::load(&config.workspace.skills_dir).context("loading skills")?,
    );
    let knowledge = Arc::new(
        KnowledgeBase::load(&config.workspace.knowledge_dir).context("loading knowledge base")?,
    );

    // ── Registry & state ─────────────────────────────────────────────
    let registry = Arc::new(ChatRegistry::new(std::time::Duration::from_millis(
        config.runtime.grace_period_ms,
    )));

    let state = AppState {
        config: config.clone(),
        kv,
        chats,
        commits,
        snapshots,
        provider,
        registry,
        skills,
        knowledge,
        limiter: Arc::new(RateLimiter::new()),
    };

    // ── Router ───────────────────────────────────────────────────────
    let app = api::router()
        .layer(CorsLayer::permissive())
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "Clerk listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
