//! TeleCoder - asynchronous coding-agent orchestrator
//!
//! Takes a natural-language task against a repository, runs an AI coding
//! agent in an isolated sandbox, and publishes the outcome as a pull
//! request or a text answer.

mod api;
mod bus;
mod config;
mod db;
mod engine;
mod git;
mod llm;
mod pipeline;
mod sandbox;

use api::{create_router, AppState};
use bus::EventBus;
use config::Config;
use db::Database;
use engine::{Engine, RepoNotesMemory};
use git::GithubProvider;
use llm::{LlmConfig, LoggingClient};
use pipeline::Stages;
use sandbox::pool::{PoolConfig, WarmPool};
use sandbox::{DockerRuntime, SandboxRuntime};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telecoder=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    // Persisted state lives under the data dir
    let data_dir = PathBuf::from(&config.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("telecoder.db");
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path)?;

    // Sessions left in flight by a previous process cannot be resumed
    let interrupted = db.fail_interrupted_sessions()?;
    if interrupted > 0 {
        tracing::warn!(count = interrupted, "Marked interrupted sessions as failed");
    }

    let llm = LlmConfig::from_env()
        .build()
        .map(|client| Arc::new(LoggingClient::new(client)) as Arc<dyn llm::LlmClient>);
    if llm.is_none() {
        tracing::warn!(
            "No LLM API key configured. Set ANTHROPIC_API_KEY or OPENAI_API_KEY; \
             pipeline stages will run with fallbacks"
        );
    }
    let stages = Stages::new(llm, config.max_sub_tasks);

    if config.github_token.is_empty() {
        tracing::warn!("GITHUB_TOKEN is not set; PR creation will fail");
    }
    let github = Arc::new(GithubProvider::new(config.github_token.clone()));

    let docker = Arc::new(DockerRuntime::new());
    if !config.docker_network.is_empty() {
        docker.ensure_network(&config.docker_network).await?;
    }

    // Optional pre-warming pool in front of the runtime
    let mut pool_handle: Option<WarmPool<DockerRuntime>> = None;
    let runtime: Arc<dyn SandboxRuntime> = if config.pool_size > 0 {
        let pool = WarmPool::new(
            Arc::clone(&docker),
            PoolConfig {
                size: config.pool_size,
                image: config.docker_image.clone(),
                network: config.docker_network.clone(),
                refill_interval: config.pool_refill_interval,
            },
        );
        pool.spawn_refill();
        tracing::info!(size = config.pool_size, "Sandbox pool enabled");
        pool_handle = Some(pool.clone());
        Arc::new(pool)
    } else {
        docker
    };

    let bus = Arc::new(EventBus::new());
    let server_addr = config.server_addr.clone();
    let engine = Engine::new(db, bus, runtime, github, stages, config)
        .with_memory(Arc::new(RepoNotesMemory::new(data_dir.join("notes"))));
    engine.start();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(AppState::new(engine.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!(addr = %server_addr, "TeleCoder server listening");
    let listener = tokio::net::TcpListener::bind(&server_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    engine.stop().await;
    if let Some(pool) = pool_handle {
        pool.shutdown().await;
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
