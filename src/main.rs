//! Pulsebot CLI entry point: a console REPL talking to the agent.

use anyhow::Context as _;
use clap::Parser;
use pulsebot::agent::Agent;
use pulsebot::dispatch::Dispatcher;
use pulsebot::llm::OpenRouterClient;
use pulsebot::memory::{JsonFileStore, MemoryStore};
use pulsebot::queue::ChannelRegistry;
use pulsebot::surface::ConsoleSurface;
use pulsebot::{ChannelId, ChannelKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing_subscriber::EnvFilter;

const SYSTEM_PROMPT: &str = include_str!("../prompts/system.txt");

#[derive(Parser)]
#[command(name = "pulsebot")]
#[command(about = "A conversational agent that streams timed action sequences")]
struct Cli {
    /// Data directory holding config.toml and memory snapshots (optional)
    #[arg(short, long)]
    data_dir: Option<std::path::PathBuf>,

    /// Name the console user goes by
    #[arg(short, long, default_value = "DVD")]
    user: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match cli.data_dir {
        Some(ref dir) => pulsebot::config::Config::load_from_dir(dir)
            .with_context(|| format!("failed to load config from {}", dir.display()))?,
        None => pulsebot::config::Config::load().context("failed to load configuration")?,
    };
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let persister = Arc::new(JsonFileStore::new(
        config.memory_path(),
        config.backup_path(),
    ));
    let store = Arc::new(
        MemoryStore::open(persister, config.persistence.backup_every)
            .await
            .context("failed to open memory store")?,
    );

    let surface = Arc::new(ConsoleSurface::new(config.persona.clone()));
    let model = Arc::new(OpenRouterClient::new(config.llm.clone(), SYSTEM_PROMPT));
    let dispatcher = Arc::new(Dispatcher::new(
        surface.clone(),
        store.clone(),
        config.pacing,
        config.persona.clone(),
    ));
    let registry = Arc::new(ChannelRegistry::new(
        dispatcher,
        store.clone(),
        Duration::from_secs(config.queue.idle_timeout_secs),
    ));
    let agent = Agent::new(store, registry, surface, model, config.command_prefix.clone());

    agent
        .set_channel(ChannelId::new(ChannelKind::Console, 0))
        .await;
    tracing::info!(persona = %config.persona, "pulsebot ready, type away");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(error) = agent.process_text(&cli.user, line).await {
            tracing::error!(%error, "failed to process input");
        }
    }

    tracing::info!("shutting down");
    agent.shutdown().await.context("failed to flush memory")?;
    Ok(())
}
