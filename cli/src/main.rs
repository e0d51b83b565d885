//! Context Engine command-line host
//!
//! Opens the engine over a data directory, runs one subcommand, prints the
//! result as JSON and saves the graph back if the command changed it.

mod commands;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use context_engine::{CachedEmbedder, ContextEngine, EngineConfig, HashingEmbedder, SystemClock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::Command;

const GRAPH_FILE: &str = "graph.bin";
const CACHE_FILE: &str = "cache.bin";

#[derive(Parser)]
#[command(name = "context-engine")]
#[command(about = "Shared semantic memory over a local data directory")]
#[command(version)]
struct Args {
    /// Engine config (TOML)
    #[arg(long, short, env = "CONTEXT_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the graph snapshot and the cache file
    #[arg(long, short, env = "CONTEXT_ENGINE_DATA_DIR", default_value = ".context")]
    data_dir: PathBuf,

    /// Embedding dimension, overriding the config file
    #[arg(long, env = "CONTEXT_ENGINE_DIMENSION")]
    dimension: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(dimension) = args.dimension {
        config.dimension = dimension;
    }
    if config.cache.disk_path.is_none() {
        config.cache.disk_path = Some(args.data_dir.join(CACHE_FILE));
    }
    config.validate()?;
    Ok(config)
}

fn open_engine(config: EngineConfig, data_dir: &Path) -> anyhow::Result<ContextEngine> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let embedder = Arc::new(CachedEmbedder::new(HashingEmbedder::new(config.dimension)));
    let engine = ContextEngine::restore(
        config,
        embedder,
        Arc::new(SystemClock),
        data_dir.join(GRAPH_FILE),
    )?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "context_engine=info,context_engine_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args)?;
    tracing::debug!("Data directory: {:?}", args.data_dir);

    let engine = Arc::new(open_engine(config, &args.data_dir)?);
    let mutates = args.command.mutates();

    let outcome = args.command.run(&engine).await;
    if let Ok(value) = &outcome {
        println!("{}", serde_json::to_string_pretty(value)?);
        commands::persist(&engine, mutates, &args.data_dir.join(GRAPH_FILE))?;
        if let Some(report) = engine.tick() {
            tracing::info!("Background consolidation pruned {} nodes", report.pruned_count);
            commands::persist(&engine, true, &args.data_dir.join(GRAPH_FILE))?;
        }
    }

    if let Err(e) = engine.shutdown() {
        tracing::error!("Shutdown failed: {}", e);
    }
    outcome.map(|_| ())
}
