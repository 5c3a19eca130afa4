//! Kibitz CLI
//!
//! Reads message events as JSON lines on stdin and writes replies as JSON
//! lines on stdout. Logs go to stderr.

use anyhow::Context;
use clap::Parser;
use kibitz::agent::ChatCompletionsClient;
use kibitz::{jobs, ChatAgent, Config, ConsoleGateway, MemoryStore, SharedMemory, StopReason};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "kibitz.toml";

/// Kibitz - a chat companion that knows when to speak
#[derive(Parser, Debug)]
#[command(name = "kibitz")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the memory snapshot
    #[arg(long)]
    memory_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(load_config(cli.config.as_deref()).await?);

    let memory_file = cli.memory_file.unwrap_or_else(default_memory_file);
    info!("Memory file: {}", memory_file.display());
    let store = Arc::new(MemoryStore::new(memory_file));
    let memory: SharedMemory = Arc::new(RwLock::new(store.load().await));

    let gateway = Arc::new(ConsoleGateway::new(config.bot.clone()));
    let model = Arc::new(ChatCompletionsClient::from_config(&config)?);
    let agent = Arc::new(ChatAgent::new(config.clone(), memory.clone(), gateway, model).await?);

    let save_job = jobs::spawn_periodic_save(store.clone(), memory.clone(), config.save_interval());
    let cleanup_job = config
        .files_dir
        .clone()
        .map(|dir| jobs::spawn_file_cleanup(dir, config.files_max_age()));

    let (tx, rx) = mpsc::channel(64);
    ConsoleGateway::spawn_stdin_reader(tx);

    info!("Kibitz started");
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Waiting for Ctrl-C failed: {}", e);
        }
    };
    match agent.serve(rx, interrupted).await {
        StopReason::InputClosed => info!("No more input"),
        StopReason::Interrupted => info!("Shutting down"),
    }

    save_job.abort();
    if let Some(job) = cleanup_job {
        job.abort();
    }

    store
        .save_shared(&memory)
        .await
        .context("saving memory on exit")?;
    info!("Memory saved");
    Ok(())
}

/// Explicit paths must exist; the default one may be missing
async fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .await
            .with_context(|| format!("loading config from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Config::load(Path::new(DEFAULT_CONFIG_FILE))
            .await
            .context("loading config from kibitz.toml"),
        None => {
            warn!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
            Ok(Config::default())
        }
    }
}

fn default_memory_file() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("kibitz").join("memory.json"))
        .unwrap_or_else(|| PathBuf::from("memory.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["kibitz", "--config", "bot.toml", "-v"]);
        assert_eq!(cli.config, Some(PathBuf::from("bot.toml")));
        assert!(cli.verbose);
        assert!(cli.memory_file.is_none());
    }

    #[test]
    fn test_default_memory_file_name() {
        assert!(default_memory_file().ends_with("memory.json"));
    }
}
