//! warp-gather — runs the configured metric gatherers.
//!
//! Loads plugin modules, builds every gatherer named in the config through
//! the gatherer registry, then polls each one on its own interval until
//! Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! warp-gather run --config /etc/warpgrid/warp-gather.toml
//! warp-gather run --config warp-gather.toml --once
//! warp-gather list --config warp-gather.toml
//! ```

mod config;
mod runner;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use warpgrid_gather::GathererRegistry;
use warpgrid_plugin::PluginLoader;

use config::GatherConfig;
use runner::{build_tasks, forward_shutdown};

#[derive(Parser)]
#[command(name = "warp-gather", about = "WarpGrid metric gatherer")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Gather on each gatherer's interval until interrupted.
    Run {
        /// Path to warp-gather.toml.
        #[arg(long, short)]
        config: PathBuf,

        /// Gather once from every gatherer, print the results and exit.
        #[arg(long)]
        once: bool,
    },
    /// Load plugins and print the available gatherer kinds.
    List {
        /// Path to warp-gather.toml.
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,warp_gather=debug,warpgrid=debug"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run { config, once } => run(&config, once).await,
        Command::List { config } => list(&config),
    }
}

/// Read the config and load its plugins into a fresh registry.
fn prepare(path: &Path) -> anyhow::Result<(GatherConfig, Arc<GathererRegistry>, PluginLoader)> {
    let config = GatherConfig::from_file(path)?;
    info!(path = %path.display(), gatherers = config.gatherers.len(), "config loaded");

    let registry = Arc::new(GathererRegistry::with_builtins());
    let loader = PluginLoader::new(Arc::clone(&registry))?;
    loader
        .load_all(&config.global.plugins)
        .context("loading plugins")?;
    if !loader.is_empty() {
        info!(plugins = loader.len(), "plugins loaded");
    }

    Ok((config, registry, loader))
}

async fn run(path: &Path, once: bool) -> anyhow::Result<()> {
    // The loader owns the plugin instances; keep it alive while gathering.
    let (config, registry, _loader) = prepare(path)?;
    let tasks = build_tasks(&config, &registry)?;
    if tasks.is_empty() {
        warn!("no gatherers configured");
        return Ok(());
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), shutdown_tx));

    if once {
        let mut failed = 0usize;
        for task in &tasks {
            match task.gather_once(&shutdown_rx).await {
                Ok(q) => println!("{}\t{}\t{}", task.name, task.kind, q),
                Err(e) => {
                    failed += 1;
                    println!("{}\t{}\terror: {}", task.name, task.kind, e);
                }
            }
        }
        if failed > 0 {
            anyhow::bail!("{failed} of {} gatherers failed", tasks.len());
        }
        return Ok(());
    }

    // ── Gather loops ───────────────────────────────────────────

    let handles: Vec<_> = tasks
        .into_iter()
        .map(|task| tokio::spawn(task.run(shutdown_rx.clone())))
        .collect();
    info!(gatherers = handles.len(), "warp-gather running");

    for handle in handles {
        let _ = handle.await;
    }

    info!("warp-gather stopped");
    Ok(())
}

fn list(path: &Path) -> anyhow::Result<()> {
    let (config, registry, loader) = prepare(path)?;

    println!("gatherer kinds:");
    for name in registry.names() {
        println!("  {name}");
    }

    if !loader.is_empty() {
        println!("plugins:");
        for path in loader.loaded_paths() {
            let declared = loader
                .plugin(&path)
                .map(|p| {
                    p.registrations()
                        .iter()
                        .map(|r| r.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            println!("  {} ({declared})", path.display());
        }
    }

    if !config.gatherers.is_empty() {
        println!("configured:");
        for g in &config.gatherers {
            println!("  {} ({})", g.name, g.kind);
        }
    }
    Ok(())
}
