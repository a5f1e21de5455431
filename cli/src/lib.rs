//! `spctl`: drive a speech-pool from the command line.

mod transcribe;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use speech_pool_core::config::Config;
use speech_pool_core::gauges::LogSink;
use speech_pool_core::logging;
use speech_pool_core::monitor::ResourceMonitor;
use speech_pool_core::sampler::MetricsSampler;
use speech_pool_core::WorkerPool;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use transcribe::TranscribeArgs;

#[derive(Debug, Parser)]
#[command(name = "spctl")]
#[command(about = "Speech-pool CLI - transcribe audio through isolated worker processes")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to ~/.config/speech-pool/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Transcribe audio files and print one JSON line per file
    Transcribe(TranscribeArgs),
    /// Start the pool and print worker resource usage
    Stats,
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration to the config path
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

impl Cli {
    fn config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Config::config_path(),
        }
    }

    fn load_config(&self) -> Result<Config> {
        let path = self.config_path()?;
        Config::load_from(&path).with_context(|| format!("Failed to load {}", path.display()))
    }
}

/// Parse arguments and run the selected command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { action } = &cli.command {
        return config_command(&cli, action);
    }

    let config = cli.load_config()?;
    let _guard = logging::init_cli(&config.logging)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let all_succeeded = runtime.block_on(async {
        match cli.command {
            Commands::Transcribe(args) => with_pool(&config, |pool| transcribe::run(pool, args)).await,
            Commands::Stats => with_pool(&config, stats).await,
            Commands::Config { .. } => Ok(true),
        }
    })?;

    if !all_succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Start the pool and its sampler, run `body`, then shut both down.
async fn with_pool<F, Fut>(config: &Config, body: F) -> Result<bool>
where
    F: FnOnce(WorkerPool) -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let pool = WorkerPool::start(config).context("Failed to start worker pool")?;

    let cancel = CancellationToken::new();
    let (_pool_tx, pool_rx) = watch::channel(Some(pool.clone()));
    let sampler = MetricsSampler::new(pool_rx, Arc::new(LogSink), &config.metrics);
    let sampler = tokio::spawn(sampler.run(cancel.clone()));

    let outcome = body(pool.clone()).await;

    cancel.cancel();
    let report = pool.shutdown(config.pool.shutdown_timeout()).await;
    info!(
        mode = ?report.mode,
        elapsed_ms = report.elapsed.as_millis() as u64,
        abandoned = report.abandoned,
        "Pool shut down"
    );
    let _ = sampler.await;
    outcome
}

async fn stats(pool: WorkerPool) -> Result<bool> {
    let stats = pool.stats().await;
    let mut monitor = ResourceMonitor::for_pids(pool.worker_pids());
    let output = serde_json::json!({
        "stats": stats,
        "memory": monitor.aggregate_memory(),
        "processes": monitor.process_tree(),
        "status": pool.status(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to serialize stats")?
    );
    Ok(true)
}

fn config_command(cli: &Cli, action: &ConfigAction) -> Result<()> {
    let path = cli.config_path()?;
    match action {
        ConfigAction::Show => {
            let config = Config::load_from(&path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save_to(&path)?;
            println!("Wrote default config to {}", path.display());
        }
        ConfigAction::Path => println!("{}", path.display()),
    }
    Ok(())
}
