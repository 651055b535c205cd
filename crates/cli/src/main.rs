//! `vaultline` - resumable conversation ingestion.

mod commands;
mod input;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use vaultline_core::{ContentHash, JobId};
use vaultline_infra::IngestConfig;
use vaultline_observability::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "vaultline")]
#[command(version, about = "Resumable, rate-limited conversation ingestion")]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true, env = "VAULTLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the queue database, progress file and index
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log output format: json, pretty or compact
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a batch of conversations through the pipeline
    Ingest {
        /// JSONL file with one conversation per line; `-` reads stdin
        #[arg(default_value = "-")]
        input: PathBuf,

        /// Number of concurrent workers
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Reprocess content even if it was already recorded
        #[arg(long)]
        force: bool,
    },

    /// Show queue, progress and rate limit state
    Status,

    /// List dead-lettered jobs
    DeadLetters {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Return a dead-lettered job to the queue with a fresh attempt budget
    Requeue { job_id: JobId },

    /// Drop the progress entry for a content hash so it is processed again
    Force { hash: ContentHash },

    /// Wipe the queue and/or the progress store
    Reset {
        #[arg(long)]
        queue: bool,

        #[arg(long)]
        progress: bool,
    },

    /// Delete finished and dead jobs older than the given age
    Purge {
        #[arg(long, default_value_t = 7)]
        days: u64,
    },
}

fn load_config(cli: &Cli) -> Result<IngestConfig> {
    let config = match &cli.config {
        Some(path) => IngestConfig::load(path)?.with_env_overrides()?,
        None => IngestConfig::from_env()?,
    };
    let config = match &cli.data_dir {
        Some(dir) => IngestConfig {
            data_dir: dir.clone(),
            ..config
        },
        None => config,
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    vaultline_observability::init_with(cli.log_format);

    let config = load_config(&cli)?;

    match cli.command {
        Command::Ingest {
            input,
            concurrency,
            force,
        } => commands::ingest(&config, &input, concurrency, force).await,
        Command::Status => commands::status(&config).await,
        Command::DeadLetters { limit } => commands::dead_letters(&config, limit).await,
        Command::Requeue { job_id } => commands::requeue(&config, job_id).await,
        Command::Force { hash } => commands::force(&config, &hash).await,
        Command::Reset { queue, progress } => commands::reset(&config, queue, progress).await,
        Command::Purge { days } => commands::purge(&config, days).await,
    }
}
