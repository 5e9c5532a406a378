//! stemflow CLI
//!
//! # Usage
//!
//! ```bash
//! # Run the engine (workers, re-scan loop, reaper) until Ctrl-C
//! stemflow --config stemflow.yaml run
//!
//! # Submit a file; the running engine admits it
//! stemflow --config stemflow.yaml submit ./song.mp3 --option model=htdemucs
//!
//! # Inspect
//! stemflow status <job-id>
//! stemflow results <job-id>
//! stemflow list --status running
//! ```
//!
//! Commands other than `run` need `storage.database` so they share the
//! engine's job store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use stemflow_orchestration::config::{EngineConfig, LogFormat, LoggingConfig};
use stemflow_orchestration::{
    command_stage_set, Engine, EngineMetrics, InMemoryTaskQueue, PipelineCoordinator,
};
use stemflow_storage::{JobId, JobStatus, StatusFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "stemflow")]
#[command(about = "Job orchestration for the separation / transcription / beat analysis pipeline", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "STEMFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Run,

    /// Submit a media file
    Submit {
        /// Path to the source media
        path: PathBuf,

        /// Processing option passed to the stages, as key=value (repeatable)
        #[arg(short, long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },

    /// Show a job's status
    Status { job_id: String },

    /// Show a completed job's artifacts
    Results { job_id: String },

    /// Request cancellation of a job
    Cancel { job_id: String },

    /// List jobs, newest first
    List {
        /// queued, running, completed, failed, cancelled, active or finished
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Count jobs per status
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Run => run_engine(config).await,
        Commands::Submit { path, options } => {
            let coordinator = client(config)?;
            let options = parse_options(&options)?;
            let input = path.to_string_lossy();
            let job_id = coordinator.create_job(&input, options).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "status": JobStatus::Queued }))
        }
        Commands::Status { job_id } => {
            let coordinator = client(config)?;
            print_json(&coordinator.status(&parse_job_id(&job_id)?).await?)
        }
        Commands::Results { job_id } => {
            let coordinator = client(config)?;
            print_json(&coordinator.results(&parse_job_id(&job_id)?).await?)
        }
        Commands::Cancel { job_id } => {
            let coordinator = client(config)?;
            print_json(&coordinator.request_cancel(&parse_job_id(&job_id)?).await?)
        }
        Commands::List { status, limit } => {
            let coordinator = client(config)?;
            let filter = parse_filter(status.as_deref())?;
            print_json(&coordinator.list_jobs(filter, limit).await?)
        }
        Commands::Stats => {
            let coordinator = client(config)?;
            print_json(&coordinator.stats().await?)
        }
    }
}

async fn run_engine(config: EngineConfig) -> anyhow::Result<()> {
    let store = Engine::open_store(&config)?;
    let stages = command_stage_set(&config.stages)?;

    #[cfg(feature = "metrics")]
    let metrics = EngineMetrics::prometheus().context("failed to register metrics")?;
    #[cfg(not(feature = "metrics"))]
    let metrics = EngineMetrics::disabled();

    let mut engine = Engine::with_metrics(config, store, stages, metrics);
    engine.start().await?;

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    #[cfg(feature = "metrics")]
    if let Ok(Some(text)) = engine.coordinator().metrics().encode() {
        eprintln!("{}", text);
    }
    engine.shutdown().await;
    Ok(())
}

/// Coordinator over the shared store that leaves admission to the engine
fn client(config: EngineConfig) -> anyhow::Result<PipelineCoordinator> {
    if config.storage.database.is_none() {
        bail!("storage.database (or STEMFLOW_DATABASE) must be set to talk to the engine's job store");
    }
    let store = Engine::open_store(&config)?;
    Ok(PipelineCoordinator::new(Arc::new(config), store, Arc::new(InMemoryTaskQueue::new())).without_admission())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log filter")?;
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
    .context("failed to install tracing subscriber")
}

/// `key=value` pairs into a JSON object; values that parse as JSON keep their type
fn parse_options(pairs: &[String]) -> anyhow::Result<serde_json::Value> {
    let mut options = serde_json::Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("option '{}' is not in KEY=VALUE form", pair);
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        options.insert(key.trim().to_string(), value);
    }
    Ok(serde_json::Value::Object(options))
}

fn parse_job_id(raw: &str) -> anyhow::Result<JobId> {
    raw.parse::<JobId>()
        .with_context(|| format!("'{}' is not a job id", raw))
}

fn parse_filter(raw: Option<&str>) -> anyhow::Result<StatusFilter> {
    Ok(match raw {
        None => StatusFilter::Any,
        Some("active") => StatusFilter::NonTerminal,
        Some("finished") => StatusFilter::Terminal,
        Some(status) => StatusFilter::Is(status.parse::<JobStatus>()?),
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
