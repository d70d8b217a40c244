use anyhow::Context as _;
use axum::{response::Json, routing::get, Router};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};

use engine::decision::JobParams;
use engine::timeline::VoiceStrategy;

mod api;
mod assembly;
mod config;
mod db;
mod generation;
mod jobs;
mod llm;
mod media;
mod orchestrator;
mod planner;
mod speech;
#[cfg(test)]
mod testing;

use config::DaemonConfig;
use jobs::{JobManager, JobRequest};
use orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "daemon", version, about = "Duration-reconciling short-form video generator")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and process queued jobs.
    Serve(ServeArgs),
    /// Run one job inline and print its report as JSON.
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:7777")]
    addr: SocketAddr,

    /// SQLite database path (overrides REEL_DB_PATH).
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Target duration in seconds.
    #[arg(long)]
    target_duration: f64,

    #[arg(long, default_value = "tiktok")]
    platform: String,

    /// Allowed fractional deviation, e.g. 0.05.
    #[arg(long)]
    tolerance: Option<f64>,

    /// Natural-language mission handed to the creative source.
    #[arg(long)]
    mission: String,

    /// single, multi or narrator-plus-character.
    #[arg(long)]
    voice_strategy: Option<VoiceStrategy>,

    /// Copy the final video here.
    #[arg(long)]
    out: Option<PathBuf>,

    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .init();

    let cli = Cli::parse();
    let config = DaemonConfig::from_env().context("invalid REEL_* configuration")?;

    match cli.cmd {
        Command::Serve(args) => serve(config, args).await,
        Command::Run(args) => run_once(config, args).await,
    }
}

fn open_runtime(
    mut config: DaemonConfig,
    db_override: Option<PathBuf>,
) -> anyhow::Result<(Arc<JobManager>, Arc<Orchestrator>, DaemonConfig)> {
    if let Some(path) = db_override {
        config.db_path = path;
    }
    let db = Arc::new(db::Database::new(&config.db_path)?);
    info!("Database initialized at {:?}", config.db_path);

    let job_manager = Arc::new(JobManager::new(db));
    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    Ok((job_manager, orchestrator, config))
}

async fn serve(config: DaemonConfig, args: ServeArgs) -> anyhow::Result<()> {
    let (job_manager, orchestrator, config) = open_runtime(config, args.db)?;

    let job_processor = jobs::processor::JobProcessor::new(job_manager.clone(), orchestrator);
    let _processor_handle = tokio::spawn(async move {
        job_processor.run().await;
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", api::router(job_manager, Arc::new(config.decision.clone())))
        .layer(cors);

    info!("Starting daemon server on {}", args.addr);
    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_once(config: DaemonConfig, args: RunArgs) -> anyhow::Result<()> {
    let (job_manager, orchestrator, _) = open_runtime(config, args.db)?;
    let request = JobRequest {
        mission: args.mission,
        params: JobParams {
            target_duration: args.target_duration,
            platform: args.platform,
            tolerance: args.tolerance,
            voice_strategy: args.voice_strategy,
            language: None,
        },
    };
    // Reject bad parameters before anything is queued or called.
    orchestrator.decide(&request.params)?;

    let job_id = job_manager.create_job(&request)?;
    let processor = jobs::processor::JobProcessor::new(job_manager.clone(), orchestrator);
    let Some(report) = processor.process_job(job_id).await? else {
        let job = job_manager.get_job(job_id)?;
        let reason = job.and_then(|j| j.error).unwrap_or_else(|| "unknown error".to_string());
        anyhow::bail!("job {} did not complete: {}", job_id, reason);
    };

    if let Some(out) = &args.out {
        tokio::fs::copy(&report.output_path, out)
            .await
            .with_context(|| format!("failed to copy output to {}", out.display()))?;
    }
    if let Err(e) = report.ensure_publishable() {
        warn!("job {} is playable but withheld from publishing: {}", job_id, e);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
