use anyhow::{bail, Context, Result};
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upkeep_engine::config::{AppConfig, CliConfig, FileConfig};
use upkeep_engine::metrics;
use upkeep_engine::scheduling::backend::BackendPreference;
use upkeep_engine::tasks::jobs::days_window;
use upkeep_engine::tasks::progress::ProgressStore;
use upkeep_engine::tasks::task::RunOptions;
use upkeep_engine::{Engine, ExecuteOutcome};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
#[clap(name = "upkeep", about = "Scheduled maintenance task engine")]
struct CliArgs {
    /// Directory holding the engine database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. Its values override the flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Trigger backend: auto, poller or queue.
    #[clap(long)]
    pub backend: Option<BackendPreference>,

    /// IANA timezone preferred hours are expressed in.
    #[clap(long)]
    pub timezone: Option<String>,

    /// Hour of day (0-23) recurring runs start at.
    #[clap(long)]
    pub preferred_hour: Option<i32>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile schedules, then dispatch due triggers until interrupted.
    Run {
        /// Serve Prometheus metrics on this port.
        #[clap(long)]
        metrics_port: Option<u16>,
    },
    /// Reconcile schedules once and print the report.
    Reconcile,
    /// List registered tasks.
    List,
    /// Run a task now.
    Execute { task_id: String },
    /// Delete checkpoints older than the given age.
    PruneProgress {
        #[clap(long, default_value_t = 7)]
        max_age_days: u64,
    },
    /// Show recent results of a task.
    History {
        task_id: String,
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let metrics_port = match &cli_args.command {
        Command::Run { metrics_port } => *metrics_port,
        _ => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        metrics_port,
        backend: cli_args.backend,
        timezone: cli_args.timezone.clone(),
        preferred_hour: cli_args.preferred_hour,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening engine database at {:?}...", config.engine_db_path());
    metrics::init_metrics();
    let engine = Engine::build(&config)?;

    match cli_args.command {
        Command::Run { .. } => run(engine, config.metrics_port).await,
        Command::Reconcile => {
            let report = engine.scheduling().reconcile();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::List => {
            let definitions = engine.scheduling().task_definitions();
            println!("{}", serde_json::to_string_pretty(&definitions)?);
            Ok(())
        }
        Command::Execute { task_id } => {
            let registry = engine.registry().clone();
            let outcome = tokio::task::spawn_blocking(move || {
                registry.execute(&task_id, RunOptions::manual())
            })
            .await??;
            match outcome {
                ExecuteOutcome::Completed(result) => {
                    println!("{}", serde_json::to_string_pretty(&result.to_json())?);
                    if !result.is_success() {
                        bail!("Task failed");
                    }
                }
                ExecuteOutcome::Skipped => println!("skipped: task is already running"),
            }
            Ok(())
        }
        Command::PruneProgress { max_age_days } => {
            let pruned = engine
                .progress()
                .prune_stale(days_window(max_age_days))?;
            println!("Pruned {} checkpoints", pruned);
            Ok(())
        }
        Command::History { task_id, limit } => {
            let records = engine.run_log().history(&task_id, limit)?;
            let results: Vec<_> = records.iter().map(|r| r.result.to_json()).collect();
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
    }
}

async fn run(engine: Engine, metrics_port: Option<u16>) -> Result<()> {
    let shutdown_token = CancellationToken::new();

    if let Some(port) = metrics_port {
        let app = Router::new().route("/metrics", get(metrics::metrics_handler));
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
            .await
            .with_context(|| format!("Failed to bind metrics port {}", port))?;
        info!("Metrics available at port {}!", port);
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let report = engine.scheduling().reconcile();
    if !report.errors.is_empty() {
        error!("Reconciliation errors: {:?}", report.errors);
    }

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested");
        signal_token.cancel();
    });

    engine.runner(shutdown_token).run().await;
    Ok(())
}
