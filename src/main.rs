use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use trade_journal_jobs::queue::{JobKind, JobOptions, JobPriority};
use trade_journal_jobs::utils::{init_logger, Clock};
use trade_journal_jobs::{create_router, Backend, Config, Services};

#[derive(Parser)]
#[command(name = "trade-journal-jobs", version, about = "Background AI analysis for the trade journal")]
struct Cli {
    /// Keep jobs and subjects in process memory instead of Redis and Postgres
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// HTTP API, worker pool and scheduler in one process (default)
    Serve,
    /// Worker pool and scheduler without the HTTP API
    Worker,
    /// Submit a single job
    Enqueue {
        #[arg(long)]
        kind: JobKind,
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "normal")]
        priority: JobPriority,
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long)]
        dedup_key: Option<String>,
    },
    /// Run one sweep immediately: analysis, cleanup or usage
    Sweep { name: String },
    /// Print queue depth by state
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _log_guard = init_logger(config.log_dir.as_deref());

    let backend = if cli.in_memory { Backend::InMemory } else { Backend::External };
    let services = Services::connect(config, backend).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(services).await,
        Command::Worker => work(services).await,
        Command::Enqueue {
            kind,
            subject,
            priority,
            delay_ms,
            dedup_key,
        } => {
            let mut options = JobOptions::default().with_priority(priority);
            if let Some(ms) = delay_ms {
                options = options.with_delay(Duration::from_millis(ms));
            }
            if let Some(key) = dedup_key {
                options = options.with_dedup_key(key);
            }
            let handle = services.producer.enqueue(kind, &subject, options).await?;
            println!("{}", serde_json::to_string_pretty(&handle)?);
            Ok(())
        }
        Command::Sweep { name } => {
            let scheduler = services.scheduler();
            let report = scheduler.run_now(&name).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Stats => {
            let counts = services.store.counts(services.clock.now()).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
    }
}

async fn serve(services: Services) -> Result<()> {
    let provider = services.analysis_provider()?;
    let pool = services.worker_pool(provider);
    let scheduler = Arc::new(services.scheduler());
    if services.config.scheduler.enabled {
        scheduler.start_all();
    }
    let workers = pool.start();
    info!(worker_id = pool.worker_id(), "Worker pool started");

    let app = create_router(services.app_state(scheduler.clone()));
    let addr = format!("{}:{}", services.config.server.host, services.config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.stop_all().await;
    workers.shutdown().await;

    served.map_err(|e| anyhow::anyhow!("Server error: {}", e))
}

async fn work(services: Services) -> Result<()> {
    let provider = services.analysis_provider()?;
    let pool = services.worker_pool(provider);
    let scheduler = services.scheduler();
    if services.config.scheduler.enabled {
        scheduler.start_all();
    }
    let workers = pool.start();
    info!(worker_id = pool.worker_id(), "Worker pool started");

    shutdown_signal().await;

    scheduler.stop_all().await;
    workers.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
