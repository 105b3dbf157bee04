//! Cold chain monitor service.
//!
//! `coldchain-monitor worker` drains the task queue until Ctrl-C.
//! `coldchain-monitor detect <shipment_id>` queues one detection and drains.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use coldchain_monitor::config::MonitorConfig;
use coldchain_monitor::insight::{
    CachedProvider, InsightGenerator, LlmInsightGenerator, NarrativeCache, OpenAiCompatibleProvider,
    StaticInsightGenerator,
};
use coldchain_monitor::orchestrator::{DetectionOrchestrator, Job, SqliteTaskQueue, TaskQueue, Worker};
use coldchain_monitor::store::{SqliteStore, Stores};
use coldchain_monitor::utils::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "coldchain-monitor", version, about = "Cold chain excursion detection and risk scoring")]
struct Cli {
    /// YAML config file; environment variables override it
    #[arg(long, global = true, env = "COLDCHAIN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drain the task queue until Ctrl-C
    Worker,
    /// Queue one detection pass for a shipment and drain the queue
    Detect {
        shipment_id: String,
    },
}

fn insight_generator(config: &MonitorConfig) -> Result<Arc<dyn InsightGenerator>> {
    match &config.llm {
        Some(llm) => {
            let provider = OpenAiCompatibleProvider::new(llm.base_url.clone(), Some(llm.api_key.clone()))?;
            let cached = CachedProvider::new(Arc::new(provider), Arc::new(NarrativeCache::new()));
            info!(model = %llm.model, "Narratives enabled");
            Ok(Arc::new(LlmInsightGenerator::new(Arc::new(cached), llm.model.clone())))
        }
        None => {
            warn!("No OPENAI_API_KEY configured; narratives will stay empty");
            Ok(Arc::new(StaticInsightGenerator))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let config = MonitorConfig::load(cli.config.as_deref())?;
    info!(database = ?config.database_path, "Opening store");

    let backend = Arc::new(SqliteStore::new(&config.database_path).await?);
    let stores = Stores::from_backend(backend);
    let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(&config.database_path).await?);

    let orchestrator = Arc::new(DetectionOrchestrator::new(stores.clone(), queue.clone()));
    let worker = Worker::new(stores, queue.clone(), orchestrator, insight_generator(&config)?)
        .with_max_attempts(config.max_task_attempts)
        .with_poll_interval(config.poll_interval());

    match cli.command {
        Command::Worker => {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                    let _ = tx.send(true);
                }
            });
            worker.run(rx).await?;
        }
        Command::Detect { shipment_id } => {
            let task_id = queue.enqueue(&Job::DetectShipment { shipment_id: shipment_id.clone() }).await?;
            info!(%shipment_id, %task_id, "Detection queued");
            let processed = worker.run_until_idle().await?;
            info!(processed, "Queue drained");
        }
    }

    Ok(())
}
