use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use newsloom::config::Settings;
use newsloom::health::HealthCheck;
use newsloom::llm::{MockGenerator, OpenAiGenerator, TextGenerator};
use newsloom::pipeline::Pipeline;
use newsloom::queue::{PgTaskQueue, TaskQueue};
use newsloom::scheduler::Scheduler;
use newsloom::sources::{FeedFetcher, FetcherRegistry};
use newsloom::store::{PgStore, Store};
use newsloom::transport::{EchoTransport, TelegramTransport, Transport};
use newsloom::worker::{Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "newsloom", about = "Content pipeline: collect, generate, tag, publish")]
struct Cli {
    /// Run every stage once in pipeline order, then exit.
    #[arg(long)]
    once: bool,

    /// Number of worker loops to run in daemon mode.
    #[arg(long, default_value_t = 2)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    let store = PgStore::connect(&settings.database_url)
        .await
        .context("failed to connect to database")?;
    store.migrate().await.context("failed to run migrations")?;
    let queue: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(store.pool().clone()));
    let store: Arc<dyn Store> = Arc::new(store);

    let mut registry = FetcherRegistry::new();
    registry.register(Box::new(FeedFetcher::new(settings.request_timeout)?));
    let registry = Arc::new(registry);

    let llm: Arc<dyn TextGenerator> = if settings.openai_api_key.is_empty() {
        warn!("OPENAI_API_KEY not set, using the mock generator");
        Arc::new(MockGenerator)
    } else {
        Arc::new(OpenAiGenerator::new(
            settings.openai_api_key.clone(),
            settings.openai_model.clone(),
            settings.request_timeout,
        )?)
    };

    let transport: Arc<dyn Transport> =
        if settings.telegram_bot_token.is_empty() || settings.telegram_channel_id.is_empty() {
            warn!("telegram credentials not set, publishing to the log only");
            Arc::new(EchoTransport)
        } else {
            Arc::new(TelegramTransport::new(
                settings.telegram_bot_token.clone(),
                settings.telegram_channel_id.clone(),
                settings.request_timeout,
            )?)
        };

    let pipeline = Arc::new(Pipeline::new(
        &settings,
        store.clone(),
        queue.clone(),
        registry,
        llm.clone(),
        transport,
    ));

    let health = HealthCheck::new(store.clone(), queue.clone(), llm);
    let report = health.run().await;
    info!(
        store_ok = report.store_ok,
        generator_ok = report.generator_ok,
        queue_pending = ?report.queue_pending,
        "startup health probe"
    );

    if cli.once {
        pipeline.run_all_once().await?;
        return Ok(());
    }

    let scheduler = Scheduler::new(queue.clone(), &settings);
    scheduler.start().await?;

    let mut workers = Vec::with_capacity(cli.workers);
    let mut handles = Vec::with_capacity(cli.workers);
    for n in 0..cli.workers {
        let worker = Arc::new(Worker::new(
            queue.clone(),
            pipeline.clone(),
            WorkerConfig {
                id: format!("worker-{}", n),
                batch: settings.worker_batch,
                poll_interval: settings.worker_poll_interval,
            },
        ));
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };
        workers.push(worker);
        handles.push(handle);
    }

    info!(workers = cli.workers, "newsloom running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    scheduler.stop().await;
    for worker in &workers {
        worker.stop().await;
    }
    // Give the worker loops a moment to notice the stop flag.
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("workers did not stop in time, exiting anyway");
    }

    Ok(())
}
