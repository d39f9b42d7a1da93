use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use vigil::alert::AlertEvaluator;
use vigil::bus::EventBus;
use vigil::cleanup::CleanupTask;
use vigil::config::{HubConfig, read_config_file};
use vigil::credentials::{CredentialCipher, PlainCipher};
use vigil::executor::JobCtx;
use vigil::hooks::Capabilities;
use vigil::ingest::ResultIngest;
use vigil::notify::{ChannelWorker, NotificationDispatcher};
use vigil::probe::{ProbeService, probe_router};
use vigil::queue::QueueRegistry;
use vigil::scheduler::{Scheduler, SchedulerConfig};
use vigil::storage::{SqliteStore, Store};
use vigil::worker::{WorkerConfig, bind_all};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<String>,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("vigil", LevelFilter::TRACE),
        ("vigil_hub", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let mut config = match &args.file {
        Some(path) => read_config_file(path)?,
        None => HubConfig::default(),
    };
    config.merge_env_senders();

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return Err(anyhow::anyhow!("configuration validation failed: {e}"));
    }

    run_hub(config).await
}

/// Construction order: credentials, store, broker registry, event bus,
/// dispatcher, evaluator, ingest, workers, scheduler.
async fn run_hub(config: HubConfig) -> anyhow::Result<()> {
    let region = config.effective_region();
    info!("starting hub (region {region})");

    let cipher: Arc<dyn CredentialCipher> = Arc::new(PlainCipher);
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&config.db_path).await?);
    info!("store ready at {:?}", config.db_path);

    let queues = QueueRegistry::new();
    let bus = EventBus::new();
    let capabilities = Capabilities::new();

    let dispatcher = Arc::new(NotificationDispatcher::new(
        store.clone(),
        queues.clone(),
        cipher.clone(),
        capabilities.clone(),
        config.dashboard_url.clone(),
    ));
    let evaluator = Arc::new(AlertEvaluator::new(
        store.clone(),
        bus.clone(),
        dispatcher,
        capabilities.clone(),
    ));
    let ingest = Arc::new(ResultIngest::new(store.clone(), bus.clone(), evaluator));

    let ctx = JobCtx::new(region, store.clone(), cipher);
    let channel_worker = ChannelWorker::new(store.clone(), config.senders.clone());
    let cleanup = CleanupTask::new(store.clone(), config.retention.clone());

    bind_all(
        &queues,
        ctx,
        ingest.clone(),
        channel_worker,
        cleanup,
        store.clone(),
        WorkerConfig::default(),
    )
    .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        store.clone(),
        queues.clone(),
        SchedulerConfig {
            poll_interval: std::time::Duration::from_secs(config.poll_interval_seconds),
            ..Default::default()
        },
        shutdown_rx.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());
    info!("scheduler started");

    // Probe wire API, when enabled
    if let Some(bind) = &config.probe_api_bind {
        let service = ProbeService::new(store.clone(), ingest.clone());
        let router = probe_router(service)
            .layer(tower_http::trace::TraceLayer::new_for_http());
        let listener = tokio::net::TcpListener::bind(bind).await?;
        info!("probe API listening on {bind}");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("probe API server failed: {e}");
            }
        });
    } else {
        info!("probe API disabled (probe_api_bind not configured)");
    }

    info!("hub running, press Ctrl+C to shut down");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }

    let _ = shutdown_tx.send(true);
    queues.shutdown();
    if let Err(e) = scheduler_task.await {
        warn!("scheduler task ended abnormally: {e}");
    }
    info!("hub stopped");
    Ok(())
}
