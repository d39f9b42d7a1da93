//! Worker pool
//!
//! Binds every queue to its handler with the configured concurrency.
//! Check queues route to the protocol executors and feed Result Ingest;
//! rollup queues run the aggregation jobs serially; each channel queue gets
//! its own delivery worker; the cleanup queue runs the retention task.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::cleanup::CleanupTask;
use crate::executor::{JobCtx, executor_for};
use crate::ingest::ResultIngest;
use crate::model::{ChannelType, CheckJob};
use crate::notify::ChannelWorker;
use crate::queue::{Job, JobHandler, QueueRegistry};
use crate::storage::Store;

/// Per-queue concurrency limits
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub http: usize,
    pub dns: usize,
    pub ssl: usize,
    pub tcp: usize,
    pub ping: usize,
    pub traceroute: usize,
    pub stream: usize,
    pub broker: usize,
    pub database: usize,
    pub passive: usize,
    pub aggregate: usize,
    pub notifications: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            http: 50,
            dns: 20,
            ssl: 10,
            tcp: 20,
            ping: 10,
            traceroute: 5,
            stream: 10,
            broker: 10,
            database: 10,
            passive: 10,
            aggregate: 5,
            notifications: 10,
        }
    }
}

/// Executes check jobs and feeds the ingest path
pub struct CheckJobHandler {
    ctx: JobCtx,
    ingest: Arc<ResultIngest>,
}

#[async_trait]
impl JobHandler for CheckJobHandler {
    #[instrument(skip_all, fields(job = %job.id))]
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let check: CheckJob = serde_json::from_value(job.data.clone())?;
        debug!(
            "running {} check for monitor {}",
            check.monitor_type, check.monitor_id
        );

        let outcome = executor_for(check.monitor_type)
            .execute(&check, &self.ctx)
            .await;

        // A control error fails the job for broker retry; the (incomplete)
        // result is discarded and the retry produces a fresh one
        if let Some(control_error) = outcome.control_error {
            return Err(control_error.0);
        }

        self.ingest.ingest(&check.org_id, &outcome.result).await
    }
}

#[derive(Debug, Deserialize)]
struct RollupJobData {
    monitor_id: String,
    bucket_start: DateTime<chrono::Utc>,
}

/// Runs one hourly or daily rollup per job
pub struct RollupHandler {
    store: Arc<dyn Store>,
    daily: bool,
}

#[async_trait]
impl JobHandler for RollupHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let data: RollupJobData = serde_json::from_value(job.data.clone())?;
        if self.daily {
            crate::rollup::run_daily(&self.store, &data.monitor_id, data.bucket_start).await?;
        } else {
            crate::rollup::run_hourly(&self.store, &data.monitor_id, data.bucket_start).await?;
        }
        Ok(())
    }
}

/// Bind every queue the core consumes
pub async fn bind_all(
    queues: &Arc<QueueRegistry>,
    ctx: JobCtx,
    ingest: Arc<ResultIngest>,
    channel_worker: Arc<ChannelWorker>,
    cleanup: Arc<CleanupTask>,
    store: Arc<dyn Store>,
    config: WorkerConfig,
) {
    let check_handler = Arc::new(CheckJobHandler { ctx, ingest });

    let check_queues: [(&str, usize); 11] = [
        ("check:http", config.http),
        ("check:dns", config.dns),
        ("check:ssl", config.ssl),
        ("check:tcp", config.tcp),
        ("check:ping", config.ping),
        ("check:traceroute", config.traceroute),
        ("check:stream", config.stream),
        ("check:broker", config.broker),
        ("check:database", config.database),
        ("check:passive", config.passive),
        ("check:aggregate", config.aggregate),
    ];
    for (queue, concurrency) in check_queues {
        queues
            .bind_worker(queue, concurrency, check_handler.clone())
            .await;
    }

    queues
        .bind_worker(
            "rollup:hourly",
            1,
            Arc::new(RollupHandler {
                store: store.clone(),
                daily: false,
            }),
        )
        .await;
    queues
        .bind_worker(
            "rollup:daily",
            1,
            Arc::new(RollupHandler {
                store,
                daily: true,
            }),
        )
        .await;

    for channel_type in [
        ChannelType::Email,
        ChannelType::Slack,
        ChannelType::Discord,
        ChannelType::Webhook,
        ChannelType::Teams,
        ChannelType::Pagerduty,
        ChannelType::Sms,
        ChannelType::Ntfy,
        ChannelType::Googlechat,
        ChannelType::Irc,
        ChannelType::Twitter,
    ] {
        queues
            .bind_worker(
                channel_type.queue_name(),
                config.notifications,
                channel_worker.clone(),
            )
            .await;
    }

    queues.bind_worker("cleanup", 1, cleanup).await;

    info!("worker pool bound to all queues");
}
