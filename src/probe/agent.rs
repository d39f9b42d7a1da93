//! Probe agent
//!
//! The edge process: heartbeats on one timer, polls for claimed jobs on
//! another, executes each job with the local protocol executors, and posts
//! results back. The agent's environment contract:
//! `PROBE_TOKEN`, `PROBE_POLL_INTERVAL_MS`, `PROBE_HEARTBEAT_MS`,
//! `PROBE_JOB_BATCH_SIZE`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::credentials::PlainCipher;
use crate::executor::{JobCtx, executor_for};
use crate::model::{ProbeMetrics, ProbePendingJob};
use crate::storage::SqliteStore;

use super::service::ProbeResultSubmission;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub hub_url: String,
    pub token: String,
    pub region: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub job_batch_size: u32,
}

impl AgentConfig {
    /// Read the agent contract from the environment
    pub fn from_env() -> anyhow::Result<Self> {
        let env_ms = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(default)
        };

        Ok(Self {
            hub_url: std::env::var("PROBE_HUB_URL")
                .map_err(|_| anyhow::anyhow!("PROBE_HUB_URL is not set"))?,
            token: std::env::var("PROBE_TOKEN")
                .map_err(|_| anyhow::anyhow!("PROBE_TOKEN is not set"))?,
            region: std::env::var("PROBE_REGION").unwrap_or_else(|_| "edge".to_string()),
            poll_interval: Duration::from_millis(env_ms("PROBE_POLL_INTERVAL_MS", 5_000)),
            heartbeat_interval: Duration::from_millis(env_ms("PROBE_HEARTBEAT_MS", 30_000)),
            job_batch_size: env_ms("PROBE_JOB_BATCH_SIZE", 10) as u32,
        })
    }
}

#[derive(Default)]
struct AgentCounters {
    active: AtomicU32,
    completed: AtomicU64,
    failed: AtomicU64,
    /// (sum_ms, samples) for the rolling average
    total_ms: AtomicU64,
    samples: AtomicU64,
}

pub struct ProbeAgent {
    config: AgentConfig,
    http: reqwest::Client,
    counters: Arc<AgentCounters>,
}

impl ProbeAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            counters: Arc::new(AgentCounters::default()),
        }
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            "probe agent starting against {} (poll {:?}, heartbeat {:?})",
            self.config.hub_url, self.config.poll_interval, self.config.heartbeat_interval
        );

        // Local context for the executors; the agent keeps a scratch store
        // only because passive executors read one — network checks never
        // touch it
        let store = Arc::new(SqliteStore::in_memory().await?);
        let ctx = JobCtx::new(self.config.region.clone(), store, Arc::new(PlainCipher));

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!("heartbeat failed: {e:#}");
                    }
                }
                _ = poll.tick() => {
                    match self.poll_jobs().await {
                        Ok(jobs) => {
                            for job in jobs {
                                self.spawn_job(&mut running, &ctx, job);
                            }
                        }
                        Err(e) => warn!("job poll failed: {e:#}"),
                    }
                }
                Some(_) = running.join_next(), if !running.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("probe agent draining {} running job(s)", running.len());
                        while running.join_next().await.is_some() {}
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_job(&self, running: &mut JoinSet<()>, ctx: &JobCtx, job: ProbePendingJob) {
        let ctx = ctx.clone();
        let http = self.http.clone();
        let hub_url = self.config.hub_url.clone();
        let token = self.config.token.clone();
        let counters = Arc::clone(&self.counters);

        running.spawn(async move {
            counters.active.fetch_add(1, Ordering::SeqCst);
            let outcome = run_one(&ctx, &http, &hub_url, &token, &job).await;
            counters.active.fetch_sub(1, Ordering::SeqCst);

            match outcome {
                Ok(elapsed_ms) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                    counters.total_ms.fetch_add(elapsed_ms, Ordering::SeqCst);
                    counters.samples.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    error!("job {} failed: {e:#}", job.id);
                }
            }
        });
    }

    async fn send_heartbeat(&self) -> anyhow::Result<()> {
        let metrics = self.collect_metrics();
        let response = self
            .http
            .post(format!("{}/api/v1/probe/heartbeat", self.config.hub_url))
            .bearer_auth(&self.config.token)
            .json(&metrics)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("hub rejected heartbeat: {}", response.status());
        }
        debug!("heartbeat acknowledged");
        Ok(())
    }

    fn collect_metrics(&self) -> ProbeMetrics {
        let mut sys = System::new_all();
        sys.refresh_all();

        let cpus = sys.cpus();
        let cpu_usage = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };
        let memory_usage = if sys.total_memory() == 0 {
            0.0
        } else {
            sys.used_memory() as f32 / sys.total_memory() as f32 * 100.0
        };

        let samples = self.counters.samples.load(Ordering::SeqCst);
        let avg_response_time = (samples > 0).then(|| {
            self.counters.total_ms.load(Ordering::SeqCst) as f64 / samples as f64
        });

        ProbeMetrics {
            cpu_usage,
            memory_usage,
            active_jobs: self.counters.active.load(Ordering::SeqCst),
            completed_jobs: self.counters.completed.load(Ordering::SeqCst),
            failed_jobs: self.counters.failed.load(Ordering::SeqCst),
            avg_response_time,
        }
    }

    async fn poll_jobs(&self) -> anyhow::Result<Vec<ProbePendingJob>> {
        let response = self
            .http
            .post(format!("{}/api/v1/probe/jobs/poll", self.config.hub_url))
            .bearer_auth(&self.config.token)
            .json(&serde_json::json!({ "batch_size": self.config.job_batch_size }))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("hub rejected poll: {}", response.status());
        }
        Ok(response.json().await?)
    }
}

/// Execute one claimed job locally and post the result back
#[instrument(skip_all, fields(job = %job.id, monitor = %job.monitor_id))]
async fn run_one(
    ctx: &JobCtx,
    http: &reqwest::Client,
    hub_url: &str,
    token: &str,
    job: &ProbePendingJob,
) -> anyhow::Result<u64> {
    let outcome = executor_for(job.job_data.monitor_type)
        .execute(&job.job_data, ctx)
        .await;
    let result = outcome.result;
    let elapsed_ms = result.response_time_ms.unwrap_or(0);

    let submission = ProbeResultSubmission {
        status: result.status,
        response_time_ms: result.response_time_ms,
        timings: result.timings,
        error_message: result.error_message,
        error_code: result.error_code,
        status_code: result.status_code,
        payload: result.payload,
    };

    let response = http
        .post(format!("{hub_url}/api/v1/probe/jobs/{}/result", job.id))
        .bearer_auth(token)
        .json(&submission)
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!("hub rejected result: {}", response.status());
    }
    Ok(elapsed_ms)
}
