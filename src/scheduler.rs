//! Scheduler
//!
//! Turns wall time into enqueued work, at most once per due tick. The fence
//! is `next_check_at`: it only advances when a monitor is processed, and a
//! monitor whose fence moved forward is no longer due, so no two ticks can
//! enqueue the same interval window.
//!
//! Beyond the main poll loop the scheduler owns the auxiliary timers:
//! maintenance notifications, hourly/daily aggregation fan-out, the daily
//! certificate re-check, and probe health. Each timer gets its own first
//! tick delay so a restart does not burst.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, instrument, warn};

use crate::model::{
    CheckJob, Monitor, MonitorType, PendingJobStatus, ProbePendingJob, ProbeStatus, new_id,
};
use crate::queue::{JobOpts, QueueRegistry};
use crate::storage::{Store, StoreResult};

/// How long a probe may go silent before it is considered offline
pub fn probe_offline_after() -> ChronoDuration {
    ChronoDuration::minutes(2)
}

/// Lifetime of a parked probe job before the reaper collects it
fn pending_job_ttl() -> ChronoDuration {
    ChronoDuration::minutes(5)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Main poll cadence (default 10s)
    pub poll_interval: Duration,
    pub maintenance_interval: Duration,
    pub hourly_rollup_interval: Duration,
    pub daily_rollup_interval: Duration,
    pub certificate_interval: Duration,
    pub probe_health_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(30),
            hourly_rollup_interval: Duration::from_secs(5 * 60),
            daily_rollup_interval: Duration::from_secs(60 * 60),
            certificate_interval: Duration::from_secs(24 * 60 * 60),
            probe_health_interval: Duration::from_secs(60),
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    queues: Arc<QueueRegistry>,
    config: SchedulerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        queues: Arc<QueueRegistry>,
        config: SchedulerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            queues,
            config,
            shutdown_rx,
        }
    }

    /// Run until shutdown. Every timer failure is logged and the loop
    /// continues; the scheduler holds no state the database does not.
    pub async fn run(mut self) {
        info!("scheduler starting (poll every {:?})", self.config.poll_interval);

        let stagger = |offset: Duration, period: Duration| {
            interval_at(Instant::now() + offset, period)
        };

        let mut poll = stagger(Duration::from_secs(1), self.config.poll_interval);
        let mut maintenance = stagger(Duration::from_secs(5), self.config.maintenance_interval);
        let mut hourly = stagger(Duration::from_secs(20), self.config.hourly_rollup_interval);
        let mut daily = stagger(Duration::from_secs(40), self.config.daily_rollup_interval);
        let mut certificates = stagger(Duration::from_secs(90), self.config.certificate_interval);
        let mut probe_health = stagger(Duration::from_secs(10), self.config.probe_health_interval);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.poll_tick(Utc::now()).await {
                        error!("scheduler poll tick failed: {e:#}");
                    }
                }
                _ = maintenance.tick() => {
                    if let Err(e) = crate::maintenance::notice_tick(
                        &self.store, &self.queues, Utc::now(),
                    ).await {
                        error!("maintenance notification tick failed: {e:#}");
                    }
                }
                _ = hourly.tick() => {
                    if let Err(e) = self.enqueue_rollups(Utc::now(), RollupKind::Hourly).await {
                        error!("hourly rollup fan-out failed: {e:#}");
                    }
                }
                _ = daily.tick() => {
                    if let Err(e) = self.enqueue_rollups(Utc::now(), RollupKind::Daily).await {
                        error!("daily rollup fan-out failed: {e:#}");
                    }
                }
                _ = certificates.tick() => {
                    if let Err(e) = self.enqueue_certificate_checks(Utc::now()).await {
                        error!("certificate re-check fan-out failed: {e:#}");
                    }
                }
                _ = probe_health.tick() => {
                    if let Err(e) = self.probe_health_tick(Utc::now()).await {
                        error!("probe health tick failed: {e:#}");
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One main tick: exclude monitors under maintenance, enqueue everything
    /// due, advance each fence
    #[instrument(skip(self))]
    pub async fn poll_tick(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let windows = self.store.active_maintenance_windows(now).await?;
        let excluded: std::collections::HashSet<&str> = windows
            .iter()
            .flat_map(|window| window.affected_monitors.iter().map(String::as_str))
            .collect();

        let due = self.store.due_monitors(now).await?;
        debug!("{} monitor(s) due, {} excluded by maintenance", due.len(), excluded.len());

        for monitor in &due {
            if excluded.contains(monitor.id.as_str()) {
                // not enqueued and not advanced: the window suppresses it
                continue;
            }
            // An individual monitor's failure must not skip the rest
            if let Err(e) = self.schedule_monitor(monitor, now).await {
                warn!("failed to schedule monitor {}: {e:#}", monitor.id);
            }
        }
        Ok(())
    }

    async fn schedule_monitor(&self, monitor: &Monitor, now: DateTime<Utc>) -> anyhow::Result<()> {
        if !monitor.monitor_type.is_passive() {
            let assignments = self.store.assignments_for_monitor(&monitor.id).await?;
            if assignments.is_empty() {
                self.enqueue_check(monitor, now).await;
            } else {
                self.dispatch_to_probes(monitor, assignments, now).await?;
            }
        }

        // Advance the fence regardless; passive and probe-less-probe cases
        // must not hot-loop
        self.store
            .advance_monitor_schedule(
                &monitor.id,
                now,
                now + ChronoDuration::seconds(monitor.interval_seconds as i64),
            )
            .await?;
        Ok(())
    }

    async fn enqueue_check(&self, monitor: &Monitor, now: DateTime<Utc>) {
        let job = CheckJob::from_monitor(monitor);
        let Ok(data) = serde_json::to_value(&job) else {
            warn!("unserializable check job for monitor {}", monitor.id);
            return;
        };

        // Natural dedupe across broker re-deliveries within a tick window
        let job_id = format!("{}-{}", monitor.id, now.timestamp_millis());
        self.queues
            .add(
                monitor.monitor_type.queue_name(),
                data,
                JobOpts {
                    job_id: Some(job_id),
                    ..Default::default()
                },
            )
            .await;
    }

    /// Probe-pinned monitors get parked rows instead of queue jobs. An
    /// exclusive assignment restricts execution to that probe; otherwise
    /// every active assignee runs the check redundantly.
    async fn dispatch_to_probes(
        &self,
        monitor: &Monitor,
        assignments: Vec<crate::model::ProbeAssignment>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let targets: Vec<&crate::model::ProbeAssignment> =
            match assignments.iter().find(|assignment| assignment.exclusive) {
                Some(exclusive) => vec![exclusive],
                None => assignments.iter().collect(),
            };

        let probe_ids: Vec<String> = targets
            .iter()
            .map(|assignment| assignment.probe_id.clone())
            .collect();
        let probes = self.store.get_probes(&probe_ids).await?;

        let mut dispatched = 0usize;
        for assignment in targets {
            let Some(probe) = probes
                .iter()
                .find(|probe| probe.id == assignment.probe_id)
            else {
                continue;
            };
            if probe.status != ProbeStatus::Active {
                continue;
            }

            let job = ProbePendingJob {
                id: new_id(),
                probe_id: probe.id.clone(),
                monitor_id: monitor.id.clone(),
                job_data: CheckJob::from_monitor(monitor),
                status: PendingJobStatus::Pending,
                expires_at: now + pending_job_ttl(),
                created_at: now,
            };
            self.store.insert_pending_job(&job).await?;
            dispatched += 1;
        }

        if dispatched == 0 {
            // All assignees offline: the advanced fence prevents hot looping
            debug!("no active probe for monitor {}, skipping this tick", monitor.id);
        }
        Ok(())
    }

    async fn enqueue_rollups(&self, now: DateTime<Utc>, kind: RollupKind) -> anyhow::Result<()> {
        let monitors = self.store.active_monitors().await?;

        let (queue, bucket) = match kind {
            RollupKind::Hourly => (
                "rollup:hourly",
                crate::rollup::hour_bucket(now - ChronoDuration::hours(1)),
            ),
            RollupKind::Daily => (
                "rollup:daily",
                crate::rollup::day_bucket(now - ChronoDuration::days(1)),
            ),
        };

        for monitor in monitors {
            let data = serde_json::json!({
                "monitor_id": monitor.id,
                "bucket_start": bucket,
            });
            let job_id = format!("{queue}-{}-{}", monitor.id, bucket.timestamp());
            self.queues
                .add(
                    queue,
                    data,
                    JobOpts {
                        job_id: Some(job_id),
                        ..Default::default()
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Daily certificate sweep: every HTTPS/SSL monitor gets an SSL check
    /// and a CT diff
    async fn enqueue_certificate_checks(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let monitors = self.store.certificate_check_monitors().await?;
        debug!("certificate re-check: {} candidate monitor(s)", monitors.len());

        for monitor in monitors {
            let mut ssl_job = CheckJob::from_monitor(&monitor);
            ssl_job.monitor_type = MonitorType::Ssl;
            if let Ok(data) = serde_json::to_value(&ssl_job) {
                let job_id = format!("cert-{}-{}", monitor.id, now.timestamp_millis());
                self.queues
                    .add(
                        MonitorType::Ssl.queue_name(),
                        data,
                        JobOpts {
                            job_id: Some(job_id),
                            ..Default::default()
                        },
                    )
                    .await;
            }

            let mut ct_job = CheckJob::from_monitor(&monitor);
            ct_job.monitor_type = MonitorType::CertificateTransparency;
            if let Ok(data) = serde_json::to_value(&ct_job) {
                let job_id = format!("ct-{}-{}", monitor.id, now.timestamp_millis());
                self.queues
                    .add(
                        MonitorType::CertificateTransparency.queue_name(),
                        data,
                        JobOpts {
                            job_id: Some(job_id),
                            ..Default::default()
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn probe_health_tick(&self, now: DateTime<Utc>) -> StoreResult<()> {
        let offlined = self
            .store
            .mark_stale_probes_offline(now - probe_offline_after())
            .await?;
        if offlined > 0 {
            warn!("marked {offlined} probe(s) offline (no heartbeat for 2m)");
        }

        let reaped = self.store.reap_expired_pending_jobs(now).await?;
        if reaped > 0 {
            debug!("reaped {reaped} expired probe job(s)");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum RollupKind {
    Hourly,
    Daily,
}
