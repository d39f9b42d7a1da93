//! Job queue contract and in-process broker
//!
//! The core treats the work queue abstractly: named queues with
//! at-least-once delivery, per-job retry with exponential backoff, delayed
//! jobs, and job-id dedupe. `QueueRegistry` is built once at process start
//! and passed into the scheduler, workers, evaluator and dispatcher; nothing
//! constructs queue handles at module load.
//!
//! ## Delivery flow
//!
//! ```text
//! add(data, opts) → [delay timer] → dispatcher → semaphore permit → handler
//!                                        ↑                            |
//!                                        └──── retry with backoff ────┘ (on Err)
//! ```
//!
//! A handler error re-enqueues the job until `attempts` is exhausted, then
//! `on_exhausted` runs exactly once (dead-letter hook).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, trace, warn};

use crate::model::new_id;

/// Retry backoff strategy
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Delay doubles per attempt, starting at `base`, capped at `cap`
    Exponential { base: Duration, cap: Duration },
    /// Constant delay between attempts
    Fixed(Duration),
}

impl Backoff {
    /// Delay before the given retry (attempt is 1-based: the attempt that
    /// just failed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, cap } => {
                let exp = attempt.saturating_sub(1).min(16);
                let delay = base.saturating_mul(2u32.saturating_pow(exp));
                delay.min(*cap)
            }
            Backoff::Fixed(delay) => *delay,
        }
    }
}

/// Options for enqueueing a job
#[derive(Debug, Clone)]
pub struct JobOpts {
    /// Stable id; a second add with the same id while the first is still
    /// queued or running is dropped (natural dedupe)
    pub job_id: Option<String>,
    /// Initial delay before the job becomes runnable
    pub delay: Option<Duration>,
    /// Total attempts including the first
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for JobOpts {
    fn default() -> Self {
        Self {
            job_id: None,
            delay: None,
            attempts: 1,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
        }
    }
}

impl JobOpts {
    /// The delivery profile used for notification jobs: 5 attempts,
    /// exponential backoff from 1s capped at 16s
    pub fn notification(job_id: String) -> Self {
        Self {
            job_id: Some(job_id),
            delay: None,
            attempts: 5,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(16),
            },
        }
    }
}

/// A job as seen by a handler
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub data: serde_json::Value,
    /// 1-based attempt counter
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Job {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handler bound to a queue by the worker pool
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one job. An `Err` is a control-plane failure and triggers a
    /// retry; check-level failures must be data, not errors.
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;

    /// Called once after the final attempt failed (dead-letter hook)
    async fn on_exhausted(&self, _job: &Job, _error: &anyhow::Error) {}
}

struct QueuedJob {
    job: Job,
    backoff: Backoff,
}

enum QueueMessage {
    Run(QueuedJob),
    /// Job finished (ok, exhausted, or deduped away): release its id
    Release(String),
}

struct QueueInner {
    name: String,
    tx: mpsc::UnboundedSender<QueueMessage>,
    /// Ids currently queued, delayed, or running
    in_flight: Mutex<HashSet<String>>,
}

/// Handle to one named queue
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    /// Enqueue a job. Returns the job id, or None when deduped away.
    #[instrument(skip(self, data, opts), fields(queue = %self.inner.name))]
    pub async fn add(&self, data: serde_json::Value, opts: JobOpts) -> Option<String> {
        let id = opts.job_id.unwrap_or_else(new_id);

        {
            let mut in_flight = self.inner.in_flight.lock().await;
            if !in_flight.insert(id.clone()) {
                trace!("job {id} already queued, deduped");
                return None;
            }
        }

        let queued = QueuedJob {
            job: Job {
                id: id.clone(),
                queue: self.inner.name.clone(),
                data,
                attempt: 1,
                max_attempts: opts.attempts.max(1),
            },
            backoff: opts.backoff,
        };

        if let Some(delay) = opts.delay {
            let tx = self.inner.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(QueueMessage::Run(queued));
            });
        } else if self.inner.tx.send(QueueMessage::Run(queued)).is_err() {
            warn!("queue {} is shut down, dropping job {id}", self.inner.name);
            return None;
        }

        Some(id)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// Registry of named queues, built once at process start
///
/// `queue()` creates queues lazily; `bind_worker` attaches a handler with a
/// concurrency limit. Construction order at boot: credentials, store,
/// registry, scheduler, workers.
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, Queue>>,
    receivers: Mutex<HashMap<String, mpsc::UnboundedReceiver<QueueMessage>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl QueueRegistry {
    pub fn new() -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// Get or create the named queue
    pub async fn queue(&self, name: &str) -> Queue {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(name) {
            return queue.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Queue {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                tx,
                in_flight: Mutex::new(HashSet::new()),
            }),
        };
        queues.insert(name.to_string(), queue.clone());
        self.receivers.lock().await.insert(name.to_string(), rx);
        queue
    }

    /// Shorthand: enqueue onto a named queue
    pub async fn add(&self, name: &str, data: serde_json::Value, opts: JobOpts) -> Option<String> {
        self.queue(name).await.add(data, opts).await
    }

    /// Bind a handler to a queue with the given concurrency
    ///
    /// Spawns the dispatcher task. Each queue can be bound at most once;
    /// a second bind gets no receiver and logs an error.
    pub async fn bind_worker(
        self: &Arc<Self>,
        name: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) {
        let queue = self.queue(name).await;
        let Some(rx) = self.receivers.lock().await.remove(name) else {
            error!("queue {name} is already bound to a worker");
            return;
        };

        let shutdown_rx = self.shutdown_tx.subscribe();
        let dispatcher = Dispatcher {
            queue,
            handler,
            concurrency: concurrency.max(1),
        };
        tokio::spawn(dispatcher.run(rx, shutdown_rx));
        debug!("worker bound to queue {name} (concurrency {concurrency})");
    }

    /// Stop all dispatchers. In-flight jobs finish; queued jobs are dropped.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Dispatcher {
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
}

impl Dispatcher {
    #[instrument(skip_all, fields(queue = %self.queue.inner.name))]
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<QueueMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(QueueMessage::Run(queued)) => {
                            let Ok(permit) =
                                Arc::clone(&semaphore).acquire_owned().await
                            else {
                                break;
                            };
                            let handler = Arc::clone(&self.handler);
                            let queue = self.queue.clone();
                            tasks.spawn(async move {
                                let _permit = permit;
                                Self::run_job(queue, handler, queued).await;
                            });
                        }
                        Some(QueueMessage::Release(id)) => {
                            self.queue.inner.in_flight.lock().await.remove(&id);
                        }
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("dispatcher shutting down");
                        break;
                    }
                }
                // Reap finished job tasks so the JoinSet stays bounded
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Grace period for in-flight jobs
        while tasks.join_next().await.is_some() {}
    }

    async fn run_job(queue: Queue, handler: Arc<dyn JobHandler>, queued: QueuedJob) {
        let QueuedJob { job, backoff } = queued;

        match handler.handle(&job).await {
            Ok(()) => {
                trace!("job {} on {} succeeded (attempt {})", job.id, job.queue, job.attempt);
                let _ = queue.inner.tx.send(QueueMessage::Release(job.id));
            }
            Err(e) if job.is_final_attempt() => {
                warn!(
                    "job {} on {} exhausted after {} attempts: {e:#}",
                    job.id, job.queue, job.attempt
                );
                handler.on_exhausted(&job, &e).await;
                let _ = queue.inner.tx.send(QueueMessage::Release(job.id));
            }
            Err(e) => {
                let delay = backoff.delay_for(job.attempt);
                debug!(
                    "job {} on {} failed (attempt {}/{}), retrying in {delay:?}: {e:#}",
                    job.id, job.queue, job.attempt, job.max_attempts
                );

                let retry = QueuedJob {
                    job: Job {
                        attempt: job.attempt + 1,
                        ..job
                    },
                    backoff,
                };
                let tx = queue.inner.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(QueueMessage::Run(retry));
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
        exhausted: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                anyhow::bail!("induced failure {n}");
            }
            Ok(())
        }

        async fn on_exhausted(&self, _job: &Job, _error: &anyhow::Error) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler(fail_first: u32) -> Arc<CountingHandler> {
        Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first,
            exhausted: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_job_runs_once_on_success() {
        let registry = QueueRegistry::new();
        let h = handler(0);
        registry.bind_worker("t", 2, h.clone()).await;

        registry
            .add("t", serde_json::json!({}), JobOpts::default())
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.exhausted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let registry = QueueRegistry::new();
        let h = handler(2);
        registry.bind_worker("t", 1, h.clone()).await;

        registry
            .add(
                "t",
                serde_json::json!({}),
                JobOpts {
                    attempts: 5,
                    backoff: Backoff::Fixed(Duration::from_millis(10)),
                    ..Default::default()
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.exhausted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let registry = QueueRegistry::new();
        let h = handler(u32::MAX);
        registry.bind_worker("t", 1, h.clone()).await;

        registry
            .add(
                "t",
                serde_json::json!({}),
                JobOpts {
                    attempts: 3,
                    backoff: Backoff::Fixed(Duration::from_millis(5)),
                    ..Default::default()
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_job_id_dedupe() {
        let registry = QueueRegistry::new();
        let h = handler(0);
        registry.bind_worker("t", 1, h.clone()).await;

        let opts = || JobOpts {
            job_id: Some("same-id".to_string()),
            // Keep the first job queued long enough for the dupe to arrive
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let first = registry.add("t", serde_json::json!({}), opts()).await;
        let second = registry.add("t", serde_json::json!({}), opts()).await;

        assert_eq!(first.as_deref(), Some("same-id"));
        assert_eq!(second, None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(16),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(16));
        assert_eq!(backoff.delay_for(30), Duration::from_secs(16));
    }
}
