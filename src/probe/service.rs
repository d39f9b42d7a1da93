//! Hub-side probe service
//!
//! All operations authenticate by the SHA-256 hash of the probe token; the
//! clear token never touches the database. Claims transition jobs
//! `pending -> claimed` atomically and only the owning probe may complete a
//! job, so a duplicated poll or a hijacked job id cannot double-ingest.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::ingest::ResultIngest;
use crate::model::{
    CheckResult, CheckStatus, ErrorCode, PhaseTimings, Probe, ProbeMetrics, ProbePendingJob,
    ProbeStatus, new_id,
};
use crate::storage::Store;

/// Default number of jobs handed out per poll when the agent asks for none
pub const DEFAULT_JOB_BATCH: u32 = 10;

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// What an agent posts back for one executed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResultSubmission {
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default)]
    pub timings: PhaseTimings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug)]
pub enum ProbeError {
    Unauthorized,
    NotFound(String),
    Store(crate::storage::StoreError),
    Ingest(anyhow::Error),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Unauthorized => write!(f, "unknown or disabled probe token"),
            ProbeError::NotFound(what) => write!(f, "not found: {what}"),
            ProbeError::Store(e) => write!(f, "store error: {e}"),
            ProbeError::Ingest(e) => write!(f, "ingest error: {e:#}"),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<crate::storage::StoreError> for ProbeError {
    fn from(err: crate::storage::StoreError) -> Self {
        ProbeError::Store(err)
    }
}

pub struct ProbeService {
    store: Arc<dyn Store>,
    ingest: Arc<ResultIngest>,
}

impl ProbeService {
    pub fn new(store: Arc<dyn Store>, ingest: Arc<ResultIngest>) -> Arc<Self> {
        Arc::new(Self { store, ingest })
    }

    /// Enroll a new probe; returns the stored row (status `pending` until
    /// the first heartbeat)
    #[instrument(skip(self, token))]
    pub async fn register(
        &self,
        org_id: &str,
        name: &str,
        region: &str,
        token: &str,
    ) -> Result<Probe, ProbeError> {
        let probe = Probe {
            id: new_id(),
            org_id: org_id.to_string(),
            name: name.to_string(),
            region: region.to_string(),
            token_hash: hash_token(token),
            status: ProbeStatus::Pending,
            last_heartbeat_at: None,
            metrics: ProbeMetrics::default(),
        };
        self.store.insert_probe(&probe).await?;
        info!("probe {} registered for org {org_id} ({region})", probe.id);
        Ok(probe)
    }

    async fn authenticate(&self, token: &str) -> Result<Probe, ProbeError> {
        let probe = self
            .store
            .probe_by_token_hash(&hash_token(token))
            .await?
            .ok_or(ProbeError::Unauthorized)?;
        if probe.status == ProbeStatus::Disabled {
            return Err(ProbeError::Unauthorized);
        }
        Ok(probe)
    }

    #[instrument(skip(self, token, metrics))]
    pub async fn heartbeat(
        &self,
        token: &str,
        metrics: &ProbeMetrics,
        now: DateTime<Utc>,
    ) -> Result<Probe, ProbeError> {
        let probe = self.authenticate(token).await?;
        self.store
            .touch_probe_heartbeat(&probe.id, now, metrics)
            .await?;
        debug!("heartbeat from probe {} ({} active jobs)", probe.id, metrics.active_jobs);
        Ok(probe)
    }

    /// Hand out up to `batch` claimable jobs
    #[instrument(skip(self, token))]
    pub async fn poll_jobs(
        &self,
        token: &str,
        batch: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProbePendingJob>, ProbeError> {
        let probe = self.authenticate(token).await?;
        let jobs = self
            .store
            .claim_pending_jobs(&probe.id, batch.unwrap_or(DEFAULT_JOB_BATCH).max(1), now)
            .await?;
        if !jobs.is_empty() {
            debug!("probe {} claimed {} job(s)", probe.id, jobs.len());
        }
        Ok(jobs)
    }

    /// Accept an executed job's result and run the normal ingest path
    #[instrument(skip(self, token, submission))]
    pub async fn submit_result(
        &self,
        token: &str,
        job_id: &str,
        submission: ProbeResultSubmission,
    ) -> Result<String, ProbeError> {
        let probe = self.authenticate(token).await?;

        let Some(monitor_id) = self.store.complete_pending_job(job_id, &probe.id).await? else {
            warn!("probe {} tried to complete foreign or stale job {job_id}", probe.id);
            return Err(ProbeError::NotFound(format!("claimed job {job_id}")));
        };

        let monitor = self
            .store
            .get_monitor(&monitor_id)
            .await?
            .ok_or_else(|| ProbeError::NotFound(format!("monitor {monitor_id}")))?;

        let mut result = CheckResult::new(&monitor.id, &probe.region, submission.status);
        result.response_time_ms = submission.response_time_ms;
        result.timings = submission.timings;
        result.error_message = submission.error_message;
        result.error_code = submission.error_code;
        result.status_code = submission.status_code;
        result.payload = submission.payload;

        let result_id = result.id.clone();
        self.ingest
            .ingest(&monitor.org_id, &result)
            .await
            .map_err(ProbeError::Ingest)?;
        Ok(result_id)
    }
}
