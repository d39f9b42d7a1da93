//! Store trait definition
//!
//! The control plane is stateless; every piece of cross-worker coordination
//! (scheduling fences, open-alert uniqueness, rollup upserts, probe claims)
//! lives behind this trait. Implementations must be `Send + Sync`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StoreResult;
use crate::model::{
    AlertChannel, AlertHistory, AlertMetadata, AlertPolicy, CheckResult, HeartbeatPing, Incident,
    MaintenanceWindow, Monitor, MonitorStatus, Probe, ProbeAssignment, ProbeMetrics,
    ProbePendingJob, RollupRow, StatusPage, Subscriber,
};

/// Maintenance-window notification slot; each is sent at most once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifySlot {
    BeforeStart,
    OnStart,
    OnEnd,
}

/// Trait for the relational store backing the monitoring core
///
/// Check-level data flows in via `insert_check_result`; alert state is
/// serialized through the conditional insert/update methods so two workers
/// can never hold two open alerts for the same (policy, monitor).
#[async_trait]
pub trait Store: Send + Sync {
    // ========================================================================
    // Monitors & scheduling
    // ========================================================================

    /// Monitors due for a regular check: not paused, `next_check_at <= now`,
    /// and not `ssl` (certificates run on their own 24h cadence)
    async fn due_monitors(&self, now: DateTime<Utc>) -> StoreResult<Vec<Monitor>>;

    /// HTTPS/SSL monitors eligible for the daily certificate re-check
    async fn certificate_check_monitors(&self) -> StoreResult<Vec<Monitor>>;

    /// All unpaused monitors (aggregation fan-out)
    async fn active_monitors(&self) -> StoreResult<Vec<Monitor>>;

    async fn get_monitor(&self, id: &str) -> StoreResult<Option<Monitor>>;

    /// Advance the scheduling fence. This is what makes a tick at-most-once:
    /// a monitor whose `next_check_at` moved forward is no longer due.
    async fn advance_monitor_schedule(
        &self,
        id: &str,
        last_checked_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Update the coarse status after a result lands
    async fn update_monitor_status(
        &self,
        id: &str,
        status: MonitorStatus,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Current statuses for a set of monitors (aggregate executor input)
    async fn monitor_statuses(&self, ids: &[String])
        -> StoreResult<Vec<(String, MonitorStatus)>>;

    // ========================================================================
    // Check results
    // ========================================================================

    async fn insert_check_result(&self, result: &CheckResult) -> StoreResult<()>;

    /// Most recent results for a monitor, newest first
    async fn recent_results(&self, monitor_id: &str, limit: u32)
        -> StoreResult<Vec<CheckResult>>;

    /// Results since an instant, newest first
    async fn results_since(
        &self,
        monitor_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<CheckResult>>;

    /// Failure-class results (failure/timeout/error) since an instant
    async fn count_failures_since(
        &self,
        monitor_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Raw results in `[start, end)`, oldest first (rollup input)
    async fn results_in_range(
        &self,
        monitor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<CheckResult>>;

    async fn latest_result(&self, monitor_id: &str) -> StoreResult<Option<CheckResult>>;

    async fn delete_results_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // ========================================================================
    // Heartbeats
    // ========================================================================

    async fn insert_heartbeat(&self, ping: &HeartbeatPing) -> StoreResult<()>;

    async fn latest_heartbeat(&self, monitor_id: &str) -> StoreResult<Option<HeartbeatPing>>;

    async fn delete_heartbeats_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // ========================================================================
    // Rollups
    // ========================================================================

    /// Insert-or-update on (monitor, region, bucket); idempotent
    async fn upsert_hourly_rollup(&self, row: &RollupRow) -> StoreResult<()>;

    async fn upsert_daily_rollup(&self, row: &RollupRow) -> StoreResult<()>;

    /// Hourly rows in `[start, end)` for one monitor, all regions
    async fn hourly_rollups_in_range(
        &self,
        monitor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<RollupRow>>;

    async fn get_hourly_rollup(
        &self,
        monitor_id: &str,
        region: &str,
        bucket_start: DateTime<Utc>,
    ) -> StoreResult<Option<RollupRow>>;

    async fn get_daily_rollup(
        &self,
        monitor_id: &str,
        region: &str,
        bucket_start: DateTime<Utc>,
    ) -> StoreResult<Option<RollupRow>>;

    // ========================================================================
    // Alert policies & channels
    // ========================================================================

    /// Policies linked to the monitor, unioned with org-wide policies
    /// (those with no link rows at all), deduplicated by id
    async fn policies_for_monitor(
        &self,
        org_id: &str,
        monitor_id: &str,
    ) -> StoreResult<Vec<AlertPolicy>>;

    async fn get_channels(&self, ids: &[String]) -> StoreResult<Vec<AlertChannel>>;

    // ========================================================================
    // Alert history
    // ========================================================================

    async fn open_alert(
        &self,
        policy_id: &str,
        monitor_id: &str,
    ) -> StoreResult<Option<AlertHistory>>;

    /// Insert a new `triggered` row. Returns false when another worker won
    /// the race (the partial unique index rejected the insert).
    async fn try_insert_open_alert(&self, alert: &AlertHistory) -> StoreResult<bool>;

    /// Refresh the coalesced metadata on an open alert
    async fn update_alert_metadata(
        &self,
        alert_id: &str,
        metadata: &AlertMetadata,
    ) -> StoreResult<()>;

    /// Transition `triggered -> resolved`; returns false if already resolved
    async fn resolve_alert(
        &self,
        alert_id: &str,
        resolved_at: DateTime<Utc>,
        resolved_by: &str,
    ) -> StoreResult<bool>;

    /// `resolved_at` of the most recently resolved alert for (policy, monitor)
    async fn last_resolved_at(
        &self,
        policy_id: &str,
        monitor_id: &str,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    async fn get_alert(&self, alert_id: &str) -> StoreResult<Option<AlertHistory>>;

    async fn insert_notification_log(
        &self,
        log: &crate::model::NotificationLog,
    ) -> StoreResult<()>;

    // ========================================================================
    // Incidents
    // ========================================================================

    /// The monitor's unresolved incident, if any
    async fn active_incident_for_monitor(
        &self,
        monitor_id: &str,
    ) -> StoreResult<Option<Incident>>;

    /// Idempotent by (incident, check result)
    async fn link_result_to_incident(
        &self,
        incident_id: &str,
        check_result_id: &str,
    ) -> StoreResult<()>;

    // ========================================================================
    // Maintenance windows, status pages, subscribers
    // ========================================================================

    /// Windows active at `now` (`starts_at <= now <= ends_at`)
    async fn active_maintenance_windows(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<MaintenanceWindow>>;

    /// Windows with at least one unsent notification slot
    async fn maintenance_windows_pending_notice(&self) -> StoreResult<Vec<MaintenanceWindow>>;

    /// Atomically set a once-only marker; returns false if it was already set
    async fn mark_window_notified(
        &self,
        window_id: &str,
        slot: NotifySlot,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Public status pages listing any of the given monitors
    async fn pages_listing_monitors(&self, monitor_ids: &[String])
        -> StoreResult<Vec<StatusPage>>;

    async fn verified_subscribers(&self, page_ids: &[String]) -> StoreResult<Vec<Subscriber>>;

    async fn delete_expired_subscriber_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    // ========================================================================
    // Probes
    // ========================================================================

    async fn insert_probe(&self, probe: &Probe) -> StoreResult<()>;

    async fn probe_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Probe>>;

    /// Record a heartbeat: bumps `last_heartbeat_at`, stores metrics, and
    /// flips `offline`/`pending` probes back to `active`
    async fn touch_probe_heartbeat(
        &self,
        probe_id: &str,
        at: DateTime<Utc>,
        metrics: &ProbeMetrics,
    ) -> StoreResult<()>;

    /// Mark probes offline whose last heartbeat predates `cutoff`
    async fn mark_stale_probes_offline(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn assignments_for_monitor(
        &self,
        monitor_id: &str,
    ) -> StoreResult<Vec<ProbeAssignment>>;

    async fn get_probes(&self, ids: &[String]) -> StoreResult<Vec<Probe>>;

    async fn insert_pending_job(&self, job: &ProbePendingJob) -> StoreResult<()>;

    /// Claim up to `limit` pending jobs for a probe (`pending -> claimed`),
    /// atomically, so two polls cannot hand out the same job
    async fn claim_pending_jobs(
        &self,
        probe_id: &str,
        limit: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ProbePendingJob>>;

    /// Complete a claimed job; only the owning probe may complete it.
    /// Returns the job's monitor id, or None when the job is not this
    /// probe's claimed job.
    async fn complete_pending_job(
        &self,
        job_id: &str,
        probe_id: &str,
    ) -> StoreResult<Option<String>>;

    async fn reap_expired_pending_jobs(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    // ========================================================================
    // Misc
    // ========================================================================

    /// Org settings blob (BYO credentials live here, encrypted)
    async fn org_settings(&self, org_id: &str) -> StoreResult<Option<serde_json::Value>>;

    async fn delete_audit_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Lightweight liveness probe of the backend itself
    async fn health_check(&self) -> StoreResult<()>;
}
