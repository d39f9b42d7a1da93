//! SQLite store implementation
//!
//! ## Features
//!
//! - **Embedded**: no separate database server required
//! - **WAL mode**: concurrent reads while workers write results
//! - **Connection pooling**: one pool shared by every subsystem
//! - **Migrations**: automatic schema versioning with sqlx
//!
//! The open-alert invariant is enforced here by the partial unique index on
//! `alert_history` plus `ON CONFLICT DO NOTHING` inserts, so concurrent
//! evaluators cannot open duplicate alerts regardless of interleaving.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::backend::{NotifySlot, Store};
use super::error::{StoreError, StoreResult};
use crate::model::{
    AlertChannel, AlertHistory, AlertMetadata, AlertPolicy, AlertStatus, ChannelType, CheckJob,
    CheckResult, CheckStatus, ErrorCode, HeartbeatPing, HeartbeatStatus, Incident,
    IncidentSeverity, IncidentStatus, MaintenanceWindow, Monitor, MonitorStatus, MonitorType,
    NotificationLog, NotifyPolicy, PendingJobStatus, PhaseTimings, Probe, ProbeAssignment,
    ProbeMetrics, ProbePendingJob, ProbeStatus, RollupRow, SentMarkers, StatusPage, Subscriber,
};

/// SQLite-backed store
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) and migrate the database at `db_path`
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite store at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self { pool })
    }

    /// In-memory database, used by tests
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        // A single connection: every handle must see the same :memory: db
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    fn ts(dt: DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn ts_opt(dt: Option<DateTime<Utc>>) -> Option<i64> {
        dt.map(|d| d.timestamp_millis())
    }

    fn from_ts(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn from_ts_opt(millis: Option<i64>) -> Option<DateTime<Utc>> {
        millis.and_then(DateTime::from_timestamp_millis)
    }

    fn json<T: serde::Serialize>(value: &T) -> StoreResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn monitor_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Monitor> {
        let type_str: String = row.get("monitor_type");
        let monitor_type = MonitorType::parse(&type_str).ok_or_else(|| {
            StoreError::SerializationError(format!("unknown monitor type: {type_str}"))
        })?;
        let status: String = row.get("status");

        Ok(Monitor {
            id: row.get("id"),
            org_id: row.get("org_id"),
            name: row.get("name"),
            monitor_type,
            url: row.get("url"),
            method: row.get("method"),
            headers: serde_json::from_str(row.get::<&str, _>("headers"))?,
            body: row.get("body"),
            interval_seconds: row.get::<i64, _>("interval_seconds") as u32,
            timeout_ms: row.get::<i64, _>("timeout_ms") as u64,
            degraded_threshold_ms: row
                .get::<Option<i64>, _>("degraded_threshold_ms")
                .map(|v| v as u64),
            assertions: serde_json::from_str(row.get::<&str, _>("assertions"))?,
            config: serde_json::from_str(row.get::<&str, _>("config"))?,
            regions: serde_json::from_str(row.get::<&str, _>("regions"))?,
            paused: row.get::<i64, _>("paused") != 0,
            status: MonitorStatus::parse(&status),
            last_checked_at: Self::from_ts_opt(row.get("last_checked_at")),
            next_check_at: Self::from_ts_opt(row.get("next_check_at")),
            created_at: Self::from_ts(row.get("created_at")),
            updated_at: Self::from_ts(row.get("updated_at")),
        })
    }

    fn result_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<CheckResult> {
        let status: String = row.get("status");
        let error_code: Option<String> = row.get("error_code");

        Ok(CheckResult {
            id: row.get("id"),
            monitor_id: row.get("monitor_id"),
            region: row.get("region"),
            status: CheckStatus::parse(&status),
            response_time_ms: row.get::<Option<i64>, _>("response_time_ms").map(|v| v as u64),
            timings: PhaseTimings {
                dns_ms: row.get::<Option<i64>, _>("dns_ms").map(|v| v as u64),
                tcp_ms: row.get::<Option<i64>, _>("tcp_ms").map(|v| v as u64),
                tls_ms: row.get::<Option<i64>, _>("tls_ms").map(|v| v as u64),
            },
            error_message: row.get("error_message"),
            error_code: error_code.as_deref().and_then(ErrorCode::parse),
            status_code: row.get::<Option<i64>, _>("status_code").map(|v| v as u16),
            payload: serde_json::from_str(row.get::<&str, _>("payload"))?,
            created_at: Self::from_ts(row.get("created_at")),
        })
    }

    fn policy_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<AlertPolicy> {
        Ok(AlertPolicy {
            id: row.get("id"),
            org_id: row.get("org_id"),
            name: row.get("name"),
            enabled: row.get::<i64, _>("enabled") != 0,
            conditions: serde_json::from_str(row.get::<&str, _>("conditions"))?,
            channels: serde_json::from_str(row.get::<&str, _>("channels"))?,
            cooldown_minutes: row.get::<i64, _>("cooldown_minutes") as u32,
            escalation_policy_id: row.get("escalation_policy_id"),
            oncall_rotation_id: row.get("oncall_rotation_id"),
        })
    }

    fn alert_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<AlertHistory> {
        let status: String = row.get("status");
        Ok(AlertHistory {
            id: row.get("id"),
            org_id: row.get("org_id"),
            monitor_id: row.get("monitor_id"),
            policy_id: row.get("policy_id"),
            status: AlertStatus::parse(&status),
            triggered_at: Self::from_ts(row.get("triggered_at")),
            resolved_at: Self::from_ts_opt(row.get("resolved_at")),
            resolved_by: row.get("resolved_by"),
            metadata: serde_json::from_str(row.get::<&str, _>("metadata"))?,
        })
    }

    fn window_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<MaintenanceWindow> {
        let notify: NotifyPolicy = serde_json::from_str(row.get::<&str, _>("notify_subscribers"))?;
        Ok(MaintenanceWindow {
            id: row.get("id"),
            org_id: row.get("org_id"),
            name: row.get("name"),
            starts_at: Self::from_ts(row.get("starts_at")),
            ends_at: Self::from_ts(row.get("ends_at")),
            affected_monitors: serde_json::from_str(row.get::<&str, _>("affected_monitors"))?,
            notify_subscribers: notify,
            notifications_sent: SentMarkers {
                before_start_at: Self::from_ts_opt(row.get("before_start_at")),
                on_start_at: Self::from_ts_opt(row.get("on_start_at")),
                on_end_at: Self::from_ts_opt(row.get("on_end_at")),
            },
        })
    }

    fn probe_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Probe> {
        let status: String = row.get("status");
        Ok(Probe {
            id: row.get("id"),
            org_id: row.get("org_id"),
            name: row.get("name"),
            region: row.get("region"),
            token_hash: row.get("token_hash"),
            status: ProbeStatus::parse(&status),
            last_heartbeat_at: Self::from_ts_opt(row.get("last_heartbeat_at")),
            metrics: serde_json::from_str(row.get::<&str, _>("metrics")).unwrap_or_default(),
        })
    }

    fn pending_job_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<ProbePendingJob> {
        let status: String = row.get("status");
        let job_data: CheckJob = serde_json::from_str(row.get::<&str, _>("job_data"))?;
        Ok(ProbePendingJob {
            id: row.get("id"),
            probe_id: row.get("probe_id"),
            monitor_id: row.get("monitor_id"),
            job_data,
            status: PendingJobStatus::parse(&status),
            expires_at: Self::from_ts(row.get("expires_at")),
            created_at: Self::from_ts(row.get("created_at")),
        })
    }

    fn rollup_from_row(row: &sqlx::sqlite::SqliteRow) -> RollupRow {
        RollupRow {
            monitor_id: row.get("monitor_id"),
            region: row.get("region"),
            bucket_start: Self::from_ts(row.get("bucket_start")),
            avg_response_time_ms: row.get("avg_response_time_ms"),
            min_response_time_ms: row
                .get::<Option<i64>, _>("min_response_time_ms")
                .map(|v| v as u64),
            max_response_time_ms: row
                .get::<Option<i64>, _>("max_response_time_ms")
                .map(|v| v as u64),
            p50: row.get::<Option<i64>, _>("p50").map(|v| v as u64),
            p75: row.get::<Option<i64>, _>("p75").map(|v| v as u64),
            p90: row.get::<Option<i64>, _>("p90").map(|v| v as u64),
            p95: row.get::<Option<i64>, _>("p95").map(|v| v as u64),
            p99: row.get::<Option<i64>, _>("p99").map(|v| v as u64),
            success_count: row.get::<i64, _>("success_count") as u64,
            degraded_count: row.get::<i64, _>("degraded_count") as u64,
            failure_count: row.get::<i64, _>("failure_count") as u64,
            total_count: row.get::<i64, _>("total_count") as u64,
            uptime_percentage: row.get("uptime_percentage"),
        }
    }

    async fn upsert_rollup(&self, table: &str, row: &RollupRow) -> StoreResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (
                monitor_id, region, bucket_start,
                avg_response_time_ms, min_response_time_ms, max_response_time_ms,
                p50, p75, p90, p95, p99,
                success_count, degraded_count, failure_count, total_count,
                uptime_percentage
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (monitor_id, region, bucket_start) DO UPDATE SET
                avg_response_time_ms = excluded.avg_response_time_ms,
                min_response_time_ms = excluded.min_response_time_ms,
                max_response_time_ms = excluded.max_response_time_ms,
                p50 = excluded.p50,
                p75 = excluded.p75,
                p90 = excluded.p90,
                p95 = excluded.p95,
                p99 = excluded.p99,
                success_count = excluded.success_count,
                degraded_count = excluded.degraded_count,
                failure_count = excluded.failure_count,
                total_count = excluded.total_count,
                uptime_percentage = excluded.uptime_percentage
            "#
        );

        sqlx::query(&sql)
            .bind(&row.monitor_id)
            .bind(&row.region)
            .bind(Self::ts(row.bucket_start))
            .bind(row.avg_response_time_ms)
            .bind(row.min_response_time_ms.map(|v| v as i64))
            .bind(row.max_response_time_ms.map(|v| v as i64))
            .bind(row.p50.map(|v| v as i64))
            .bind(row.p75.map(|v| v as i64))
            .bind(row.p90.map(|v| v as i64))
            .bind(row.p95.map(|v| v as i64))
            .bind(row.p99.map(|v| v as i64))
            .bind(row.success_count as i64)
            .bind(row.degraded_count as i64)
            .bind(row.failure_count as i64)
            .bind(row.total_count as i64)
            .bind(row.uptime_percentage)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_rollup(
        &self,
        table: &str,
        monitor_id: &str,
        region: &str,
        bucket_start: DateTime<Utc>,
    ) -> StoreResult<Option<RollupRow>> {
        let sql = format!(
            "SELECT * FROM {table} WHERE monitor_id = ? AND region = ? AND bucket_start = ?"
        );
        let row = sqlx::query(&sql)
            .bind(monitor_id)
            .bind(region)
            .bind(Self::ts(bucket_start))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::rollup_from_row(&r)))
    }

    // Test and tooling surface: the core never creates monitors itself, but
    // integration tests and fixtures need a way to seed them.
    pub async fn insert_monitor(&self, monitor: &Monitor) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO monitors (
                id, org_id, name, monitor_type, url, method, headers, body,
                interval_seconds, timeout_ms, degraded_threshold_ms, assertions,
                config, regions, paused, status, last_checked_at, next_check_at,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&monitor.id)
        .bind(&monitor.org_id)
        .bind(&monitor.name)
        .bind(monitor.monitor_type.as_str())
        .bind(&monitor.url)
        .bind(&monitor.method)
        .bind(Self::json(&monitor.headers)?)
        .bind(&monitor.body)
        .bind(monitor.interval_seconds as i64)
        .bind(monitor.timeout_ms as i64)
        .bind(monitor.degraded_threshold_ms.map(|v| v as i64))
        .bind(Self::json(&monitor.assertions)?)
        .bind(Self::json(&monitor.config)?)
        .bind(Self::json(&monitor.regions)?)
        .bind(monitor.paused as i64)
        .bind(monitor.status.as_str())
        .bind(Self::ts_opt(monitor.last_checked_at))
        .bind(Self::ts_opt(monitor.next_check_at))
        .bind(Self::ts(monitor.created_at))
        .bind(Self::ts(monitor.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_policy(&self, policy: &AlertPolicy) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_policies (
                id, org_id, name, enabled, conditions, channels, cooldown_minutes,
                escalation_policy_id, oncall_rotation_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&policy.id)
        .bind(&policy.org_id)
        .bind(&policy.name)
        .bind(policy.enabled as i64)
        .bind(Self::json(&policy.conditions)?)
        .bind(Self::json(&policy.channels)?)
        .bind(policy.cooldown_minutes as i64)
        .bind(&policy.escalation_policy_id)
        .bind(&policy.oncall_rotation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn link_policy(&self, monitor_id: &str, policy_id: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO monitor_alert_policies (monitor_id, policy_id) VALUES (?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(monitor_id)
        .bind(policy_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_channel(&self, channel: &AlertChannel) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO alert_channels (id, org_id, channel_type, config, enabled)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&channel.id)
        .bind(&channel.org_id)
        .bind(channel.channel_type.as_str())
        .bind(Self::json(&channel.config)?)
        .bind(channel.enabled as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_maintenance_window(&self, window: &MaintenanceWindow) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO maintenance_windows (
                id, org_id, name, starts_at, ends_at, affected_monitors,
                notify_subscribers, before_start_at, on_start_at, on_end_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&window.id)
        .bind(&window.org_id)
        .bind(&window.name)
        .bind(Self::ts(window.starts_at))
        .bind(Self::ts(window.ends_at))
        .bind(Self::json(&window.affected_monitors)?)
        .bind(Self::json(&window.notify_subscribers)?)
        .bind(Self::ts_opt(window.notifications_sent.before_start_at))
        .bind(Self::ts_opt(window.notifications_sent.on_start_at))
        .bind(Self::ts_opt(window.notifications_sent.on_end_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_incident(&self, incident: &Incident) -> StoreResult<()> {
        let severity = match incident.severity {
            IncidentSeverity::Minor => "minor",
            IncidentSeverity::Major => "major",
            IncidentSeverity::Critical => "critical",
        };
        sqlx::query(
            r#"
            INSERT INTO incidents (
                id, org_id, title, severity, status, started_at, resolved_at,
                affected_monitors
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&incident.id)
        .bind(&incident.org_id)
        .bind(&incident.title)
        .bind(severity)
        .bind(incident.status.as_str())
        .bind(Self::ts(incident.started_at))
        .bind(Self::ts_opt(incident.resolved_at))
        .bind(Self::json(&incident.affected_monitors)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_assignment(&self, assignment: &ProbeAssignment) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO probe_assignments (probe_id, monitor_id, priority, exclusive)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&assignment.probe_id)
        .bind(&assignment.monitor_id)
        .bind(assignment.priority as i64)
        .bind(assignment.exclusive as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_status_page(&self, page: &StatusPage) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO status_pages (id, org_id, name, monitors, public)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&page.id)
        .bind(&page.org_id)
        .bind(&page.name)
        .bind(Self::json(&page.monitors)?)
        .bind(page.public as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_subscriber(&self, sub: &Subscriber) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscribers (
                id, page_id, email, verified, token, token_expires_at, email_enabled
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sub.id)
        .bind(&sub.page_id)
        .bind(&sub.email)
        .bind(sub.verified as i64)
        .bind(&sub.token)
        .bind(Self::ts_opt(sub.token_expires_at))
        .bind(sub.email_enabled as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn notification_logs_for_alert(
        &self,
        alert_history_id: &str,
    ) -> StoreResult<Vec<NotificationLog>> {
        let rows = sqlx::query(
            "SELECT * FROM notification_logs WHERE alert_history_id = ? ORDER BY sent_at",
        )
        .bind(alert_history_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| NotificationLog {
                id: row.get("id"),
                alert_history_id: row.get("alert_history_id"),
                channel_id: row.get("channel_id"),
                success: row.get::<i64, _>("success") != 0,
                response_code: row.get::<Option<i64>, _>("response_code").map(|v| v as u16),
                error_message: row.get("error_message"),
                retry_count: row.get::<i64, _>("retry_count") as u32,
                sent_at: Self::from_ts(row.get("sent_at")),
            })
            .collect())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn due_monitors(&self, now: DateTime<Utc>) -> StoreResult<Vec<Monitor>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM monitors
            WHERE paused = 0
              AND next_check_at IS NOT NULL
              AND next_check_at <= ?
              AND monitor_type != 'ssl'
            ORDER BY next_check_at ASC
            "#,
        )
        .bind(Self::ts(now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::monitor_from_row).collect()
    }

    async fn certificate_check_monitors(&self) -> StoreResult<Vec<Monitor>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM monitors
            WHERE paused = 0
              AND (monitor_type = 'ssl'
                   OR (monitor_type = 'http' AND url LIKE 'https:%'))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::monitor_from_row).collect()
    }

    async fn active_monitors(&self) -> StoreResult<Vec<Monitor>> {
        let rows = sqlx::query("SELECT * FROM monitors WHERE paused = 0")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::monitor_from_row).collect()
    }

    async fn get_monitor(&self, id: &str) -> StoreResult<Option<Monitor>> {
        let row = sqlx::query("SELECT * FROM monitors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::monitor_from_row).transpose()
    }

    async fn advance_monitor_schedule(
        &self,
        id: &str,
        last_checked_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE monitors SET last_checked_at = ?, next_check_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(Self::ts(last_checked_at))
        .bind(Self::ts(next_check_at))
        .bind(Self::ts(last_checked_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_monitor_status(
        &self,
        id: &str,
        status: MonitorStatus,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE monitors SET status = ?, last_checked_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Self::ts(checked_at))
        .bind(Self::ts(checked_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn monitor_statuses(
        &self,
        ids: &[String],
    ) -> StoreResult<Vec<(String, MonitorStatus)>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id, status FROM monitors WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let status: String = row.get("status");
                (row.get("id"), MonitorStatus::parse(&status))
            })
            .collect())
    }

    async fn insert_check_result(&self, result: &CheckResult) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO check_results (
                id, monitor_id, region, status, response_time_ms,
                dns_ms, tcp_ms, tls_ms, error_message, error_code,
                status_code, payload, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.id)
        .bind(&result.monitor_id)
        .bind(&result.region)
        .bind(result.status.as_str())
        .bind(result.response_time_ms.map(|v| v as i64))
        .bind(result.timings.dns_ms.map(|v| v as i64))
        .bind(result.timings.tcp_ms.map(|v| v as i64))
        .bind(result.timings.tls_ms.map(|v| v as i64))
        .bind(&result.error_message)
        .bind(result.error_code.map(|c| c.as_str()))
        .bind(result.status_code.map(|v| v as i64))
        .bind(Self::json(&result.payload)?)
        .bind(Self::ts(result.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_results(
        &self,
        monitor_id: &str,
        limit: u32,
    ) -> StoreResult<Vec<CheckResult>> {
        let rows = sqlx::query(
            "SELECT * FROM check_results WHERE monitor_id = ?
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(monitor_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::result_from_row).collect()
    }

    async fn results_since(
        &self,
        monitor_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<CheckResult>> {
        let rows = sqlx::query(
            "SELECT * FROM check_results WHERE monitor_id = ? AND created_at >= ?
             ORDER BY created_at DESC",
        )
        .bind(monitor_id)
        .bind(Self::ts(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::result_from_row).collect()
    }

    async fn count_failures_since(
        &self,
        monitor_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM check_results
             WHERE monitor_id = ? AND created_at >= ?
               AND status IN ('failure', 'timeout', 'error')",
        )
        .bind(monitor_id)
        .bind(Self::ts(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn results_in_range(
        &self,
        monitor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<CheckResult>> {
        let rows = sqlx::query(
            "SELECT * FROM check_results
             WHERE monitor_id = ? AND created_at >= ? AND created_at < ?
             ORDER BY created_at ASC",
        )
        .bind(monitor_id)
        .bind(Self::ts(start))
        .bind(Self::ts(end))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::result_from_row).collect()
    }

    async fn latest_result(&self, monitor_id: &str) -> StoreResult<Option<CheckResult>> {
        let row = sqlx::query(
            "SELECT * FROM check_results WHERE monitor_id = ?
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(monitor_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::result_from_row).transpose()
    }

    async fn delete_results_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM check_results WHERE created_at < ?")
            .bind(Self::ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_heartbeat(&self, ping: &HeartbeatPing) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO heartbeat_pings (id, monitor_id, status, duration_ms, exit_code, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&ping.id)
        .bind(&ping.monitor_id)
        .bind(ping.status.as_str())
        .bind(ping.duration_ms.map(|v| v as i64))
        .bind(ping.exit_code)
        .bind(Self::ts(ping.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_heartbeat(&self, monitor_id: &str) -> StoreResult<Option<HeartbeatPing>> {
        let row = sqlx::query(
            "SELECT * FROM heartbeat_pings WHERE monitor_id = ?
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(monitor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let status: String = row.get("status");
            HeartbeatPing {
                id: row.get("id"),
                monitor_id: row.get("monitor_id"),
                status: HeartbeatStatus::parse(&status),
                duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|v| v as u64),
                exit_code: row.get("exit_code"),
                created_at: Self::from_ts(row.get("created_at")),
            }
        }))
    }

    async fn delete_heartbeats_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM heartbeat_pings WHERE created_at < ?")
            .bind(Self::ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_hourly_rollup(&self, row: &RollupRow) -> StoreResult<()> {
        self.upsert_rollup("check_results_hourly", row).await
    }

    async fn upsert_daily_rollup(&self, row: &RollupRow) -> StoreResult<()> {
        self.upsert_rollup("check_results_daily", row).await
    }

    async fn hourly_rollups_in_range(
        &self,
        monitor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<RollupRow>> {
        let rows = sqlx::query(
            "SELECT * FROM check_results_hourly
             WHERE monitor_id = ? AND bucket_start >= ? AND bucket_start < ?
             ORDER BY bucket_start ASC",
        )
        .bind(monitor_id)
        .bind(Self::ts(start))
        .bind(Self::ts(end))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::rollup_from_row).collect())
    }

    async fn get_hourly_rollup(
        &self,
        monitor_id: &str,
        region: &str,
        bucket_start: DateTime<Utc>,
    ) -> StoreResult<Option<RollupRow>> {
        self.get_rollup("check_results_hourly", monitor_id, region, bucket_start)
            .await
    }

    async fn get_daily_rollup(
        &self,
        monitor_id: &str,
        region: &str,
        bucket_start: DateTime<Utc>,
    ) -> StoreResult<Option<RollupRow>> {
        self.get_rollup("check_results_daily", monitor_id, region, bucket_start)
            .await
    }

    async fn policies_for_monitor(
        &self,
        org_id: &str,
        monitor_id: &str,
    ) -> StoreResult<Vec<AlertPolicy>> {
        // Linked policies restrict themselves to their monitors; a policy
        // with no link rows at all acts org-wide.
        let linked = sqlx::query(
            r#"
            SELECT p.* FROM alert_policies p
            JOIN monitor_alert_policies l ON l.policy_id = p.id
            WHERE l.monitor_id = ? AND p.org_id = ?
            "#,
        )
        .bind(monitor_id)
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let global = sqlx::query(
            r#"
            SELECT p.* FROM alert_policies p
            WHERE p.org_id = ?
              AND NOT EXISTS (
                  SELECT 1 FROM monitor_alert_policies l WHERE l.policy_id = p.id
              )
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let mut seen = std::collections::HashSet::new();
        let mut policies = Vec::new();
        for row in linked.iter().chain(global.iter()) {
            let policy = Self::policy_from_row(row)?;
            if seen.insert(policy.id.clone()) {
                policies.push(policy);
            }
        }
        Ok(policies)
    }

    async fn get_channels(&self, ids: &[String]) -> StoreResult<Vec<AlertChannel>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM alert_channels WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut channels = Vec::with_capacity(rows.len());
        for row in rows {
            let type_str: String = row.get("channel_type");
            let Some(channel_type) = ChannelType::parse(&type_str) else {
                continue;
            };
            channels.push(AlertChannel {
                id: row.get("id"),
                org_id: row.get("org_id"),
                channel_type,
                config: serde_json::from_str(row.get::<&str, _>("config"))?,
                enabled: row.get::<i64, _>("enabled") != 0,
            });
        }
        Ok(channels)
    }

    async fn open_alert(
        &self,
        policy_id: &str,
        monitor_id: &str,
    ) -> StoreResult<Option<AlertHistory>> {
        let row = sqlx::query(
            "SELECT * FROM alert_history
             WHERE policy_id = ? AND monitor_id = ? AND status = 'triggered'",
        )
        .bind(policy_id)
        .bind(monitor_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::alert_from_row).transpose()
    }

    async fn try_insert_open_alert(&self, alert: &AlertHistory) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO alert_history (
                id, org_id, monitor_id, policy_id, status,
                triggered_at, resolved_at, resolved_by, metadata
            )
            VALUES (?, ?, ?, ?, 'triggered', ?, NULL, NULL, ?)
            ON CONFLICT (policy_id, monitor_id) WHERE status = 'triggered'
            DO NOTHING
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.org_id)
        .bind(&alert.monitor_id)
        .bind(&alert.policy_id)
        .bind(Self::ts(alert.triggered_at))
        .bind(Self::json(&alert.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_alert_metadata(
        &self,
        alert_id: &str,
        metadata: &AlertMetadata,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE alert_history SET metadata = ? WHERE id = ?")
            .bind(Self::json(metadata)?)
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resolve_alert(
        &self,
        alert_id: &str,
        resolved_at: DateTime<Utc>,
        resolved_by: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE alert_history SET status = 'resolved', resolved_at = ?, resolved_by = ?
             WHERE id = ? AND status = 'triggered'",
        )
        .bind(Self::ts(resolved_at))
        .bind(resolved_by)
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn last_resolved_at(
        &self,
        policy_id: &str,
        monitor_id: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT resolved_at FROM alert_history
             WHERE policy_id = ? AND monitor_id = ? AND status = 'resolved'
               AND resolved_at IS NOT NULL
             ORDER BY resolved_at DESC LIMIT 1",
        )
        .bind(policy_id)
        .bind(monitor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| Self::from_ts_opt(r.get("resolved_at"))))
    }

    async fn get_alert(&self, alert_id: &str) -> StoreResult<Option<AlertHistory>> {
        let row = sqlx::query("SELECT * FROM alert_history WHERE id = ?")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::alert_from_row).transpose()
    }

    async fn insert_notification_log(&self, log: &NotificationLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_logs (
                id, alert_history_id, channel_id, success, response_code,
                error_message, retry_count, sent_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.alert_history_id)
        .bind(&log.channel_id)
        .bind(log.success as i64)
        .bind(log.response_code.map(|v| v as i64))
        .bind(&log.error_message)
        .bind(log.retry_count as i64)
        .bind(Self::ts(log.sent_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_incident_for_monitor(
        &self,
        monitor_id: &str,
    ) -> StoreResult<Option<Incident>> {
        let rows = sqlx::query("SELECT * FROM incidents WHERE status != 'resolved'")
            .fetch_all(&self.pool)
            .await?;

        for row in rows {
            let affected: Vec<String> =
                serde_json::from_str(row.get::<&str, _>("affected_monitors"))?;
            if !affected.iter().any(|m| m == monitor_id) {
                continue;
            }
            let severity: String = row.get("severity");
            let status: String = row.get("status");
            return Ok(Some(Incident {
                id: row.get("id"),
                org_id: row.get("org_id"),
                title: row.get("title"),
                severity: match severity.as_str() {
                    "critical" => IncidentSeverity::Critical,
                    "major" => IncidentSeverity::Major,
                    _ => IncidentSeverity::Minor,
                },
                status: IncidentStatus::parse(&status),
                started_at: Self::from_ts(row.get("started_at")),
                resolved_at: Self::from_ts_opt(row.get("resolved_at")),
                affected_monitors: affected,
            }));
        }
        Ok(None)
    }

    async fn link_result_to_incident(
        &self,
        incident_id: &str,
        check_result_id: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO incident_check_results (incident_id, check_result_id)
             VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(incident_id)
        .bind(check_result_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_maintenance_windows(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<MaintenanceWindow>> {
        let rows = sqlx::query(
            "SELECT * FROM maintenance_windows WHERE starts_at <= ? AND ends_at >= ?",
        )
        .bind(Self::ts(now))
        .bind(Self::ts(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::window_from_row).collect()
    }

    async fn maintenance_windows_pending_notice(&self) -> StoreResult<Vec<MaintenanceWindow>> {
        let rows = sqlx::query(
            "SELECT * FROM maintenance_windows
             WHERE before_start_at IS NULL OR on_start_at IS NULL OR on_end_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::window_from_row).collect()
    }

    async fn mark_window_notified(
        &self,
        window_id: &str,
        slot: NotifySlot,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let column = match slot {
            NotifySlot::BeforeStart => "before_start_at",
            NotifySlot::OnStart => "on_start_at",
            NotifySlot::OnEnd => "on_end_at",
        };
        let sql = format!(
            "UPDATE maintenance_windows SET {column} = ? WHERE id = ? AND {column} IS NULL"
        );
        let result = sqlx::query(&sql)
            .bind(Self::ts(at))
            .bind(window_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pages_listing_monitors(
        &self,
        monitor_ids: &[String],
    ) -> StoreResult<Vec<StatusPage>> {
        if monitor_ids.is_empty() {
            return Ok(vec![]);
        }

        let rows = sqlx::query("SELECT * FROM status_pages WHERE public = 1")
            .fetch_all(&self.pool)
            .await?;

        let mut pages = Vec::new();
        for row in rows {
            let monitors: Vec<String> = serde_json::from_str(row.get::<&str, _>("monitors"))?;
            if monitors.iter().any(|m| monitor_ids.contains(m)) {
                pages.push(StatusPage {
                    id: row.get("id"),
                    org_id: row.get("org_id"),
                    name: row.get("name"),
                    monitors,
                    public: true,
                });
            }
        }
        Ok(pages)
    }

    async fn verified_subscribers(&self, page_ids: &[String]) -> StoreResult<Vec<Subscriber>> {
        if page_ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = vec!["?"; page_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM subscribers WHERE verified = 1 AND page_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in page_ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| Subscriber {
                id: row.get("id"),
                page_id: row.get("page_id"),
                email: row.get("email"),
                verified: true,
                token: row.get("token"),
                token_expires_at: Self::from_ts_opt(row.get("token_expires_at")),
                email_enabled: row.get::<i64, _>("email_enabled") != 0,
            })
            .collect())
    }

    async fn delete_expired_subscriber_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE subscribers SET token = NULL, token_expires_at = NULL
             WHERE verified = 0 AND token_expires_at IS NOT NULL AND token_expires_at < ?",
        )
        .bind(Self::ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_probe(&self, probe: &Probe) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO probes (
                id, org_id, name, region, token_hash, status, last_heartbeat_at, metrics
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&probe.id)
        .bind(&probe.org_id)
        .bind(&probe.name)
        .bind(&probe.region)
        .bind(&probe.token_hash)
        .bind(probe.status.as_str())
        .bind(Self::ts_opt(probe.last_heartbeat_at))
        .bind(Self::json(&probe.metrics)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn probe_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Probe>> {
        let row = sqlx::query("SELECT * FROM probes WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::probe_from_row).transpose()
    }

    async fn touch_probe_heartbeat(
        &self,
        probe_id: &str,
        at: DateTime<Utc>,
        metrics: &ProbeMetrics,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE probes SET
                last_heartbeat_at = ?,
                metrics = ?,
                status = CASE WHEN status IN ('offline', 'pending') THEN 'active' ELSE status END
            WHERE id = ?
            "#,
        )
        .bind(Self::ts(at))
        .bind(Self::json(metrics)?)
        .bind(probe_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_stale_probes_offline(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE probes SET status = 'offline'
             WHERE status = 'active'
               AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?)",
        )
        .bind(Self::ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn assignments_for_monitor(
        &self,
        monitor_id: &str,
    ) -> StoreResult<Vec<ProbeAssignment>> {
        let rows = sqlx::query(
            "SELECT * FROM probe_assignments WHERE monitor_id = ? ORDER BY priority DESC",
        )
        .bind(monitor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ProbeAssignment {
                probe_id: row.get("probe_id"),
                monitor_id: row.get("monitor_id"),
                priority: row.get::<i64, _>("priority") as i32,
                exclusive: row.get::<i64, _>("exclusive") != 0,
            })
            .collect())
    }

    async fn get_probes(&self, ids: &[String]) -> StoreResult<Vec<Probe>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM probes WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::probe_from_row).collect()
    }

    async fn insert_pending_job(&self, job: &ProbePendingJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO probe_pending_jobs (
                id, probe_id, monitor_id, job_data, status, expires_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.probe_id)
        .bind(&job.monitor_id)
        .bind(Self::json(&job.job_data)?)
        .bind(job.status.as_str())
        .bind(Self::ts(job.expires_at))
        .bind(Self::ts(job.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_pending_jobs(
        &self,
        probe_id: &str,
        limit: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ProbePendingJob>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT * FROM probe_pending_jobs
             WHERE probe_id = ? AND status = 'pending' AND expires_at > ?
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(probe_id)
        .bind(Self::ts(now))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let job = Self::pending_job_from_row(row)?;
            let updated = sqlx::query(
                "UPDATE probe_pending_jobs SET status = 'claimed'
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                jobs.push(ProbePendingJob {
                    status: PendingJobStatus::Claimed,
                    ..job
                });
            }
        }

        tx.commit().await?;
        Ok(jobs)
    }

    async fn complete_pending_job(
        &self,
        job_id: &str,
        probe_id: &str,
    ) -> StoreResult<Option<String>> {
        let result = sqlx::query(
            "UPDATE probe_pending_jobs SET status = 'completed'
             WHERE id = ? AND probe_id = ? AND status = 'claimed'",
        )
        .bind(job_id)
        .bind(probe_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT monitor_id FROM probe_pending_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("monitor_id")))
    }

    async fn reap_expired_pending_jobs(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM probe_pending_jobs WHERE status != 'completed' AND expires_at <= ?",
        )
        .bind(Self::ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn org_settings(&self, org_id: &str) -> StoreResult<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT settings FROM organizations WHERE id = ?")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_str(r.get::<&str, _>("settings")).map_err(Into::into))
            .transpose()
    }

    async fn delete_audit_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < ?")
            .bind(Self::ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
