//! Heartbeat executor (passive)
//!
//! External jobs ping the API; this executor only reads the latest ping and
//! judges its age. With `expected = interval_seconds` and a configurable
//! grace period:
//!
//! ```text
//! Δ = now − last ping
//! Δ >  expected + grace  → failure (OVERDUE)
//! Δ >  expected          → degraded
//! otherwise              → success
//! ```
//!
//! A last ping with status `fail` is a failure regardless of age; a monitor
//! with no pings at all has never reported and fails with NO_PINGS.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::instrument;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode, HeartbeatStatus};

use super::{CheckOutcome, Executor, JobCtx};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HeartbeatConfig {
    grace_period_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: 60,
        }
    }
}

pub struct HeartbeatExecutor;

#[async_trait]
impl Executor for HeartbeatExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config: HeartbeatConfig =
            serde_json::from_value(job.config.clone()).unwrap_or_default();

        let ping = match ctx.store.latest_heartbeat(&job.monitor_id).await {
            Ok(ping) => ping,
            Err(e) => {
                let result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                return CheckOutcome::control(result, anyhow::anyhow!(e));
            }
        };

        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);

        let Some(ping) = ping else {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::NoPings);
            result.error_message = Some("no heartbeat pings ever received".to_string());
            return CheckOutcome::ok(result);
        };

        result.payload = serde_json::json!({
            "last_ping_at": ping.created_at,
            "last_ping_status": ping.status,
            "duration_ms": ping.duration_ms,
            "exit_code": ping.exit_code,
        });

        if ping.status == HeartbeatStatus::Fail {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::JobFailed);
            result.error_message = Some(match ping.exit_code {
                Some(code) => format!("last run reported failure (exit code {code})"),
                None => "last run reported failure".to_string(),
            });
            return CheckOutcome::ok(result);
        }

        let age_seconds = (Utc::now() - ping.created_at).num_seconds().max(0) as u64;
        let expected = job.interval_seconds as u64;
        let grace = config.grace_period_seconds;

        if age_seconds > expected + grace {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::Overdue);
            result.error_message = Some(format!(
                "last ping {age_seconds}s ago, expected every {expected}s (+{grace}s grace)"
            ));
        } else if age_seconds > expected {
            result.status = CheckStatus::Degraded;
            result.error_message = Some(format!(
                "last ping {age_seconds}s ago, inside the {grace}s grace period"
            ));
        }
        CheckOutcome::ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::PlainCipher;
    use crate::model::{Assertions, HeartbeatPing, MonitorType, new_id};
    use crate::storage::{SqliteStore, Store};
    use chrono::Duration;
    use std::sync::Arc;

    fn job() -> CheckJob {
        CheckJob {
            monitor_id: "hb1".to_string(),
            org_id: "o1".to_string(),
            monitor_type: MonitorType::Heartbeat,
            url: String::new(),
            method: "GET".to_string(),
            headers: Default::default(),
            body: None,
            timeout_ms: 5_000,
            interval_seconds: 60,
            degraded_threshold_ms: None,
            assertions: Assertions::default(),
            config: serde_json::json!({"grace_period_seconds": 30}),
            regions: vec![],
        }
    }

    async fn ctx_with_ping(
        age_seconds: i64,
        status: HeartbeatStatus,
    ) -> (JobCtx, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        seed_monitor(&store).await;
        store
            .insert_heartbeat(&HeartbeatPing {
                id: new_id(),
                monitor_id: "hb1".to_string(),
                status,
                duration_ms: Some(1_200),
                exit_code: if status == HeartbeatStatus::Fail {
                    Some(1)
                } else {
                    Some(0)
                },
                created_at: Utc::now() - Duration::seconds(age_seconds),
            })
            .await
            .unwrap();
        (
            JobCtx::new("uk".to_string(), store.clone(), Arc::new(PlainCipher)),
            store,
        )
    }

    async fn seed_monitor(store: &SqliteStore) {
        let now = Utc::now();
        store
            .insert_monitor(&crate::model::Monitor {
                id: "hb1".to_string(),
                org_id: "o1".to_string(),
                name: "cron".to_string(),
                monitor_type: MonitorType::Heartbeat,
                url: String::new(),
                method: "GET".to_string(),
                headers: Default::default(),
                body: None,
                interval_seconds: 60,
                timeout_ms: 5_000,
                degraded_threshold_ms: None,
                assertions: Assertions::default(),
                config: serde_json::Value::Null,
                regions: vec![],
                paused: false,
                status: crate::model::MonitorStatus::Pending,
                last_checked_at: None,
                next_check_at: Some(now),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fresh_ping_is_success() {
        let (ctx, _store) = ctx_with_ping(10, HeartbeatStatus::Complete).await;
        let outcome = HeartbeatExecutor.execute(&job(), &ctx).await;
        assert_eq!(outcome.result.status, CheckStatus::Success);
    }

    #[tokio::test]
    async fn test_inside_grace_is_degraded() {
        // 75s old: past the 60s interval but inside the 30s grace
        let (ctx, _store) = ctx_with_ping(75, HeartbeatStatus::Complete).await;
        let outcome = HeartbeatExecutor.execute(&job(), &ctx).await;
        assert_eq!(outcome.result.status, CheckStatus::Degraded);
    }

    #[tokio::test]
    async fn test_overdue_is_failure() {
        let (ctx, _store) = ctx_with_ping(120, HeartbeatStatus::Complete).await;
        let outcome = HeartbeatExecutor.execute(&job(), &ctx).await;
        assert_eq!(outcome.result.status, CheckStatus::Failure);
        assert_eq!(outcome.result.error_code, Some(ErrorCode::Overdue));
    }

    #[tokio::test]
    async fn test_failed_ping_is_job_failed() {
        let (ctx, _store) = ctx_with_ping(5, HeartbeatStatus::Fail).await;
        let outcome = HeartbeatExecutor.execute(&job(), &ctx).await;
        assert_eq!(outcome.result.status, CheckStatus::Failure);
        assert_eq!(outcome.result.error_code, Some(ErrorCode::JobFailed));
    }

    #[tokio::test]
    async fn test_no_pings_is_failure() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        seed_monitor(&store).await;
        let ctx = JobCtx::new("uk".to_string(), store, Arc::new(PlainCipher));
        let outcome = HeartbeatExecutor.execute(&job(), &ctx).await;
        assert_eq!(outcome.result.status, CheckStatus::Failure);
        assert_eq!(outcome.result.error_code, Some(ErrorCode::NoPings));
    }
}
