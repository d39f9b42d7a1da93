//! Alert evaluator
//!
//! One invocation per check result. The policy set is the union of
//! monitor-linked policies and org-wide policies (those with no link rows
//! at all). Fire conditions use OR-semantics; an open alert coalesces
//! repeated failures instead of re-notifying; cooldown is measured from the
//! previous alert's `resolved_at`; recovery requires `consecutive_successes`
//! clean results and resolves atomically.
//!
//! Concurrency: two ingest flows for the same monitor may race. The store's
//! partial unique index guarantees at most one `triggered` row per
//! (policy, monitor); a lost insert race downgrades into coalescing.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::bus::{Event, EventBus, org_topic};
use crate::hooks::Capabilities;
use crate::model::{
    AlertHistory, AlertMetadata, AlertPolicy, AlertStatus, CheckStatus, MAX_FAILURE_TIMESTAMPS,
    Monitor, new_id,
};
use crate::notify::{AlertKind, NotificationDispatcher};
use crate::storage::Store;

/// Everything the evaluator needs from one check result
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub monitor_id: String,
    pub org_id: String,
    pub check_result_id: String,
    pub status: CheckStatus,
    pub error_message: Option<String>,
    pub response_time_ms: Option<u64>,
    pub status_code: Option<u16>,
}

pub struct AlertEvaluator {
    store: Arc<dyn Store>,
    bus: EventBus,
    dispatcher: Arc<NotificationDispatcher>,
    capabilities: Arc<Capabilities>,
}

impl AlertEvaluator {
    pub fn new(
        store: Arc<dyn Store>,
        bus: EventBus,
        dispatcher: Arc<NotificationDispatcher>,
        capabilities: Arc<Capabilities>,
    ) -> Self {
        Self {
            store,
            bus,
            dispatcher,
            capabilities,
        }
    }

    #[instrument(skip(self, evaluation), fields(monitor = %evaluation.monitor_id))]
    pub async fn evaluate(&self, evaluation: &Evaluation, now: DateTime<Utc>) -> anyhow::Result<()> {
        let policies = self
            .store
            .policies_for_monitor(&evaluation.org_id, &evaluation.monitor_id)
            .await?;
        if policies.is_empty() {
            return Ok(());
        }

        let monitor = self.store.get_monitor(&evaluation.monitor_id).await?;
        let Some(monitor) = monitor else {
            debug!("monitor vanished before evaluation, skipping");
            return Ok(());
        };

        for policy in policies.iter().filter(|policy| policy.enabled) {
            let outcome = if evaluation.status == CheckStatus::Success {
                self.recover_path(policy, &monitor, evaluation, now).await
            } else {
                self.fire_path(policy, &monitor, evaluation, now).await
            };

            // One policy's failure must not starve the others
            if let Err(e) = outcome {
                warn!("policy {} evaluation failed: {e:#}", policy.id);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Fire path
    // ========================================================================

    async fn fire_path(
        &self,
        policy: &AlertPolicy,
        monitor: &Monitor,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if !self.conditions_match(policy, evaluation, now).await? {
            return Ok(());
        }

        // Open-alert coalescing: update metadata, never re-notify
        if let Some(open) = self
            .store
            .open_alert(&policy.id, &monitor.id)
            .await?
        {
            self.coalesce(&open, evaluation, now).await?;
            return Ok(());
        }

        // Cooldown, measured from the previous resolution
        if let Some(resolved_at) = self
            .store
            .last_resolved_at(&policy.id, &monitor.id)
            .await?
        {
            let quiet_until = resolved_at + Duration::minutes(policy.cooldown_minutes as i64);
            if now < quiet_until {
                debug!(
                    "policy {} for {} in cooldown until {quiet_until}",
                    policy.id, monitor.id
                );
                return Ok(());
            }
        }

        let alert = AlertHistory {
            id: new_id(),
            org_id: evaluation.org_id.clone(),
            monitor_id: monitor.id.clone(),
            policy_id: policy.id.clone(),
            status: AlertStatus::Triggered,
            triggered_at: now,
            resolved_at: None,
            resolved_by: None,
            metadata: AlertMetadata {
                check_result_id: Some(evaluation.check_result_id.clone()),
                error_message: evaluation.error_message.clone(),
                failure_count: 1,
                failure_timestamps: vec![now],
                response_time_ms: evaluation.response_time_ms,
                status_code: evaluation.status_code,
            },
        };

        if !self.store.try_insert_open_alert(&alert).await? {
            // Lost the race; the winner's row absorbs this failure
            if let Some(open) = self.store.open_alert(&policy.id, &monitor.id).await? {
                self.coalesce(&open, evaluation, now).await?;
            }
            return Ok(());
        }

        info!(
            "alert {} triggered: policy {} on monitor {}",
            alert.id, policy.id, monitor.id
        );

        self.dispatcher
            .dispatch(&alert, policy, monitor, AlertKind::Triggered)
            .await;

        if policy.escalation_policy_id.is_some()
            && let Some(scheduler) = self.capabilities.escalation_scheduler().await
            && let Err(e) = scheduler.schedule(&alert, policy).await
        {
            warn!("escalation scheduling failed for alert {}: {e:#}", alert.id);
        }

        self.bus
            .publish(
                &org_topic(&evaluation.org_id),
                Event::new(
                    "alert:triggered",
                    serde_json::json!({
                        "alertId": alert.id,
                        "monitorId": monitor.id,
                        "timestamp": now,
                    }),
                ),
            )
            .await;
        Ok(())
    }

    async fn coalesce(
        &self,
        open: &AlertHistory,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut metadata = open.metadata.clone();
        metadata.failure_count += 1;
        metadata.failure_timestamps.push(now);
        if metadata.failure_timestamps.len() > MAX_FAILURE_TIMESTAMPS {
            let excess = metadata.failure_timestamps.len() - MAX_FAILURE_TIMESTAMPS;
            metadata.failure_timestamps.drain(..excess);
        }
        metadata.check_result_id = Some(evaluation.check_result_id.clone());
        metadata.error_message = evaluation.error_message.clone();
        metadata.response_time_ms = evaluation.response_time_ms;
        metadata.status_code = evaluation.status_code;

        self.store.update_alert_metadata(&open.id, &metadata).await?;
        debug!(
            "alert {} coalesced failure #{}",
            open.id, metadata.failure_count
        );
        Ok(())
    }

    /// OR-semantics across condition kinds
    async fn conditions_match(
        &self,
        policy: &AlertPolicy,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let conditions = &policy.conditions;
        if !conditions.has_fire_condition() {
            return Ok(false);
        }

        if let Some(n) = conditions.consecutive_failures {
            let recent = self
                .store
                .recent_results(&evaluation.monitor_id, n)
                .await?;
            if recent.len() >= n as usize
                && recent.iter().all(|result| result.status.is_failure())
            {
                return Ok(true);
            }
        }

        if let Some(window) = &conditions.failures_in_window {
            let since = now - Duration::minutes(window.window_minutes as i64);
            let count = self
                .store
                .count_failures_since(&evaluation.monitor_id, since)
                .await?;
            if count >= window.count as u64 {
                return Ok(true);
            }
        }

        if let Some(minutes) = conditions.degraded_duration_minutes
            && evaluation.status == CheckStatus::Degraded
        {
            let since = now - Duration::minutes(minutes as i64);
            let in_window = self
                .store
                .results_since(&evaluation.monitor_id, since)
                .await?;
            if !in_window.is_empty()
                && in_window
                    .iter()
                    .all(|result| result.status == CheckStatus::Degraded)
            {
                return Ok(true);
            }
        }

        Ok(false)
    }

    // ========================================================================
    // Recover path
    // ========================================================================

    async fn recover_path(
        &self,
        policy: &AlertPolicy,
        monitor: &Monitor,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(open) = self.store.open_alert(&policy.id, &monitor.id).await? else {
            return Ok(());
        };

        let required = policy.conditions.consecutive_successes.unwrap_or(1).max(1);
        let recent = self
            .store
            .recent_results(&evaluation.monitor_id, required)
            .await?;
        if recent.len() < required as usize
            || !recent
                .iter()
                .all(|result| result.status == CheckStatus::Success)
        {
            return Ok(());
        }

        // Atomic transition; false means another worker resolved it first
        if !self.store.resolve_alert(&open.id, now, "system").await? {
            return Ok(());
        }

        info!(
            "alert {} resolved: policy {} on monitor {} recovered",
            open.id, policy.id, monitor.id
        );

        self.dispatcher
            .dispatch(&open, policy, monitor, AlertKind::Recovered)
            .await;

        self.bus
            .publish(
                &org_topic(&evaluation.org_id),
                Event::new(
                    "alert:resolved",
                    serde_json::json!({
                        "alertId": open.id,
                        "monitorId": monitor.id,
                        "resolvedBy": "system",
                        "timestamp": now,
                    }),
                ),
            )
            .await;
        Ok(())
    }
}
