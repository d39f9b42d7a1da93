//! Result ingest
//!
//! Every active executor hands its `CheckResult` to this path:
//!
//! 1. persist the result (required; failure here fails the job so the
//!    broker retries it),
//! 2. link failure-class results to the monitor's open incident,
//! 3. update the monitor's coarse status,
//! 4. publish `monitor:check` (and certificate events when captured),
//! 5. invoke the alert evaluator synchronously.
//!
//! Steps 2-5 are best-effort: their errors are logged and never fail the
//! job. Re-delivery after a crash produces at most one extra result row
//! because result ids are fresh per attempt.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, instrument, warn};

use crate::alert::{AlertEvaluator, Evaluation};
use crate::bus::{Event, EventBus, monitor_topic};
use crate::model::{CheckResult, HeartbeatPing};
use crate::storage::Store;

pub struct ResultIngest {
    store: Arc<dyn Store>,
    bus: EventBus,
    evaluator: Arc<AlertEvaluator>,
}

impl ResultIngest {
    pub fn new(store: Arc<dyn Store>, bus: EventBus, evaluator: Arc<AlertEvaluator>) -> Self {
        Self {
            store,
            bus,
            evaluator,
        }
    }

    /// Record a ping from an external job (called by the API when a
    /// heartbeat URL is hit); the passive heartbeat executor reads these
    #[instrument(skip(self, ping), fields(monitor = %ping.monitor_id))]
    pub async fn record_heartbeat(&self, ping: &HeartbeatPing) -> anyhow::Result<()> {
        self.store.insert_heartbeat(ping).await?;
        self.bus
            .publish(
                &monitor_topic(&ping.monitor_id),
                Event::new(
                    "monitor:heartbeat",
                    serde_json::json!({
                        "monitorId": ping.monitor_id,
                        "status": ping.status,
                        "durationMs": ping.duration_ms,
                        "timestamp": ping.created_at,
                    }),
                ),
            )
            .await;
        Ok(())
    }

    #[instrument(skip(self, result), fields(monitor = %result.monitor_id, status = %result.status.as_str()))]
    pub async fn ingest(&self, org_id: &str, result: &CheckResult) -> anyhow::Result<()> {
        // 1. persist; the one step that must not be swallowed
        self.store.insert_check_result(result).await?;
        debug!("check result {} persisted", result.id);

        // 2. incident linkage for failure-class results, idempotent
        if result.status.is_failure() {
            match self.store.active_incident_for_monitor(&result.monitor_id).await {
                Ok(Some(incident)) => {
                    if let Err(e) = self
                        .store
                        .link_result_to_incident(&incident.id, &result.id)
                        .await
                    {
                        warn!("failed to link result to incident {}: {e}", incident.id);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("incident lookup failed: {e}"),
            }
        }

        // 3. coarse status
        if let Err(e) = self
            .store
            .update_monitor_status(
                &result.monitor_id,
                result.status.monitor_status(),
                Utc::now(),
            )
            .await
        {
            warn!("failed to update monitor status: {e}");
        }

        // 4. live events
        let topic = monitor_topic(&result.monitor_id);
        self.bus
            .publish(
                &topic,
                Event::new(
                    "monitor:check",
                    serde_json::json!({
                        "monitorId": result.monitor_id,
                        "status": result.status,
                        "responseTimeMs": result.response_time_ms,
                        "timestamp": result.created_at,
                    }),
                ),
            )
            .await;

        if let Some(certificate) = result.payload.get("certificate") {
            self.bus
                .publish(
                    &topic,
                    Event::new(
                        "monitor:certificate",
                        serde_json::json!({
                            "monitorId": result.monitor_id,
                            "certificate": certificate,
                            "timestamp": result.created_at,
                        }),
                    ),
                )
                .await;
        }
        if result.payload.get("ct_log_ids").is_some() {
            self.bus
                .publish(
                    &topic,
                    Event::new(
                        "monitor:certificate_transparency",
                        serde_json::json!({
                            "monitorId": result.monitor_id,
                            "status": result.status,
                            "timestamp": result.created_at,
                        }),
                    ),
                )
                .await;
        }

        // 5. alert evaluation; errors logged, never surfaced as a job failure
        let evaluation = Evaluation {
            monitor_id: result.monitor_id.clone(),
            org_id: org_id.to_string(),
            check_result_id: result.id.clone(),
            status: result.status,
            error_message: result.error_message.clone(),
            response_time_ms: result.response_time_ms,
            status_code: result.status_code,
        };
        if let Err(e) = self.evaluator.evaluate(&evaluation, Utc::now()).await {
            error!("alert evaluation failed for {}: {e:#}", result.monitor_id);
        }

        Ok(())
    }
}
