//! Notification dispatch
//!
//! Fan-out: one fired (or recovered) alert becomes one job per enabled
//! channel, each on its channel-type queue with the shared delivery profile
//! (5 attempts, exponential backoff 1s..16s). Job ids are stable
//! (`alert-<alertId>-<channelId>` / `recovery-...`) so broker re-delivery
//! dedupes naturally. One channel's enqueue failure never suppresses the
//! others.

pub mod channels;
pub mod email;
pub mod irc;
pub mod twitter;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credentials::{CredentialCipher, decrypt_config};
use crate::hooks::Capabilities;
use crate::model::{AlertHistory, AlertPolicy, ChannelType, Monitor};
use crate::queue::{JobOpts, QueueRegistry};
use crate::storage::Store;

pub use channels::ChannelWorker;

/// Whether a dispatch announces a new alert or a recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Triggered,
    Recovered,
}

impl AlertKind {
    fn job_prefix(&self) -> &'static str {
        match self {
            AlertKind::Triggered => "alert",
            AlertKind::Recovered => "recovery",
        }
    }
}

/// The rendered facts every channel formats its own way
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert_history_id: String,
    pub monitor_name: String,
    pub monitor_url: String,
    /// "triggered" or "recovered"
    pub status: AlertKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub dashboard_url: String,
    pub timestamp: chrono::DateTime<Utc>,
}

/// One queued delivery: channel coordinates plus the decrypted config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    pub channel_id: String,
    pub channel_type: ChannelType,
    /// Decrypted channel config; never cached beyond this job
    pub config: serde_json::Value,
    pub payload: AlertPayload,
}

/// Platform fallback credentials (used when an org brings no BYO config)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformSenders {
    #[serde(default)]
    pub smtp: Option<email::SmtpSettings>,
    #[serde(default)]
    pub resend_api_key: Option<String>,
    #[serde(default)]
    pub twilio_account_sid: Option<String>,
    #[serde(default)]
    pub twilio_auth_token: Option<String>,
    #[serde(default)]
    pub twilio_from: Option<String>,
}

pub struct NotificationDispatcher {
    store: Arc<dyn Store>,
    queues: Arc<QueueRegistry>,
    cipher: Arc<dyn CredentialCipher>,
    capabilities: Arc<Capabilities>,
    dashboard_url: String,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queues: Arc<QueueRegistry>,
        cipher: Arc<dyn CredentialCipher>,
        capabilities: Arc<Capabilities>,
        dashboard_url: String,
    ) -> Self {
        Self {
            store,
            queues,
            cipher,
            capabilities,
            dashboard_url,
        }
    }

    /// Fan an alert out to the policy's channels (plus on-call, if resolvable)
    pub async fn dispatch(
        &self,
        alert: &AlertHistory,
        policy: &AlertPolicy,
        monitor: &Monitor,
        kind: AlertKind,
    ) {
        let payload = AlertPayload {
            alert_history_id: alert.id.clone(),
            monitor_name: monitor.name.clone(),
            monitor_url: monitor.url.clone(),
            status: kind,
            message: alert.metadata.error_message.clone(),
            response_time_ms: alert.metadata.response_time_ms,
            status_code: alert.metadata.status_code,
            dashboard_url: format!("{}/monitors/{}", self.dashboard_url, monitor.id),
            timestamp: Utc::now(),
        };

        let channels = match self.store.get_channels(&policy.channels).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!("failed to load channels for policy {}: {e}", policy.id);
                vec![]
            }
        };

        for channel in channels.iter().filter(|channel| channel.enabled) {
            let job = NotificationJob {
                channel_id: channel.id.clone(),
                channel_type: channel.channel_type,
                config: decrypt_config(&self.cipher, &channel.config),
                payload: payload.clone(),
            };

            let data = match serde_json::to_value(&job) {
                Ok(data) => data,
                Err(e) => {
                    warn!("failed to serialize job for channel {}: {e}", channel.id);
                    continue;
                }
            };

            let job_id = format!("{}-{}-{}", kind.job_prefix(), alert.id, channel.id);
            let queued = self
                .queues
                .add(
                    channel.channel_type.queue_name(),
                    data,
                    JobOpts::notification(job_id),
                )
                .await;
            debug!(
                "notification for alert {} on channel {} queued: {:?}",
                alert.id, channel.id, queued
            );
        }

        // On-call recipient gets a direct email on top of the channel fan-out
        if let Some(rotation_id) = &policy.oncall_rotation_id {
            self.dispatch_oncall(alert, rotation_id, &payload, kind).await;
        }
    }

    async fn dispatch_oncall(
        &self,
        alert: &AlertHistory,
        rotation_id: &str,
        payload: &AlertPayload,
        kind: AlertKind,
    ) {
        let Some(resolver) = self.capabilities.oncall_resolver().await else {
            return;
        };

        let email = match resolver.current_oncall_email(rotation_id).await {
            Ok(Some(email)) => email,
            Ok(None) => {
                debug!("rotation {rotation_id} has no current on-call, skipping");
                return;
            }
            Err(e) => {
                warn!("on-call resolution failed for rotation {rotation_id}: {e:#}");
                return;
            }
        };

        let job = NotificationJob {
            channel_id: format!("oncall-{rotation_id}"),
            channel_type: ChannelType::Email,
            config: serde_json::json!({ "to": email }),
            payload: payload.clone(),
        };

        if let Ok(data) = serde_json::to_value(&job) {
            let job_id = format!("{}-{}-oncall", kind.job_prefix(), alert.id);
            self.queues
                .add(
                    ChannelType::Email.queue_name(),
                    data,
                    JobOpts::notification(job_id),
                )
                .await;
        }
    }
}

/// Human-readable one-liner shared by the simple text channels
pub fn render_message(payload: &AlertPayload) -> String {
    match payload.status {
        AlertKind::Triggered => {
            let detail = payload
                .message
                .as_deref()
                .map(|message| format!(" ({message})"))
                .unwrap_or_default();
            format!(
                "🔴 {} is down{}\n{}\n{}",
                payload.monitor_name, detail, payload.monitor_url, payload.dashboard_url
            )
        }
        AlertKind::Recovered => format!(
            "✅ {} has recovered\n{}\n{}",
            payload.monitor_name, payload.monitor_url, payload.dashboard_url
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(kind: AlertKind) -> AlertPayload {
        AlertPayload {
            alert_history_id: "a1".to_string(),
            monitor_name: "api".to_string(),
            monitor_url: "https://api.example.com".to_string(),
            status: kind,
            message: Some("CONNECTION_REFUSED".to_string()),
            response_time_ms: None,
            status_code: None,
            dashboard_url: "https://app.example.com/monitors/m1".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_render_triggered_and_recovered() {
        let down = render_message(&payload(AlertKind::Triggered));
        assert!(down.contains("api is down"));
        assert!(down.contains("CONNECTION_REFUSED"));

        let up = render_message(&payload(AlertKind::Recovered));
        assert!(up.contains("recovered"));
        assert!(!up.contains("CONNECTION_REFUSED"));
    }

    #[test]
    fn test_job_prefixes() {
        assert_eq!(AlertKind::Triggered.job_prefix(), "alert");
        assert_eq!(AlertKind::Recovered.job_prefix(), "recovery");
    }
}
