//! Channel delivery workers
//!
//! One `ChannelWorker` instance is bound to each channel-type queue. The
//! webhook-POST family (Slack, Discord, Teams, Google Chat, PagerDuty,
//! ntfy, generic webhook) lives here; email, IRC and Twitter have their own
//! modules. A success writes a `NotificationLog{success:true}`; the final
//! failed attempt writes exactly one `NotificationLog{success:false}`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::model::{ChannelType, NotificationLog, new_id};
use crate::queue::{Job, JobHandler};
use crate::storage::Store;

use super::{AlertKind, NotificationJob, PlatformSenders, render_message};

/// SMS bodies are truncated to the carrier limit
const SMS_MAX_CHARS: usize = 1600;

pub struct ChannelWorker {
    store: Arc<dyn Store>,
    http: reqwest::Client,
    platform: PlatformSenders,
}

#[async_trait]
impl JobHandler for ChannelWorker {
    #[instrument(skip_all, fields(job = %job.id, attempt = job.attempt))]
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        // Maintenance subscriber notices share the email queue but carry
        // their own shape
        if job.data.get("kind").and_then(|v| v.as_str()) == Some("maintenance") {
            return self.deliver_maintenance(&job.data).await;
        }

        let notification: NotificationJob = serde_json::from_value(job.data.clone())?;

        let response_code = self.deliver(&notification).await?;

        let log = NotificationLog {
            id: new_id(),
            alert_history_id: notification.payload.alert_history_id.clone(),
            channel_id: notification.channel_id.clone(),
            success: true,
            response_code,
            error_message: None,
            retry_count: job.attempt - 1,
            sent_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_notification_log(&log).await {
            warn!("failed to record notification log: {e}");
        }
        Ok(())
    }

    async fn on_exhausted(&self, job: &Job, error: &anyhow::Error) {
        let Ok(notification) = serde_json::from_value::<NotificationJob>(job.data.clone()) else {
            warn!("exhausted job {} carries unparseable payload", job.id);
            return;
        };

        let log = NotificationLog {
            id: new_id(),
            alert_history_id: notification.payload.alert_history_id.clone(),
            channel_id: notification.channel_id.clone(),
            success: false,
            response_code: None,
            error_message: Some(format!("{error:#}")),
            retry_count: job.attempt,
            sent_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_notification_log(&log).await {
            warn!("failed to record dead-letter notification log: {e}");
        }
    }
}

impl ChannelWorker {
    pub fn new(store: Arc<dyn Store>, platform: PlatformSenders) -> Arc<Self> {
        Arc::new(Self {
            store,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            platform,
        })
    }

    async fn deliver_maintenance(&self, data: &serde_json::Value) -> anyhow::Result<()> {
        let field = |name: &str| {
            data.get(name)
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("maintenance job is missing {name:?}"))
        };
        super::email::send_direct(&self.platform, field("to")?, field("subject")?, field("body")?)
            .await
    }

    async fn deliver(&self, notification: &NotificationJob) -> anyhow::Result<Option<u16>> {
        let config = &notification.config;
        let payload = &notification.payload;

        match notification.channel_type {
            ChannelType::Email => {
                super::email::send(config, &self.platform, payload).await?;
                Ok(None)
            }
            ChannelType::Irc => {
                super::irc::send(config, &render_message(payload)).await?;
                Ok(None)
            }
            ChannelType::Twitter => {
                let code = super::twitter::send(&self.http, config, payload).await?;
                Ok(Some(code))
            }
            ChannelType::Slack => {
                self.post_json(config, serde_json::json!({ "text": render_message(payload) }))
                    .await
            }
            ChannelType::Discord => {
                self.post_json(
                    config,
                    serde_json::json!({ "content": render_message(payload) }),
                )
                .await
            }
            ChannelType::Teams | ChannelType::Googlechat => {
                self.post_json(config, serde_json::json!({ "text": render_message(payload) }))
                    .await
            }
            ChannelType::Ntfy => self.send_ntfy(config, payload).await,
            ChannelType::Pagerduty => self.send_pagerduty(config, payload).await,
            ChannelType::Webhook => self.send_webhook(config, payload).await,
            ChannelType::Sms => self.send_sms(config, payload).await,
        }
    }

    fn url_from(config: &serde_json::Value) -> anyhow::Result<String> {
        config
            .get("url")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!("channel config is missing \"url\""))
    }

    async fn post_json(
        &self,
        config: &serde_json::Value,
        body: serde_json::Value,
    ) -> anyhow::Result<Option<u16>> {
        let url = Self::url_from(config)?;
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook endpoint returned {status}");
        }
        Ok(Some(status.as_u16()))
    }

    async fn send_ntfy(
        &self,
        config: &serde_json::Value,
        payload: &super::AlertPayload,
    ) -> anyhow::Result<Option<u16>> {
        let server = config
            .get("server")
            .and_then(|v| v.as_str())
            .unwrap_or("https://ntfy.sh");
        let topic = config
            .get("topic")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("ntfy config is missing \"topic\""))?;

        let mut request = self
            .http
            .post(format!("{}/{topic}", server.trim_end_matches('/')))
            .header(
                "Title",
                match payload.status {
                    AlertKind::Triggered => "Monitor down",
                    AlertKind::Recovered => "Monitor recovered",
                },
            )
            .body(render_message(payload));
        if let Some(token) = config.get("token").and_then(|v| v.as_str()) {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("ntfy returned {status}");
        }
        Ok(Some(status.as_u16()))
    }

    async fn send_pagerduty(
        &self,
        config: &serde_json::Value,
        payload: &super::AlertPayload,
    ) -> anyhow::Result<Option<u16>> {
        let routing_key = config
            .get("routing_key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("pagerduty config is missing \"routing_key\""))?;

        let event_action = match payload.status {
            AlertKind::Triggered => "trigger",
            AlertKind::Recovered => "resolve",
        };
        let body = serde_json::json!({
            "routing_key": routing_key,
            "event_action": event_action,
            "dedup_key": payload.alert_history_id,
            "payload": {
                "summary": render_message(payload),
                "source": payload.monitor_url,
                "severity": "critical",
                "timestamp": payload.timestamp,
            },
        });

        let response = self
            .http
            .post("https://events.pagerduty.com/v2/enqueue")
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("pagerduty returned {status}");
        }
        Ok(Some(status.as_u16()))
    }

    async fn send_webhook(
        &self,
        config: &serde_json::Value,
        payload: &super::AlertPayload,
    ) -> anyhow::Result<Option<u16>> {
        let url = Self::url_from(config)?;
        let body = serde_json::to_string(payload)?;

        let method = config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("POST");
        let mut request = if method.eq_ignore_ascii_case("GET") {
            self.http.get(&url)
        } else {
            self.http
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body.clone())
        };

        // HMAC signing when a key is configured; a signing failure must not
        // abort delivery
        if let Some(key) = config.get("signing_key").and_then(|v| v.as_str()) {
            match sign_body(key.as_bytes(), body.as_bytes()) {
                Ok(signature) => {
                    request = request
                        .header("X-Vigil-Signature", format!("sha256={signature}"))
                        .header("X-Vigil-Timestamp", Utc::now().timestamp().to_string());
                }
                Err(e) => warn!("webhook signing failed, sending unsigned: {e}"),
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned {status}");
        }
        Ok(Some(status.as_u16()))
    }

    async fn send_sms(
        &self,
        config: &serde_json::Value,
        payload: &super::AlertPayload,
    ) -> anyhow::Result<Option<u16>> {
        let sid = config
            .get("account_sid")
            .and_then(|v| v.as_str())
            .or(self.platform.twilio_account_sid.as_deref())
            .ok_or_else(|| anyhow::anyhow!("sms config is missing \"account_sid\""))?;
        let token = config
            .get("auth_token")
            .and_then(|v| v.as_str())
            .or(self.platform.twilio_auth_token.as_deref())
            .ok_or_else(|| anyhow::anyhow!("sms config is missing \"auth_token\""))?;
        let from = config
            .get("from")
            .and_then(|v| v.as_str())
            .or(self.platform.twilio_from.as_deref())
            .ok_or_else(|| anyhow::anyhow!("sms config is missing \"from\""))?;
        let to = config
            .get("to")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("sms config is missing \"to\""))?;

        let body = truncate_chars(&render_message(payload), SMS_MAX_CHARS);

        let response = self
            .http
            .post(format!(
                "https://api.twilio.com/2010-04-01/Accounts/{sid}/Messages.json"
            ))
            .basic_auth(sid, Some(token))
            .form(&[("From", from), ("To", to), ("Body", body.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("sms gateway returned {status}");
        }
        Ok(Some(status.as_u16()))
    }
}

/// HMAC-SHA256 over the request body, hex encoded
pub fn sign_body(key: &[u8], body: &[u8]) -> anyhow::Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("invalid signing key: {e}"))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Truncate on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        debug!("truncating message to {max_chars} chars");
        text.chars().take(max_chars).collect()
    }
}
