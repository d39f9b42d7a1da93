//! Email delivery
//!
//! Prefers the org's BYO SMTP config; falls back to the platform SMTP
//! settings, then to a hosted-API key when configured. Rendering stays
//! deliberately plain — template rendering is an external concern.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use tracing::debug;

use super::{AlertKind, AlertPayload, PlatformSenders, render_message};

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

pub async fn send(
    config: &serde_json::Value,
    platform: &PlatformSenders,
    payload: &AlertPayload,
) -> anyhow::Result<()> {
    let to = config
        .get("to")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("email config is missing \"to\""))?;

    let subject = match payload.status {
        AlertKind::Triggered => format!("[ALERT] {} is down", payload.monitor_name),
        AlertKind::Recovered => format!("[RESOLVED] {} has recovered", payload.monitor_name),
    };
    let body = render_message(payload);

    // BYO SMTP from the channel config wins
    if let Ok(smtp) = serde_json::from_value::<SmtpSettings>(config.clone()) {
        return send_smtp(&smtp, to, &subject, &body).await;
    }

    if let Some(smtp) = &platform.smtp {
        debug!("using platform SMTP fallback for {to}");
        return send_smtp(smtp, to, &subject, &body).await;
    }

    if let Some(api_key) = &platform.resend_api_key {
        debug!("using hosted email API fallback for {to}");
        return send_hosted(api_key, to, &subject, &body).await;
    }

    anyhow::bail!("no SMTP configuration and no platform fallback available")
}

/// Send through the platform senders only (maintenance notices and other
/// system mail with no per-channel config)
pub async fn send_direct(
    platform: &PlatformSenders,
    to: &str,
    subject: &str,
    body: &str,
) -> anyhow::Result<()> {
    if let Some(smtp) = &platform.smtp {
        return send_smtp(smtp, to, subject, body).await;
    }
    if let Some(api_key) = &platform.resend_api_key {
        return send_hosted(api_key, to, subject, body).await;
    }
    anyhow::bail!("no platform email sender configured")
}

async fn send_smtp(smtp: &SmtpSettings, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
    let from: Mailbox = smtp
        .from
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid from address {:?}: {e}", smtp.from))?;
    let to: Mailbox = to
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid to address {to:?}: {e}"))?;

    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .body(body.to_string())?;

    let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)?
        .port(smtp.port)
        .credentials(Credentials::new(smtp.username.clone(), smtp.password.clone()))
        .build();

    transport.send(message).await?;
    Ok(())
}

async fn send_hosted(api_key: &str, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .post("https://api.resend.com/emails")
        .bearer_auth(api_key)
        .json(&serde_json::json!({
            "from": "alerts@vigil.dev",
            "to": [to],
            "subject": subject,
            "text": body,
        }))
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("hosted email API returned {}", response.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smtp_settings_deserialization() {
        let settings: SmtpSettings = serde_json::from_value(serde_json::json!({
            "host": "smtp.example.com",
            "username": "mailer",
            "password": "hunter2",
            "from": "alerts@example.com",
        }))
        .unwrap();
        assert_eq!(settings.port, 587);
    }

    #[tokio::test]
    async fn test_missing_everything_is_an_error() {
        let payload = AlertPayload {
            alert_history_id: "a1".to_string(),
            monitor_name: "api".to_string(),
            monitor_url: "https://api.example.com".to_string(),
            status: AlertKind::Triggered,
            message: None,
            response_time_ms: None,
            status_code: None,
            dashboard_url: String::new(),
            timestamp: chrono::Utc::now(),
        };

        let err = send(
            &serde_json::json!({"to": "ops@example.com"}),
            &PlatformSenders::default(),
            &payload,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no SMTP configuration"));
    }
}
