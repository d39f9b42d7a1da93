//! Message-broker executor (MQTT, AMQP)
//!
//! Both protocols are checked by completing a real connection handshake:
//! MQTT waits for a `CONNACK`, AMQP for the connection to open. Credentials
//! come decrypted from the per-type config.

use std::time::Instant;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use tracing::instrument;

use crate::credentials::decrypt_config;
use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode, MonitorType, new_id};

use super::{CheckOutcome, Executor, JobCtx, deadline, latency_status, timeout_result};

pub struct BrokerExecutor;

#[async_trait]
impl Executor for BrokerExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id, kind = %job.monitor_type))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config = decrypt_config(&ctx.cipher, &job.config);
        let start = Instant::now();

        let outcome = match job.monitor_type {
            MonitorType::Amqp => {
                deadline(job.timeout_ms, self.check_amqp(job, &config)).await
            }
            _ => deadline(job.timeout_ms, self.check_mqtt(job, &config)).await,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let mut result = match outcome {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err((code, message))) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                result.error_code = Some(code);
                result.error_message = Some(message);
                result
            }
            Ok(Ok(())) => CheckResult::new(
                &job.monitor_id,
                &ctx.region,
                latency_status(elapsed_ms, job.degraded_threshold_ms),
            ),
        };
        result.response_time_ms = Some(elapsed_ms);
        CheckOutcome::ok(result)
    }
}

impl BrokerExecutor {
    async fn check_mqtt(
        &self,
        job: &CheckJob,
        config: &serde_json::Value,
    ) -> Result<(), (ErrorCode, String)> {
        let Some((host, port)) = super::host_and_port(&job.url, 1883) else {
            return Err((
                ErrorCode::InvalidConfig,
                format!("cannot parse broker from {:?}", job.url),
            ));
        };

        let mut options = MqttOptions::new(format!("vigil-{}", new_id()), host, port);
        if let (Some(username), Some(password)) = (
            config.get("username").and_then(|v| v.as_str()),
            config.get("password").and_then(|v| v.as_str()),
        ) {
            options.set_credentials(username, password);
        }

        let (_client, mut eventloop) = AsyncClient::new(options, 4);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == rumqttc::ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err((
                            ErrorCode::AuthFailed,
                            format!("broker rejected connection: {:?}", ack.code),
                        ))
                    };
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err((
                        ErrorCode::ConnectionRefused,
                        format!("MQTT connect failed: {e}"),
                    ));
                }
            }
        }
    }

    async fn check_amqp(
        &self,
        job: &CheckJob,
        config: &serde_json::Value,
    ) -> Result<(), (ErrorCode, String)> {
        let uri = if job.url.starts_with("amqp://") || job.url.starts_with("amqps://") {
            job.url.clone()
        } else {
            format!("amqp://{}", job.url)
        };

        let connection =
            lapin::Connection::connect(&uri, lapin::ConnectionProperties::default())
                .await
                .map_err(|e| {
                    let text = e.to_string();
                    let code = if text.contains("ACCESS_REFUSED") || text.contains("auth") {
                        ErrorCode::AuthFailed
                    } else {
                        ErrorCode::ConnectionRefused
                    };
                    (code, format!("AMQP connect failed: {e}"))
                })?;

        // Optional: assert a queue exists (passively) before closing
        if let Some(queue) = config.get("queue").and_then(|v| v.as_str()) {
            let channel = connection.create_channel().await.map_err(|e| {
                (
                    ErrorCode::ProtocolError,
                    format!("AMQP channel open failed: {e}"),
                )
            })?;
            channel
                .queue_declare(
                    queue,
                    lapin::options::QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    lapin::types::FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    (
                        ErrorCode::QueueNotFound,
                        format!("queue {queue:?} not found: {e}"),
                    )
                })?;
        }

        let _ = connection.close(200, "check complete").await;
        Ok(())
    }
}
