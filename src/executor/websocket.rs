//! WebSocket executor
//!
//! Completes the upgrade handshake, optionally exchanges a ping/pong, and
//! closes cleanly. Handshake latency drives the degraded rule.

use std::time::Instant;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::instrument;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{CheckOutcome, Executor, JobCtx, deadline, latency_status, timeout_result};

pub struct WebsocketExecutor;

#[async_trait]
impl Executor for WebsocketExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let start = Instant::now();

        let connected = match deadline(job.timeout_ms, connect_async(job.url.as_str())).await {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err(e)) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                result.response_time_ms = Some(start.elapsed().as_millis() as u64);
                result.error_code = Some(classify_ws_error(&e));
                result.error_message = Some(format!("websocket handshake failed: {e}"));
                return CheckOutcome::ok(result);
            }
            Ok(Ok((stream, response))) => (stream, response),
        };
        let (mut stream, response) = connected;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        // Best-effort ping within whatever deadline remains
        let remaining = job.timeout_ms.saturating_sub(elapsed_ms).max(1);
        let ponged = deadline(remaining, async {
            stream.send(Message::Ping(Vec::new())).await.ok()?;
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Pong(_)) => return Some(true),
                    Ok(_) => continue,
                    Err(_) => return Some(false),
                }
            }
            Some(false)
        })
        .await
        .ok()
        .flatten()
        .unwrap_or(false);

        let _ = stream.close(None).await;

        let mut result = CheckResult::new(
            &job.monitor_id,
            &ctx.region,
            latency_status(elapsed_ms, job.degraded_threshold_ms),
        );
        result.response_time_ms = Some(elapsed_ms);
        result.status_code = Some(response.status().as_u16());
        result.payload = serde_json::json!({ "pong": ponged });
        CheckOutcome::ok(result)
    }
}

fn classify_ws_error(err: &tokio_tungstenite::tungstenite::Error) -> ErrorCode {
    use tokio_tungstenite::tungstenite::Error;
    match err {
        Error::Io(io) => super::classify_io_error(io),
        Error::Tls(_) => ErrorCode::SslError,
        Error::Http(response) => {
            if response.status() == 401 || response.status() == 403 {
                ErrorCode::AuthFailed
            } else {
                ErrorCode::StatusCodeMismatch
            }
        }
        Error::Url(_) => ErrorCode::InvalidConfig,
        _ => ErrorCode::ProtocolError,
    }
}
