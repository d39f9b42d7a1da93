//! ICMP executor
//!
//! Raw ICMP sockets need elevated privileges, so this shells out to the
//! platform `ping` binary, the same way the traceroute executor drives its
//! tool. One echo request per check, bounded by the job timeout.

use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::instrument;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{CheckOutcome, Executor, JobCtx, deadline, latency_status, timeout_result};

pub struct PingExecutor;

#[async_trait]
impl Executor for PingExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let Some((host, _)) = super::host_and_port(&job.url, 0) else {
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
            result.error_code = Some(ErrorCode::InvalidConfig);
            result.error_message = Some(format!("cannot parse host from {:?}", job.url));
            return CheckOutcome::ok(result);
        };

        let mut command = Command::new("ping");
        #[cfg(target_os = "windows")]
        command.args(["-n", "1", "-w", &job.timeout_ms.to_string(), &host]);
        #[cfg(not(target_os = "windows"))]
        {
            let wait_secs = (job.timeout_ms / 1_000).max(1).to_string();
            command.args(["-c", "1", "-W", &wait_secs, &host]);
        }

        let start = Instant::now();
        let output = match deadline(job.timeout_ms, command.output()).await {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err(e)) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                result.error_code = Some(ErrorCode::InternalError);
                result.error_message = Some(format!("failed to run ping: {e}"));
                return CheckOutcome::ok(result);
            }
            Ok(Ok(output)) => output,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let rtt_ms = parse_rtt_ms(&stdout);

        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);
        result.response_time_ms = Some(rtt_ms.map(|rtt| rtt as u64).unwrap_or(elapsed_ms));
        result.payload = serde_json::json!({ "rtt_ms": rtt_ms });

        if output.status.success() {
            result.status =
                latency_status(result.response_time_ms.unwrap_or(0), job.degraded_threshold_ms);
        } else {
            result.status = CheckStatus::Failure;
            let stderr = String::from_utf8_lossy(&output.stderr);
            result.error_code = Some(if stderr.contains("unknown host") || stderr.contains("not known")
            {
                ErrorCode::HostNotFound
            } else {
                ErrorCode::DestinationUnreachable
            });
            result.error_message = Some(format!("ping to {host} failed"));
        }
        CheckOutcome::ok(result)
    }
}

/// Pull the round-trip time out of ping's output (`time=12.3 ms`)
fn parse_rtt_ms(output: &str) -> Option<f64> {
    let idx = output.find("time=")?;
    let rest = &output[idx + 5..];
    let end = rest.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rtt_from_linux_output() {
        let out = "64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=8.31 ms";
        assert_eq!(parse_rtt_ms(out), Some(8.31));
    }

    #[test]
    fn test_parse_rtt_missing() {
        assert_eq!(parse_rtt_ms("Request timeout for icmp_seq 1"), None);
    }
}
