//! Traceroute executor
//!
//! Drives the platform traceroute tool (ICMP mode preferred, `tracert` on
//! Windows), caps hops at `max_hops`, and derives the per-hop wait from the
//! job timeout. A hop of `* * *` is a timeout hop. The check succeeds when
//! the final hop resolves; a hop-count expectation mismatch degrades it.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::instrument;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{CheckOutcome, Executor, JobCtx, deadline, timeout_result};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TracerouteConfig {
    max_hops: u32,
    expected_hop_count: Option<u32>,
}

impl Default for TracerouteConfig {
    fn default() -> Self {
        Self {
            max_hops: 30,
            expected_hop_count: None,
        }
    }
}

/// One parsed hop; `None` fields mean the hop timed out
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hop {
    pub hop: u32,
    pub address: Option<String>,
    pub hostname: Option<String>,
    pub rtt_ms: Option<f64>,
}

pub struct TracerouteExecutor;

#[async_trait]
impl Executor for TracerouteExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config: TracerouteConfig =
            serde_json::from_value(job.config.clone()).unwrap_or_default();
        let Some((host, _)) = super::host_and_port(&job.url, 0) else {
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
            result.error_code = Some(ErrorCode::InvalidConfig);
            result.error_message = Some(format!("cannot parse host from {:?}", job.url));
            return CheckOutcome::ok(result);
        };

        let max_hops = config.max_hops.clamp(1, 64);
        // Spread the job timeout across hops, at least one second each
        let per_hop_wait = ((job.timeout_ms / 1_000) / max_hops as u64).max(1);

        let mut command;
        #[cfg(target_os = "windows")]
        {
            command = Command::new("tracert");
            command.args(["-h", &max_hops.to_string(), "-d", &host]);
        }
        #[cfg(not(target_os = "windows"))]
        {
            command = Command::new("traceroute");
            command.args([
                "-I",
                "-m",
                &max_hops.to_string(),
                "-w",
                &per_hop_wait.to_string(),
                "-q",
                "1",
                &host,
            ]);
        }

        let start = Instant::now();
        let output = match deadline(job.timeout_ms, command.output()).await {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err(e)) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                result.error_code = Some(ErrorCode::InternalError);
                result.error_message = Some(format!("failed to run traceroute: {e}"));
                return CheckOutcome::ok(result);
            }
            Ok(Ok(output)) => output,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let hops = parse_hops(&stdout);

        let hop_count = hops.len();
        let destination_reached = hops.last().is_some_and(|hop| hop.address.is_some());

        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);
        result.response_time_ms = Some(elapsed_ms);
        result.payload = serde_json::json!({
            "hops": hops,
            "hop_count": hop_count,
        });

        if !destination_reached {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::DestinationUnreachable);
            result.error_message = Some(format!(
                "destination {host} not reached within {} hops",
                hop_count.max(1)
            ));
            return CheckOutcome::ok(result);
        }

        if let Some(expected) = config.expected_hop_count
            && hop_count as u32 != expected
        {
            result.status = CheckStatus::Degraded;
            result.error_code = Some(ErrorCode::HopCountMismatch);
            result.error_message =
                Some(format!("route is {hop_count} hops, expected {expected}"));
        }
        CheckOutcome::ok(result)
    }
}

/// Parse traceroute output lines into hops. Lines that are not hop lines
/// (headers, warnings) are skipped.
pub fn parse_hops(output: &str) -> Vec<Hop> {
    let mut hops = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        let mut parts = trimmed.split_whitespace();

        let Some(hop_number) = parts.next().and_then(|first| first.parse::<u32>().ok()) else {
            continue;
        };

        let rest: Vec<&str> = parts.collect();
        if rest.iter().all(|token| *token == "*") {
            hops.push(Hop {
                hop: hop_number,
                address: None,
                hostname: None,
                rtt_ms: None,
            });
            continue;
        }

        // Formats: "host (ip)  1.23 ms"  or  "ip  1.23 ms"
        let mut hostname = None;
        let mut address = None;
        let mut rtt_ms = None;

        for (index, token) in rest.iter().enumerate() {
            if let Some(inner) = token.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
                address = Some(inner.to_string());
            } else if index == 0 {
                if token.parse::<std::net::IpAddr>().is_ok() {
                    address = Some(token.to_string());
                } else {
                    hostname = Some(token.to_string());
                }
            } else if rtt_ms.is_none()
                && rest.get(index + 1).is_some_and(|next| *next == "ms")
            {
                rtt_ms = token.parse().ok();
            }
        }

        hops.push(Hop {
            hop: hop_number,
            address,
            hostname,
            rtt_ms,
        });
    }

    hops
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
traceroute to example.com (93.184.216.34), 30 hops max, 60 byte packets
 1  gateway (192.168.1.1)  1.123 ms
 2  * * *
 3  93.184.216.34  12.456 ms
";

    #[test]
    fn test_parses_named_timeout_and_bare_hops() {
        let hops = parse_hops(SAMPLE);
        assert_eq!(hops.len(), 3);

        assert_eq!(hops[0].hostname.as_deref(), Some("gateway"));
        assert_eq!(hops[0].address.as_deref(), Some("192.168.1.1"));
        assert_eq!(hops[0].rtt_ms, Some(1.123));

        assert_eq!(hops[1].address, None);
        assert_eq!(hops[1].rtt_ms, None);

        assert_eq!(hops[2].address.as_deref(), Some("93.184.216.34"));
        assert_eq!(hops[2].rtt_ms, Some(12.456));
    }

    #[test]
    fn test_header_lines_are_skipped() {
        let hops = parse_hops("traceroute to x, 30 hops max\nno hops here\n");
        assert!(hops.is_empty());
    }
}
