//! DNS executor
//!
//! Resolves the configured record type and optionally asserts an expected
//! value among the returned records.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;
use trust_dns_resolver::proto::rr::RecordType;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{CheckOutcome, Executor, JobCtx, deadline, latency_status, timeout_result};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DnsConfig {
    record_type: String,
    expected: Option<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            record_type: "A".to_string(),
            expected: None,
        }
    }
}

pub struct DnsExecutor;

#[async_trait]
impl Executor for DnsExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config: DnsConfig = serde_json::from_value(job.config.clone()).unwrap_or_default();
        let Some((host, _)) = super::host_and_port(&job.url, 0) else {
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
            result.error_code = Some(ErrorCode::InvalidConfig);
            result.error_message = Some(format!("cannot parse domain from {:?}", job.url));
            return CheckOutcome::ok(result);
        };

        let record_type = match config.record_type.to_uppercase().parse::<RecordType>() {
            Ok(rt) => rt,
            Err(_) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                result.error_code = Some(ErrorCode::InvalidConfig);
                result.error_message =
                    Some(format!("unknown record type {:?}", config.record_type));
                return CheckOutcome::ok(result);
            }
        };

        let start = Instant::now();
        let lookup = match deadline(job.timeout_ms, ctx.resolver.lookup(host.as_str(), record_type))
            .await
        {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err(e)) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                result.response_time_ms = Some(start.elapsed().as_millis() as u64);
                result.error_code = Some(ErrorCode::HostNotFound);
                result.error_message = Some(format!("{e}"));
                return CheckOutcome::ok(result);
            }
            Ok(Ok(lookup)) => lookup,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let records: Vec<String> = lookup
            .record_iter()
            .filter_map(|record| record.data().map(|data| data.to_string()))
            .collect();

        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);
        result.response_time_ms = Some(elapsed_ms);
        result.timings.dns_ms = Some(elapsed_ms);
        result.payload = serde_json::json!({
            "record_type": config.record_type.to_uppercase(),
            "records": records,
        });

        if records.is_empty() {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::HostNotFound);
            result.error_message = Some(format!("no {} records for {host}", config.record_type));
            return CheckOutcome::ok(result);
        }

        if let Some(expected) = &config.expected
            && !records.iter().any(|record| record.contains(expected.as_str()))
        {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::DnsMismatch);
            result.error_message = Some(format!(
                "expected {:?} among {} record(s), got {:?}",
                expected,
                records.len(),
                records
            ));
            return CheckOutcome::ok(result);
        }

        result.status = latency_status(elapsed_ms, job.degraded_threshold_ms);
        CheckOutcome::ok(result)
    }
}
