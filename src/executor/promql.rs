//! PromQL executor
//!
//! Runs a configured instant query against a Prometheus-compatible API and
//! compares the first sample against warning/critical thresholds.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{CheckOutcome, Executor, JobCtx, classify_reqwest_error, deadline, timeout_result};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PromqlConfig {
    query: String,
    /// "gt": the value firing when it exceeds a threshold; "lt": when below
    comparison: String,
    warning_threshold: Option<f64>,
    critical_threshold: Option<f64>,
}

impl Default for PromqlConfig {
    fn default() -> Self {
        Self {
            query: "up".to_string(),
            comparison: "lt".to_string(),
            warning_threshold: None,
            critical_threshold: None,
        }
    }
}

pub struct PromqlExecutor;

#[async_trait]
impl Executor for PromqlExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config: PromqlConfig = serde_json::from_value(job.config.clone()).unwrap_or_default();
        let url = format!("{}/api/v1/query", job.url.trim_end_matches('/'));

        let start = Instant::now();
        let response = match deadline(
            job.timeout_ms,
            ctx.http.get(&url).query(&[("query", &config.query)]).send(),
        )
        .await
        {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err(e)) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                result.response_time_ms = Some(start.elapsed().as_millis() as u64);
                result.error_code = Some(classify_reqwest_error(&e));
                result.error_message = Some(format!("query request failed: {e}"));
                return CheckOutcome::ok(result);
            }
            Ok(Ok(response)) => response,
        };

        let body: serde_json::Value = match deadline(job.timeout_ms, response.json()).await {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err(e)) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                result.error_code = Some(ErrorCode::ProtocolError);
                result.error_message = Some(format!("unparseable query response: {e}"));
                return CheckOutcome::ok(result);
            }
            Ok(Ok(body)) => body,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let value = extract_sample(&body);
        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);
        result.response_time_ms = Some(elapsed_ms);
        result.payload = serde_json::json!({ "query": config.query, "value": value });

        let Some(value) = value else {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::PatternMismatch);
            result.error_message = Some("query returned no samples".to_string());
            return CheckOutcome::ok(result);
        };

        let breaches = |threshold: f64| match config.comparison.as_str() {
            "gt" => value > threshold,
            _ => value < threshold,
        };

        if let Some(critical) = config.critical_threshold
            && breaches(critical)
        {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::PatternMismatch);
            result.error_message = Some(format!(
                "value {value} breaches critical threshold {critical}"
            ));
        } else if let Some(warning) = config.warning_threshold
            && breaches(warning)
        {
            result.status = CheckStatus::Degraded;
            result.error_message = Some(format!(
                "value {value} breaches warning threshold {warning}"
            ));
        }
        CheckOutcome::ok(result)
    }
}

/// Pull the first sample value out of a Prometheus instant-query response
fn extract_sample(body: &serde_json::Value) -> Option<f64> {
    body.get("data")?
        .get("result")?
        .as_array()?
        .first()?
        .get("value")?
        .as_array()?
        .get(1)?
        .as_str()?
        .parse()
        .ok()
}
