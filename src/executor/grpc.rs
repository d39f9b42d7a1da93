//! gRPC executor
//!
//! Uses the standard `grpc.health.v1` health protocol. The configured
//! service name defaults to the empty string, which per the protocol means
//! "the server as a whole".

use std::time::Instant;

use async_trait::async_trait;
use tonic::transport::Endpoint;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tracing::instrument;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{CheckOutcome, Executor, JobCtx, deadline, latency_status, timeout_result};

pub struct GrpcExecutor;

#[async_trait]
impl Executor for GrpcExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let service = job
            .config
            .get("service")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let endpoint = match Endpoint::from_shared(job.url.clone()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                result.error_code = Some(ErrorCode::InvalidConfig);
                result.error_message = Some(format!("invalid gRPC endpoint: {e}"));
                return CheckOutcome::ok(result);
            }
        };

        let start = Instant::now();
        let channel = match deadline(job.timeout_ms, endpoint.connect()).await {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err(e)) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                result.response_time_ms = Some(start.elapsed().as_millis() as u64);
                result.error_code = Some(ErrorCode::ConnectionRefused);
                result.error_message = Some(format!("gRPC connect failed: {e}"));
                return CheckOutcome::ok(result);
            }
            Ok(Ok(channel)) => channel,
        };

        let mut client = HealthClient::new(channel);
        let request = HealthCheckRequest {
            service: service.clone(),
        };

        let remaining = job.timeout_ms.saturating_sub(start.elapsed().as_millis() as u64);
        let response = match deadline(remaining.max(1), client.check(request)).await {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err(status)) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                result.response_time_ms = Some(start.elapsed().as_millis() as u64);
                result.error_code = Some(match status.code() {
                    tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
                        ErrorCode::AuthFailed
                    }
                    tonic::Code::NotFound | tonic::Code::Unimplemented => {
                        ErrorCode::ProtocolError
                    }
                    _ => ErrorCode::ProtocolError,
                });
                result.error_message = Some(format!("health check failed: {status}"));
                return CheckOutcome::ok(result);
            }
            Ok(Ok(response)) => response,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let serving = response.into_inner().status();
        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);
        result.response_time_ms = Some(elapsed_ms);
        result.payload = serde_json::json!({
            "service": service,
            "serving_status": format!("{serving:?}"),
        });

        match serving {
            ServingStatus::Serving => {
                result.status = latency_status(elapsed_ms, job.degraded_threshold_ms);
            }
            other => {
                result.status = CheckStatus::Failure;
                result.error_code = Some(ErrorCode::ProtocolError);
                result.error_message = Some(format!("service reported {other:?}"));
            }
        }
        CheckOutcome::ok(result)
    }
}
