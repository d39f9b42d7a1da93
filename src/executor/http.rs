//! HTTP(S) executor
//!
//! Supports method, merged headers, request body, redirect following per
//! config, response-body assertions (`contains`, `not_contains`, `regex`),
//! allowed status codes, and a hard `max_response_time_ms` assertion. A
//! response that passes every hard assertion but is strictly slower than
//! `degraded_threshold_ms` is degraded, not success.
//!
//! For HTTPS targets the executor additionally captures certificate info
//! (best effort) so the ingest path can publish a `monitor:certificate`
//! event alongside the check itself.

use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use tracing::{instrument, trace, warn};

use crate::credentials::decrypt_config;
use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{
    CheckOutcome, Executor, JobCtx, classify_reqwest_error, deadline, latency_status,
    timeout_result,
};

pub struct HttpExecutor;

#[async_trait]
impl Executor for HttpExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config = decrypt_config(&ctx.cipher, &job.config);
        let follow_redirects = config
            .get("follow_redirects")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let client = match reqwest::Client::builder()
            .redirect(if follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            })
            .danger_accept_invalid_certs(
                config
                    .get("ignore_tls_errors")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            )
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                result.error_code = Some(ErrorCode::InternalError);
                result.error_message = Some(format!("failed to build HTTP client: {e}"));
                return CheckOutcome::ok(result);
            }
        };

        let start = Instant::now();

        // DNS phase measured separately; reqwest does not expose per-phase
        // timings
        let dns_ms = self.resolve_phase(job, ctx).await;
        if let Err(code) = &dns_ms {
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
            result.response_time_ms = Some(start.elapsed().as_millis() as u64);
            result.error_code = Some(*code);
            result.error_message = Some(format!("DNS resolution failed for {}", job.url));
            return CheckOutcome::ok(result);
        }

        let request = self.build_request(&client, job, &config);

        let response = match deadline(job.timeout_ms, request.send()).await {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err(e)) => {
                let elapsed = start.elapsed().as_millis() as u64;
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                result.response_time_ms = Some(elapsed);
                result.error_code = Some(classify_reqwest_error(&e));
                result.error_message = Some(format!("{e}"));
                return CheckOutcome::ok(result);
            }
            Ok(Ok(response)) => response,
        };

        let status_code = response.status().as_u16();

        // Body must be read inside the deadline too; HEAD gets none
        let body = if job.method.eq_ignore_ascii_case("HEAD") {
            String::new()
        } else {
            match deadline(
                job.timeout_ms.saturating_sub(start.elapsed().as_millis() as u64),
                response.text(),
            )
            .await
            {
                Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
                Ok(Err(e)) => {
                    let mut result =
                        CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                    result.response_time_ms = Some(start.elapsed().as_millis() as u64);
                    result.status_code = Some(status_code);
                    result.error_code = Some(classify_reqwest_error(&e));
                    result.error_message = Some(format!("failed to read body: {e}"));
                    return CheckOutcome::ok(result);
                }
                Ok(Ok(body)) => body,
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let mut result = self.evaluate(job, ctx, status_code, &body, elapsed_ms);
        result.timings.dns_ms = dns_ms.ok().flatten();

        // HTTPS co-check: capture certificate metadata for the event stream
        if job.url.starts_with("https://")
            && config
                .get("check_certificate")
                .and_then(|v| v.as_bool())
                .unwrap_or(true)
        {
            match super::tls::capture_certificate(job, 5_000).await {
                Ok(info) => {
                    if let Ok(value) = serde_json::to_value(&info) {
                        if result.payload.is_null() {
                            result.payload = serde_json::json!({});
                        }
                        if let Some(map) = result.payload.as_object_mut() {
                            map.insert("certificate".to_string(), value);
                        }
                    }
                }
                Err(e) => trace!("certificate capture skipped: {e:#}"),
            }
        }

        CheckOutcome::ok(result)
    }
}

impl HttpExecutor {
    /// Resolve the target host, returning the DNS phase duration.
    /// IP-literal hosts skip resolution.
    async fn resolve_phase(
        &self,
        job: &CheckJob,
        ctx: &JobCtx,
    ) -> Result<Option<u64>, ErrorCode> {
        let Some((host, _)) = super::host_and_port(&job.url, 443) else {
            return Err(ErrorCode::HostNotFound);
        };
        if std::net::IpAddr::from_str(&host).is_ok() {
            return Ok(None);
        }

        let started = Instant::now();
        match deadline(job.timeout_ms, ctx.resolver.lookup_ip(host.as_str())).await {
            Err(_) => Err(ErrorCode::Timeout),
            Ok(Err(_)) => Err(ErrorCode::HostNotFound),
            Ok(Ok(lookup)) => {
                if lookup.iter().next().is_none() {
                    return Err(ErrorCode::HostNotFound);
                }
                Ok(Some(started.elapsed().as_millis() as u64))
            }
        }
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        job: &CheckJob,
        config: &serde_json::Value,
    ) -> reqwest::RequestBuilder {
        let method = reqwest::Method::from_str(&job.method.to_uppercase())
            .unwrap_or(reqwest::Method::GET);

        let mut request = client.request(method, &job.url);

        for (name, value) in &job.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &job.body {
            request = request.body(body.clone());
        }

        // Basic auth from the (already decrypted) per-type config
        if let Some(username) = config.get("username").and_then(|v| v.as_str()) {
            let password = config.get("password").and_then(|v| v.as_str());
            request = request.basic_auth(username, password);
        }

        request
    }

    fn evaluate(
        &self,
        job: &CheckJob,
        ctx: &JobCtx,
        status_code: u16,
        body: &str,
        elapsed_ms: u64,
    ) -> CheckResult {
        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);
        result.status_code = Some(status_code);
        result.response_time_ms = Some(elapsed_ms);

        // Hard assertions first: status, body, response-time ceiling
        let status_ok = match &job.assertions.status_codes {
            Some(allowed) => allowed.contains(&status_code),
            None => (200..300).contains(&status_code),
        };
        if !status_ok {
            result.status = CheckStatus::Failure;
            result.error_code = Some(if status_code == 401 || status_code == 403 {
                ErrorCode::AuthFailed
            } else {
                ErrorCode::StatusCodeMismatch
            });
            result.error_message = Some(format!("unexpected status code: {status_code}"));
            return result;
        }

        if let Some(needle) = &job.assertions.body_contains
            && !body.contains(needle.as_str())
        {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::PatternMismatch);
            result.error_message = Some(format!("body does not contain {needle:?}"));
            return result;
        }

        if let Some(needle) = &job.assertions.body_not_contains
            && body.contains(needle.as_str())
        {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::PatternMismatch);
            result.error_message = Some(format!("body contains forbidden {needle:?}"));
            return result;
        }

        if let Some(pattern) = &job.assertions.body_regex {
            match Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(body) {
                        result.status = CheckStatus::Failure;
                        result.error_code = Some(ErrorCode::PatternMismatch);
                        result.error_message =
                            Some(format!("body does not match /{pattern}/"));
                        return result;
                    }
                }
                Err(e) => {
                    warn!("invalid body regex {pattern:?}: {e}");
                    result.status = CheckStatus::Error;
                    result.error_code = Some(ErrorCode::InvalidConfig);
                    result.error_message = Some(format!("invalid regex: {e}"));
                    return result;
                }
            }
        }

        if let Some(max_ms) = job.assertions.max_response_time_ms
            && elapsed_ms > max_ms
        {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::ResponseTooSlow);
            result.error_message =
                Some(format!("response took {elapsed_ms}ms (max {max_ms}ms)"));
            return result;
        }

        // All hard assertions pass; apply the soft latency rule
        result.status = latency_status(elapsed_ms, job.degraded_threshold_ms);
        if result.status == CheckStatus::Degraded {
            result.error_message = Some(format!(
                "response took {elapsed_ms}ms (degraded threshold {}ms)",
                job.degraded_threshold_ms.unwrap_or_default()
            ));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::PlainCipher;
    use crate::model::{Assertions, MonitorType};
    use crate::storage::SqliteStore;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_ctx() -> JobCtx {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        JobCtx::new("uk".to_string(), store, Arc::new(PlainCipher))
    }

    fn job(url: &str) -> CheckJob {
        CheckJob {
            monitor_id: "m1".to_string(),
            org_id: "o1".to_string(),
            monitor_type: MonitorType::Http,
            url: url.to_string(),
            method: "GET".to_string(),
            headers: Default::default(),
            body: None,
            timeout_ms: 5_000,
            interval_seconds: 60,
            degraded_threshold_ms: None,
            assertions: Assertions::default(),
            config: serde_json::json!({"check_certificate": false}),
            regions: vec![],
        }
    }

    #[tokio::test]
    async fn test_success_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let outcome = HttpExecutor
            .execute(&job(&server.uri()), &test_ctx().await)
            .await;
        assert_eq!(outcome.result.status, CheckStatus::Success);
        assert_eq!(outcome.result.status_code, Some(200));
        assert!(outcome.control_error.is_none());
    }

    #[tokio::test]
    async fn test_failure_on_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let outcome = HttpExecutor
            .execute(&job(&server.uri()), &test_ctx().await)
            .await;
        assert_eq!(outcome.result.status, CheckStatus::Failure);
        assert_eq!(
            outcome.result.error_code,
            Some(ErrorCode::StatusCodeMismatch)
        );
    }

    #[tokio::test]
    async fn test_auth_failure_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let outcome = HttpExecutor
            .execute(&job(&server.uri()), &test_ctx().await)
            .await;
        assert_eq!(outcome.result.error_code, Some(ErrorCode::AuthFailed));
    }

    #[tokio::test]
    async fn test_body_assertion_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("unhealthy"))
            .mount(&server)
            .await;

        let mut check = job(&server.uri());
        check.assertions.body_contains = Some("healthy".to_string());
        check.assertions.body_not_contains = Some("unhealthy".to_string());

        let outcome = HttpExecutor.execute(&check, &test_ctx().await).await;
        // body_contains("healthy") actually matches inside "unhealthy";
        // the not_contains assertion is what fails here
        assert_eq!(outcome.result.status, CheckStatus::Failure);
        assert_eq!(outcome.result.error_code, Some(ErrorCode::PatternMismatch));
    }

    #[tokio::test]
    async fn test_degraded_on_slow_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(150)),
            )
            .mount(&server)
            .await;

        let mut check = job(&server.uri());
        check.degraded_threshold_ms = Some(50);

        let outcome = HttpExecutor.execute(&check, &test_ctx().await).await;
        assert_eq!(outcome.result.status, CheckStatus::Degraded);
    }

    #[tokio::test]
    async fn test_timeout_is_timeout_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let mut check = job(&server.uri());
        check.timeout_ms = 100;

        let outcome = HttpExecutor.execute(&check, &test_ctx().await).await;
        assert_eq!(outcome.result.status, CheckStatus::Timeout);
        assert_eq!(outcome.result.error_code, Some(ErrorCode::Timeout));
        // bounded by the deadline
        assert!(outcome.result.response_time_ms.unwrap_or(0) <= 200);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Port 1 is essentially never listening
        let outcome = HttpExecutor
            .execute(&job("http://127.0.0.1:1/"), &test_ctx().await)
            .await;
        assert_eq!(outcome.result.status, CheckStatus::Failure);
        assert_eq!(
            outcome.result.error_code,
            Some(ErrorCode::ConnectionRefused)
        );
    }
}
