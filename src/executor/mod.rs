//! Per-protocol check executors
//!
//! Every executor is a pure mapping `(CheckJob, JobCtx) -> CheckOutcome`.
//! Check-level failures (refused connections, bad certificates, assertion
//! misses) are **data**: they become a persisted `CheckResult`, never an
//! error. Only control-plane failures (store down, internal bug) surface as
//! a `ControlError`, which fails the job so the broker retries it.
//!
//! ## Timeout discipline
//!
//! `timeout_ms` is a hard wall-clock bound enforced with `deadline()`. A
//! late socket event cannot double-write: the timeout branch wins the race
//! and the losing future is dropped at the await point. Code paths that
//! capture data from callbacks (the TLS verifier) go through a single-writer
//! latch instead.

pub mod aggregate;
pub mod broker;
pub mod ct;
pub mod database;
pub mod dns;
pub mod email_auth;
pub mod grpc;
pub mod heartbeat;
pub mod http;
pub mod ping;
pub mod promql;
pub mod tcp;
pub mod tls;
pub mod traceroute;
pub mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};

use crate::credentials::CredentialCipher;
use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode, MonitorType};
use crate::storage::Store;

/// Shared context handed to every executor invocation
#[derive(Clone)]
pub struct JobCtx {
    /// Region stamped onto results produced by this worker
    pub region: String,
    pub store: Arc<dyn Store>,
    pub cipher: Arc<dyn CredentialCipher>,
    /// Base HTTP client (no redirects, no default timeout; executors attach
    /// per-request deadlines)
    pub http: reqwest::Client,
    pub resolver: Arc<TokioAsyncResolver>,
}

impl JobCtx {
    pub fn new(region: String, store: Arc<dyn Store>, cipher: Arc<dyn CredentialCipher>) -> Self {
        Self {
            region,
            store,
            cipher,
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
            resolver: Arc::new(TokioAsyncResolver::tokio(
                ResolverConfig::default(),
                ResolverOpts::default(),
            )),
        }
    }
}

/// A control-plane failure that should fail (and retry) the job itself
#[derive(Debug)]
pub struct ControlError(pub anyhow::Error);

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

/// What an executor hands back: always a result, sometimes a job failure
pub struct CheckOutcome {
    pub result: CheckResult,
    pub control_error: Option<ControlError>,
}

impl CheckOutcome {
    pub fn ok(result: CheckResult) -> Self {
        Self {
            result,
            control_error: None,
        }
    }

    pub fn control(result: CheckResult, error: anyhow::Error) -> Self {
        Self {
            result,
            control_error: Some(ControlError(error)),
        }
    }
}

/// One protocol implementation
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome;
}

/// Resolve the executor for a monitor type
pub fn executor_for(monitor_type: MonitorType) -> Arc<dyn Executor> {
    match monitor_type {
        MonitorType::Http | MonitorType::Elasticsearch => Arc::new(http::HttpExecutor),
        MonitorType::Promql => Arc::new(promql::PromqlExecutor),
        MonitorType::Ssl => Arc::new(tls::TlsExecutor::full()),
        MonitorType::CertificateTransparency => Arc::new(ct::CtExecutor),
        MonitorType::Dns => Arc::new(dns::DnsExecutor),
        MonitorType::EmailAuth => Arc::new(email_auth::EmailAuthExecutor),
        MonitorType::Tcp
        | MonitorType::Smtp
        | MonitorType::Imap
        | MonitorType::Pop3
        | MonitorType::Ssh
        | MonitorType::Ldap
        | MonitorType::Rdp => Arc::new(tcp::TcpExecutor),
        MonitorType::Ping => Arc::new(ping::PingExecutor),
        MonitorType::Traceroute => Arc::new(traceroute::TracerouteExecutor),
        MonitorType::Websocket => Arc::new(websocket::WebsocketExecutor),
        MonitorType::Grpc => Arc::new(grpc::GrpcExecutor),
        MonitorType::Mqtt | MonitorType::Amqp => Arc::new(broker::BrokerExecutor),
        MonitorType::Postgres
        | MonitorType::Mysql
        | MonitorType::Mongodb
        | MonitorType::Redis => Arc::new(database::DatabaseExecutor),
        MonitorType::Heartbeat => Arc::new(heartbeat::HeartbeatExecutor),
        MonitorType::PrometheusRemoteWrite => Arc::new(heartbeat::HeartbeatExecutor),
        MonitorType::Aggregate => Arc::new(aggregate::AggregateExecutor),
    }
}

/// Await `fut` under the job's wall-clock deadline
pub async fn deadline<T>(
    timeout_ms: u64,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, tokio::time::error::Elapsed> {
    tokio::time::timeout(Duration::from_millis(timeout_ms.max(1)), fut).await
}

/// Single-writer guard for callback-driven capture paths: only the first
/// claimant may write the shared result
#[derive(Debug, Default)]
pub struct ResultLatch {
    written: AtomicBool,
}

impl ResultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once
    pub fn try_claim(&self) -> bool {
        self.written
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Build the timeout result every executor shares
pub fn timeout_result(job: &CheckJob, region: &str) -> CheckResult {
    let mut result = CheckResult::new(&job.monitor_id, region, CheckStatus::Timeout);
    result.response_time_ms = Some(job.timeout_ms);
    result.error_code = Some(ErrorCode::Timeout);
    result.error_message = Some(format!("check exceeded {}ms", job.timeout_ms));
    result
}

/// success vs degraded by the soft latency rule: strictly slower than the
/// threshold is degraded; exactly at the threshold is still success
pub fn latency_status(elapsed_ms: u64, degraded_threshold_ms: Option<u64>) -> CheckStatus {
    match degraded_threshold_ms {
        Some(threshold) if elapsed_ms > threshold => CheckStatus::Degraded,
        _ => CheckStatus::Success,
    }
}

/// Map a transport error to the stable taxonomy
pub fn classify_io_error(err: &std::io::Error) -> ErrorCode {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
        ErrorKind::TimedOut => ErrorCode::Timeout,
        ErrorKind::NotFound => ErrorCode::HostNotFound,
        ErrorKind::PermissionDenied => ErrorCode::AuthFailed,
        _ => ErrorCode::ProtocolError,
    }
}

/// Map a reqwest error to the stable taxonomy
pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        return ErrorCode::Timeout;
    }
    if err.is_connect() {
        let text = err.to_string();
        if text.contains("dns") || text.contains("resolve") {
            return ErrorCode::HostNotFound;
        }
        return ErrorCode::ConnectionRefused;
    }
    let text = err.to_string();
    if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
        return ErrorCode::SslError;
    }
    ErrorCode::ProtocolError
}

/// Extract `host` (and optional port) from a URL-ish target string
pub fn host_and_port(url: &str, default_port: u16) -> Option<(String, u16)> {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("wss://"))
        .or_else(|| url.strip_prefix("ws://"))
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    let authority = stripped.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => Some((host.to_string(), port)),
            Err(_) => Some((authority.to_string(), default_port)),
        },
        _ => Some((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_threshold_is_strict() {
        // exactly at the threshold is NOT degraded
        assert_eq!(latency_status(500, Some(500)), CheckStatus::Success);
        assert_eq!(latency_status(501, Some(500)), CheckStatus::Degraded);
        assert_eq!(latency_status(10_000, None), CheckStatus::Success);
    }

    #[test]
    fn test_result_latch_single_writer() {
        let latch = ResultLatch::new();
        assert!(latch.try_claim());
        assert!(!latch.try_claim());
        assert!(!latch.try_claim());
    }

    #[test]
    fn test_host_and_port_parsing() {
        assert_eq!(
            host_and_port("https://example.com/path", 443),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            host_and_port("example.com:5432", 0),
            Some(("example.com".to_string(), 5432))
        );
        assert_eq!(
            host_and_port("tcp://10.0.0.1:6379", 0),
            Some(("10.0.0.1".to_string(), 6379))
        );
        assert_eq!(host_and_port("", 80), None);
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let slow = tokio::time::sleep(Duration::from_secs(5));
        let outcome = deadline(10, slow).await;
        assert!(outcome.is_err());
    }
}
