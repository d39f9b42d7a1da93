//! Core data model
//!
//! Every entity belongs to exactly one organization. Identifiers are opaque
//! URL-safe strings; timestamps are UTC with millisecond precision.
//!
//! Enums that are persisted as TEXT provide `as_str`/`parse` pairs with a
//! conservative fallback, so an unknown value read back from the database
//! never panics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a new opaque id (UUID v4, compact hex form)
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Monitors
// ============================================================================

/// Protocol implemented by a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorType {
    Http,
    Ssl,
    CertificateTransparency,
    Dns,
    Tcp,
    Ping,
    Traceroute,
    Websocket,
    Grpc,
    Smtp,
    Imap,
    Pop3,
    Ssh,
    Ldap,
    Rdp,
    Mqtt,
    Amqp,
    Postgres,
    Mysql,
    Mongodb,
    Redis,
    Elasticsearch,
    EmailAuth,
    Promql,
    PrometheusRemoteWrite,
    Heartbeat,
    Aggregate,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorType::Http => "http",
            MonitorType::Ssl => "ssl",
            MonitorType::CertificateTransparency => "certificate_transparency",
            MonitorType::Dns => "dns",
            MonitorType::Tcp => "tcp",
            MonitorType::Ping => "ping",
            MonitorType::Traceroute => "traceroute",
            MonitorType::Websocket => "websocket",
            MonitorType::Grpc => "grpc",
            MonitorType::Smtp => "smtp",
            MonitorType::Imap => "imap",
            MonitorType::Pop3 => "pop3",
            MonitorType::Ssh => "ssh",
            MonitorType::Ldap => "ldap",
            MonitorType::Rdp => "rdp",
            MonitorType::Mqtt => "mqtt",
            MonitorType::Amqp => "amqp",
            MonitorType::Postgres => "postgres",
            MonitorType::Mysql => "mysql",
            MonitorType::Mongodb => "mongodb",
            MonitorType::Redis => "redis",
            MonitorType::Elasticsearch => "elasticsearch",
            MonitorType::EmailAuth => "email_auth",
            MonitorType::Promql => "promql",
            MonitorType::PrometheusRemoteWrite => "prometheus_remote_write",
            MonitorType::Heartbeat => "heartbeat",
            MonitorType::Aggregate => "aggregate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "http" => MonitorType::Http,
            "ssl" => MonitorType::Ssl,
            "certificate_transparency" => MonitorType::CertificateTransparency,
            "dns" => MonitorType::Dns,
            "tcp" => MonitorType::Tcp,
            "ping" => MonitorType::Ping,
            "traceroute" => MonitorType::Traceroute,
            "websocket" => MonitorType::Websocket,
            "grpc" => MonitorType::Grpc,
            "smtp" => MonitorType::Smtp,
            "imap" => MonitorType::Imap,
            "pop3" => MonitorType::Pop3,
            "ssh" => MonitorType::Ssh,
            "ldap" => MonitorType::Ldap,
            "rdp" => MonitorType::Rdp,
            "mqtt" => MonitorType::Mqtt,
            "amqp" => MonitorType::Amqp,
            "postgres" => MonitorType::Postgres,
            "mysql" => MonitorType::Mysql,
            "mongodb" => MonitorType::Mongodb,
            "redis" => MonitorType::Redis,
            "elasticsearch" => MonitorType::Elasticsearch,
            "email_auth" => MonitorType::EmailAuth,
            "promql" => MonitorType::Promql,
            "prometheus_remote_write" => MonitorType::PrometheusRemoteWrite,
            "heartbeat" => MonitorType::Heartbeat,
            "aggregate" => MonitorType::Aggregate,
            _ => return None,
        })
    }

    /// Queue the scheduler routes this monitor type to
    pub fn queue_name(&self) -> &'static str {
        match self {
            MonitorType::Http | MonitorType::Promql | MonitorType::Elasticsearch => "check:http",
            MonitorType::Ssl | MonitorType::CertificateTransparency => "check:ssl",
            MonitorType::Dns | MonitorType::EmailAuth => "check:dns",
            MonitorType::Tcp
            | MonitorType::Smtp
            | MonitorType::Imap
            | MonitorType::Pop3
            | MonitorType::Ssh
            | MonitorType::Ldap
            | MonitorType::Rdp => "check:tcp",
            MonitorType::Ping => "check:ping",
            MonitorType::Traceroute => "check:traceroute",
            MonitorType::Websocket | MonitorType::Grpc => "check:stream",
            MonitorType::Mqtt | MonitorType::Amqp => "check:broker",
            MonitorType::Postgres
            | MonitorType::Mysql
            | MonitorType::Mongodb
            | MonitorType::Redis => "check:database",
            MonitorType::PrometheusRemoteWrite | MonitorType::Heartbeat => "check:passive",
            MonitorType::Aggregate => "check:aggregate",
        }
    }

    /// Passive monitors advance their schedule without an enqueued job;
    /// their results arrive from outside (pushed metrics).
    pub fn is_passive(&self) -> bool {
        matches!(self, MonitorType::PrometheusRemoteWrite)
    }
}

impl std::fmt::Display for MonitorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse monitor state shown on dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Active,
    Degraded,
    Down,
    Paused,
    Pending,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Active => "active",
            MonitorStatus::Degraded => "degraded",
            MonitorStatus::Down => "down",
            MonitorStatus::Paused => "paused",
            MonitorStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => MonitorStatus::Active,
            "degraded" => MonitorStatus::Degraded,
            "down" => MonitorStatus::Down,
            "paused" => MonitorStatus::Paused,
            _ => MonitorStatus::Pending,
        }
    }
}

/// Response-body and status assertions applied by active executors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assertions {
    /// Allowed HTTP status codes (default: any 2xx)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_codes: Option<Vec<u16>>,

    /// Response body must contain this substring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_contains: Option<String>,

    /// Response body must NOT contain this substring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_not_contains: Option<String>,

    /// Response body must match this regex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_regex: Option<String>,

    /// Hard upper bound on response time (a miss is a failure, not degraded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_time_ms: Option<u64>,
}

impl Assertions {
    pub fn is_empty(&self) -> bool {
        *self == Assertions::default()
    }
}

/// A configured target + protocol + cadence + assertions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub monitor_type: MonitorType,
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Check cadence; always >= 10
    pub interval_seconds: u32,

    /// Hard wall-clock bound for each check; always > 0
    pub timeout_ms: u64,

    /// Soft latency bound; a response strictly slower than this is degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_threshold_ms: Option<u64>,

    #[serde(default)]
    pub assertions: Assertions,

    /// Per-type configuration (TLS policy, DNS expectations, thresholds, ...)
    #[serde(default)]
    pub config: serde_json::Value,

    #[serde(default)]
    pub regions: Vec<String>,

    #[serde(default)]
    pub paused: bool,

    pub status: MonitorStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_check_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_method() -> String {
    "GET".to_string()
}

// ============================================================================
// Check results
// ============================================================================

/// Outcome class of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Success,
    Degraded,
    Failure,
    Timeout,
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Success => "success",
            CheckStatus::Degraded => "degraded",
            CheckStatus::Failure => "failure",
            CheckStatus::Timeout => "timeout",
            CheckStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => CheckStatus::Success,
            "degraded" => CheckStatus::Degraded,
            "failure" => CheckStatus::Failure,
            "timeout" => CheckStatus::Timeout,
            _ => CheckStatus::Error,
        }
    }

    /// failure, timeout and error all count as hard failures for alerting
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CheckStatus::Failure | CheckStatus::Timeout | CheckStatus::Error
        )
    }

    /// Coarse monitor status this check result maps to
    pub fn monitor_status(&self) -> MonitorStatus {
        match self {
            CheckStatus::Success => MonitorStatus::Active,
            CheckStatus::Degraded => MonitorStatus::Degraded,
            _ => MonitorStatus::Down,
        }
    }
}

/// Stable error classification; serialized SCREAMING_SNAKE_CASE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionRefused,
    HostNotFound,
    SslError,
    AuthFailed,
    Timeout,
    CertExpired,
    CertExpiringWarning,
    CertExpiringCritical,
    CertChainIncomplete,
    CertHostnameMismatch,
    CertChainInvalid,
    TlsVersionTooLow,
    CipherBlocked,
    OcspStapleMissing,
    OcspUnreachable,
    CrlUnreachable,
    CaaInvalid,
    PatternMismatch,
    StatusCodeMismatch,
    ResponseTooSlow,
    RowCountMismatch,
    CtUnexpectedIssuer,
    CtNewCertificate,
    CtFetchFailed,
    DnsMismatch,
    ProtocolError,
    QueueNotFound,
    HopCountMismatch,
    DestinationUnreachable,
    Overdue,
    JobFailed,
    NoPings,
    SpfMissing,
    DkimMissing,
    DmarcMissing,
    AuthScoreLow,
    DependencyDown,
    DependencyDegraded,
    InvalidConfig,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        // serde provides the canonical form; this avoids allocating for logs
        match self {
            ErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCode::HostNotFound => "HOST_NOT_FOUND",
            ErrorCode::SslError => "SSL_ERROR",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::CertExpired => "CERT_EXPIRED",
            ErrorCode::CertExpiringWarning => "CERT_EXPIRING_WARNING",
            ErrorCode::CertExpiringCritical => "CERT_EXPIRING_CRITICAL",
            ErrorCode::CertChainIncomplete => "CERT_CHAIN_INCOMPLETE",
            ErrorCode::CertHostnameMismatch => "CERT_HOSTNAME_MISMATCH",
            ErrorCode::CertChainInvalid => "CERT_CHAIN_INVALID",
            ErrorCode::TlsVersionTooLow => "TLS_VERSION_TOO_LOW",
            ErrorCode::CipherBlocked => "CIPHER_BLOCKED",
            ErrorCode::OcspStapleMissing => "OCSP_STAPLE_MISSING",
            ErrorCode::OcspUnreachable => "OCSP_UNREACHABLE",
            ErrorCode::CrlUnreachable => "CRL_UNREACHABLE",
            ErrorCode::CaaInvalid => "CAA_INVALID",
            ErrorCode::PatternMismatch => "PATTERN_MISMATCH",
            ErrorCode::StatusCodeMismatch => "STATUS_CODE_MISMATCH",
            ErrorCode::ResponseTooSlow => "RESPONSE_TOO_SLOW",
            ErrorCode::RowCountMismatch => "ROW_COUNT_MISMATCH",
            ErrorCode::CtUnexpectedIssuer => "CT_UNEXPECTED_ISSUER",
            ErrorCode::CtNewCertificate => "CT_NEW_CERTIFICATE",
            ErrorCode::CtFetchFailed => "CT_FETCH_FAILED",
            ErrorCode::DnsMismatch => "DNS_MISMATCH",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::QueueNotFound => "QUEUE_NOT_FOUND",
            ErrorCode::HopCountMismatch => "HOP_COUNT_MISMATCH",
            ErrorCode::DestinationUnreachable => "DESTINATION_UNREACHABLE",
            ErrorCode::Overdue => "OVERDUE",
            ErrorCode::JobFailed => "JOB_FAILED",
            ErrorCode::NoPings => "NO_PINGS",
            ErrorCode::SpfMissing => "SPF_MISSING",
            ErrorCode::DkimMissing => "DKIM_MISSING",
            ErrorCode::DmarcMissing => "DMARC_MISSING",
            ErrorCode::AuthScoreLow => "AUTH_SCORE_LOW",
            ErrorCode::DependencyDown => "DEPENDENCY_DOWN",
            ErrorCode::DependencyDegraded => "DEPENDENCY_DEGRADED",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase connection timings captured by HTTP/TLS executors
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ms: Option<u64>,
}

/// One measurement of a monitor at a point in time; immutable after insert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub monitor_id: String,
    pub region: String,
    pub status: CheckStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(default)]
    pub timings: PhaseTimings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Executor-specific payload (certificate info, hops, scores, ...)
    #[serde(default)]
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl CheckResult {
    /// Skeleton result with a fresh id; executors fill in the rest
    pub fn new(monitor_id: &str, region: &str, status: CheckStatus) -> Self {
        Self {
            id: new_id(),
            monitor_id: monitor_id.to_string(),
            region: region.to_string(),
            status,
            response_time_ms: None,
            timings: PhaseTimings::default(),
            error_message: None,
            error_code: None,
            status_code: None,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Heartbeats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Start,
    Complete,
    Fail,
}

impl HeartbeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatStatus::Start => "start",
            HeartbeatStatus::Complete => "complete",
            HeartbeatStatus::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "start" => HeartbeatStatus::Start,
            "fail" => HeartbeatStatus::Fail,
            _ => HeartbeatStatus::Complete,
        }
    }
}

/// A ping from an external job (cron, backup, pipeline)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub id: String,
    pub monitor_id: String,
    pub status: HeartbeatStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Rollups
// ============================================================================

/// Pre-computed aggregate over raw results for one (monitor, region, bucket)
///
/// Used for both hourly and daily rows; the bucket start disambiguates.
/// Invariant: success + degraded + failure = total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupRow {
    pub monitor_id: String,
    pub region: String,
    pub bucket_start: DateTime<Utc>,

    pub avg_response_time_ms: Option<f64>,
    pub min_response_time_ms: Option<u64>,
    pub max_response_time_ms: Option<u64>,
    pub p50: Option<u64>,
    pub p75: Option<u64>,
    pub p90: Option<u64>,
    pub p95: Option<u64>,
    pub p99: Option<u64>,

    pub success_count: u64,
    pub degraded_count: u64,
    pub failure_count: u64,
    pub total_count: u64,

    pub uptime_percentage: Option<f64>,
}

// ============================================================================
// Alerting
// ============================================================================

/// Fire conditions; OR-semantics across kinds, at least one set when enabled
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertConditions {
    /// Last N results are all failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,

    /// At least `count` failures within the trailing window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures_in_window: Option<FailureWindow>,

    /// Every result in the last M minutes is degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_duration_minutes: Option<u32>,

    /// Successes required before an open alert resolves (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_successes: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureWindow {
    pub count: u32,
    pub window_minutes: u32,
}

impl AlertConditions {
    /// A policy with no fire condition can never trigger
    pub fn has_fire_condition(&self) -> bool {
        self.consecutive_failures.is_some()
            || self.failures_in_window.is_some()
            || self.degraded_duration_minutes.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPolicy {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub enabled: bool,
    pub conditions: AlertConditions,
    /// Channel ids notified on fire/recover
    pub channels: Vec<String>,
    pub cooldown_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oncall_rotation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Triggered,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Triggered => "triggered",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "triggered" => AlertStatus::Triggered,
            _ => AlertStatus::Resolved,
        }
    }
}

/// Mutable metadata on an open alert, coalesced across repeated failures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_result_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub failure_count: u32,
    /// Capped at the most recent 20 entries
    #[serde(default)]
    pub failure_timestamps: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Maximum failure timestamps retained on an open alert
pub const MAX_FAILURE_TIMESTAMPS: usize = 20;

/// A persisted finding that a policy's fire condition held for a monitor
///
/// At most one `triggered` row may exist per (policy, monitor) at a time;
/// the store enforces this with a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistory {
    pub id: String,
    pub org_id: String,
    pub monitor_id: String,
    pub policy_id: String,
    pub status: AlertStatus,
    pub triggered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    pub metadata: AlertMetadata,
}

// ============================================================================
// Notification channels
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Slack,
    Discord,
    Webhook,
    Teams,
    Pagerduty,
    Sms,
    Ntfy,
    Googlechat,
    Irc,
    Twitter,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "email",
            ChannelType::Slack => "slack",
            ChannelType::Discord => "discord",
            ChannelType::Webhook => "webhook",
            ChannelType::Teams => "teams",
            ChannelType::Pagerduty => "pagerduty",
            ChannelType::Sms => "sms",
            ChannelType::Ntfy => "ntfy",
            ChannelType::Googlechat => "googlechat",
            ChannelType::Irc => "irc",
            ChannelType::Twitter => "twitter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "email" => ChannelType::Email,
            "slack" => ChannelType::Slack,
            "discord" => ChannelType::Discord,
            "webhook" => ChannelType::Webhook,
            "teams" => ChannelType::Teams,
            "pagerduty" => ChannelType::Pagerduty,
            "sms" => ChannelType::Sms,
            "ntfy" => ChannelType::Ntfy,
            "googlechat" => ChannelType::Googlechat,
            "irc" => ChannelType::Irc,
            "twitter" => ChannelType::Twitter,
            _ => return None,
        })
    }

    /// One queue per channel kind; SMS gets its own queue
    pub fn queue_name(&self) -> &'static str {
        match self {
            ChannelType::Email => "notify:email",
            ChannelType::Slack => "notify:slack",
            ChannelType::Discord => "notify:discord",
            ChannelType::Webhook => "notify:webhook",
            ChannelType::Teams => "notify:teams",
            ChannelType::Pagerduty => "notify:pagerduty",
            ChannelType::Sms => "notify:sms",
            ChannelType::Ntfy => "notify:ntfy",
            ChannelType::Googlechat => "notify:googlechat",
            ChannelType::Irc => "notify:irc",
            ChannelType::Twitter => "notify:twitter",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannel {
    pub id: String,
    pub org_id: String,
    pub channel_type: ChannelType,
    /// Encrypted at rest; decrypted just-in-time per job
    pub config: serde_json::Value,
    pub enabled: bool,
}

/// One row per final delivery attempt per channel per alert; immutable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: String,
    pub alert_history_id: String,
    pub channel_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub sent_at: DateTime<Utc>,
}

// ============================================================================
// Maintenance windows
// ============================================================================

/// Subscriber-notification opportunities for a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyPolicy {
    /// Minutes before start at which the advance notice fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_start_minutes: Option<i64>,
    #[serde(default)]
    pub on_start: bool,
    #[serde(default)]
    pub on_end: bool,
}

/// Durable once-only markers; a set marker is never re-sent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentMarkers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_start_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_start_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    /// Always after starts_at
    pub ends_at: DateTime<Utc>,
    pub affected_monitors: Vec<String>,
    #[serde(default)]
    pub notify_subscribers: NotifyPolicy,
    #[serde(default)]
    pub notifications_sent: SentMarkers,
}

impl MaintenanceWindow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now <= self.ends_at
    }
}

// ============================================================================
// Incidents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Investigating,
    Identified,
    Monitoring,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Identified => "identified",
            IncidentStatus::Monitoring => "monitoring",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "investigating" => IncidentStatus::Investigating,
            "identified" => IncidentStatus::Identified,
            "monitoring" => IncidentStatus::Monitoring,
            _ => IncidentStatus::Resolved,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub org_id: String,
    pub title: String,
    pub severity: IncidentSeverity,
    pub status: IncidentStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub affected_monitors: Vec<String>,
}

// ============================================================================
// Remote probes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Active,
    Offline,
    Disabled,
    Pending,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Active => "active",
            ProbeStatus::Offline => "offline",
            ProbeStatus::Disabled => "disabled",
            ProbeStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => ProbeStatus::Active,
            "offline" => ProbeStatus::Offline,
            "disabled" => ProbeStatus::Disabled,
            _ => ProbeStatus::Pending,
        }
    }
}

/// Edge agent metrics reported with each heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeMetrics {
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub active_jobs: u32,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_response_time: Option<f64>,
}

/// An external agent executing checks on behalf of the core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub region: String,
    /// SHA-256 of the enrollment token; the clear token is never stored
    pub token_hash: String,
    pub status: ProbeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: ProbeMetrics,
}

/// Pins a monitor to a probe. `exclusive` restricts execution to that probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeAssignment {
    pub probe_id: String,
    pub monitor_id: String,
    pub priority: i32,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingJobStatus {
    Pending,
    Claimed,
    Completed,
}

impl PendingJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingJobStatus::Pending => "pending",
            PendingJobStatus::Claimed => "claimed",
            PendingJobStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => PendingJobStatus::Pending,
            "claimed" => PendingJobStatus::Claimed,
            _ => PendingJobStatus::Completed,
        }
    }
}

/// A check job parked for a probe to claim; reaped after `expires_at`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbePendingJob {
    pub id: String,
    pub probe_id: String,
    pub monitor_id: String,
    pub job_data: CheckJob,
    pub status: PendingJobStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Status pages & subscribers (maintenance notification surface)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPage {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub monitors: Vec<String>,
    pub public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub page_id: String,
    pub email: String,
    pub verified: bool,
    /// Verification token; expired tokens are retention-deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Per-channel opt-outs; email defaults on
    #[serde(default = "default_true")]
    pub email_enabled: bool,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Dispatch payload
// ============================================================================

/// The full check spec carried by a queue job or a probe pending job
///
/// Executors receive exactly this; they never read the monitor row again,
/// so a check observes the monitor as it was when scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckJob {
    pub monitor_id: String,
    pub org_id: String,
    pub monitor_type: MonitorType,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub timeout_ms: u64,
    pub interval_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_threshold_ms: Option<u64>,
    #[serde(default)]
    pub assertions: Assertions,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub regions: Vec<String>,
}

impl CheckJob {
    pub fn from_monitor(monitor: &Monitor) -> Self {
        Self {
            monitor_id: monitor.id.clone(),
            org_id: monitor.org_id.clone(),
            monitor_type: monitor.monitor_type,
            url: monitor.url.clone(),
            method: monitor.method.clone(),
            headers: monitor.headers.clone(),
            body: monitor.body.clone(),
            timeout_ms: monitor.timeout_ms,
            interval_seconds: monitor.interval_seconds,
            degraded_threshold_ms: monitor.degraded_threshold_ms,
            assertions: monitor.assertions.clone(),
            config: monitor.config.clone(),
            regions: monitor.regions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_monitor_mapping() {
        assert_eq!(CheckStatus::Success.monitor_status(), MonitorStatus::Active);
        assert_eq!(
            CheckStatus::Degraded.monitor_status(),
            MonitorStatus::Degraded
        );
        assert_eq!(CheckStatus::Failure.monitor_status(), MonitorStatus::Down);
        assert_eq!(CheckStatus::Timeout.monitor_status(), MonitorStatus::Down);
        assert_eq!(CheckStatus::Error.monitor_status(), MonitorStatus::Down);
    }

    #[test]
    fn test_check_status_failure_class() {
        assert!(CheckStatus::Failure.is_failure());
        assert!(CheckStatus::Timeout.is_failure());
        assert!(CheckStatus::Error.is_failure());
        assert!(!CheckStatus::Success.is_failure());
        assert!(!CheckStatus::Degraded.is_failure());
    }

    #[test]
    fn test_monitor_type_round_trip() {
        for t in [
            MonitorType::Http,
            MonitorType::Ssl,
            MonitorType::CertificateTransparency,
            MonitorType::EmailAuth,
            MonitorType::PrometheusRemoteWrite,
            MonitorType::Aggregate,
        ] {
            assert_eq!(MonitorType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MonitorType::parse("bogus"), None);
    }

    #[test]
    fn test_error_code_serialized_form() {
        let code = serde_json::to_string(&ErrorCode::CertExpiringWarning).unwrap();
        assert_eq!(code, "\"CERT_EXPIRING_WARNING\"");
        assert_eq!(
            ErrorCode::parse("CONNECTION_REFUSED"),
            Some(ErrorCode::ConnectionRefused)
        );
    }

    #[test]
    fn test_maintenance_window_activity() {
        let now = Utc::now();
        let window = MaintenanceWindow {
            id: new_id(),
            org_id: "org".into(),
            name: "db upgrade".into(),
            starts_at: now - chrono::Duration::minutes(5),
            ends_at: now + chrono::Duration::minutes(10),
            affected_monitors: vec![],
            notify_subscribers: NotifyPolicy::default(),
            notifications_sent: SentMarkers::default(),
        };
        assert!(window.is_active(now));
        assert!(!window.is_active(now + chrono::Duration::minutes(11)));
    }

    #[test]
    fn test_ids_are_opaque_and_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
