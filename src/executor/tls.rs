//! TLS/SSL certificate executor
//!
//! Opens a TLS connection with SNI set to the target hostname and
//! certificate verification disabled (the point is to inspect bad
//! certificates, not to refuse them), then extracts certificate metadata
//! and applies the policy ladder in order:
//!
//! expired → hostname mismatch → chain invalid → chain incomplete (if
//! required) → expiry thresholds → TLS version minimum → cipher allow/block
//! → OCSP stapling requirement → OCSP responder reachability → CRL
//! reachability → CAA validation.
//!
//! Dual mode: as the `ssl` monitor type this produces a full check result;
//! invoked from the HTTPS executor it only captures certificate info
//! (`capture_certificate`) for the `monitor:certificate` event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tracing::{debug, instrument, trace};
use x509_cert::Certificate;
use x509_cert::der::Decode;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{AuthorityInfoAccessSyntax, CrlDistributionPoints, SubjectAltName};

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{CheckOutcome, Executor, JobCtx, ResultLatch, deadline, timeout_result};

/// Max issuer-chain hops walked before assuming a cycle
const MAX_CHAIN_DEPTH: usize = 10;

/// OID for the OCSP access method inside AuthorityInfoAccess
const OCSP_ACCESS_OID: &str = "1.3.6.1.5.5.7.48.1";
/// subjectAltName extension
const SAN_OID: &str = "2.5.29.17";
/// authorityInfoAccess extension
const AIA_OID: &str = "1.3.6.1.5.5.7.1.1";
/// cRLDistributionPoints extension
const CRL_DP_OID: &str = "2.5.29.31";

/// Certificate metadata surfaced in results and events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub san: Vec<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub days_until_expiry: i64,
    pub protocol: Option<String>,
    pub cipher: Option<String>,
    pub fingerprint_sha256: String,
    pub ocsp_urls: Vec<String>,
    pub crl_urls: Vec<String>,
    pub chain_length: usize,
    pub chain_complete: bool,
    pub chain_valid: bool,
    pub ocsp_stapled: bool,
}

/// Policy knobs from the monitor's per-type config
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsPolicy {
    pub expiry_error_days: i64,
    pub expiry_warning_days: i64,
    pub require_complete_chain: bool,
    pub min_tls_version: Option<String>,
    pub allowed_ciphers: Vec<String>,
    pub blocked_ciphers: Vec<String>,
    pub require_ocsp_stapling: bool,
    pub check_ocsp: bool,
    pub check_crl: bool,
    pub caa_allowed_issuers: Vec<String>,
    pub caa_strict: bool,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            expiry_error_days: 7,
            expiry_warning_days: 30,
            require_complete_chain: false,
            min_tls_version: None,
            allowed_ciphers: vec![],
            blocked_ciphers: vec![],
            require_ocsp_stapling: false,
            check_ocsp: false,
            check_crl: false,
            caa_allowed_issuers: vec![],
            caa_strict: false,
        }
    }
}

/// Outcome of one ladder rung
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyVerdict {
    pub status: CheckStatus,
    pub error_code: Option<ErrorCode>,
    pub message: Option<String>,
}

impl PolicyVerdict {
    fn ok() -> Self {
        Self {
            status: CheckStatus::Success,
            error_code: None,
            message: None,
        }
    }

    fn failure(code: ErrorCode, message: String) -> Self {
        Self {
            status: CheckStatus::Failure,
            error_code: Some(code),
            message: Some(message),
        }
    }

    fn degraded(code: ErrorCode, message: String) -> Self {
        Self {
            status: CheckStatus::Degraded,
            error_code: Some(code),
            message: Some(message),
        }
    }
}

pub struct TlsExecutor;

impl TlsExecutor {
    pub fn full() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for TlsExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let Some((host, port)) = super::host_and_port(&job.url, 443) else {
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
            result.error_code = Some(ErrorCode::InvalidConfig);
            result.error_message = Some(format!("cannot parse host from {:?}", job.url));
            return CheckOutcome::ok(result);
        };

        let policy: TlsPolicy =
            serde_json::from_value(job.config.clone()).unwrap_or_default();

        let start = Instant::now();
        let captured = match deadline(job.timeout_ms, handshake(&host, port)).await {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err((code, message))) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                result.response_time_ms = Some(start.elapsed().as_millis() as u64);
                result.error_code = Some(code);
                result.error_message = Some(message);
                return CheckOutcome::ok(result);
            }
            Ok(Ok(captured)) => captured,
        };

        let now = Utc::now();
        let mut verdict = apply_policy(&captured.info, &host, &policy, now);

        // Reachability rungs only run while the ladder is still clean
        if verdict.status == CheckStatus::Success {
            verdict = self.reachability_rungs(&captured.info, &policy, ctx).await;
        }
        if verdict.status == CheckStatus::Success && !policy.caa_allowed_issuers.is_empty() {
            verdict = self.caa_rung(&host, &captured.info, &policy, ctx).await;
        }

        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, verdict.status);
        result.response_time_ms = Some(start.elapsed().as_millis() as u64);
        result.timings.tcp_ms = Some(captured.tcp_ms);
        result.timings.tls_ms = Some(captured.tls_ms);
        result.error_code = verdict.error_code;
        result.error_message = verdict.message;
        result.payload = serde_json::json!({ "certificate": captured.info });
        CheckOutcome::ok(result)
    }
}

impl TlsExecutor {
    async fn reachability_rungs(
        &self,
        info: &CertificateInfo,
        policy: &TlsPolicy,
        ctx: &JobCtx,
    ) -> PolicyVerdict {
        if policy.require_ocsp_stapling && !info.ocsp_stapled {
            return PolicyVerdict::degraded(
                ErrorCode::OcspStapleMissing,
                "server did not staple an OCSP response".to_string(),
            );
        }

        if policy.check_ocsp {
            for url in &info.ocsp_urls {
                if !self.url_reachable(ctx, url).await {
                    return PolicyVerdict::degraded(
                        ErrorCode::OcspUnreachable,
                        format!("OCSP responder unreachable: {url}"),
                    );
                }
            }
        }

        if policy.check_crl {
            for url in &info.crl_urls {
                if !self.url_reachable(ctx, url).await {
                    return PolicyVerdict::degraded(
                        ErrorCode::CrlUnreachable,
                        format!("CRL distribution point unreachable: {url}"),
                    );
                }
            }
        }

        PolicyVerdict::ok()
    }

    async fn url_reachable(&self, ctx: &JobCtx, url: &str) -> bool {
        match deadline(5_000, ctx.http.head(url).send()).await {
            Ok(Ok(_)) => true,
            _ => false,
        }
    }

    /// CAA: every issue record must name an allowed issuer. A domain with
    /// no CAA records at all passes (standard CAA semantics).
    async fn caa_rung(
        &self,
        host: &str,
        info: &CertificateInfo,
        policy: &TlsPolicy,
        ctx: &JobCtx,
    ) -> PolicyVerdict {
        use trust_dns_resolver::proto::rr::RecordType;

        let lookup = match deadline(
            5_000,
            ctx.resolver.lookup(host, RecordType::CAA),
        )
        .await
        {
            Ok(Ok(lookup)) => lookup,
            // NXDOMAIN / no records: CAA allows any issuer
            _ => return PolicyVerdict::ok(),
        };

        let records: Vec<String> = lookup
            .record_iter()
            .filter_map(|record| record.data().map(|data| data.to_string()))
            .collect();

        if records.is_empty() {
            return PolicyVerdict::ok();
        }

        let violating = records.iter().find(|record| {
            record.contains("issue")
                && !policy
                    .caa_allowed_issuers
                    .iter()
                    .any(|allowed| record.to_lowercase().contains(&allowed.to_lowercase()))
        });

        if let Some(record) = violating {
            debug!("CAA record {record:?} outside allowed issuers for {host}");
            let message = format!(
                "CAA record {record:?} does not name an allowed issuer (cert issuer: {})",
                info.issuer
            );
            return if policy.caa_strict {
                PolicyVerdict::failure(ErrorCode::CaaInvalid, message)
            } else {
                PolicyVerdict::degraded(ErrorCode::CaaInvalid, message)
            };
        }
        PolicyVerdict::ok()
    }
}

/// Apply the synchronous rungs of the policy ladder, in order
pub fn apply_policy(
    info: &CertificateInfo,
    host: &str,
    policy: &TlsPolicy,
    now: DateTime<Utc>,
) -> PolicyVerdict {
    // 1. expired
    if let Some(not_after) = info.not_after
        && not_after <= now
    {
        return PolicyVerdict::failure(
            ErrorCode::CertExpired,
            format!("certificate expired at {not_after}"),
        );
    }
    if let Some(not_before) = info.not_before
        && not_before > now
    {
        return PolicyVerdict::failure(
            ErrorCode::CertExpired,
            format!("certificate not valid until {not_before}"),
        );
    }

    // 2. hostname mismatch
    if !hostname_matches(host, &info.san, &info.subject) {
        return PolicyVerdict::failure(
            ErrorCode::CertHostnameMismatch,
            format!("certificate does not cover {host}"),
        );
    }

    // 3. chain invalid (a middle link does not chain)
    if !info.chain_valid {
        return PolicyVerdict::failure(
            ErrorCode::CertChainInvalid,
            "presented chain does not link".to_string(),
        );
    }

    // 4. chain incomplete, when required
    if policy.require_complete_chain && !info.chain_complete {
        return PolicyVerdict::failure(
            ErrorCode::CertChainIncomplete,
            "server did not present intermediate certificates".to_string(),
        );
    }

    // 5. expiry thresholds: critical at <= error days, warning at <= warning days
    let days = info.days_until_expiry;
    if days <= policy.expiry_error_days {
        return PolicyVerdict::failure(
            ErrorCode::CertExpiringCritical,
            format!("certificate expires in {days} days"),
        );
    }
    if days <= policy.expiry_warning_days {
        return PolicyVerdict::degraded(
            ErrorCode::CertExpiringWarning,
            format!("certificate expires in {days} days"),
        );
    }

    // 6. TLS version minimum
    if let (Some(min), Some(negotiated)) = (&policy.min_tls_version, &info.protocol)
        && tls_version_rank(negotiated) < tls_version_rank(min)
    {
        return PolicyVerdict::failure(
            ErrorCode::TlsVersionTooLow,
            format!("negotiated {negotiated}, minimum {min}"),
        );
    }

    // 7. cipher allow/block lists
    if let Some(cipher) = &info.cipher {
        if !policy.allowed_ciphers.is_empty()
            && !policy
                .allowed_ciphers
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(cipher))
        {
            return PolicyVerdict::failure(
                ErrorCode::CipherBlocked,
                format!("cipher {cipher} not in allow list"),
            );
        }
        if policy
            .blocked_ciphers
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(cipher))
        {
            return PolicyVerdict::failure(
                ErrorCode::CipherBlocked,
                format!("cipher {cipher} is blocked"),
            );
        }
    }

    PolicyVerdict::ok()
}

fn tls_version_rank(version: &str) -> u8 {
    match version.trim_start_matches("TLSv").trim_start_matches("TLS ") {
        "1.0" => 1,
        "1.1" => 2,
        "1.2" => 3,
        "1.3" => 4,
        _ => 0,
    }
}

/// Wildcard-aware hostname match over SAN entries, falling back to the
/// subject CN
pub fn hostname_matches(host: &str, san: &[String], subject: &str) -> bool {
    let host = host.to_lowercase();

    let matches_name = |name: &str| -> bool {
        let name = name.to_lowercase();
        if let Some(suffix) = name.strip_prefix("*.") {
            // Wildcard covers exactly one extra label
            match host.split_once('.') {
                Some((label, rest)) => !label.is_empty() && rest == suffix,
                None => false,
            }
        } else {
            name == host
        }
    };

    if san.iter().any(|name| matches_name(name)) {
        return true;
    }
    if san.is_empty() {
        // Legacy CN-only certificates
        if let Some(cn) = subject
            .split(',')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("CN="))
        {
            return matches_name(cn);
        }
    }
    false
}

struct HandshakeCapture {
    info: CertificateInfo,
    tcp_ms: u64,
    tls_ms: u64,
}

/// No-op verifier that records whether the server stapled an OCSP response.
/// The latch keeps a renegotiating peer from writing the capture twice.
#[derive(Debug)]
struct CapturingVerifier {
    latch: ResultLatch,
    ocsp_stapled: Arc<AtomicBool>,
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.latch.try_claim() {
            self.ocsp_stapled
                .store(!ocsp_response.is_empty(), Ordering::SeqCst);
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client config that accepts any certificate; used wherever a check needs
/// the connection rather than the trust decision
pub fn noverify_config() -> rustls::ClientConfig {
    let verifier = CapturingVerifier {
        latch: ResultLatch::new(),
        ocsp_stapled: Arc::new(AtomicBool::new(false)),
    };
    client_config(Arc::new(verifier))
}

/// The crypto provider is pinned explicitly so the process-default never
/// becomes ambiguous when other TLS stacks are linked in
fn client_config(verifier: Arc<dyn ServerCertVerifier>) -> rustls::ClientConfig {
    rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("ring provider supports the default protocol versions")
    .dangerous()
    .with_custom_certificate_verifier(verifier)
    .with_no_client_auth()
}

/// Connect, handshake, and extract certificate metadata
async fn handshake(host: &str, port: u16) -> Result<HandshakeCapture, (ErrorCode, String)> {
    let tcp_start = Instant::now();
    let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
        (
            super::classify_io_error(&e),
            format!("TCP connect to {host}:{port} failed: {e}"),
        )
    })?;
    let tcp_ms = tcp_start.elapsed().as_millis() as u64;

    let ocsp_stapled = Arc::new(AtomicBool::new(false));
    let verifier = CapturingVerifier {
        latch: ResultLatch::new(),
        ocsp_stapled: Arc::clone(&ocsp_stapled),
    };

    let config = client_config(Arc::new(verifier));

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| (ErrorCode::InvalidConfig, format!("invalid SNI name: {e}")))?;

    let tls_start = Instant::now();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| (ErrorCode::SslError, format!("TLS handshake failed: {e}")))?;
    let tls_ms = tls_start.elapsed().as_millis() as u64;

    let (_, connection) = stream.get_ref();

    let protocol = connection.protocol_version().map(|version| {
        match version {
            rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
            rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
            other => format!("{other:?}"),
        }
    });
    let cipher = connection
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?}", suite.suite()));

    let chain: Vec<Vec<u8>> = connection
        .peer_certificates()
        .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
        .unwrap_or_default();

    if chain.is_empty() {
        return Err((
            ErrorCode::SslError,
            "server presented no certificates".to_string(),
        ));
    }

    let mut info = extract_info(&chain)
        .map_err(|e| (ErrorCode::SslError, format!("certificate parse failed: {e}")))?;
    info.protocol = protocol;
    info.cipher = cipher;
    info.ocsp_stapled = ocsp_stapled.load(Ordering::SeqCst);

    Ok(HandshakeCapture {
        info,
        tcp_ms,
        tls_ms,
    })
}

struct ParsedCert {
    subject: String,
    issuer: String,
    san: Vec<String>,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
    ocsp_urls: Vec<String>,
    crl_urls: Vec<String>,
}

fn parse_cert(der: &[u8]) -> anyhow::Result<ParsedCert> {
    let cert = Certificate::from_der(der)?;
    let tbs = &cert.tbs_certificate;

    let mut san = Vec::new();
    let mut ocsp_urls = Vec::new();
    let mut crl_urls = Vec::new();

    if let Some(extensions) = &tbs.extensions {
        for ext in extensions {
            let bytes = ext.extn_value.as_bytes();
            let oid = ext.extn_id.to_string();
            if oid == SAN_OID {
                if let Ok(alt) = SubjectAltName::from_der(bytes) {
                    for name in alt.0 {
                        if let GeneralName::DnsName(dns) = name {
                            san.push(dns.to_string());
                        }
                    }
                }
            } else if oid == AIA_OID {
                if let Ok(aia) = AuthorityInfoAccessSyntax::from_der(bytes) {
                    for access in aia.0 {
                        if access.access_method.to_string() == OCSP_ACCESS_OID
                            && let GeneralName::UniformResourceIdentifier(uri) =
                                access.access_location
                        {
                            ocsp_urls.push(uri.to_string());
                        }
                    }
                }
            } else if oid == CRL_DP_OID {
                if let Ok(crl) = CrlDistributionPoints::from_der(bytes) {
                    for point in crl.0 {
                        if let Some(
                            x509_cert::ext::pkix::name::DistributionPointName::FullName(names),
                        ) = point.distribution_point
                        {
                            for name in names {
                                if let GeneralName::UniformResourceIdentifier(uri) = name {
                                    crl_urls.push(uri.to_string());
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(ParsedCert {
        subject: tbs.subject.to_string(),
        issuer: tbs.issuer.to_string(),
        san,
        not_before: time_to_utc(&tbs.validity.not_before),
        not_after: time_to_utc(&tbs.validity.not_after),
        ocsp_urls,
        crl_urls,
    })
}

fn time_to_utc(time: &x509_cert::time::Time) -> Option<DateTime<Utc>> {
    let unix = time.to_unix_duration();
    DateTime::from_timestamp(unix.as_secs() as i64, unix.subsec_nanos())
}

/// Build CertificateInfo from the presented chain (leaf first)
fn extract_info(chain: &[Vec<u8>]) -> anyhow::Result<CertificateInfo> {
    let parsed: Vec<ParsedCert> = chain
        .iter()
        .map(|der| parse_cert(der))
        .collect::<anyhow::Result<_>>()?;

    let leaf = parsed
        .first()
        .ok_or_else(|| anyhow::anyhow!("empty certificate chain"))?;

    let fingerprint = hex::encode(Sha256::digest(&chain[0]));

    // Walk the issuer chain with a depth guard. The chain is valid when
    // every walked link resolves; complete when the walk ends at a
    // self-signed certificate or consumed at least one intermediate.
    let mut chain_valid = true;
    let mut chain_complete = false;
    let mut index = 0usize;
    let mut hops = 0usize;
    let mut visited = std::collections::HashSet::new();

    loop {
        if hops >= MAX_CHAIN_DEPTH || !visited.insert(index) {
            break;
        }
        let current = &parsed[index];

        if current.subject == current.issuer {
            chain_complete = true;
            break;
        }

        match parsed
            .iter()
            .position(|candidate| candidate.subject == current.issuer)
        {
            Some(next) => {
                index = next;
                hops += 1;
            }
            None => {
                // Issuer absent: a bare leaf means missing intermediates;
                // a chained intermediate signed by an absent trust anchor
                // is the normal complete case.
                if hops == 0 && parsed.len() > 1 {
                    chain_valid = false;
                } else if hops > 0 {
                    chain_complete = true;
                }
                break;
            }
        }
    }

    let now = Utc::now();
    let days_until_expiry = leaf
        .not_after
        .map(|not_after| (not_after - now).num_days())
        .unwrap_or(0);

    Ok(CertificateInfo {
        subject: leaf.subject.clone(),
        issuer: leaf.issuer.clone(),
        san: leaf.san.clone(),
        not_before: leaf.not_before,
        not_after: leaf.not_after,
        days_until_expiry,
        protocol: None,
        cipher: None,
        fingerprint_sha256: fingerprint,
        ocsp_urls: leaf.ocsp_urls.clone(),
        crl_urls: leaf.crl_urls.clone(),
        chain_length: parsed.len(),
        chain_complete,
        chain_valid,
        ocsp_stapled: false,
    })
}

/// Best-effort certificate capture for the HTTPS co-check
pub async fn capture_certificate(
    job: &CheckJob,
    timeout_ms: u64,
) -> anyhow::Result<CertificateInfo> {
    let (host, port) = super::host_and_port(&job.url, 443)
        .ok_or_else(|| anyhow::anyhow!("cannot parse host from {:?}", job.url))?;

    match deadline(timeout_ms, handshake(&host, port)).await {
        Err(_) => anyhow::bail!("certificate capture timed out"),
        Ok(Err((code, message))) => anyhow::bail!("{code}: {message}"),
        Ok(Ok(captured)) => {
            trace!("captured certificate for {host} ({} SANs)", captured.info.san.len());
            Ok(captured.info)
        }
    }
}
