//! TCP-family executor
//!
//! Covers plain TCP reachability plus the greeting-based protocols that
//! identify themselves in their first server line: SMTP (`220`), IMAP
//! (`* OK`), POP3 (`+OK`) and SSH (`SSH-`). LDAP and RDP are reachability
//! checks on their protocol ports. `tls: true` in the config wraps the
//! connection for implicit-TLS variants (SMTPS, IMAPS, POP3S).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::instrument;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode, MonitorType};

use super::{CheckOutcome, Executor, JobCtx, deadline, latency_status, timeout_result};

pub struct TcpExecutor;

/// Expected greeting prefix for a protocol, if it has one
fn expected_greeting(monitor_type: MonitorType) -> Option<&'static str> {
    match monitor_type {
        MonitorType::Smtp => Some("220"),
        MonitorType::Imap => Some("* OK"),
        MonitorType::Pop3 => Some("+OK"),
        MonitorType::Ssh => Some("SSH-"),
        _ => None,
    }
}

fn default_port(monitor_type: MonitorType, tls: bool) -> u16 {
    match monitor_type {
        MonitorType::Smtp => {
            if tls {
                465
            } else {
                25
            }
        }
        MonitorType::Imap => {
            if tls {
                993
            } else {
                143
            }
        }
        MonitorType::Pop3 => {
            if tls {
                995
            } else {
                110
            }
        }
        MonitorType::Ssh => 22,
        MonitorType::Ldap => {
            if tls {
                636
            } else {
                389
            }
        }
        MonitorType::Rdp => 3389,
        _ => 0,
    }
}

#[async_trait]
impl Executor for TcpExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id, kind = %job.monitor_type))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let tls = job
            .config
            .get("tls")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let Some((host, port)) =
            super::host_and_port(&job.url, default_port(job.monitor_type, tls))
        else {
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
            result.error_code = Some(ErrorCode::InvalidConfig);
            result.error_message = Some(format!("cannot parse target from {:?}", job.url));
            return CheckOutcome::ok(result);
        };
        if port == 0 && expected_greeting(job.monitor_type).is_none() {
            // plain tcp monitors must specify their port
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
            result.error_code = Some(ErrorCode::InvalidConfig);
            result.error_message = Some("tcp monitor needs an explicit port".to_string());
            return CheckOutcome::ok(result);
        }

        let start = Instant::now();
        let outcome = deadline(job.timeout_ms, self.connect_and_greet(job, &host, port, tls)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let mut result = match outcome {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(Err((code, message))) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Failure);
                result.error_code = Some(code);
                result.error_message = Some(message);
                result
            }
            Ok(Ok(greeting)) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);
                if let Some(greeting) = greeting {
                    result.payload = serde_json::json!({ "greeting": greeting });
                }
                result.status = latency_status(elapsed_ms, job.degraded_threshold_ms);
                result
            }
        };
        result.response_time_ms = Some(elapsed_ms);
        result.timings.tcp_ms = Some(elapsed_ms);
        CheckOutcome::ok(result)
    }
}

impl TcpExecutor {
    async fn connect_and_greet(
        &self,
        job: &CheckJob,
        host: &str,
        port: u16,
        tls: bool,
    ) -> Result<Option<String>, (ErrorCode, String)> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            (
                super::classify_io_error(&e),
                format!("connect to {host}:{port} failed: {e}"),
            )
        })?;

        let expected = expected_greeting(job.monitor_type);

        if tls {
            let stream = wrap_tls(stream, host).await?;
            self.read_greeting(stream, job.monitor_type, expected).await
        } else {
            self.read_greeting(stream, job.monitor_type, expected).await
        }
    }

    async fn read_greeting<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut stream: S,
        monitor_type: MonitorType,
        expected: Option<&'static str>,
    ) -> Result<Option<String>, (ErrorCode, String)> {
        let Some(expected) = expected else {
            return Ok(None);
        };

        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await.map_err(|e| {
            (
                super::classify_io_error(&e),
                format!("reading greeting failed: {e}"),
            )
        })?;
        if n == 0 {
            return Err((
                ErrorCode::ProtocolError,
                "connection closed before greeting".to_string(),
            ));
        }

        let greeting = String::from_utf8_lossy(&buf[..n])
            .lines()
            .next()
            .unwrap_or("")
            .to_string();

        if !greeting.starts_with(expected) {
            return Err((
                ErrorCode::ProtocolError,
                format!(
                    "unexpected {} greeting: {greeting:?} (wanted prefix {expected:?})",
                    monitor_type
                ),
            ));
        }
        Ok(Some(greeting))
    }
}

/// Wrap a TCP stream in TLS without verification (reachability, not trust)
async fn wrap_tls(
    stream: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, (ErrorCode, String)> {
    use rustls::pki_types::ServerName;

    let verifier = super::tls::noverify_config();
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| (ErrorCode::InvalidConfig, format!("invalid SNI name: {e}")))?;

    tokio_rustls::TlsConnector::from(Arc::new(verifier))
        .connect(server_name, stream)
        .await
        .map_err(|e| (ErrorCode::SslError, format!("TLS handshake failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::PlainCipher;
    use crate::model::Assertions;
    use crate::storage::SqliteStore;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn test_ctx() -> JobCtx {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        JobCtx::new("uk".to_string(), store, Arc::new(PlainCipher))
    }

    fn job(url: &str, monitor_type: MonitorType) -> CheckJob {
        CheckJob {
            monitor_id: "m1".to_string(),
            org_id: "o1".to_string(),
            monitor_type,
            url: url.to_string(),
            method: "GET".to_string(),
            headers: Default::default(),
            body: None,
            timeout_ms: 2_000,
            interval_seconds: 60,
            degraded_threshold_ms: None,
            assertions: Assertions::default(),
            config: serde_json::Value::Null,
            regions: vec![],
        }
    }

    #[tokio::test]
    async fn test_plain_tcp_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let outcome = TcpExecutor
            .execute(&job(&addr.to_string(), MonitorType::Tcp), &test_ctx().await)
            .await;
        assert_eq!(outcome.result.status, CheckStatus::Success);
    }

    #[tokio::test]
    async fn test_tcp_connection_refused() {
        let outcome = TcpExecutor
            .execute(&job("127.0.0.1:1", MonitorType::Tcp), &test_ctx().await)
            .await;
        assert_eq!(outcome.result.status, CheckStatus::Failure);
        assert_eq!(
            outcome.result.error_code,
            Some(ErrorCode::ConnectionRefused)
        );
    }

    #[tokio::test]
    async fn test_smtp_greeting_accepted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"220 mail.example.com ESMTP ready\r\n").await;
            }
        });

        let outcome = TcpExecutor
            .execute(&job(&addr.to_string(), MonitorType::Smtp), &test_ctx().await)
            .await;
        assert_eq!(outcome.result.status, CheckStatus::Success);
        assert!(
            outcome.result.payload["greeting"]
                .as_str()
                .unwrap()
                .starts_with("220")
        );
    }

    #[tokio::test]
    async fn test_ssh_wrong_banner_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"HTTP/1.1 200 OK\r\n").await;
            }
        });

        let outcome = TcpExecutor
            .execute(&job(&addr.to_string(), MonitorType::Ssh), &test_ctx().await)
            .await;
        assert_eq!(outcome.result.status, CheckStatus::Failure);
        assert_eq!(outcome.result.error_code, Some(ErrorCode::ProtocolError));
    }

    #[tokio::test]
    async fn test_tcp_without_port_is_config_error() {
        let outcome = TcpExecutor
            .execute(&job("example.com", MonitorType::Tcp), &test_ctx().await)
            .await;
        assert_eq!(outcome.result.status, CheckStatus::Error);
        assert_eq!(outcome.result.error_code, Some(ErrorCode::InvalidConfig));
    }
}
