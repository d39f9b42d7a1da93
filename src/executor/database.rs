//! Database executor (Postgres, MySQL, Redis, MongoDB)
//!
//! Each flavor completes a real round-trip: SQL databases connect and run
//! either `SELECT 1` or a configured query (with an optional expected row
//! count), Redis answers a `PING`, MongoDB answers the `ping` command.
//! Connection strings carry credentials and are decrypted before use.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::instrument;

use crate::credentials::decrypt_config;
use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode, MonitorType};

use super::{CheckOutcome, Executor, JobCtx, deadline, latency_status, timeout_result};

pub struct DatabaseExecutor;

#[async_trait]
impl Executor for DatabaseExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id, kind = %job.monitor_type))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config = decrypt_config(&ctx.cipher, &job.config);
        // Prefer an explicit (decrypted) connection string over the URL
        let target = config
            .get("connection_string")
            .and_then(|v| v.as_str())
            .unwrap_or(&job.url)
            .to_string();
        let query = config.get("query").and_then(|v| v.as_str()).map(String::from);
        let expected_rows = config.get("expected_rows").and_then(|v| v.as_u64());

        let start = Instant::now();
        let outcome = match job.monitor_type {
            MonitorType::Postgres => {
                deadline(
                    job.timeout_ms,
                    self.check_postgres(&target, query.as_deref(), expected_rows),
                )
                .await
            }
            MonitorType::Mysql => {
                deadline(
                    job.timeout_ms,
                    self.check_mysql(&target, query.as_deref(), expected_rows),
                )
                .await
            }
            MonitorType::Redis => deadline(job.timeout_ms, self.check_redis(&target)).await,
            _ => deadline(job.timeout_ms, self.check_mongodb(&target)).await,
        };
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
            Ok(Ok(rows)) => {
                let mut result = CheckResult::new(
                    &job.monitor_id,
                    &ctx.region,
                    latency_status(elapsed_ms, job.degraded_threshold_ms),
                );
                if let Some(rows) = rows {
                    result.payload = serde_json::json!({ "rows": rows });
                }
                result
            }
        };
        result.response_time_ms = Some(elapsed_ms);
        CheckOutcome::ok(result)
    }
}

type DbOutcome = Result<Option<u64>, (ErrorCode, String)>;

fn classify_db_error(text: &str) -> ErrorCode {
    let lower = text.to_lowercase();
    if lower.contains("password") || lower.contains("auth") || lower.contains("denied") {
        ErrorCode::AuthFailed
    } else if lower.contains("refused") {
        ErrorCode::ConnectionRefused
    } else if lower.contains("resolve") || lower.contains("unknown host") {
        ErrorCode::HostNotFound
    } else {
        ErrorCode::ProtocolError
    }
}

impl DatabaseExecutor {
    async fn check_postgres(
        &self,
        url: &str,
        query: Option<&str>,
        expected_rows: Option<u64>,
    ) -> DbOutcome {
        let mut conn = sqlx::postgres::PgConnection::connect(url)
            .await
            .map_err(|e| (classify_db_error(&e.to_string()), format!("postgres connect failed: {e}")))?;

        let rows = sqlx::query(query.unwrap_or("SELECT 1"))
            .fetch_all(&mut conn)
            .await
            .map_err(|e| (ErrorCode::ProtocolError, format!("query failed: {e}")))?;
        let _ = conn.close().await;

        check_row_count(rows.len() as u64, expected_rows)
    }

    async fn check_mysql(
        &self,
        url: &str,
        query: Option<&str>,
        expected_rows: Option<u64>,
    ) -> DbOutcome {
        let mut conn = sqlx::mysql::MySqlConnection::connect(url)
            .await
            .map_err(|e| (classify_db_error(&e.to_string()), format!("mysql connect failed: {e}")))?;

        let rows = sqlx::query(query.unwrap_or("SELECT 1"))
            .fetch_all(&mut conn)
            .await
            .map_err(|e| (ErrorCode::ProtocolError, format!("query failed: {e}")))?;
        let _ = conn.close().await;

        check_row_count(rows.len() as u64, expected_rows)
    }

    async fn check_redis(&self, url: &str) -> DbOutcome {
        let url = if url.starts_with("redis://") || url.starts_with("rediss://") {
            url.to_string()
        } else {
            format!("redis://{url}")
        };

        let client = redis::Client::open(url.as_str())
            .map_err(|e| (ErrorCode::InvalidConfig, format!("invalid redis url: {e}")))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| (classify_db_error(&e.to_string()), format!("redis connect failed: {e}")))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| (ErrorCode::ProtocolError, format!("PING failed: {e}")))?;
        if pong != "PONG" {
            return Err((
                ErrorCode::ProtocolError,
                format!("unexpected PING reply: {pong:?}"),
            ));
        }
        Ok(None)
    }

    async fn check_mongodb(&self, url: &str) -> DbOutcome {
        let url = if url.starts_with("mongodb://") || url.starts_with("mongodb+srv://") {
            url.to_string()
        } else {
            format!("mongodb://{url}")
        };

        let client = mongodb::Client::with_uri_str(&url)
            .await
            .map_err(|e| (classify_db_error(&e.to_string()), format!("mongodb connect failed: {e}")))?;

        client
            .database("admin")
            .run_command(mongodb::bson::doc! { "ping": 1 }, None)
            .await
            .map_err(|e| (classify_db_error(&e.to_string()), format!("ping failed: {e}")))?;
        Ok(None)
    }
}

fn check_row_count(rows: u64, expected: Option<u64>) -> DbOutcome {
    if let Some(expected) = expected
        && rows != expected
    {
        return Err((
            ErrorCode::RowCountMismatch,
            format!("query returned {rows} row(s), expected {expected}"),
        ));
    }
    Ok(Some(rows))
}
