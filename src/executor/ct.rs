//! Certificate Transparency executor
//!
//! Queries crt.sh for the target domain, dedupes entries by certificate id,
//! and diffs against the id set stored by the previous CT check. A new
//! certificate from an issuer outside `expected_issuers` is a failure; any
//! other new certificate is degraded (both dampened by the alert_on_*
//! flags). The stored id set only ever grows, up to crt.sh truncation.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{CheckOutcome, Executor, JobCtx, deadline};

#[derive(Debug, Deserialize)]
struct CrtShEntry {
    id: u64,
    issuer_name: String,
    #[serde(default)]
    name_value: String,
    #[serde(default)]
    entry_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CtConfig {
    expected_issuers: Vec<String>,
    alert_on_unexpected_issuers: bool,
    alert_on_new_certificates: bool,
}

impl Default for CtConfig {
    fn default() -> Self {
        Self {
            expected_issuers: vec![],
            alert_on_unexpected_issuers: true,
            alert_on_new_certificates: true,
        }
    }
}

pub struct CtExecutor;

#[async_trait]
impl Executor for CtExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config: CtConfig = serde_json::from_value(job.config.clone()).unwrap_or_default();
        let Some((domain, _)) = super::host_and_port(&job.url, 443) else {
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
            result.error_code = Some(ErrorCode::InvalidConfig);
            result.error_message = Some(format!("cannot parse domain from {:?}", job.url));
            return CheckOutcome::ok(result);
        };

        // Previous id set, from the last persisted CT result
        let known: HashSet<u64> = match ctx.store.latest_result(&job.monitor_id).await {
            Ok(Some(previous)) => previous
                .payload
                .get("ct_log_ids")
                .and_then(|ids| serde_json::from_value(ids.clone()).ok())
                .unwrap_or_default(),
            Ok(None) => HashSet::new(),
            Err(e) => {
                let result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                return CheckOutcome::control(result, anyhow::anyhow!(e));
            }
        };
        let first_run = known.is_empty();

        let start = std::time::Instant::now();
        let mut entries = match self.fetch(&domain, job.timeout_ms, ctx).await {
            Ok(entries) => entries,
            Err(message) => {
                let mut result =
                    CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                result.response_time_ms = Some(start.elapsed().as_millis() as u64);
                result.error_code = Some(ErrorCode::CtFetchFailed);
                result.error_message = Some(message);
                return CheckOutcome::ok(result);
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        // Dedupe by id, newest first
        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert(entry.id));
        entries.sort_by(|a, b| b.id.cmp(&a.id));

        let new_entries: Vec<&CrtShEntry> = entries
            .iter()
            .filter(|entry| !known.contains(&entry.id))
            .collect();

        let unexpected: Vec<&&CrtShEntry> = new_entries
            .iter()
            .filter(|entry| {
                !config.expected_issuers.is_empty()
                    && !config.expected_issuers.iter().any(|issuer| {
                        entry
                            .issuer_name
                            .to_lowercase()
                            .contains(&issuer.to_lowercase())
                    })
            })
            .collect();

        // The stored set is monotone: union of everything ever seen
        let all_ids: HashSet<u64> = known
            .iter()
            .copied()
            .chain(entries.iter().map(|entry| entry.id))
            .collect();

        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);
        result.response_time_ms = Some(elapsed_ms);
        result.payload = serde_json::json!({
            "ct_log_ids": all_ids,
            "total_certificates": entries.len(),
            "new_certificates": new_entries
                .iter()
                .map(|entry| serde_json::json!({
                    "id": entry.id,
                    "issuer": entry.issuer_name,
                    "names": entry.name_value,
                    "logged_at": entry.entry_timestamp,
                }))
                .collect::<Vec<_>>(),
        });

        if !unexpected.is_empty() && config.alert_on_unexpected_issuers {
            result.status = CheckStatus::Failure;
            result.error_code = Some(ErrorCode::CtUnexpectedIssuer);
            result.error_message = Some(format!(
                "{} new certificate(s) from unexpected issuer(s), e.g. {:?}",
                unexpected.len(),
                unexpected[0].issuer_name
            ));
        } else if !new_entries.is_empty() && !first_run && config.alert_on_new_certificates {
            result.status = CheckStatus::Degraded;
            result.error_code = Some(ErrorCode::CtNewCertificate);
            result.error_message = Some(format!(
                "{} new certificate(s) logged for {domain}",
                new_entries.len()
            ));
        }

        debug!(
            "CT check for {domain}: {} total, {} new, {} unexpected",
            entries.len(),
            new_entries.len(),
            unexpected.len()
        );
        CheckOutcome::ok(result)
    }
}

impl CtExecutor {
    async fn fetch(
        &self,
        domain: &str,
        timeout_ms: u64,
        ctx: &JobCtx,
    ) -> Result<Vec<CrtShEntry>, String> {
        let url = format!("https://crt.sh/?q={domain}&output=json");

        let response = match deadline(timeout_ms, ctx.http.get(&url).send()).await {
            Err(_) => return Err("crt.sh request timed out".to_string()),
            Ok(Err(e)) => return Err(format!("crt.sh request failed: {e}")),
            Ok(Ok(response)) => response,
        };

        if !response.status().is_success() {
            return Err(format!("crt.sh returned {}", response.status()));
        }

        match deadline(timeout_ms, response.json::<Vec<CrtShEntry>>()).await {
            Err(_) => Err("crt.sh response read timed out".to_string()),
            Ok(Err(e)) => Err(format!("crt.sh returned unparseable JSON: {e}")),
            Ok(Ok(entries)) => Ok(entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_deserialization() {
        let json = r#"[
            {"id": 42, "issuer_name": "C=US, O=Let's Encrypt, CN=R11",
             "name_value": "example.com", "entry_timestamp": "2026-01-01T00:00:00"},
            {"id": 41, "issuer_name": "C=US, O=DigiCert Inc", "name_value": "example.com"}
        ]"#;
        let entries: Vec<CrtShEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, 42);
        assert!(entries[1].entry_timestamp.is_none());
    }

    #[test]
    fn test_config_defaults_alert_on_everything() {
        let config: CtConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(config.alert_on_new_certificates);
        assert!(config.alert_on_unexpected_issuers);
        assert!(config.expected_issuers.is_empty());
    }
}
