//! Email authentication executor (SPF / DKIM / DMARC)
//!
//! Reads the domain's TXT records: SPF from the apex (`v=spf1`, with the
//! `all` qualifier), DKIM from `{selector}._domainkey.<domain>` across the
//! configured (or default) selector list with an inferred key size, DMARC
//! from `_dmarc.<domain>` (`p`, `sp`, `pct`, alignment). The three parts
//! combine into a 0-100 score: SPF up to 30, DKIM up to 30, DMARC up to 40.
//!
//! Strict validation fails on missing SPF or DMARC and degrades below a
//! score of 50.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};
use trust_dns_resolver::proto::rr::RecordType;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode};

use super::{CheckOutcome, Executor, JobCtx, deadline, timeout_result};

const DEFAULT_SELECTORS: &[&str] = &[
    "default",
    "google",
    "selector1",
    "selector2",
    "k1",
    "mail",
    "s1",
    "s2",
];

const DEGRADED_SCORE: u32 = 50;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EmailAuthConfig {
    selectors: Vec<String>,
    strict: bool,
}

impl Default for EmailAuthConfig {
    fn default() -> Self {
        Self {
            selectors: vec![],
            strict: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SpfReport {
    pub present: bool,
    pub record: Option<String>,
    /// `-all`, `~all`, `?all`, `+all`
    pub all_qualifier: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DkimSelector {
    pub selector: String,
    pub key_bits: u32,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DmarcReport {
    pub present: bool,
    pub policy: Option<String>,
    pub subdomain_policy: Option<String>,
    pub pct: Option<u32>,
    pub dkim_alignment: Option<String>,
    pub spf_alignment: Option<String>,
}

pub struct EmailAuthExecutor;

#[async_trait]
impl Executor for EmailAuthExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config: EmailAuthConfig =
            serde_json::from_value(job.config.clone()).unwrap_or_default();
        let Some((domain, _)) = super::host_and_port(&job.url, 0) else {
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
            result.error_code = Some(ErrorCode::InvalidConfig);
            result.error_message = Some(format!("cannot parse domain from {:?}", job.url));
            return CheckOutcome::ok(result);
        };

        let start = std::time::Instant::now();
        let scan = deadline(job.timeout_ms, self.scan(&domain, &config, ctx)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let (spf, dkim, dmarc) = match scan {
            Err(_) => return CheckOutcome::ok(timeout_result(job, &ctx.region)),
            Ok(parts) => parts,
        };

        let score = score(&spf, &dkim, &dmarc);

        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Success);
        result.response_time_ms = Some(elapsed_ms);
        result.payload = serde_json::json!({
            "score": score,
            "spf": spf,
            "dkim_selectors": dkim,
            "dmarc": dmarc,
        });

        if config.strict {
            if !spf.present {
                result.status = CheckStatus::Failure;
                result.error_code = Some(ErrorCode::SpfMissing);
                result.error_message = Some(format!("no SPF record on {domain}"));
                return CheckOutcome::ok(result);
            }
            if !dmarc.present {
                result.status = CheckStatus::Failure;
                result.error_code = Some(ErrorCode::DmarcMissing);
                result.error_message = Some(format!("no DMARC record on _dmarc.{domain}"));
                return CheckOutcome::ok(result);
            }
        }

        if score < DEGRADED_SCORE {
            result.status = CheckStatus::Degraded;
            result.error_code = Some(ErrorCode::AuthScoreLow);
            result.error_message = Some(format!("email auth score {score}/100"));
        }
        CheckOutcome::ok(result)
    }
}

impl EmailAuthExecutor {
    async fn scan(
        &self,
        domain: &str,
        config: &EmailAuthConfig,
        ctx: &JobCtx,
    ) -> (SpfReport, Vec<DkimSelector>, DmarcReport) {
        let spf = parse_spf(&self.txt_records(ctx, domain).await);

        let selector_names: Vec<String> = if config.selectors.is_empty() {
            DEFAULT_SELECTORS.iter().map(|s| s.to_string()).collect()
        } else {
            config.selectors.clone()
        };

        let mut dkim = Vec::new();
        for selector in &selector_names {
            let name = format!("{selector}._domainkey.{domain}");
            let records = self.txt_records(ctx, &name).await;
            if let Some(bits) = parse_dkim_bits(&records) {
                trace!("DKIM selector {selector} found on {domain} ({bits} bits)");
                dkim.push(DkimSelector {
                    selector: selector.clone(),
                    key_bits: bits,
                });
            }
        }

        let dmarc = parse_dmarc(&self.txt_records(ctx, &format!("_dmarc.{domain}")).await);

        (spf, dkim, dmarc)
    }

    async fn txt_records(&self, ctx: &JobCtx, name: &str) -> Vec<String> {
        match ctx.resolver.lookup(name, RecordType::TXT).await {
            Ok(lookup) => lookup
                .record_iter()
                .filter_map(|record| record.data().map(|data| data.to_string()))
                .collect(),
            Err(_) => vec![],
        }
    }
}

pub fn parse_spf(records: &[String]) -> SpfReport {
    let Some(record) = records.iter().find(|r| r.contains("v=spf1")) else {
        return SpfReport::default();
    };

    let all_qualifier = record
        .split_whitespace()
        .find(|token| token.ends_with("all"))
        .map(|token| token.to_string());

    SpfReport {
        present: true,
        record: Some(record.clone()),
        all_qualifier,
    }
}

/// Infer the RSA key size from the base64 `p=` payload length
pub fn parse_dkim_bits(records: &[String]) -> Option<u32> {
    let record = records.iter().find(|r| r.contains("v=DKIM1"))?;
    let key = record
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("p="))?;
    if key.is_empty() {
        // Revoked key
        return None;
    }

    // base64 length → DER length → rough modulus size
    let der_len = key.len() * 3 / 4;
    Some(if der_len > 350 {
        4096
    } else if der_len > 250 {
        2048
    } else {
        1024
    })
}

pub fn parse_dmarc(records: &[String]) -> DmarcReport {
    let Some(record) = records.iter().find(|r| r.contains("v=DMARC1")) else {
        return DmarcReport::default();
    };

    let tag = |name: &str| -> Option<String> {
        record
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix(&format!("{name}=")))
            .map(|value| value.to_string())
    };

    DmarcReport {
        present: true,
        policy: tag("p"),
        subdomain_policy: tag("sp"),
        pct: tag("pct").and_then(|v| v.parse().ok()),
        dkim_alignment: tag("adkim"),
        spf_alignment: tag("aspf"),
    }
}

/// Combine the three mechanisms into a 0-100 score
pub fn score(spf: &SpfReport, dkim: &[DkimSelector], dmarc: &DmarcReport) -> u32 {
    let mut score = 0;

    // SPF: up to 30
    if spf.present {
        score += 15;
        score += match spf.all_qualifier.as_deref() {
            Some("-all") => 15,
            Some("~all") => 10,
            Some("?all") => 5,
            _ => 0,
        };
    }

    // DKIM: up to 30
    if !dkim.is_empty() {
        score += 20;
        if dkim.iter().any(|selector| selector.key_bits >= 2048) {
            score += 10;
        }
    }

    // DMARC: up to 40
    if dmarc.present {
        score += 15;
        score += match dmarc.policy.as_deref() {
            Some("reject") => 25,
            Some("quarantine") => 15,
            Some("none") => 5,
            _ => 0,
        };
    }

    score.min(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spf_parsing() {
        let records = vec!["v=spf1 include:_spf.google.com ~all".to_string()];
        let spf = parse_spf(&records);
        assert!(spf.present);
        assert_eq!(spf.all_qualifier.as_deref(), Some("~all"));

        assert!(!parse_spf(&["unrelated".to_string()]).present);
    }

    #[test]
    fn test_dkim_key_size_inference() {
        // ~392 base64 chars ≈ 2048-bit key DER
        let long_key = "A".repeat(392);
        let records = vec![format!("v=DKIM1; k=rsa; p={long_key}")];
        assert_eq!(parse_dkim_bits(&records), Some(2048));

        let short_key = "A".repeat(216);
        let records = vec![format!("v=DKIM1; k=rsa; p={short_key}")];
        assert_eq!(parse_dkim_bits(&records), Some(1024));

        // revoked key
        let records = vec!["v=DKIM1; p=".to_string()];
        assert_eq!(parse_dkim_bits(&records), None);
    }

    #[test]
    fn test_dmarc_parsing() {
        let records =
            vec!["v=DMARC1; p=reject; sp=quarantine; pct=100; adkim=s; aspf=r".to_string()];
        let dmarc = parse_dmarc(&records);
        assert!(dmarc.present);
        assert_eq!(dmarc.policy.as_deref(), Some("reject"));
        assert_eq!(dmarc.subdomain_policy.as_deref(), Some("quarantine"));
        assert_eq!(dmarc.pct, Some(100));
        assert_eq!(dmarc.dkim_alignment.as_deref(), Some("s"));
    }

    #[test]
    fn test_score_caps_and_components() {
        let spf = SpfReport {
            present: true,
            record: None,
            all_qualifier: Some("-all".to_string()),
        };
        let dkim = vec![DkimSelector {
            selector: "default".to_string(),
            key_bits: 2048,
        }];
        let dmarc = DmarcReport {
            present: true,
            policy: Some("reject".to_string()),
            ..Default::default()
        };

        assert_eq!(score(&spf, &dkim, &dmarc), 100);
        assert_eq!(score(&SpfReport::default(), &[], &DmarcReport::default()), 0);

        // SPF-only with a soft all sits below the degraded line
        assert!(score(&spf, &[], &DmarcReport::default()) < DEGRADED_SCORE);
    }
}
