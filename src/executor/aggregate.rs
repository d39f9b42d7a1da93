//! Aggregate executor (derived)
//!
//! Reads the current status of its dependency monitors and derives a
//! combined status. Paused and pending dependencies never count toward the
//! denominator. Absolute mode compares raw counts against thresholds;
//! percentage mode compares shares of the non-paused denominator.
//! `count_degraded_as_down` folds degraded dependencies into the down tally.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use crate::model::{CheckJob, CheckResult, CheckStatus, ErrorCode, MonitorStatus};

use super::{CheckOutcome, Executor, JobCtx};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AggregateConfig {
    dependencies: Vec<String>,
    /// "absolute" or "percentage"
    mode: String,
    /// down dependencies (count or percent) at which the aggregate fails
    down_threshold: f64,
    /// degraded-or-down dependencies at which the aggregate degrades
    degraded_threshold: f64,
    count_degraded_as_down: bool,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            dependencies: vec![],
            mode: "absolute".to_string(),
            down_threshold: 1.0,
            degraded_threshold: 1.0,
            count_degraded_as_down: false,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct Tally {
    active: u64,
    degraded: u64,
    down: u64,
    paused: u64,
}

pub struct AggregateExecutor;

#[async_trait]
impl Executor for AggregateExecutor {
    #[instrument(skip_all, fields(monitor = %job.monitor_id))]
    async fn execute(&self, job: &CheckJob, ctx: &JobCtx) -> CheckOutcome {
        let config: AggregateConfig =
            serde_json::from_value(job.config.clone()).unwrap_or_default();

        if config.dependencies.is_empty() {
            let mut result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
            result.error_code = Some(ErrorCode::InvalidConfig);
            result.error_message = Some("aggregate monitor has no dependencies".to_string());
            return CheckOutcome::ok(result);
        }

        let statuses = match ctx.store.monitor_statuses(&config.dependencies).await {
            Ok(statuses) => statuses,
            Err(e) => {
                let result = CheckResult::new(&job.monitor_id, &ctx.region, CheckStatus::Error);
                return CheckOutcome::control(result, anyhow::anyhow!(e));
            }
        };

        let tally = tally(&statuses);
        let (status, message) = evaluate(&config, &tally);

        let mut result = CheckResult::new(&job.monitor_id, &ctx.region, status);
        result.error_message = message;
        if status == CheckStatus::Failure {
            result.error_code = Some(ErrorCode::DependencyDown);
        } else if status == CheckStatus::Degraded {
            result.error_code = Some(ErrorCode::DependencyDegraded);
        }
        result.payload = serde_json::json!({
            "dependencies": config.dependencies.len(),
            "active": tally.active,
            "degraded": tally.degraded,
            "down": tally.down,
            "paused": tally.paused,
        });
        CheckOutcome::ok(result)
    }
}

fn tally(statuses: &[(String, MonitorStatus)]) -> Tally {
    let mut tally = Tally::default();
    for (_, status) in statuses {
        match status {
            MonitorStatus::Active => tally.active += 1,
            MonitorStatus::Degraded => tally.degraded += 1,
            MonitorStatus::Down => tally.down += 1,
            MonitorStatus::Paused | MonitorStatus::Pending => tally.paused += 1,
        }
    }
    tally
}

fn evaluate(config: &AggregateConfig, tally: &Tally) -> (CheckStatus, Option<String>) {
    let denominator = tally.active + tally.degraded + tally.down;
    if denominator == 0 {
        // Everything paused or pending: nothing to say
        return (CheckStatus::Success, None);
    }

    let effective_down = if config.count_degraded_as_down {
        tally.down + tally.degraded
    } else {
        tally.down
    };
    let effective_impaired = tally.down + tally.degraded;

    let (down_measure, impaired_measure) = if config.mode == "percentage" {
        (
            effective_down as f64 / denominator as f64 * 100.0,
            effective_impaired as f64 / denominator as f64 * 100.0,
        )
    } else {
        (effective_down as f64, effective_impaired as f64)
    };

    if down_measure >= config.down_threshold {
        let unit = if config.mode == "percentage" { "%" } else { "" };
        return (
            CheckStatus::Failure,
            Some(format!(
                "{down_measure}{unit} of dependencies down (threshold {}{unit})",
                config.down_threshold
            )),
        );
    }
    if impaired_measure >= config.degraded_threshold {
        let unit = if config.mode == "percentage" { "%" } else { "" };
        return (
            CheckStatus::Degraded,
            Some(format!(
                "{impaired_measure}{unit} of dependencies impaired (threshold {}{unit})",
                config.degraded_threshold
            )),
        );
    }
    (CheckStatus::Success, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(active: u64, degraded: u64, down: u64, paused: u64) -> Vec<(String, MonitorStatus)> {
        let mut out = Vec::new();
        for _ in 0..active {
            out.push(("m".to_string(), MonitorStatus::Active));
        }
        for _ in 0..degraded {
            out.push(("m".to_string(), MonitorStatus::Degraded));
        }
        for _ in 0..down {
            out.push(("m".to_string(), MonitorStatus::Down));
        }
        for _ in 0..paused {
            out.push(("m".to_string(), MonitorStatus::Paused));
        }
        out
    }

    #[test]
    fn test_absolute_mode_thresholds() {
        let config = AggregateConfig {
            down_threshold: 2.0,
            degraded_threshold: 1.0,
            ..Default::default()
        };

        let (status, _) = evaluate(&config, &tally(&statuses(5, 0, 0, 0)));
        assert_eq!(status, CheckStatus::Success);

        let (status, _) = evaluate(&config, &tally(&statuses(4, 1, 0, 0)));
        assert_eq!(status, CheckStatus::Degraded);

        let (status, _) = evaluate(&config, &tally(&statuses(3, 0, 2, 0)));
        assert_eq!(status, CheckStatus::Failure);
    }

    #[test]
    fn test_percentage_mode_excludes_paused() {
        let config = AggregateConfig {
            mode: "percentage".to_string(),
            down_threshold: 50.0,
            degraded_threshold: 25.0,
            ..Default::default()
        };

        // 1 down of 2 non-paused = 50%, paused monitors excluded
        let (status, _) = evaluate(&config, &tally(&statuses(1, 0, 1, 3)));
        assert_eq!(status, CheckStatus::Failure);
    }

    #[test]
    fn test_degraded_folds_into_down_when_configured() {
        let config = AggregateConfig {
            down_threshold: 2.0,
            degraded_threshold: 10.0,
            count_degraded_as_down: true,
            ..Default::default()
        };

        let (status, _) = evaluate(&config, &tally(&statuses(3, 2, 0, 0)));
        assert_eq!(status, CheckStatus::Failure);
    }

    #[test]
    fn test_all_paused_is_success() {
        let config = AggregateConfig::default();
        let (status, _) = evaluate(&config, &tally(&statuses(0, 0, 0, 4)));
        assert_eq!(status, CheckStatus::Success);
    }
}
