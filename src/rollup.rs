//! Rollup aggregation
//!
//! Hourly: raw results in `[hour, hour+1h)` grouped by region, with
//! nearest-rank percentiles over the sorted response times. Daily: hourly
//! rows in `[day, day+24h)` grouped by region; averages are weighted by
//! `total_count`, min/max are monotone reductions, and daily percentiles
//! are approximated by pooling the hourly p50/p95/p99 values — approximate
//! by design, exact daily percentiles would need the raw rows again.
//!
//! Both writes are pure upserts, so re-running a bucket is idempotent and
//! concurrent runs cannot disagree.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument};

use crate::model::{CheckResult, CheckStatus, RollupRow};
use crate::storage::Store;

/// Nearest-rank percentile over a sorted sequence, clamped to valid indices
pub fn percentile(sorted: &[u64], p: u8) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p as f64 / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}

/// Truncate to the containing hour
pub fn hour_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp() - at.timestamp().rem_euclid(3600);
    DateTime::from_timestamp(secs, 0).unwrap_or(at)
}

/// Truncate to the containing UTC day
pub fn day_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp() - at.timestamp().rem_euclid(86_400);
    DateTime::from_timestamp(secs, 0).unwrap_or(at)
}

/// Compute hourly rows (one per region) from the bucket's raw results.
/// CT-log checks carry no latency signal and are excluded.
pub fn hourly_rows(
    monitor_id: &str,
    bucket_start: DateTime<Utc>,
    results: &[CheckResult],
) -> Vec<RollupRow> {
    let mut by_region: BTreeMap<&str, Vec<&CheckResult>> = BTreeMap::new();
    for result in results {
        if result.payload.get("ct_log_ids").is_some() {
            continue;
        }
        by_region.entry(&result.region).or_default().push(result);
    }

    let mut rows = Vec::with_capacity(by_region.len());
    for (region, results) in by_region {
        let total = results.len() as u64;
        let success = results
            .iter()
            .filter(|r| r.status == CheckStatus::Success)
            .count() as u64;
        let degraded = results
            .iter()
            .filter(|r| r.status == CheckStatus::Degraded)
            .count() as u64;
        let failure = total - success - degraded;

        let mut times: Vec<u64> = results
            .iter()
            .filter_map(|r| r.response_time_ms)
            .collect();
        times.sort_unstable();

        let avg = if times.is_empty() {
            None
        } else {
            Some(times.iter().sum::<u64>() as f64 / times.len() as f64)
        };

        rows.push(RollupRow {
            monitor_id: monitor_id.to_string(),
            region: region.to_string(),
            bucket_start,
            avg_response_time_ms: avg,
            min_response_time_ms: times.first().copied(),
            max_response_time_ms: times.last().copied(),
            p50: percentile(&times, 50),
            p75: percentile(&times, 75),
            p90: percentile(&times, 90),
            p95: percentile(&times, 95),
            p99: percentile(&times, 99),
            success_count: success,
            degraded_count: degraded,
            failure_count: failure,
            uptime_percentage: (total > 0)
                .then(|| (success + degraded) as f64 / total as f64 * 100.0),
            total_count: total,
        });
    }
    rows
}

/// Compute daily rows (one per region) from the day's hourly rows
pub fn daily_rows(
    monitor_id: &str,
    bucket_start: DateTime<Utc>,
    hourly: &[RollupRow],
) -> Vec<RollupRow> {
    let mut by_region: BTreeMap<&str, Vec<&RollupRow>> = BTreeMap::new();
    for row in hourly {
        by_region.entry(&row.region).or_default().push(row);
    }

    let mut rows = Vec::with_capacity(by_region.len());
    for (region, hours) in by_region {
        let total: u64 = hours.iter().map(|h| h.total_count).sum();
        if total == 0 {
            continue;
        }
        let success: u64 = hours.iter().map(|h| h.success_count).sum();
        let degraded: u64 = hours.iter().map(|h| h.degraded_count).sum();
        let failure: u64 = hours.iter().map(|h| h.failure_count).sum();

        // avg weighted by each hour's sample count
        let weighted: f64 = hours
            .iter()
            .filter_map(|h| h.avg_response_time_ms.map(|avg| avg * h.total_count as f64))
            .sum();
        let weight: u64 = hours
            .iter()
            .filter(|h| h.avg_response_time_ms.is_some())
            .map(|h| h.total_count)
            .sum();
        let avg = (weight > 0).then(|| weighted / weight as f64);

        let min = hours.iter().filter_map(|h| h.min_response_time_ms).min();
        let max = hours.iter().filter_map(|h| h.max_response_time_ms).max();

        // pooled-percentile approximation
        let mut pool: Vec<u64> = hours
            .iter()
            .flat_map(|h| [h.p50, h.p95, h.p99])
            .flatten()
            .collect();
        pool.sort_unstable();

        rows.push(RollupRow {
            monitor_id: monitor_id.to_string(),
            region: region.to_string(),
            bucket_start,
            avg_response_time_ms: avg,
            min_response_time_ms: min,
            max_response_time_ms: max,
            p50: percentile(&pool, 50),
            p75: percentile(&pool, 75),
            p90: percentile(&pool, 90),
            p95: percentile(&pool, 95),
            p99: percentile(&pool, 99),
            success_count: success,
            degraded_count: degraded,
            failure_count: failure,
            uptime_percentage: Some((success + degraded) as f64 / total as f64 * 100.0),
            total_count: total,
        });
    }
    rows
}

/// Run the hourly job for one (monitor, hour). Writes nothing when the
/// bucket has no raw rows.
#[instrument(skip(store))]
pub async fn run_hourly(
    store: &Arc<dyn Store>,
    monitor_id: &str,
    bucket_start: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let results = store
        .results_in_range(monitor_id, bucket_start, bucket_start + Duration::hours(1))
        .await?;

    let rows = hourly_rows(monitor_id, bucket_start, &results);
    for row in &rows {
        store.upsert_hourly_rollup(row).await?;
    }
    debug!("hourly rollup for {monitor_id} @ {bucket_start}: {} row(s)", rows.len());
    Ok(rows.len())
}

/// Run the daily job for one (monitor, UTC day)
#[instrument(skip(store))]
pub async fn run_daily(
    store: &Arc<dyn Store>,
    monitor_id: &str,
    bucket_start: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let hourly = store
        .hourly_rollups_in_range(monitor_id, bucket_start, bucket_start + Duration::hours(24))
        .await?;

    let rows = daily_rows(monitor_id, bucket_start, &hourly);
    for row in &rows {
        store.upsert_daily_rollup(row).await?;
    }
    debug!("daily rollup for {monitor_id} @ {bucket_start}: {} row(s)", rows.len());
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckResult;

    fn result(status: CheckStatus, response_time_ms: Option<u64>) -> CheckResult {
        let mut result = CheckResult::new("m1", "uk", status);
        result.response_time_ms = response_time_ms;
        result
    }

    #[test]
    fn test_nearest_rank_percentiles() {
        let sorted = [100, 150, 200, 250];
        assert_eq!(percentile(&sorted, 50), Some(150));
        assert_eq!(percentile(&sorted, 75), Some(200));
        assert_eq!(percentile(&sorted, 90), Some(250));
        assert_eq!(percentile(&sorted, 99), Some(250));
        assert_eq!(percentile(&[], 50), None);
        assert_eq!(percentile(&[42], 1), Some(42));
    }

    #[test]
    fn test_hourly_reference_bucket() {
        // four successes at 100/150/200/250ms
        let results: Vec<CheckResult> = [100, 150, 200, 250]
            .into_iter()
            .map(|ms| result(CheckStatus::Success, Some(ms)))
            .collect();

        let rows = hourly_rows("m1", hour_bucket(Utc::now()), &results);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];

        assert_eq!(row.avg_response_time_ms, Some(175.0));
        assert_eq!(row.min_response_time_ms, Some(100));
        assert_eq!(row.max_response_time_ms, Some(250));
        assert_eq!(row.p50, Some(150));
        assert_eq!(row.p90, Some(250));
        assert_eq!(row.success_count, 4);
        assert_eq!(row.total_count, 4);
        assert_eq!(row.uptime_percentage, Some(100.0));
    }

    #[test]
    fn test_counts_always_sum_to_total() {
        let results = vec![
            result(CheckStatus::Success, Some(100)),
            result(CheckStatus::Degraded, Some(900)),
            result(CheckStatus::Failure, None),
            result(CheckStatus::Timeout, Some(5000)),
            result(CheckStatus::Error, None),
        ];

        let rows = hourly_rows("m1", hour_bucket(Utc::now()), &results);
        let row = &rows[0];
        assert_eq!(
            row.success_count + row.degraded_count + row.failure_count,
            row.total_count
        );
        assert_eq!(row.failure_count, 3);
        // degraded still counts as up
        assert_eq!(row.uptime_percentage, Some(40.0));
    }

    #[test]
    fn test_ct_results_are_excluded() {
        let mut ct = result(CheckStatus::Success, Some(10));
        ct.payload = serde_json::json!({"ct_log_ids": [1, 2]});
        let rows = hourly_rows("m1", hour_bucket(Utc::now()), &[ct]);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_empty_bucket_writes_no_rows() {
        assert!(hourly_rows("m1", hour_bucket(Utc::now()), &[]).is_empty());
    }

    #[test]
    fn test_regions_split_into_separate_rows() {
        let mut us = result(CheckStatus::Success, Some(80));
        us.region = "us".to_string();
        let uk = result(CheckStatus::Failure, None);

        let rows = hourly_rows("m1", hour_bucket(Utc::now()), &[us, uk]);
        assert_eq!(rows.len(), 2);
        let regions: Vec<&str> = rows.iter().map(|r| r.region.as_str()).collect();
        assert_eq!(regions, vec!["uk", "us"]);
    }

    #[test]
    fn test_daily_weighted_average_and_pooling() {
        let day = day_bucket(Utc::now());
        let hour_a = RollupRow {
            monitor_id: "m1".to_string(),
            region: "uk".to_string(),
            bucket_start: day,
            avg_response_time_ms: Some(100.0),
            min_response_time_ms: Some(50),
            max_response_time_ms: Some(150),
            p50: Some(100),
            p75: Some(120),
            p90: Some(140),
            p95: Some(145),
            p99: Some(150),
            success_count: 10,
            degraded_count: 0,
            failure_count: 0,
            total_count: 10,
            uptime_percentage: Some(100.0),
        };
        let hour_b = RollupRow {
            avg_response_time_ms: Some(400.0),
            min_response_time_ms: Some(300),
            max_response_time_ms: Some(500),
            p50: Some(400),
            p95: Some(480),
            p99: Some(500),
            success_count: 20,
            failure_count: 10,
            total_count: 30,
            uptime_percentage: Some(66.6),
            ..hour_a.clone()
        };

        let rows = daily_rows("m1", day, &[hour_a, hour_b]);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];

        // (100*10 + 400*30) / 40
        assert_eq!(row.avg_response_time_ms, Some(325.0));
        assert_eq!(row.min_response_time_ms, Some(50));
        assert_eq!(row.max_response_time_ms, Some(500));
        assert_eq!(row.total_count, 40);
        assert_eq!(row.success_count, 30);
        assert_eq!(row.failure_count, 10);
        assert_eq!(row.uptime_percentage, Some(75.0));

        // pool = sorted [100,145,150,400,480,500]; p50 = 3rd = 150
        assert_eq!(row.p50, Some(150));
        assert_eq!(row.p99, Some(500));
    }

    #[test]
    fn test_hourly_rows_are_deterministic() {
        let results: Vec<CheckResult> = [250, 100, 200, 150]
            .into_iter()
            .map(|ms| result(CheckStatus::Success, Some(ms)))
            .collect();
        let bucket = hour_bucket(Utc::now());

        let first = hourly_rows("m1", bucket, &results);
        let second = hourly_rows("m1", bucket, &results);
        assert_eq!(first, second);
    }
}
