//! Property-based tests for aggregation and retry invariants using proptest

use proptest::prelude::*;
use std::time::Duration;

use vigil::model::{CheckResult, CheckStatus};
use vigil::queue::Backoff;
use vigil::rollup::{hour_bucket, hourly_rows, percentile};

fn arb_status() -> impl Strategy<Value = CheckStatus> {
    prop_oneof![
        Just(CheckStatus::Success),
        Just(CheckStatus::Degraded),
        Just(CheckStatus::Failure),
        Just(CheckStatus::Timeout),
        Just(CheckStatus::Error),
    ]
}

fn arb_result() -> impl Strategy<Value = CheckResult> {
    (arb_status(), proptest::option::of(0u64..60_000)).prop_map(|(status, ms)| {
        let mut result = CheckResult::new("m1", "uk", status);
        result.response_time_ms = ms;
        result
    })
}

// Property: counts always partition the total, and uptime stays in [0, 100]
proptest! {
    #[test]
    fn prop_rollup_counts_partition_total(results in prop::collection::vec(arb_result(), 0..50)) {
        let rows = hourly_rows("m1", hour_bucket(chrono::Utc::now()), &results);

        for row in rows {
            prop_assert_eq!(
                row.success_count + row.degraded_count + row.failure_count,
                row.total_count
            );
            if let Some(uptime) = row.uptime_percentage {
                prop_assert!((0.0..=100.0).contains(&uptime));
            }
            prop_assert!(row.total_count > 0);
        }
    }
}

// Property: percentiles are members of the input and ordered p50 <= p95 <= p99
proptest! {
    #[test]
    fn prop_percentiles_are_members_and_ordered(mut times in prop::collection::vec(0u64..100_000, 1..200)) {
        times.sort_unstable();

        let p50 = percentile(&times, 50).unwrap();
        let p95 = percentile(&times, 95).unwrap();
        let p99 = percentile(&times, 99).unwrap();

        prop_assert!(times.contains(&p50));
        prop_assert!(times.contains(&p95));
        prop_assert!(times.contains(&p99));
        prop_assert!(p50 <= p95);
        prop_assert!(p95 <= p99);
        prop_assert!(p99 <= *times.last().unwrap());
    }
}

// Property: min <= avg <= max whenever response times exist
proptest! {
    #[test]
    fn prop_rollup_avg_bounded_by_min_max(times in prop::collection::vec(0u64..60_000, 1..100)) {
        let results: Vec<CheckResult> = times
            .iter()
            .map(|ms| {
                let mut result = CheckResult::new("m1", "uk", CheckStatus::Success);
                result.response_time_ms = Some(*ms);
                result
            })
            .collect();

        let rows = hourly_rows("m1", hour_bucket(chrono::Utc::now()), &results);
        let row = &rows[0];

        let min = row.min_response_time_ms.unwrap() as f64;
        let max = row.max_response_time_ms.unwrap() as f64;
        let avg = row.avg_response_time_ms.unwrap();
        prop_assert!(min <= avg + f64::EPSILON);
        prop_assert!(avg <= max + f64::EPSILON);
    }
}

// Property: rollups are a pure function of their input
proptest! {
    #[test]
    fn prop_rollup_is_deterministic(results in prop::collection::vec(arb_result(), 0..50)) {
        let bucket = hour_bucket(chrono::Utc::now());
        prop_assert_eq!(
            hourly_rows("m1", bucket, &results),
            hourly_rows("m1", bucket, &results)
        );
    }
}

// Property: exponential backoff never exceeds its cap and never decreases
// below the base
proptest! {
    #[test]
    fn prop_backoff_bounded(attempt in 1u32..100) {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(16),
        };
        let delay = backoff.delay_for(attempt);
        prop_assert!(delay >= Duration::from_secs(1));
        prop_assert!(delay <= Duration::from_secs(16));
    }
}

// Property: backoff is monotone non-decreasing in the attempt number
proptest! {
    #[test]
    fn prop_backoff_monotone(attempt in 1u32..30) {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(60),
        };
        prop_assert!(backoff.delay_for(attempt) <= backoff.delay_for(attempt + 1));
    }
}
