//! Rollup pipeline against the real store: idempotence and daily pooling

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use vigil::model::CheckStatus;
use vigil::rollup::{hour_bucket, run_daily, run_hourly};
use vigil::storage::Store;

use crate::helpers::*;

#[tokio::test]
async fn test_hourly_rollup_and_idempotence() {
    let rig = rig().await;
    let bucket = hour_bucket(Utc::now() - Duration::hours(1));

    rig.store
        .insert_monitor(&test_monitor("m1", None))
        .await
        .unwrap();
    for (offset, ms) in [(1, 100), (2, 150), (3, 200), (4, 250)] {
        let mut result = result_at(
            "m1",
            CheckStatus::Success,
            bucket + Duration::minutes(offset),
        );
        result.response_time_ms = Some(ms);
        rig.store_dyn.insert_check_result(&result).await.unwrap();
    }

    let written = run_hourly(&rig.store_dyn, "m1", bucket).await.unwrap();
    assert_eq!(written, 1);

    let row = rig
        .store_dyn
        .get_hourly_rollup("m1", "uk", bucket)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.avg_response_time_ms, Some(175.0));
    assert_eq!(row.min_response_time_ms, Some(100));
    assert_eq!(row.max_response_time_ms, Some(250));
    assert_eq!(row.p50, Some(150));
    assert_eq!(row.p90, Some(250));
    assert_eq!(row.success_count, 4);
    assert_eq!(row.total_count, 4);
    assert_eq!(row.uptime_percentage, Some(100.0));

    // run again: byte-identical row
    run_hourly(&rig.store_dyn, "m1", bucket).await.unwrap();
    let again = rig
        .store_dyn
        .get_hourly_rollup("m1", "uk", bucket)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again, row);
}

#[tokio::test]
async fn test_empty_bucket_writes_nothing() {
    let rig = rig().await;
    rig.store
        .insert_monitor(&test_monitor("m1", None))
        .await
        .unwrap();

    let bucket = hour_bucket(Utc::now() - Duration::hours(2));
    let written = run_hourly(&rig.store_dyn, "m1", bucket).await.unwrap();
    assert_eq!(written, 0);
    assert!(
        rig.store_dyn
            .get_hourly_rollup("m1", "uk", bucket)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_daily_rollup_from_hourly_rows() {
    let rig = rig().await;
    rig.store
        .insert_monitor(&test_monitor("m1", None))
        .await
        .unwrap();

    let day = vigil::rollup::day_bucket(Utc::now() - Duration::days(1));

    // two hours of raw data, different mixes
    for hour in 0..2 {
        let bucket = day + Duration::hours(hour);
        for minute in 0..4 {
            let status = if hour == 1 && minute == 0 {
                CheckStatus::Failure
            } else {
                CheckStatus::Success
            };
            let mut result = result_at("m1", status, bucket + Duration::minutes(minute * 10));
            result.response_time_ms = Some(100 + (minute as u64) * 50);
            rig.store_dyn.insert_check_result(&result).await.unwrap();
        }
        run_hourly(&rig.store_dyn, "m1", bucket).await.unwrap();
    }

    let written = run_daily(&rig.store_dyn, "m1", day).await.unwrap();
    assert_eq!(written, 1);

    let row = rig
        .store_dyn
        .get_daily_rollup("m1", "uk", day)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.total_count, 8);
    assert_eq!(row.failure_count, 1);
    assert_eq!(
        row.success_count + row.degraded_count + row.failure_count,
        row.total_count
    );
    assert_eq!(row.uptime_percentage, Some(87.5));

    // daily is idempotent too
    run_daily(&rig.store_dyn, "m1", day).await.unwrap();
    let again = rig
        .store_dyn
        .get_daily_rollup("m1", "uk", day)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again, row);
}
