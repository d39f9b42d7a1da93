//! Remote probe protocol: registration, heartbeat, claim and completion
//! semantics, result ingestion

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use vigil::model::{CheckStatus, MonitorStatus, PendingJobStatus, ProbeMetrics, ProbeStatus};
use vigil::probe::ProbeService;
use vigil::probe::service::ProbeResultSubmission;
use vigil::storage::Store;

use crate::helpers::*;

async fn service(rig: &TestRig) -> std::sync::Arc<ProbeService> {
    ProbeService::new(rig.store_dyn.clone(), rig.ingest.clone())
}

#[tokio::test]
async fn test_register_then_heartbeat_activates() {
    let rig = rig().await;
    let service = service(&rig).await;

    let probe = service
        .register("org-1", "edge-1", "us-east", "tok-secret")
        .await
        .unwrap();
    assert_eq!(probe.status, ProbeStatus::Pending);
    // only the hash is stored
    assert_ne!(probe.token_hash, "tok-secret");

    service
        .heartbeat("tok-secret", &ProbeMetrics::default(), Utc::now())
        .await
        .unwrap();

    let probes = rig.store_dyn.get_probes(&[probe.id.clone()]).await.unwrap();
    assert_eq!(probes[0].status, ProbeStatus::Active);
    assert!(probes[0].last_heartbeat_at.is_some());
}

#[tokio::test]
async fn test_unknown_token_is_rejected() {
    let rig = rig().await;
    let service = service(&rig).await;

    let err = service
        .heartbeat("no-such-token", &ProbeMetrics::default(), Utc::now())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown or disabled"));
}

#[tokio::test]
async fn test_claims_are_exclusive_per_poll() {
    let rig = rig().await;
    let service = service(&rig).await;
    let now = Utc::now();

    rig.store
        .insert_monitor(&test_monitor("m1", Some(now)))
        .await
        .unwrap();
    let probe = service
        .register("org-1", "edge-1", "us-east", "tok")
        .await
        .unwrap();

    rig.store_dyn
        .insert_pending_job(&vigil::model::ProbePendingJob {
            id: "job-1".to_string(),
            probe_id: probe.id.clone(),
            monitor_id: "m1".to_string(),
            job_data: vigil::model::CheckJob::from_monitor(&test_monitor("m1", Some(now))),
            status: PendingJobStatus::Pending,
            expires_at: now + Duration::minutes(5),
            created_at: now,
        })
        .await
        .unwrap();

    let first = service.poll_jobs("tok", Some(10), now).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].status, PendingJobStatus::Claimed);

    // a second poll finds nothing claimable
    let second = service.poll_jobs("tok", Some(10), now).await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_submit_runs_ingest_and_updates_monitor() {
    let rig = rig().await;
    let service = service(&rig).await;
    let now = Utc::now();

    rig.store
        .insert_monitor(&test_monitor("m1", Some(now)))
        .await
        .unwrap();
    let probe = service
        .register("org-1", "edge-1", "us-east", "tok")
        .await
        .unwrap();

    rig.store_dyn
        .insert_pending_job(&vigil::model::ProbePendingJob {
            id: "job-1".to_string(),
            probe_id: probe.id.clone(),
            monitor_id: "m1".to_string(),
            job_data: vigil::model::CheckJob::from_monitor(&test_monitor("m1", Some(now))),
            status: PendingJobStatus::Pending,
            expires_at: now + Duration::minutes(5),
            created_at: now,
        })
        .await
        .unwrap();
    service.poll_jobs("tok", Some(1), now).await.unwrap();

    let result_id = service
        .submit_result(
            "tok",
            "job-1",
            ProbeResultSubmission {
                status: CheckStatus::Failure,
                response_time_ms: Some(800),
                timings: Default::default(),
                error_message: Some("connection refused".to_string()),
                error_code: Some(vigil::model::ErrorCode::ConnectionRefused),
                status_code: None,
                payload: serde_json::Value::Null,
            },
        )
        .await
        .unwrap();

    // result persisted with the probe's region and fed through ingest
    let latest = rig.store_dyn.latest_result("m1").await.unwrap().unwrap();
    assert_eq!(latest.id, result_id);
    assert_eq!(latest.region, "us-east");
    assert_eq!(latest.status, CheckStatus::Failure);

    let monitor = rig.store_dyn.get_monitor("m1").await.unwrap().unwrap();
    assert_eq!(monitor.status, MonitorStatus::Down);
}

#[tokio::test]
async fn test_only_owner_completes_a_job() {
    let rig = rig().await;
    let service = service(&rig).await;
    let now = Utc::now();

    rig.store
        .insert_monitor(&test_monitor("m1", Some(now)))
        .await
        .unwrap();
    let owner = service
        .register("org-1", "edge-1", "us-east", "tok-owner")
        .await
        .unwrap();
    service
        .register("org-1", "edge-2", "eu-west", "tok-other")
        .await
        .unwrap();

    rig.store_dyn
        .insert_pending_job(&vigil::model::ProbePendingJob {
            id: "job-1".to_string(),
            probe_id: owner.id.clone(),
            monitor_id: "m1".to_string(),
            job_data: vigil::model::CheckJob::from_monitor(&test_monitor("m1", Some(now))),
            status: PendingJobStatus::Pending,
            expires_at: now + Duration::minutes(5),
            created_at: now,
        })
        .await
        .unwrap();
    service.poll_jobs("tok-owner", Some(1), now).await.unwrap();

    let err = service
        .submit_result(
            "tok-other",
            "job-1",
            ProbeResultSubmission {
                status: CheckStatus::Success,
                response_time_ms: None,
                timings: Default::default(),
                error_message: None,
                error_code: None,
                status_code: None,
                payload: serde_json::Value::Null,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn test_expired_jobs_are_reaped() {
    let rig = rig().await;
    let service = service(&rig).await;
    let now = Utc::now();

    rig.store
        .insert_monitor(&test_monitor("m1", Some(now)))
        .await
        .unwrap();
    let probe = service
        .register("org-1", "edge-1", "us-east", "tok")
        .await
        .unwrap();

    rig.store_dyn
        .insert_pending_job(&vigil::model::ProbePendingJob {
            id: "job-stale".to_string(),
            probe_id: probe.id.clone(),
            monitor_id: "m1".to_string(),
            job_data: vigil::model::CheckJob::from_monitor(&test_monitor("m1", Some(now))),
            status: PendingJobStatus::Pending,
            expires_at: now - Duration::minutes(1),
            created_at: now - Duration::minutes(6),
        })
        .await
        .unwrap();

    let reaped = rig.store_dyn.reap_expired_pending_jobs(now).await.unwrap();
    assert_eq!(reaped, 1);

    let jobs = service.poll_jobs("tok", Some(10), now).await.unwrap();
    assert!(jobs.is_empty());
}
