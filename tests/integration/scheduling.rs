//! Scheduler behaviour: due selection, fences, maintenance suppression,
//! probe dispatch

use std::sync::Arc;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use tokio::sync::watch;

use vigil::model::{
    MaintenanceWindow, NotifyPolicy, PendingJobStatus, Probe, ProbeAssignment, ProbeMetrics,
    ProbeStatus, SentMarkers,
};
use vigil::scheduler::{Scheduler, SchedulerConfig};
use vigil::storage::Store;

use crate::helpers::*;

async fn scheduler_for(rig: &TestRig) -> Scheduler {
    let (_tx, rx) = watch::channel(false);
    Scheduler::new(
        rig.store_dyn.clone(),
        rig.queues.clone(),
        SchedulerConfig::default(),
        rx,
    )
}

#[tokio::test]
async fn test_due_monitor_is_enqueued_and_fence_advances() {
    let rig = rig().await;
    let recorder = Arc::new(RecordingHandler::default());
    rig.queues.bind_worker("check:http", 4, recorder.clone()).await;

    let now = Utc::now();
    rig.store
        .insert_monitor(&test_monitor("m1", Some(now - Duration::seconds(5))))
        .await
        .unwrap();

    scheduler_for(&rig).await.poll_tick(now).await.unwrap();
    settle().await;

    assert_eq!(recorder.count().await, 1);
    let ids = recorder.job_ids().await;
    assert_eq!(ids[0], format!("m1-{}", now.timestamp_millis()));

    let monitor = rig.store_dyn.get_monitor("m1").await.unwrap().unwrap();
    assert_eq!(monitor.next_check_at, Some(now + Duration::seconds(60)));
    assert_eq!(monitor.last_checked_at, Some(now));

    // the advanced fence makes a second tick a no-op
    scheduler_for(&rig).await.poll_tick(now).await.unwrap();
    settle().await;
    assert_eq!(recorder.count().await, 1);
}

#[tokio::test]
async fn test_paused_monitor_is_never_enqueued() {
    let rig = rig().await;
    let recorder = Arc::new(RecordingHandler::default());
    rig.queues.bind_worker("check:http", 4, recorder.clone()).await;

    let now = Utc::now();
    let mut monitor = test_monitor("m1", Some(now - Duration::seconds(5)));
    monitor.paused = true;
    rig.store.insert_monitor(&monitor).await.unwrap();

    scheduler_for(&rig).await.poll_tick(now).await.unwrap();
    settle().await;

    assert_eq!(recorder.count().await, 0);
}

#[tokio::test]
async fn test_maintenance_window_suppresses_without_advancing() {
    let rig = rig().await;
    let recorder = Arc::new(RecordingHandler::default());
    rig.queues.bind_worker("check:http", 4, recorder.clone()).await;

    let now = Utc::now();
    let due_at = now - Duration::seconds(30);
    rig.store
        .insert_monitor(&test_monitor("m1", Some(due_at)))
        .await
        .unwrap();
    rig.store
        .insert_maintenance_window(&MaintenanceWindow {
            id: id(),
            org_id: "org-1".to_string(),
            name: "db upgrade".to_string(),
            starts_at: now - Duration::minutes(5),
            ends_at: now + Duration::minutes(10),
            affected_monitors: vec!["m1".to_string()],
            notify_subscribers: NotifyPolicy::default(),
            notifications_sent: SentMarkers::default(),
        })
        .await
        .unwrap();

    scheduler_for(&rig).await.poll_tick(now).await.unwrap();
    settle().await;

    assert_eq!(recorder.count().await, 0);
    // suppression must not advance the fence
    let monitor = rig.store_dyn.get_monitor("m1").await.unwrap().unwrap();
    assert_eq!(monitor.next_check_at, Some(due_at));
}

#[tokio::test]
async fn test_assigned_monitor_parks_probe_jobs_instead_of_queueing() {
    let rig = rig().await;
    let recorder = Arc::new(RecordingHandler::default());
    rig.queues.bind_worker("check:http", 4, recorder.clone()).await;

    let now = Utc::now();
    rig.store
        .insert_monitor(&test_monitor("m1", Some(now - Duration::seconds(5))))
        .await
        .unwrap();
    rig.store_dyn
        .insert_probe(&Probe {
            id: "probe-1".to_string(),
            org_id: "org-1".to_string(),
            name: "edge".to_string(),
            region: "us-east".to_string(),
            token_hash: "hash".to_string(),
            status: ProbeStatus::Active,
            last_heartbeat_at: Some(now),
            metrics: ProbeMetrics::default(),
        })
        .await
        .unwrap();
    rig.store
        .insert_assignment(&ProbeAssignment {
            probe_id: "probe-1".to_string(),
            monitor_id: "m1".to_string(),
            priority: 0,
            exclusive: false,
        })
        .await
        .unwrap();

    scheduler_for(&rig).await.poll_tick(now).await.unwrap();
    settle().await;

    // nothing on the protocol queue; one parked probe job instead
    assert_eq!(recorder.count().await, 0);
    let jobs = rig
        .store_dyn
        .claim_pending_jobs("probe-1", 10, now)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].monitor_id, "m1");
    assert_eq!(jobs[0].status, PendingJobStatus::Claimed);

    // fence still advanced
    let monitor = rig.store_dyn.get_monitor("m1").await.unwrap().unwrap();
    assert_eq!(monitor.next_check_at, Some(now + Duration::seconds(60)));
}

#[tokio::test]
async fn test_offline_assignees_skip_dispatch_but_advance() {
    let rig = rig().await;

    let now = Utc::now();
    rig.store
        .insert_monitor(&test_monitor("m1", Some(now - Duration::seconds(5))))
        .await
        .unwrap();
    rig.store_dyn
        .insert_probe(&Probe {
            id: "probe-1".to_string(),
            org_id: "org-1".to_string(),
            name: "edge".to_string(),
            region: "us-east".to_string(),
            token_hash: "hash".to_string(),
            status: ProbeStatus::Offline,
            last_heartbeat_at: Some(now - Duration::minutes(10)),
            metrics: ProbeMetrics::default(),
        })
        .await
        .unwrap();
    rig.store
        .insert_assignment(&ProbeAssignment {
            probe_id: "probe-1".to_string(),
            monitor_id: "m1".to_string(),
            priority: 0,
            exclusive: false,
        })
        .await
        .unwrap();

    scheduler_for(&rig).await.poll_tick(now).await.unwrap();

    let jobs = rig
        .store_dyn
        .claim_pending_jobs("probe-1", 10, now)
        .await
        .unwrap();
    assert!(jobs.is_empty());

    let monitor = rig.store_dyn.get_monitor("m1").await.unwrap().unwrap();
    assert_eq!(monitor.next_check_at, Some(now + Duration::seconds(60)));
}

#[tokio::test]
async fn test_stale_probes_go_offline() {
    let rig = rig().await;
    let now = Utc::now();

    rig.store_dyn
        .insert_probe(&Probe {
            id: "probe-1".to_string(),
            org_id: "org-1".to_string(),
            name: "edge".to_string(),
            region: "us-east".to_string(),
            token_hash: "hash-1".to_string(),
            status: ProbeStatus::Active,
            last_heartbeat_at: Some(now - Duration::minutes(5)),
            metrics: ProbeMetrics::default(),
        })
        .await
        .unwrap();

    let flipped = rig
        .store_dyn
        .mark_stale_probes_offline(now - Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(flipped, 1);

    let probes = rig
        .store_dyn
        .get_probes(&["probe-1".to_string()])
        .await
        .unwrap();
    assert_eq!(probes[0].status, ProbeStatus::Offline);
}
