//! End-to-end alert lifecycle: fire, coalesce, recover, cooldown

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use vigil::model::{AlertConditions, AlertStatus, ChannelType, CheckStatus, FailureWindow};
use vigil::storage::Store;

use crate::helpers::*;

async fn seed_consecutive_failure_policy(rig: &TestRig) {
    rig.store
        .insert_monitor(&test_monitor("m1", Some(Utc::now())))
        .await
        .unwrap();
    rig.store
        .insert_channel(&test_channel("c1", ChannelType::Slack))
        .await
        .unwrap();
    rig.store
        .insert_policy(&test_policy(
            "p1",
            vec!["c1".to_string()],
            AlertConditions {
                consecutive_failures: Some(3),
                consecutive_successes: Some(2),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    rig.store.link_policy("m1", "p1").await.unwrap();
}

#[tokio::test]
async fn test_consecutive_failures_fire_once() {
    let rig = rig().await;
    seed_consecutive_failure_policy(&rig).await;
    let t = Utc::now();

    // two failures: below the threshold, nothing fires
    submit_and_evaluate(&rig, "m1", CheckStatus::Failure, t).await;
    submit_and_evaluate(&rig, "m1", CheckStatus::Failure, t + Duration::seconds(30)).await;
    assert!(rig.store_dyn.open_alert("p1", "m1").await.unwrap().is_none());

    // third failure fires exactly one alert with one notification
    submit_and_evaluate(&rig, "m1", CheckStatus::Failure, t + Duration::seconds(60)).await;
    settle().await;

    let alert = rig.store_dyn.open_alert("p1", "m1").await.unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Triggered);
    assert_eq!(alert.metadata.failure_count, 1);
    assert_eq!(alert.metadata.failure_timestamps.len(), 1);
    assert_eq!(rig.notifications.count().await, 1);

    let ids = rig.notifications.job_ids().await;
    assert_eq!(ids[0], format!("alert-{}-c1", alert.id));
}

#[tokio::test]
async fn test_continuing_failures_coalesce_without_renotifying() {
    let rig = rig().await;
    seed_consecutive_failure_policy(&rig).await;
    let t = Utc::now();

    for offset in [0, 30, 60, 90, 120] {
        submit_and_evaluate(&rig, "m1", CheckStatus::Failure, t + Duration::seconds(offset))
            .await;
    }
    settle().await;

    let alert = rig.store_dyn.open_alert("p1", "m1").await.unwrap().unwrap();
    // fired at the third failure, coalesced the fourth and fifth
    assert_eq!(alert.metadata.failure_count, 3);
    assert_eq!(alert.metadata.failure_timestamps.len(), 3);
    assert_eq!(rig.notifications.count().await, 1);
}

#[tokio::test]
async fn test_recovery_after_consecutive_successes() {
    let rig = rig().await;
    seed_consecutive_failure_policy(&rig).await;
    let t = Utc::now();

    for offset in [0, 30, 60] {
        submit_and_evaluate(&rig, "m1", CheckStatus::Failure, t + Duration::seconds(offset))
            .await;
    }

    // one success is not enough with consecutive_successes = 2
    submit_and_evaluate(&rig, "m1", CheckStatus::Success, t + Duration::seconds(150)).await;
    assert!(rig.store_dyn.open_alert("p1", "m1").await.unwrap().is_some());

    submit_and_evaluate(&rig, "m1", CheckStatus::Success, t + Duration::seconds(180)).await;
    settle().await;

    assert!(rig.store_dyn.open_alert("p1", "m1").await.unwrap().is_none());
    let resolved_at = rig.store_dyn.last_resolved_at("p1", "m1").await.unwrap();
    assert_eq!(resolved_at, Some(t + Duration::seconds(180)));

    // fire notification + recovery notification
    assert_eq!(rig.notifications.count().await, 2);
    let ids = rig.notifications.job_ids().await;
    assert!(ids.iter().any(|id| id.starts_with("recovery-")));
}

#[tokio::test]
async fn test_cooldown_measured_from_resolution() {
    let rig = rig().await;
    seed_consecutive_failure_policy(&rig).await;
    let t = Utc::now();

    // fire and resolve
    for offset in [0, 30, 60] {
        submit_and_evaluate(&rig, "m1", CheckStatus::Failure, t + Duration::seconds(offset))
            .await;
    }
    submit_and_evaluate(&rig, "m1", CheckStatus::Success, t + Duration::seconds(150)).await;
    submit_and_evaluate(&rig, "m1", CheckStatus::Success, t + Duration::seconds(180)).await;

    // three fresh failures inside the 10-minute cooldown: no new alert
    for offset in [300, 330, 360] {
        submit_and_evaluate(&rig, "m1", CheckStatus::Failure, t + Duration::seconds(offset))
            .await;
    }
    assert!(rig.store_dyn.open_alert("p1", "m1").await.unwrap().is_none());

    // the same condition after the cooldown fires again
    let after = t + Duration::seconds(180) + Duration::minutes(11);
    for offset in [0, 30, 60] {
        submit_and_evaluate(&rig, "m1", CheckStatus::Failure, after + Duration::seconds(offset))
            .await;
    }
    assert!(rig.store_dyn.open_alert("p1", "m1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_failures_in_window_condition() {
    let rig = rig().await;
    rig.store
        .insert_monitor(&test_monitor("m2", Some(Utc::now())))
        .await
        .unwrap();
    rig.store
        .insert_channel(&test_channel("c1", ChannelType::Slack))
        .await
        .unwrap();
    rig.store
        .insert_policy(&test_policy(
            "p2",
            vec!["c1".to_string()],
            AlertConditions {
                failures_in_window: Some(FailureWindow {
                    count: 3,
                    window_minutes: 10,
                }),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    rig.store.link_policy("m2", "p2").await.unwrap();

    let t = Utc::now();
    // interleaved successes do not reset a windowed count
    submit_and_evaluate(&rig, "m2", CheckStatus::Failure, t).await;
    submit_and_evaluate(&rig, "m2", CheckStatus::Success, t + Duration::minutes(1)).await;
    submit_and_evaluate(&rig, "m2", CheckStatus::Failure, t + Duration::minutes(2)).await;
    assert!(rig.store_dyn.open_alert("p2", "m2").await.unwrap().is_none());

    submit_and_evaluate(&rig, "m2", CheckStatus::Failure, t + Duration::minutes(3)).await;
    assert!(rig.store_dyn.open_alert("p2", "m2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_org_wide_policy_applies_without_links() {
    let rig = rig().await;
    rig.store
        .insert_monitor(&test_monitor("m3", Some(Utc::now())))
        .await
        .unwrap();
    rig.store
        .insert_channel(&test_channel("c1", ChannelType::Slack))
        .await
        .unwrap();
    // no link rows at all: applies to every monitor in the org
    rig.store
        .insert_policy(&test_policy(
            "p-global",
            vec!["c1".to_string()],
            AlertConditions {
                consecutive_failures: Some(1),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    submit_and_evaluate(&rig, "m3", CheckStatus::Failure, Utc::now()).await;
    assert!(
        rig.store_dyn
            .open_alert("p-global", "m3")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_linked_policy_is_monitor_scoped() {
    let rig = rig().await;
    rig.store
        .insert_monitor(&test_monitor("m4", Some(Utc::now())))
        .await
        .unwrap();
    rig.store
        .insert_monitor(&test_monitor("m5", Some(Utc::now())))
        .await
        .unwrap();
    rig.store
        .insert_policy(&test_policy(
            "p-linked",
            vec![],
            AlertConditions {
                consecutive_failures: Some(1),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    // any link row scopes the policy to its monitors
    rig.store.link_policy("m4", "p-linked").await.unwrap();

    submit_and_evaluate(&rig, "m5", CheckStatus::Failure, Utc::now()).await;
    assert!(
        rig.store_dyn
            .open_alert("p-linked", "m5")
            .await
            .unwrap()
            .is_none()
    );

    submit_and_evaluate(&rig, "m4", CheckStatus::Failure, Utc::now()).await;
    assert!(
        rig.store_dyn
            .open_alert("p-linked", "m4")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_ingest_links_failures_to_open_incident() {
    let rig = rig().await;
    rig.store
        .insert_monitor(&test_monitor("m1", Some(Utc::now())))
        .await
        .unwrap();
    rig.store
        .insert_incident(&vigil::model::Incident {
            id: "inc-1".to_string(),
            org_id: "org-1".to_string(),
            title: "api outage".to_string(),
            severity: vigil::model::IncidentSeverity::Major,
            status: vigil::model::IncidentStatus::Investigating,
            started_at: Utc::now() - Duration::minutes(10),
            resolved_at: None,
            affected_monitors: vec!["m1".to_string()],
        })
        .await
        .unwrap();

    let result = result_at("m1", CheckStatus::Failure, Utc::now());
    rig.ingest.ingest("org-1", &result).await.unwrap();

    // persisted, status mapped, and linked to the open incident
    let latest = rig.store_dyn.latest_result("m1").await.unwrap().unwrap();
    assert_eq!(latest.id, result.id);

    let monitor = rig.store_dyn.get_monitor("m1").await.unwrap().unwrap();
    assert_eq!(monitor.status, vigil::model::MonitorStatus::Down);

    let incident = rig
        .store_dyn
        .active_incident_for_monitor("m1")
        .await
        .unwrap();
    assert_eq!(incident.unwrap().id, "inc-1");
}

#[tokio::test]
async fn test_open_alert_uniqueness_under_duplicate_inserts() {
    let rig = rig().await;
    seed_consecutive_failure_policy(&rig).await;

    let template = vigil::model::AlertHistory {
        id: id(),
        org_id: "org-1".to_string(),
        monitor_id: "m1".to_string(),
        policy_id: "p1".to_string(),
        status: AlertStatus::Triggered,
        triggered_at: Utc::now(),
        resolved_at: None,
        resolved_by: None,
        metadata: Default::default(),
    };

    assert!(rig.store_dyn.try_insert_open_alert(&template).await.unwrap());

    // a second open row for the same (policy, monitor) is rejected
    let duplicate = vigil::model::AlertHistory {
        id: id(),
        ..template
    };
    assert!(!rig.store_dyn.try_insert_open_alert(&duplicate).await.unwrap());
}
