//! Maintenance-window subscriber notifications: once-only slots end to end

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use vigil::maintenance::notice_tick;
use vigil::model::{
    MaintenanceWindow, NotifyPolicy, SentMarkers, StatusPage, Subscriber,
};
use vigil::storage::{NotifySlot, Store};

use crate::helpers::*;

async fn seed(rig: &TestRig, window: &MaintenanceWindow) {
    rig.store
        .insert_monitor(&test_monitor("m1", None))
        .await
        .unwrap();
    rig.store.insert_maintenance_window(window).await.unwrap();
    rig.store
        .insert_status_page(&StatusPage {
            id: "page-1".to_string(),
            org_id: "org-1".to_string(),
            name: "public status".to_string(),
            monitors: vec!["m1".to_string()],
            public: true,
        })
        .await
        .unwrap();
    for (id, verified) in [("sub-1", true), ("sub-2", true), ("sub-3", false)] {
        rig.store
            .insert_subscriber(&Subscriber {
                id: id.to_string(),
                page_id: "page-1".to_string(),
                email: format!("{id}@example.com"),
                verified,
                token: None,
                token_expires_at: None,
                email_enabled: true,
            })
            .await
            .unwrap();
    }
}

fn started_window() -> MaintenanceWindow {
    let now = Utc::now();
    MaintenanceWindow {
        id: "w1".to_string(),
        org_id: "org-1".to_string(),
        name: "db upgrade".to_string(),
        starts_at: now - Duration::minutes(1),
        ends_at: now + Duration::minutes(30),
        affected_monitors: vec!["m1".to_string()],
        notify_subscribers: NotifyPolicy {
            before_start_minutes: None,
            on_start: true,
            on_end: true,
        },
        notifications_sent: SentMarkers::default(),
    }
}

#[tokio::test]
async fn test_on_start_notifies_each_verified_subscriber_once() {
    let rig = rig().await;
    seed(&rig, &started_window()).await;

    let now = Utc::now();
    notice_tick(&rig.store_dyn, &rig.queues, now).await.unwrap();
    settle().await;

    // two verified subscribers, the unverified one is skipped
    assert_eq!(rig.notifications.count().await, 2);
    let ids = rig.notifications.job_ids().await;
    assert!(ids.iter().all(|id| id.starts_with("maintenance-w1-start-")));

    // a second tick resends nothing: the durable marker is set
    notice_tick(&rig.store_dyn, &rig.queues, now).await.unwrap();
    settle().await;
    assert_eq!(rig.notifications.count().await, 2);
}

#[tokio::test]
async fn test_mark_is_claimed_exactly_once() {
    let rig = rig().await;
    seed(&rig, &started_window()).await;
    let now = Utc::now();

    let first = rig
        .store_dyn
        .mark_window_notified("w1", NotifySlot::OnStart, now)
        .await
        .unwrap();
    let second = rig
        .store_dyn
        .mark_window_notified("w1", NotifySlot::OnStart, now)
        .await
        .unwrap();
    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn test_on_end_fires_after_window() {
    let rig = rig().await;
    let mut window = started_window();
    window.starts_at = Utc::now() - Duration::hours(2);
    window.ends_at = Utc::now() - Duration::minutes(5);
    // the start slot was already sent while the window ran
    window.notifications_sent.on_start_at = Some(window.starts_at);
    seed(&rig, &window).await;

    notice_tick(&rig.store_dyn, &rig.queues, Utc::now())
        .await
        .unwrap();
    settle().await;

    let ids = rig.notifications.job_ids().await;
    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| id.starts_with("maintenance-w1-end-")));
}
