//! Maintenance-window subscriber notifications
//!
//! Three once-only slots per window: an advance notice, a start notice, and
//! an end notice. The durable marker is claimed *before* any job is
//! enqueued, so concurrent schedulers and restarts can never resend a slot;
//! a crash between claim and enqueue drops that slot rather than
//! duplicating it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument, warn};

use crate::model::{ChannelType, MaintenanceWindow};
use crate::queue::{JobOpts, QueueRegistry};
use crate::storage::{NotifySlot, Store};

/// One pass over windows with unsent slots
#[instrument(skip_all)]
pub async fn notice_tick(
    store: &Arc<dyn Store>,
    queues: &Arc<QueueRegistry>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let windows = store.maintenance_windows_pending_notice().await?;

    for window in windows {
        for slot in due_slots(&window, now) {
            // Claim first: the marker is the idempotence guard
            match store.mark_window_notified(&window.id, slot, now).await {
                Ok(true) => {
                    if let Err(e) = notify_subscribers(store, queues, &window, slot).await {
                        warn!(
                            "maintenance notification for window {} ({slot:?}) failed: {e:#}",
                            window.id
                        );
                    }
                }
                Ok(false) => {} // another worker claimed it
                Err(e) => warn!("failed to claim slot {slot:?} on window {}: {e}", window.id),
            }
        }
    }
    Ok(())
}

/// Slots whose time condition holds and whose marker is still unset
pub fn due_slots(window: &MaintenanceWindow, now: DateTime<Utc>) -> Vec<NotifySlot> {
    let mut slots = Vec::new();
    let sent = &window.notifications_sent;
    let policy = &window.notify_subscribers;

    if let Some(minutes) = policy.before_start_minutes {
        let notice_from = window.starts_at - Duration::minutes(minutes.max(0));
        if sent.before_start_at.is_none() && now >= notice_from && now < window.starts_at {
            slots.push(NotifySlot::BeforeStart);
        }
    }

    if policy.on_start
        && sent.on_start_at.is_none()
        && now >= window.starts_at
        && now < window.ends_at
    {
        slots.push(NotifySlot::OnStart);
    }

    if policy.on_end && sent.on_end_at.is_none() && now >= window.ends_at {
        slots.push(NotifySlot::OnEnd);
    }

    slots
}

async fn notify_subscribers(
    store: &Arc<dyn Store>,
    queues: &Arc<QueueRegistry>,
    window: &MaintenanceWindow,
    slot: NotifySlot,
) -> anyhow::Result<()> {
    let pages = store
        .pages_listing_monitors(&window.affected_monitors)
        .await?;
    if pages.is_empty() {
        debug!("window {} affects no public status page", window.id);
        return Ok(());
    }

    let page_ids: Vec<String> = pages.iter().map(|page| page.id.clone()).collect();
    let subscribers = store.verified_subscribers(&page_ids).await?;

    let (subject, body) = render(window, slot);
    let mut enqueued = 0usize;

    for subscriber in subscribers.iter().filter(|s| s.email_enabled) {
        let data = serde_json::json!({
            "kind": "maintenance",
            "to": subscriber.email,
            "subject": subject,
            "body": body,
            "window_id": window.id,
        });
        let job_id = format!(
            "maintenance-{}-{}-{}",
            window.id,
            slot_tag(slot),
            subscriber.id
        );
        if queues
            .add(
                ChannelType::Email.queue_name(),
                data,
                JobOpts::notification(job_id),
            )
            .await
            .is_some()
        {
            enqueued += 1;
        }
    }

    debug!(
        "window {} slot {slot:?}: {enqueued} subscriber notification(s) enqueued",
        window.id
    );
    Ok(())
}

fn slot_tag(slot: NotifySlot) -> &'static str {
    match slot {
        NotifySlot::BeforeStart => "before",
        NotifySlot::OnStart => "start",
        NotifySlot::OnEnd => "end",
    }
}

fn render(window: &MaintenanceWindow, slot: NotifySlot) -> (String, String) {
    match slot {
        NotifySlot::BeforeStart => (
            format!("Upcoming maintenance: {}", window.name),
            format!(
                "Scheduled maintenance \"{}\" starts at {} and ends at {}.",
                window.name, window.starts_at, window.ends_at
            ),
        ),
        NotifySlot::OnStart => (
            format!("Maintenance started: {}", window.name),
            format!(
                "Maintenance \"{}\" is underway until {}. Affected monitors are not being checked.",
                window.name, window.ends_at
            ),
        ),
        NotifySlot::OnEnd => (
            format!("Maintenance finished: {}", window.name),
            format!("Maintenance \"{}\" has completed.", window.name),
        ),
    }
}
