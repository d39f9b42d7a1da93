//! Per-topic real-time event bus
//!
//! The core only publishes; the API layer subscribes and forwards to
//! websockets/SSE. Topics are created lazily and events are plain JSON-ish
//! maps so consumers tolerate additional fields.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::trace;

/// Capacity per topic; slow subscribers lag and drop, which is acceptable
/// for live-update streams
const TOPIC_CAPACITY: usize = 256;

/// One published event
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// Topic name for a monitor's live stream
pub fn monitor_topic(monitor_id: &str) -> String {
    format!("monitor:{monitor_id}")
}

/// Topic name for an organization's live stream
pub fn org_topic(org_id: &str) -> String {
    format!("org:{org_id}")
}

/// Publish/subscribe hub keyed by topic
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event; a topic with no subscribers drops it silently
    pub async fn publish(&self, topic: &str, event: Event) {
        let sender = {
            let topics = self.topics.read().await;
            topics.get(topic).cloned()
        };

        if let Some(sender) = sender {
            trace!("publishing {} on {topic}", event.event_type);
            let _ = sender.send(event);
        }
    }

    /// Subscribe to a topic, creating it if needed
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Event> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }
}
