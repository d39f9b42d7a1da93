//! Shared fixtures for the integration suite

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use vigil::alert::AlertEvaluator;
use vigil::bus::EventBus;
use vigil::credentials::PlainCipher;
use vigil::hooks::Capabilities;
use vigil::ingest::ResultIngest;
use vigil::model::{
    AlertChannel, AlertConditions, AlertPolicy, Assertions, ChannelType, CheckResult, CheckStatus,
    Monitor, MonitorStatus, MonitorType, new_id,
};
use vigil::notify::NotificationDispatcher;
use vigil::queue::{Job, JobHandler, QueueRegistry};
use vigil::storage::{SqliteStore, Store};

/// Records every job delivered to the queues it is bound to
#[derive(Default)]
pub struct RecordingHandler {
    pub jobs: Mutex<Vec<Job>>,
}

#[async_trait::async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        self.jobs.lock().await.push(job.clone());
        Ok(())
    }
}

impl RecordingHandler {
    pub async fn count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn job_ids(&self) -> Vec<String> {
        self.jobs.lock().await.iter().map(|j| j.id.clone()).collect()
    }
}

/// Fully-wired pipeline against an in-memory store, with a recorder bound
/// to every notification queue
pub struct TestRig {
    pub store: Arc<SqliteStore>,
    pub store_dyn: Arc<dyn Store>,
    pub queues: Arc<QueueRegistry>,
    pub bus: EventBus,
    pub evaluator: Arc<AlertEvaluator>,
    pub ingest: Arc<ResultIngest>,
    pub notifications: Arc<RecordingHandler>,
}

pub async fn rig() -> TestRig {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let store_dyn: Arc<dyn Store> = store.clone();
    let queues = QueueRegistry::new();
    let bus = EventBus::new();
    let capabilities = Capabilities::new();

    let dispatcher = Arc::new(NotificationDispatcher::new(
        store_dyn.clone(),
        queues.clone(),
        Arc::new(PlainCipher),
        capabilities.clone(),
        "http://dash.test".to_string(),
    ));
    let evaluator = Arc::new(AlertEvaluator::new(
        store_dyn.clone(),
        bus.clone(),
        dispatcher,
        capabilities,
    ));
    let ingest = Arc::new(ResultIngest::new(
        store_dyn.clone(),
        bus.clone(),
        evaluator.clone(),
    ));

    let notifications = Arc::new(RecordingHandler::default());
    for channel_type in [
        ChannelType::Email,
        ChannelType::Slack,
        ChannelType::Webhook,
        ChannelType::Sms,
    ] {
        queues
            .bind_worker(channel_type.queue_name(), 4, notifications.clone())
            .await;
    }

    TestRig {
        store,
        store_dyn,
        queues,
        bus,
        evaluator,
        ingest,
        notifications,
    }
}

/// Let queued jobs drain to the recorder
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}

pub fn test_monitor(id: &str, next_check_at: Option<DateTime<Utc>>) -> Monitor {
    let now = Utc::now();
    Monitor {
        id: id.to_string(),
        org_id: "org-1".to_string(),
        name: format!("monitor {id}"),
        monitor_type: MonitorType::Http,
        url: "https://example.com/health".to_string(),
        method: "GET".to_string(),
        headers: HashMap::new(),
        body: None,
        interval_seconds: 60,
        timeout_ms: 5_000,
        degraded_threshold_ms: None,
        assertions: Assertions::default(),
        config: serde_json::Value::Null,
        regions: vec!["uk".to_string()],
        paused: false,
        status: MonitorStatus::Pending,
        last_checked_at: None,
        next_check_at,
        created_at: now,
        updated_at: now,
    }
}

pub fn test_policy(id: &str, channels: Vec<String>, conditions: AlertConditions) -> AlertPolicy {
    AlertPolicy {
        id: id.to_string(),
        org_id: "org-1".to_string(),
        name: format!("policy {id}"),
        enabled: true,
        conditions,
        channels,
        cooldown_minutes: 10,
        escalation_policy_id: None,
        oncall_rotation_id: None,
    }
}

pub fn test_channel(id: &str, channel_type: ChannelType) -> AlertChannel {
    AlertChannel {
        id: id.to_string(),
        org_id: "org-1".to_string(),
        channel_type,
        config: serde_json::json!({"url": "http://chat.test/hook"}),
        enabled: true,
    }
}

/// A check result with an explicit creation time
pub fn result_at(
    monitor_id: &str,
    status: CheckStatus,
    created_at: DateTime<Utc>,
) -> CheckResult {
    let mut result = CheckResult::new(monitor_id, "uk", status);
    result.created_at = created_at;
    result.response_time_ms = Some(120);
    if status.is_failure() {
        result.error_message = Some("connection refused".to_string());
    }
    result
}

/// Insert a result row and evaluate it at the same instant
pub async fn submit_and_evaluate(
    rig: &TestRig,
    monitor_id: &str,
    status: CheckStatus,
    at: DateTime<Utc>,
) {
    let result = result_at(monitor_id, status, at);
    rig.store_dyn.insert_check_result(&result).await.unwrap();

    let evaluation = vigil::alert::Evaluation {
        monitor_id: monitor_id.to_string(),
        org_id: "org-1".to_string(),
        check_result_id: result.id.clone(),
        status,
        error_message: result.error_message.clone(),
        response_time_ms: result.response_time_ms,
        status_code: None,
    };
    rig.evaluator.evaluate(&evaluation, at).await.unwrap();
}

pub fn id() -> String {
    new_id()
}
