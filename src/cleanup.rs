//! Retention cleanup
//!
//! Deletes raw check results, heartbeat pings, audit logs, and expired
//! subscriber verification tokens beyond their configured retention.
//! Rollups are the durable history and are never touched here.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::queue::{Job, JobHandler};
use crate::storage::Store;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub results_days: u32,
    pub heartbeats_days: u32,
    pub audit_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            results_days: 30,
            heartbeats_days: 90,
            audit_days: 365,
        }
    }
}

pub struct CleanupTask {
    store: Arc<dyn Store>,
    retention: RetentionConfig,
}

impl CleanupTask {
    pub fn new(store: Arc<dyn Store>, retention: RetentionConfig) -> Arc<Self> {
        Arc::new(Self { store, retention })
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let now = Utc::now();

        let results = self
            .store
            .delete_results_before(now - Duration::days(self.retention.results_days as i64))
            .await?;
        let heartbeats = self
            .store
            .delete_heartbeats_before(now - Duration::days(self.retention.heartbeats_days as i64))
            .await?;
        let audit = self
            .store
            .delete_audit_logs_before(now - Duration::days(self.retention.audit_days as i64))
            .await?;
        let tokens = self.store.delete_expired_subscriber_tokens(now).await?;

        info!(
            "retention pass: {results} result(s), {heartbeats} heartbeat(s), \
             {audit} audit row(s), {tokens} expired token(s)"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for CleanupTask {
    async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
        self.run().await
    }
}
