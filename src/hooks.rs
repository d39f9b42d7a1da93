//! Capability registration for optional enterprise modules
//!
//! Escalation scheduling and on-call resolution ship outside the core.
//! Optional packages register implementations at boot; the core invokes
//! them when present and logs at info when absent, continuing either way.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::model::{AlertHistory, AlertPolicy};

/// Schedules escalation steps for a fired alert
#[async_trait]
pub trait EscalationScheduler: Send + Sync {
    async fn schedule(&self, alert: &AlertHistory, policy: &AlertPolicy) -> anyhow::Result<()>;
}

/// Resolves an on-call rotation to the currently on-call user's email
#[async_trait]
pub trait OncallResolver: Send + Sync {
    async fn current_oncall_email(&self, rotation_id: &str) -> anyhow::Result<Option<String>>;
}

/// Registry the core consults for optional capabilities
#[derive(Default)]
pub struct Capabilities {
    escalation: RwLock<Option<Arc<dyn EscalationScheduler>>>,
    oncall: RwLock<Option<Arc<dyn OncallResolver>>>,
}

impl Capabilities {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register_escalation_scheduler(&self, scheduler: Arc<dyn EscalationScheduler>) {
        *self.escalation.write().await = Some(scheduler);
        info!("escalation scheduler registered");
    }

    pub async fn register_oncall_resolver(&self, resolver: Arc<dyn OncallResolver>) {
        *self.oncall.write().await = Some(resolver);
        info!("on-call resolver registered");
    }

    pub async fn escalation_scheduler(&self) -> Option<Arc<dyn EscalationScheduler>> {
        let scheduler = self.escalation.read().await.clone();
        if scheduler.is_none() {
            info!("no escalation scheduler registered, skipping");
        }
        scheduler
    }

    pub async fn oncall_resolver(&self) -> Option<Arc<dyn OncallResolver>> {
        let resolver = self.oncall.read().await.clone();
        if resolver.is_none() {
            info!("no on-call resolver registered, skipping");
        }
        resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOncall;

    #[async_trait]
    impl OncallResolver for FixedOncall {
        async fn current_oncall_email(&self, _rotation_id: &str) -> anyhow::Result<Option<String>> {
            Ok(Some("oncall@example.com".to_string()))
        }
    }

    #[tokio::test]
    async fn test_missing_capability_is_none() {
        let caps = Capabilities::new();
        assert!(caps.oncall_resolver().await.is_none());
        assert!(caps.escalation_scheduler().await.is_none());
    }

    #[tokio::test]
    async fn test_registered_capability_resolves() {
        let caps = Capabilities::new();
        caps.register_oncall_resolver(Arc::new(FixedOncall)).await;

        let resolver = caps.oncall_resolver().await.unwrap();
        let email = resolver.current_oncall_email("rot-1").await.unwrap();
        assert_eq!(email.as_deref(), Some("oncall@example.com"));
    }
}
