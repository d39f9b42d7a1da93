//! Hub configuration
//!
//! A JSON config file plus a handful of environment variables
//! (`MONITOR_DEFAULT_REGION`, platform sender credentials). `validate()`
//! rejects out-of-range values before any subsystem starts.

use std::path::PathBuf;

use tracing::trace;

use crate::cleanup::RetentionConfig;
use crate::notify::PlatformSenders;

/// Default region stamped on hub-executed checks
pub const DEFAULT_REGION: &str = "uk";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct HubConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Region for checks executed by this hub worker
    #[serde(default)]
    pub region: Option<String>,

    /// Base URL used in notification deep links
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,

    /// Main scheduler poll cadence in seconds
    #[serde(default = "default_poll_seconds")]
    pub poll_interval_seconds: u64,

    /// Bind address for the probe wire API; None disables it
    #[serde(default)]
    pub probe_api_bind: Option<String>,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Platform fallback senders (SMTP / hosted email / SMS gateway)
    #[serde(default)]
    pub senders: PlatformSenders,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./vigil.db")
}

fn default_dashboard_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_poll_seconds() -> u64 {
    10
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            region: None,
            dashboard_url: default_dashboard_url(),
            poll_interval_seconds: default_poll_seconds(),
            probe_api_bind: None,
            retention: RetentionConfig::default(),
            senders: PlatformSenders::default(),
        }
    }
}

impl HubConfig {
    /// Effective region: config wins, then `MONITOR_DEFAULT_REGION`, then
    /// the built-in default
    pub fn effective_region(&self) -> String {
        self.region
            .clone()
            .or_else(|| std::env::var("MONITOR_DEFAULT_REGION").ok())
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    /// Merge platform sender credentials from the environment when the
    /// config file leaves them unset
    pub fn merge_env_senders(&mut self) {
        if self.senders.resend_api_key.is_none() {
            self.senders.resend_api_key = std::env::var("RESEND_API_KEY").ok();
        }
        if self.senders.twilio_account_sid.is_none() {
            self.senders.twilio_account_sid = std::env::var("TWILIO_ACCOUNT_SID").ok();
        }
        if self.senders.twilio_auth_token.is_none() {
            self.senders.twilio_auth_token = std::env::var("TWILIO_AUTH_TOKEN").ok();
        }
        if self.senders.twilio_from.is_none() {
            self.senders.twilio_from = std::env::var("TWILIO_FROM").ok();
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_seconds == 0 {
            return Err("poll_interval_seconds must be at least 1".to_string());
        }
        if self.poll_interval_seconds > 3600 {
            return Err("poll_interval_seconds cannot exceed 3600".to_string());
        }
        if self.retention.results_days == 0 {
            return Err("retention.results_days must be at least 1".to_string());
        }
        if self.dashboard_url.is_empty() {
            return Err("dashboard_url must not be empty".to_string());
        }
        Ok(())
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<HubConfig> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("invalid configuration file: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
