//! Remote probe protocol
//!
//! Probes are external agents running checks from other network locations.
//! The hub side (`service`, `api`) parks jobs for assigned probes, hands
//! them out on long-poll, and ingests submitted results; the agent side
//! (`agent`) heartbeats, claims, executes locally, and posts results back.

pub mod agent;
pub mod api;
pub mod service;

pub use agent::{AgentConfig, ProbeAgent};
pub use api::probe_router;
pub use service::{ProbeService, hash_token};
