//! Engine configuration.

use std::time::Duration;
use anyhow::Result;

/// Scheduler and log configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease TTL granted on claim and on each heartbeat renewal.
    pub lease_ttl: Duration,

    /// Expected heartbeat interval; workers renew at this cadence.
    pub heartbeat_interval: Duration,

    /// Payloads larger than this many bytes are externalized to the blob
    /// store and replaced with a reference in event data.
    pub externalize_threshold: usize,

    /// Name of the blob store references point at.
    pub reference_store: String,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let lease_secs: u64 = std::env::var("TOKENFLOW_LEASE_TTL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let heartbeat_secs: u64 = std::env::var("TOKENFLOW_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        let externalize_threshold: usize = std::env::var("TOKENFLOW_EXTERNALIZE_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(64 * 1024);

        let reference_store = std::env::var("TOKENFLOW_REFERENCE_STORE")
            .unwrap_or_else(|_| "blob".to_string());

        Ok(Self {
            lease_ttl: Duration::from_secs(lease_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            externalize_threshold,
            reference_store,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            externalize_threshold: 64 * 1024,
            reference_store: "blob".to_string(),
        }
    }
}
