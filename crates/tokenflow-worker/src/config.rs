//! Worker configuration.

use std::time::Duration;
use anyhow::Result;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier; the lease owner string.
    pub worker_id: String,

    /// Worker pool name, for log attribution.
    pub pool_name: String,

    /// Lease renewal cadence.
    pub heartbeat_interval: Duration,

    /// Maximum step runs executed concurrently.
    pub max_concurrent_runs: usize,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker_id = std::env::var("TOKENFLOW_WORKER_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let pool_name = std::env::var("TOKENFLOW_POOL_NAME")
            .unwrap_or_else(|_| "default".to_string());

        let heartbeat_secs: u64 = std::env::var("TOKENFLOW_WORKER_HEARTBEAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        let max_concurrent: usize = std::env::var("TOKENFLOW_WORKER_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        Ok(Self {
            worker_id,
            pool_name,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_concurrent_runs: max_concurrent,
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            pool_name: "default".to_string(),
            heartbeat_interval: Duration::from_secs(15),
            max_concurrent_runs: 4,
        }
    }
}
