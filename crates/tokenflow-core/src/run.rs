//! Runtime identities: tokens, step runs, leases.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type ExecutionId = Uuid;
pub type TokenId = Uuid;
pub type StepRunId = Uuid;

/// A unit of control flow: "step X may run with payload Y".
///
/// Tokens carry no business data beyond `args`; everything else a step needs
/// comes from `workload` and `ctx` at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub token_id: TokenId,
    pub execution_id: ExecutionId,
    pub target_step: String,
    /// Payload merged from the firing arc's `args`; always an object.
    #[serde(default)]
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Step run whose arc evaluation produced this token, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_step_run_id: Option<StepRunId>,
}

impl Token {
    pub fn new(execution_id: ExecutionId, target_step: impl Into<String>, args: Value) -> Self {
        Self {
            token_id: Uuid::new_v4(),
            execution_id,
            target_step: target_step.into(),
            args,
            trace_id: None,
            parent_step_run_id: None,
        }
    }

    pub fn with_parent(mut self, parent: StepRunId) -> Self {
        self.parent_step_run_id = Some(parent);
        self
    }
}

/// Single-owner execution claim over a step run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    /// TTL granted at claim and on each renewal, in seconds.
    pub ttl_secs: u64,
}

impl Lease {
    pub fn grant(owner: impl Into<String>, ttl_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            expires_at: now + Duration::seconds(ttl_secs as i64),
            ttl_secs,
        }
    }

    pub fn renew(&mut self, now: DateTime<Utc>) {
        self.expires_at = now + Duration::seconds(self.ttl_secs as i64);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lifecycle of a step run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Scheduled,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Running => "RUNNING",
            RunStatus::Done => "DONE",
            RunStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }
}

/// One consumption of a token: a step bound to a worker under a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub step_run_id: StepRunId,
    pub execution_id: ExecutionId,
    pub step_name: String,
    pub token: Token,
    pub status: RunStatus,
    /// Scheduler-level attempt, bumped when a lease expires and the run is
    /// re-dispatched. Distinct from per-task retry attempts inside a
    /// pipeline.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl StepRun {
    pub fn new(token: Token) -> Self {
        Self {
            step_run_id: Uuid::new_v4(),
            execution_id: token.execution_id,
            step_name: token.target_step.clone(),
            token,
            status: RunStatus::Scheduled,
            attempt: 1,
            lease: None,
        }
    }
}
