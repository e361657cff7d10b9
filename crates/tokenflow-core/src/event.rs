//! Event envelope for the append-only execution log.
//!
//! Every observable state change in an execution is recorded as one of these.
//! The log is the sole source of truth: execution state is a pure fold over
//! the event sequence, and the `ctx` scope exists only as the sum of recorded
//! `ctx.patched` events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::run::ExecutionId;

/// Globally unique event identity, assigned at construction.
pub type EventId = Uuid;

/// Which plane produced the event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Control plane: scheduler, routing, lifecycle.
    Server,
    /// Data plane: pipeline and task execution.
    Worker,
}

/// Canonical event names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    PlaybookExecutionRequested,
    PlaybookRequestEvaluated,
    WorkflowStarted,
    TokenEnqueued,
    TokenClaimed,
    StepScheduled,
    StepSkipped,
    NextEvaluated,
    WorkflowFinished,
    PlaybookProcessed,
    TaskStarted,
    TaskProcessed,
    StepDone,
    StepFailed,
    LoopStarted,
    LoopIterationStarted,
    LoopIterationCompleted,
    LoopDone,
    CtxPatched,
}

impl EventName {
    /// Terminal step-run events: these feed arc evaluation and completion
    /// detection, and their application must be idempotent.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventName::StepDone | EventName::StepFailed | EventName::LoopDone
        )
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventName::PlaybookExecutionRequested => "playbook.execution_requested",
            EventName::PlaybookRequestEvaluated => "playbook.request_evaluated",
            EventName::WorkflowStarted => "workflow.started",
            EventName::TokenEnqueued => "token.enqueued",
            EventName::TokenClaimed => "token.claimed",
            EventName::StepScheduled => "step.scheduled",
            EventName::StepSkipped => "step.skipped",
            EventName::NextEvaluated => "next.evaluated",
            EventName::WorkflowFinished => "workflow.finished",
            EventName::PlaybookProcessed => "playbook.processed",
            EventName::TaskStarted => "task.started",
            EventName::TaskProcessed => "task.processed",
            EventName::StepDone => "step.done",
            EventName::StepFailed => "step.failed",
            EventName::LoopStarted => "loop.started",
            EventName::LoopIterationStarted => "loop.iteration_started",
            EventName::LoopIterationCompleted => "loop.iteration_completed",
            EventName::LoopDone => "loop.done",
            EventName::CtxPatched => "ctx.patched",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for EventName {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = match s {
            "playbook.execution_requested" => EventName::PlaybookExecutionRequested,
            "playbook.request_evaluated" => EventName::PlaybookRequestEvaluated,
            "workflow.started" => EventName::WorkflowStarted,
            "token.enqueued" => EventName::TokenEnqueued,
            "token.claimed" => EventName::TokenClaimed,
            "step.scheduled" => EventName::StepScheduled,
            "step.skipped" => EventName::StepSkipped,
            "next.evaluated" => EventName::NextEvaluated,
            "workflow.finished" => EventName::WorkflowFinished,
            "playbook.processed" => EventName::PlaybookProcessed,
            "task.started" => EventName::TaskStarted,
            "task.processed" => EventName::TaskProcessed,
            "step.done" => EventName::StepDone,
            "step.failed" => EventName::StepFailed,
            "loop.started" => EventName::LoopStarted,
            "loop.iteration_started" => EventName::LoopIterationStarted,
            "loop.iteration_completed" => EventName::LoopIterationCompleted,
            "loop.done" => EventName::LoopDone,
            "ctx.patched" => EventName::CtxPatched,
            other => {
                return Err(crate::error::EngineError::Parse(format!(
                    "unknown event name: {}",
                    other
                )))
            }
        };
        Ok(name)
    }
}

/// Status carried on the event envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Started,
    Running,
    Completed,
    Failed,
    Skipped,
    Terminated,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Started => "STARTED",
            EventStatus::Running => "RUNNING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Skipped => "SKIPPED",
            EventStatus::Terminated => "TERMINATED",
        };
        write!(f, "{}", s)
    }
}

/// The kind of entity an event is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Execution,
    Token,
    StepRun,
    Task,
    Loop,
}

/// A single log record.
///
/// `event_id` is assigned at construction and globally unique. `seq` is
/// assigned by the event log at append time and is strictly monotonic per
/// execution; a zero value means "not yet appended".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub seq: u64,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub name: EventName,
    pub entity: EntityKind,
    pub entity_id: String,
    pub status: EventStatus,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(
        execution_id: ExecutionId,
        source: EventSource,
        name: EventName,
        entity: EntityKind,
        entity_id: impl Into<String>,
        status: EventStatus,
        data: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            seq: 0,
            execution_id,
            timestamp: Utc::now(),
            source,
            name,
            entity,
            entity_id: entity_id.into(),
            status,
            data,
        }
    }

    /// Fetch a string field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Fetch an integer field from the payload.
    pub fn data_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(|v| v.as_u64())
    }
}
