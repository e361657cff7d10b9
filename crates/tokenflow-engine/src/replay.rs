//! Pure replay: fold an event sequence into execution state.
//!
//! No side effects, no clock, no I/O. The scheduler's derived state after a
//! crash is exactly `ExecutionState::from_events(log.read(id))`.

use std::collections::HashMap;

use serde_json::{json, Value};

use tokenflow_core::value::merge_patch;
use tokenflow_core::{Event, EventName, EventStatus, ExecutionId, RunStatus, StepRunId, Token, TokenId};

/// Overall execution status as derived from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Requested but no workflow.started yet.
    Initial,
    InProgress,
    Completed,
    Failed,
    Terminated,
}

/// A step run as reconstructed from the log.
#[derive(Debug, Clone)]
pub struct ReplayedRun {
    pub step_name: String,
    pub status: RunStatus,
    pub attempt: u32,
}

/// Execution state derived purely from events.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub workload: Value,
    pub ctx: Value,
    /// Tokens enqueued but not yet consumed by a schedule or skip.
    pub pending_tokens: Vec<Token>,
    pub step_runs: HashMap<StepRunId, ReplayedRun>,
}

impl ExecutionState {
    /// Fold a full event sequence. Returns `None` for an empty sequence.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let mut state = Self {
            execution_id: first.execution_id,
            status: ExecutionStatus::Initial,
            workload: json!({}),
            ctx: json!({}),
            pending_tokens: Vec::new(),
            step_runs: HashMap::new(),
        };
        for event in events {
            state.apply(event);
        }
        Some(state)
    }

    /// All tokens still runnable: this is what a restarted scheduler
    /// re-dispatches.
    pub fn runnable_tokens(&self) -> &[Token] {
        &self.pending_tokens
    }

    /// No pending tokens and every step run terminal.
    pub fn is_complete(&self) -> bool {
        self.pending_tokens.is_empty()
            && self.step_runs.values().all(|r| r.status.is_terminal())
    }

    fn apply(&mut self, event: &Event) {
        match event.name {
            EventName::WorkflowStarted => {
                self.status = ExecutionStatus::InProgress;
                if let Some(workload) = event.data.get("workload") {
                    self.workload = workload.clone();
                }
            }
            EventName::WorkflowFinished => {
                self.status = match event.status {
                    EventStatus::Completed => ExecutionStatus::Completed,
                    EventStatus::Terminated => ExecutionStatus::Terminated,
                    _ => ExecutionStatus::Failed,
                };
            }
            EventName::CtxPatched => {
                if let Some(patch) = event.data.get("patch") {
                    merge_patch(&mut self.ctx, patch);
                }
            }
            EventName::TokenEnqueued => {
                if let Ok(token) = serde_json::from_value::<Token>(event.data.clone()) {
                    self.pending_tokens.push(token);
                }
            }
            EventName::StepScheduled => {
                self.consume_token(event.data.get("token_id"));
                if let Ok(step_run_id) = event.entity_id.parse::<StepRunId>() {
                    self.step_runs.insert(
                        step_run_id,
                        ReplayedRun {
                            step_name: event.data_str("step").unwrap_or_default().to_string(),
                            status: RunStatus::Scheduled,
                            attempt: event.data_u64("attempt").unwrap_or(1) as u32,
                        },
                    );
                }
            }
            EventName::StepSkipped => {
                self.consume_token(event.data.get("token_id"));
            }
            EventName::TokenClaimed => {
                self.update_run(&event.entity_id, RunStatus::Running, event);
            }
            EventName::StepDone => {
                self.update_run(&event.entity_id, RunStatus::Done, event);
            }
            EventName::StepFailed => {
                self.update_run(&event.entity_id, RunStatus::Failed, event);
            }
            EventName::LoopDone => {
                let status = if event.status == EventStatus::Failed {
                    RunStatus::Failed
                } else {
                    RunStatus::Done
                };
                self.update_run(&event.entity_id, status, event);
            }
            _ => {}
        }
    }

    fn consume_token(&mut self, token_id: Option<&Value>) {
        let Some(token_id) = token_id
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<TokenId>().ok())
        else {
            return;
        };
        self.pending_tokens.retain(|t| t.token_id != token_id);
    }

    fn update_run(&mut self, entity_id: &str, status: RunStatus, event: &Event) {
        if let Ok(step_run_id) = entity_id.parse::<StepRunId>() {
            if let Some(run) = self.step_runs.get_mut(&step_run_id) {
                run.status = status;
                if let Some(attempt) = event.data_u64("attempt") {
                    run.attempt = attempt as u32;
                }
            }
        }
    }
}
