//! Token scheduler: the control-plane brain.
//!
//! Owns submission, token dispatch, lease bookkeeping, terminal-event
//! routing over `next` arcs, and completion detection. All decisions are
//! recorded to the event log before derived state is updated, so a restart
//! can rebuild everything from the log (see [`crate::replay`]).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use tokenflow_core::value::{merged, scope};
use tokenflow_core::{
    validate_playbook, EngineError, EngineResult, EntityKind, Event, EventName, EventSource,
    EventStatus, ExecutionId, Lease, NextMode, Playbook, RunStatus, Step, StepRun, StepRunId,
    TemplateRenderer, Token,
};

use crate::config::EngineConfig;
use crate::context::ContextStore;
use crate::log::EventLog;
use crate::replay::ExecutionState;

/// Everything a worker needs to execute a claimed step run.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run: StepRun,
    pub step: Step,
    pub workload: Value,
    pub ctx: Value,
}

struct ExecutionEntry {
    playbook: Arc<Playbook>,
    pending: VecDeque<Token>,
    runs: HashMap<StepRunId, StepRun>,
    /// Terminal events already applied, keyed by (step_run_id, attempt).
    applied_terminals: HashSet<(StepRunId, u32)>,
    /// A step run failed and its failure selected no outgoing arc.
    unhandled_failure: bool,
    terminated: bool,
    finished: bool,
}

/// Scheduler over the event log and context store.
pub struct TokenScheduler {
    log: Arc<EventLog>,
    store: Arc<ContextStore>,
    renderer: TemplateRenderer,
    config: EngineConfig,
    inner: Mutex<HashMap<ExecutionId, ExecutionEntry>>,
}

impl TokenScheduler {
    pub fn new(log: Arc<EventLog>, store: Arc<ContextStore>, config: EngineConfig) -> Self {
        Self {
            log,
            store,
            renderer: TemplateRenderer::new(),
            config,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> Arc<EventLog> {
        self.log.clone()
    }

    pub fn store(&self) -> Arc<ContextStore> {
        self.store.clone()
    }

    /// Validate and admit a playbook execution.
    ///
    /// On success the log holds the request, its evaluation, workflow start,
    /// and the initial token for the start step. A validation failure
    /// rejects the submission before any execution state exists.
    pub fn submit_execution(
        &self,
        playbook: Playbook,
        payload: Value,
    ) -> EngineResult<ExecutionId> {
        validate_playbook(&playbook)?;
        if !payload.is_object() && !payload.is_null() {
            return Err(EngineError::SchemaViolation(
                "submission payload must be an object".into(),
            ));
        }

        let execution_id = uuid::Uuid::new_v4();
        let name = playbook.metadata.name.clone();

        self.emit(
            execution_id,
            EventName::PlaybookExecutionRequested,
            EntityKind::Execution,
            execution_id.to_string(),
            EventStatus::Pending,
            json!({"playbook": name, "payload": payload}),
        )?;
        self.emit(
            execution_id,
            EventName::PlaybookRequestEvaluated,
            EntityKind::Execution,
            execution_id.to_string(),
            EventStatus::Completed,
            json!({"playbook": name}),
        )?;

        let workload = merged(&object_or_empty(&playbook.workload), &object_or_empty(&payload));
        self.store.init_execution(execution_id, workload.clone())?;

        self.emit(
            execution_id,
            EventName::WorkflowStarted,
            EntityKind::Execution,
            execution_id.to_string(),
            EventStatus::Started,
            json!({"playbook": name, "workload": workload}),
        )?;

        let mut inner = self.lock()?;
        inner.insert(
            execution_id,
            ExecutionEntry {
                playbook: Arc::new(playbook),
                pending: VecDeque::new(),
                runs: HashMap::new(),
                applied_terminals: HashSet::new(),
                unhandled_failure: false,
                terminated: false,
                finished: false,
            },
        );
        drop(inner);

        let token = Token::new(execution_id, tokenflow_core::playbook::START_STEP, json!({}));
        self.enqueue_token(token)?;

        info!(execution_id = %execution_id, playbook = %name, "execution submitted");
        Ok(execution_id)
    }

    /// Turn pending tokens into scheduled step runs, consuming every token
    /// either into a run or a skip.
    pub fn dispatch_ready(&self, execution_id: ExecutionId) -> EngineResult<Vec<StepRun>> {
        let mut scheduled = Vec::new();
        loop {
            let (token, step, halted) = {
                let mut inner = self.lock()?;
                let entry = entry_mut(&mut inner, execution_id)?;
                match entry.pending.pop_front() {
                    None => break,
                    Some(token) => {
                        let halted = entry.terminated || entry.finished;
                        let step = entry.playbook.step(&token.target_step).cloned();
                        (token, step, halted)
                    }
                }
            };

            if halted {
                self.skip_token(&token, "terminated")?;
                continue;
            }
            let Some(step) = step else {
                // Unreachable post-validation; consume rather than wedge.
                self.skip_token(&token, "unknown_step")?;
                continue;
            };

            if let Some(when) = &step.when {
                if !self.guard_matches(when, &token)? {
                    self.skip_token(&token, "guard_false")?;
                    continue;
                }
            }

            let run = StepRun::new(token);
            self.emit(
                execution_id,
                EventName::StepScheduled,
                EntityKind::StepRun,
                run.step_run_id.to_string(),
                EventStatus::Pending,
                json!({
                    "step": run.step_name,
                    "token_id": run.token.token_id.to_string(),
                    "attempt": run.attempt,
                }),
            )?;

            let mut inner = self.lock()?;
            let entry = entry_mut(&mut inner, execution_id)?;
            entry.runs.insert(run.step_run_id, run.clone());
            scheduled.push(run);
        }
        Ok(scheduled)
    }

    /// Dispatch across all live executions.
    pub fn dispatch_ready_tokens(&self) -> EngineResult<Vec<StepRun>> {
        let ids: Vec<ExecutionId> = {
            let inner = self.lock()?;
            inner.keys().copied().collect()
        };
        let mut all = Vec::new();
        for execution_id in ids {
            all.extend(self.dispatch_ready(execution_id)?);
        }
        Ok(all)
    }

    /// Claim a scheduled run under a lease. Returns `None` if the run is
    /// not claimable (already running or finished).
    pub fn claim_run(
        &self,
        step_run_id: StepRunId,
        worker_id: &str,
    ) -> EngineResult<Option<ClaimedRun>> {
        let claimed = {
            let mut inner = self.lock()?;
            let Some((execution_id, run)) = find_run_mut(&mut inner, step_run_id) else {
                return Ok(None);
            };
            if run.status != RunStatus::Scheduled {
                return Ok(None);
            }
            run.status = RunStatus::Running;
            run.lease = Some(Lease::grant(
                worker_id,
                self.config.lease_ttl.as_secs(),
                Utc::now(),
            ));
            let run = run.clone();
            let entry = inner
                .get(&execution_id)
                .ok_or_else(|| EngineError::Internal("entry vanished".into()))?;
            let step = entry
                .playbook
                .step(&run.step_name)
                .cloned()
                .ok_or_else(|| EngineError::Internal(format!("no step '{}'", run.step_name)))?;
            (execution_id, run, step)
        };
        let (execution_id, run, step) = claimed;

        self.emit(
            execution_id,
            EventName::TokenClaimed,
            EntityKind::StepRun,
            step_run_id.to_string(),
            EventStatus::Running,
            json!({
                "worker_id": worker_id,
                "token_id": run.token.token_id.to_string(),
                "attempt": run.attempt,
            }),
        )?;

        Ok(Some(ClaimedRun {
            workload: self.store.workload(execution_id)?,
            ctx: self.store.ctx(execution_id)?,
            run,
            step,
        }))
    }

    /// Renew a lease. Fails with [`EngineError::LeaseLost`] when the caller
    /// no longer owns the run.
    pub fn heartbeat(&self, step_run_id: StepRunId, worker_id: &str) -> EngineResult<()> {
        let mut inner = self.lock()?;
        let Some((_, run)) = find_run_mut(&mut inner, step_run_id) else {
            return Err(EngineError::LeaseLost(format!(
                "unknown step run {}",
                step_run_id
            )));
        };
        match &mut run.lease {
            Some(lease) if lease.owner == worker_id => {
                lease.renew(Utc::now());
                Ok(())
            }
            _ => Err(EngineError::LeaseLost(format!(
                "worker {} does not hold the lease on {}",
                worker_id, step_run_id
            ))),
        }
    }

    /// Reap expired leases: the run goes back to `SCHEDULED` with a bumped
    /// attempt and becomes claimable again. At-least-once follows.
    pub fn expire_leases(&self, now: DateTime<Utc>) -> EngineResult<Vec<StepRunId>> {
        let mut expired = Vec::new();
        let mut rescheduled = Vec::new();
        {
            let mut inner = self.lock()?;
            for entry in inner.values_mut() {
                for run in entry.runs.values_mut() {
                    let lost = matches!(&run.lease, Some(lease)
                        if run.status == RunStatus::Running && lease.is_expired(now));
                    if lost {
                        run.lease = None;
                        run.status = RunStatus::Scheduled;
                        run.attempt += 1;
                        expired.push(run.step_run_id);
                        rescheduled.push((run.execution_id, run.step_run_id, run.clone()));
                    }
                }
            }
        }
        for (execution_id, step_run_id, run) in rescheduled {
            warn!(step_run_id = %step_run_id, "lease expired, rescheduling");
            self.emit(
                execution_id,
                EventName::StepScheduled,
                EntityKind::StepRun,
                step_run_id.to_string(),
                EventStatus::Pending,
                json!({
                    "step": run.step_name,
                    "token_id": run.token.token_id.to_string(),
                    "attempt": run.attempt,
                }),
            )?;
        }
        Ok(expired)
    }

    /// Record a terminal event on behalf of a worker and route it.
    ///
    /// A completion from a worker that lost its lease, or a duplicate
    /// delivery of an already-applied (step_run_id, attempt), is discarded
    /// without recording anything.
    pub fn complete_run(
        &self,
        step_run_id: StepRunId,
        worker_id: &str,
        name: EventName,
        status: EventStatus,
        mut data: Value,
    ) -> EngineResult<Vec<Token>> {
        if !name.is_terminal() {
            return Err(EngineError::Internal(format!(
                "{} is not a terminal event",
                name
            )));
        }
        let (execution_id, attempt) = {
            let mut inner = self.lock()?;
            let Some((execution_id, run)) = find_run_mut(&mut inner, step_run_id) else {
                return Err(EngineError::Internal(format!(
                    "unknown step run {}",
                    step_run_id
                )));
            };
            let owns = matches!(&run.lease, Some(lease) if lease.owner == worker_id);
            if !owns {
                warn!(step_run_id = %step_run_id, worker_id, "late completion discarded");
                return Ok(Vec::new());
            }
            (run.execution_id, run.attempt)
        };

        if let Value::Object(map) = &mut data {
            map.entry("attempt".to_string())
                .or_insert(json!(attempt));
        }
        let mut event = Event::new(
            execution_id,
            EventSource::Worker,
            name,
            EntityKind::StepRun,
            step_run_id.to_string(),
            status,
            data,
        );
        event.seq = self.log.append(event.clone())?;
        self.on_terminal_event(&event)
    }

    /// Apply an already-recorded terminal event: mark the run, evaluate its
    /// `next` arcs, enqueue produced tokens, and check completion.
    /// Idempotent per (step_run_id, attempt).
    pub fn on_terminal_event(&self, event: &Event) -> EngineResult<Vec<Token>> {
        let step_run_id: StepRunId = event
            .entity_id
            .parse()
            .map_err(|_| EngineError::Internal("terminal event without step_run_id".into()))?;
        let attempt = event.data_u64("attempt").unwrap_or(1) as u32;
        let execution_id = event.execution_id;

        let (run, step, mode, halted) = {
            let mut inner = self.lock()?;
            let entry = entry_mut(&mut inner, execution_id)?;
            if !entry.applied_terminals.insert((step_run_id, attempt)) {
                debug!(step_run_id = %step_run_id, attempt, "duplicate terminal event ignored");
                return Ok(Vec::new());
            }
            let run = entry
                .runs
                .get_mut(&step_run_id)
                .ok_or_else(|| EngineError::Internal(format!("unknown step run {}", step_run_id)))?;
            run.lease = None;
            run.status = if event.status == EventStatus::Failed {
                RunStatus::Failed
            } else {
                RunStatus::Done
            };
            let run = run.clone();
            let step = entry
                .playbook
                .step(&run.step_name)
                .cloned()
                .ok_or_else(|| EngineError::Internal(format!("no step '{}'", run.step_name)))?;
            (run, step.clone(), step.spec.next_mode, entry.terminated)
        };

        let mut tokens = Vec::new();
        let mut selected = Vec::new();
        if !halted {
            let workload = self.store.workload(execution_id)?;
            let ctx = self.store.ctx(execution_id)?;
            let vars = event.data.get("vars").cloned().unwrap_or(json!({}));
            let arc_scope = scope(&[
                ("event", &event.data),
                ("ctx", &ctx),
                ("vars", &vars),
                ("workload", &workload),
            ]);

            for arc in step.arcs() {
                let matched = match &arc.when {
                    None => true,
                    Some(when) => match self.renderer.evaluate_condition(when, &arc_scope) {
                        Ok(matched) => matched,
                        Err(err) => {
                            warn!(step = %run.step_name, arc = %arc.step, %err,
                                "arc guard evaluation failed, treating as no match");
                            false
                        }
                    },
                };
                if !matched {
                    continue;
                }
                let args = match &arc.args {
                    None => json!({}),
                    Some(args) => match self
                        .renderer
                        .render_value(&Value::Object(args.clone()), &arc_scope)
                    {
                        Ok(args) => args,
                        Err(err) => {
                            warn!(step = %run.step_name, arc = %arc.step, %err,
                                "arc args rendering failed, arc does not fire");
                            continue;
                        }
                    },
                };
                selected.push(arc.step.clone());
                tokens.push(
                    Token::new(execution_id, arc.step.clone(), args)
                        .with_parent(step_run_id),
                );
                if mode == NextMode::Exclusive {
                    break;
                }
            }

            self.emit(
                execution_id,
                EventName::NextEvaluated,
                EntityKind::StepRun,
                step_run_id.to_string(),
                EventStatus::Completed,
                json!({
                    "step": run.step_name,
                    "mode": mode,
                    "selected": selected,
                }),
            )?;
        }

        if event.status == EventStatus::Failed && tokens.is_empty() {
            let mut inner = self.lock()?;
            entry_mut(&mut inner, execution_id)?.unhandled_failure = true;
        }

        for token in &tokens {
            self.enqueue_token(token.clone())?;
        }

        self.check_completion(execution_id)?;
        Ok(tokens)
    }

    /// True when no pending tokens remain and every step run is terminal.
    pub fn is_complete(&self, execution_id: ExecutionId) -> EngineResult<bool> {
        let inner = self.lock()?;
        let entry = entry_ref(&inner, execution_id)?;
        Ok(entry.pending.is_empty()
            && entry.runs.values().all(|r| r.status.is_terminal()))
    }

    /// Stop dispatching tokens for an execution. In-flight runs finish and
    /// record their terminal events but produce no further tokens.
    pub fn terminate(&self, execution_id: ExecutionId) -> EngineResult<()> {
        let drained: Vec<Token> = {
            let mut inner = self.lock()?;
            let entry = entry_mut(&mut inner, execution_id)?;
            entry.terminated = true;
            entry.pending.drain(..).collect()
        };
        for token in drained {
            self.skip_token(&token, "terminated")?;
        }
        info!(execution_id = %execution_id, "execution terminated");
        self.check_completion(execution_id)
    }

    /// Rebuild scheduler state for an execution from the log. Pending
    /// tokens become dispatchable again; applied terminals stay applied.
    pub fn resume_execution(&self, playbook: Playbook, execution_id: ExecutionId) -> EngineResult<()> {
        validate_playbook(&playbook)?;
        let events = self.log.read(execution_id)?;
        let state = ExecutionState::from_events(&events)
            .ok_or_else(|| EngineError::Internal(format!("no events for {}", execution_id)))?;

        self.store
            .restore(execution_id, state.workload.clone(), state.ctx.clone())?;

        let mut applied = HashSet::new();
        let mut tokens_by_id: HashMap<tokenflow_core::TokenId, Token> = HashMap::new();
        let mut token_for_run: HashMap<StepRunId, tokenflow_core::TokenId> = HashMap::new();
        for event in &events {
            if event.name.is_terminal() {
                if let Ok(id) = event.entity_id.parse::<StepRunId>() {
                    applied.insert((id, event.data_u64("attempt").unwrap_or(1) as u32));
                }
            }
            match event.name {
                EventName::TokenEnqueued => {
                    if let Ok(token) = serde_json::from_value::<Token>(event.data.clone()) {
                        tokens_by_id.insert(token.token_id, token);
                    }
                }
                EventName::StepScheduled => {
                    if let (Ok(run_id), Some(token_id)) = (
                        event.entity_id.parse::<StepRunId>(),
                        event
                            .data_str("token_id")
                            .and_then(|s| s.parse::<tokenflow_core::TokenId>().ok()),
                    ) {
                        token_for_run.insert(run_id, token_id);
                    }
                }
                _ => {}
            }
        }

        let mut runs = HashMap::new();
        for (step_run_id, replayed) in &state.step_runs {
            // Non-terminal runs lost their lease with the process; they go
            // back to SCHEDULED and will be claimed again.
            let status = if replayed.status.is_terminal() {
                replayed.status
            } else {
                RunStatus::Scheduled
            };
            // The run's token is recorded in full on its token.enqueued
            // event; args must survive a restart.
            let token = token_for_run
                .get(step_run_id)
                .and_then(|token_id| tokens_by_id.get(token_id))
                .cloned()
                .unwrap_or_else(|| {
                    Token::new(execution_id, replayed.step_name.clone(), json!({}))
                });
            let mut run = StepRun::new(token);
            run.step_run_id = *step_run_id;
            run.status = status;
            run.attempt = replayed.attempt;
            runs.insert(*step_run_id, run);
        }

        let mut inner = self.lock()?;
        inner.insert(
            execution_id,
            ExecutionEntry {
                playbook: Arc::new(playbook),
                pending: state.pending_tokens.into_iter().collect(),
                runs,
                applied_terminals: applied,
                unhandled_failure: false,
                terminated: state.status == crate::replay::ExecutionStatus::Terminated,
                finished: matches!(
                    state.status,
                    crate::replay::ExecutionStatus::Completed
                        | crate::replay::ExecutionStatus::Failed
                ),
            },
        );
        Ok(())
    }

    fn check_completion(&self, execution_id: ExecutionId) -> EngineResult<()> {
        let status = {
            let mut inner = self.lock()?;
            let entry = entry_mut(&mut inner, execution_id)?;
            let complete = !entry.finished
                && entry.pending.is_empty()
                && entry.runs.values().all(|r| r.status.is_terminal());
            if !complete {
                return Ok(());
            }
            entry.finished = true;
            if entry.terminated {
                EventStatus::Terminated
            } else if entry.unhandled_failure {
                EventStatus::Failed
            } else {
                EventStatus::Completed
            }
        };

        self.emit(
            execution_id,
            EventName::WorkflowFinished,
            EntityKind::Execution,
            execution_id.to_string(),
            status,
            json!({"status": status}),
        )?;
        self.emit(
            execution_id,
            EventName::PlaybookProcessed,
            EntityKind::Execution,
            execution_id.to_string(),
            status,
            json!({"status": status}),
        )?;
        info!(execution_id = %execution_id, status = %status, "execution finished");
        Ok(())
    }

    fn guard_matches(&self, when: &str, token: &Token) -> EngineResult<bool> {
        let workload = self.store.workload(token.execution_id)?;
        let ctx = self.store.ctx(token.execution_id)?;
        let guard_scope = scope(&[
            ("workload", &workload),
            ("ctx", &ctx),
            ("args", &token.args),
        ]);
        match self.renderer.evaluate_condition(when, &guard_scope) {
            Ok(matched) => Ok(matched),
            Err(err) => {
                // A guard that cannot be evaluated does not fire.
                warn!(step = %token.target_step, %err, "guard evaluation failed, skipping");
                Ok(false)
            }
        }
    }

    fn enqueue_token(&self, token: Token) -> EngineResult<()> {
        self.emit(
            token.execution_id,
            EventName::TokenEnqueued,
            EntityKind::Token,
            token.token_id.to_string(),
            EventStatus::Pending,
            serde_json::to_value(&token)?,
        )?;
        let mut inner = self.lock()?;
        entry_mut(&mut inner, token.execution_id)?
            .pending
            .push_back(token);
        Ok(())
    }

    fn skip_token(&self, token: &Token, reason: &str) -> EngineResult<()> {
        debug!(step = %token.target_step, reason, "token skipped");
        self.emit(
            token.execution_id,
            EventName::StepSkipped,
            EntityKind::Token,
            token.token_id.to_string(),
            EventStatus::Skipped,
            json!({
                "step": token.target_step,
                "token_id": token.token_id.to_string(),
                "reason": reason,
            }),
        )?;
        self.check_completion(token.execution_id)
    }

    fn emit(
        &self,
        execution_id: ExecutionId,
        name: EventName,
        entity: EntityKind,
        entity_id: String,
        status: EventStatus,
        data: Value,
    ) -> EngineResult<u64> {
        self.log.append(Event::new(
            execution_id,
            EventSource::Server,
            name,
            entity,
            entity_id,
            status,
            data,
        ))
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, HashMap<ExecutionId, ExecutionEntry>>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Internal("scheduler lock poisoned".into()))
    }
}

fn entry_mut<'a>(
    inner: &'a mut HashMap<ExecutionId, ExecutionEntry>,
    execution_id: ExecutionId,
) -> EngineResult<&'a mut ExecutionEntry> {
    inner
        .get_mut(&execution_id)
        .ok_or_else(|| EngineError::Internal(format!("unknown execution {}", execution_id)))
}

fn entry_ref<'a>(
    inner: &'a HashMap<ExecutionId, ExecutionEntry>,
    execution_id: ExecutionId,
) -> EngineResult<&'a ExecutionEntry> {
    inner
        .get(&execution_id)
        .ok_or_else(|| EngineError::Internal(format!("unknown execution {}", execution_id)))
}

fn find_run_mut(
    inner: &mut HashMap<ExecutionId, ExecutionEntry>,
    step_run_id: StepRunId,
) -> Option<(ExecutionId, &mut StepRun)> {
    for (execution_id, entry) in inner.iter_mut() {
        if let Some(run) = entry.runs.get_mut(&step_run_id) {
            return Some((*execution_id, run));
        }
    }
    None
}

fn object_or_empty(value: &Value) -> Value {
    if value.is_object() {
        value.clone()
    } else {
        json!({})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenflow_core::parse_playbook;

    fn scheduler() -> TokenScheduler {
        let log = Arc::new(EventLog::new());
        let store = Arc::new(ContextStore::new(log.clone()));
        TokenScheduler::new(log, store, EngineConfig::default())
    }

    fn names(scheduler: &TokenScheduler, execution_id: ExecutionId) -> Vec<EventName> {
        scheduler
            .log()
            .read(execution_id)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    const LINEAR: &str = r#"
apiVersion: tokenflow.dev/v1
kind: Playbook
metadata:
  name: linear
workload:
  region: eu
workflow:
  - step: start
    next:
      - fetch
  - step: fetch
    tool:
      kind: noop
"#;

    #[test]
    fn test_submit_emits_lifecycle_events() {
        let scheduler = scheduler();
        let playbook = parse_playbook(LINEAR).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({"extra": 1})).unwrap();

        let names = names(&scheduler, execution_id);
        assert_eq!(
            names,
            vec![
                EventName::PlaybookExecutionRequested,
                EventName::PlaybookRequestEvaluated,
                EventName::WorkflowStarted,
                EventName::TokenEnqueued,
            ]
        );
        // Payload merged over declared workload.
        assert_eq!(
            scheduler.store().workload(execution_id).unwrap(),
            json!({"region": "eu", "extra": 1})
        );
    }

    #[test]
    fn test_invalid_playbook_rejected_without_events() {
        let scheduler = scheduler();
        let yaml = LINEAR.replace("step: fetch", "step: start");
        let playbook: Playbook = serde_yaml::from_str(&yaml).unwrap();
        let err = scheduler.submit_execution(playbook, json!({})).unwrap_err();
        assert!(matches!(err, EngineError::SchemaViolation(_)));
    }

    #[test]
    fn test_dispatch_creates_run_and_claim_grants_lease() {
        let scheduler = scheduler();
        let playbook = parse_playbook(LINEAR).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();

        let runs = scheduler.dispatch_ready(execution_id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].step_name, "start");

        let claimed = scheduler.claim_run(runs[0].step_run_id, "w1").unwrap().unwrap();
        assert_eq!(claimed.run.status, RunStatus::Running);
        assert_eq!(claimed.step.step, "start");
        // Second claim is refused.
        assert!(scheduler.claim_run(runs[0].step_run_id, "w2").unwrap().is_none());
    }

    #[test]
    fn test_guard_false_skips_token() {
        let scheduler = scheduler();
        let yaml = r#"
apiVersion: tokenflow.dev/v1
kind: Playbook
metadata:
  name: guarded
workflow:
  - step: start
    when: "workload.enabled"
    tool:
      kind: noop
"#;
        let playbook = parse_playbook(yaml).unwrap();
        let execution_id = scheduler
            .submit_execution(playbook, json!({"enabled": false}))
            .unwrap();

        let runs = scheduler.dispatch_ready(execution_id).unwrap();
        assert!(runs.is_empty());
        assert!(names(&scheduler, execution_id).contains(&EventName::StepSkipped));
        // Nothing left to do: skipping the only token completes the workflow.
        assert!(names(&scheduler, execution_id).contains(&EventName::WorkflowFinished));
    }

    #[test]
    fn test_guard_error_counts_as_false() {
        let scheduler = scheduler();
        let yaml = r#"
apiVersion: tokenflow.dev/v1
kind: Playbook
metadata:
  name: broken-guard
workflow:
  - step: start
    when: "workload.a ~!! nonsense"
    tool:
      kind: noop
"#;
        let playbook = parse_playbook(yaml).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();
        let runs = scheduler.dispatch_ready(execution_id).unwrap();
        assert!(runs.is_empty());
        assert!(names(&scheduler, execution_id).contains(&EventName::StepSkipped));
    }

    fn run_to_terminal(
        scheduler: &TokenScheduler,
        execution_id: ExecutionId,
        status: EventStatus,
        data: Value,
    ) -> Vec<Token> {
        let runs = scheduler.dispatch_ready(execution_id).unwrap();
        let run = &runs[0];
        scheduler.claim_run(run.step_run_id, "w1").unwrap().unwrap();
        let name = if status == EventStatus::Failed {
            EventName::StepFailed
        } else {
            EventName::StepDone
        };
        scheduler
            .complete_run(run.step_run_id, "w1", name, status, data)
            .unwrap()
    }

    const BRANCHING: &str = r#"
apiVersion: tokenflow.dev/v1
kind: Playbook
metadata:
  name: branching
workflow:
  - step: start
    spec:
      next_mode: MODE
    tool:
      kind: noop
    next:
      - step: a
        when: "event.result.value > 10"
      - step: b
        when: "event.result.value > 1"
      - step: c
        when: "event.result.value > 0"
  - step: a
    tool: {kind: noop}
  - step: b
    tool: {kind: noop}
  - step: c
    tool: {kind: noop}
"#;

    #[test]
    fn test_exclusive_routing_picks_first_match() {
        let scheduler = scheduler();
        let playbook = parse_playbook(&BRANCHING.replace("MODE", "exclusive")).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();

        let tokens = run_to_terminal(
            &scheduler,
            execution_id,
            EventStatus::Completed,
            json!({"step": "start", "result": {"value": 5}}),
        );
        // Guards evaluate [false, true, true] but only the first match fires.
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].target_step, "b");
    }

    #[test]
    fn test_inclusive_routing_fires_all_matches_in_order() {
        let scheduler = scheduler();
        let playbook = parse_playbook(&BRANCHING.replace("MODE", "inclusive")).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();

        let tokens = run_to_terminal(
            &scheduler,
            execution_id,
            EventStatus::Completed,
            json!({"step": "start", "result": {"value": 5}}),
        );
        let targets: Vec<&str> = tokens.iter().map(|t| t.target_step.as_str()).collect();
        assert_eq!(targets, vec!["b", "c"]);
    }

    const ARGS: &str = r#"
apiVersion: tokenflow.dev/v1
kind: Playbook
metadata:
  name: args
workflow:
  - step: start
    tool: {kind: noop}
    next:
      - step: report
        args:
          total: "{{ event.result.count }}"
  - step: report
    tool: {kind: noop}
"#;

    #[test]
    fn test_arc_args_rendered_into_token() {
        let scheduler = scheduler();
        let playbook = parse_playbook(ARGS).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();
        let tokens = run_to_terminal(
            &scheduler,
            execution_id,
            EventStatus::Completed,
            json!({"step": "start", "result": {"count": 42}}),
        );
        assert_eq!(tokens[0].args, json!({"total": 42}));
    }

    #[test]
    fn test_arc_args_render_error_drops_arc() {
        let scheduler = scheduler();
        let yaml = ARGS.replace(
            "{{ event.result.count }}",
            "{{ event.result.count ~!! nonsense }}",
        );
        let playbook = parse_playbook(&yaml).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();
        let tokens = run_to_terminal(
            &scheduler,
            execution_id,
            EventStatus::Completed,
            json!({"step": "start", "result": {"count": 42}}),
        );
        // The arc does not fire; the execution still finishes on the log.
        assert!(tokens.is_empty());
        let finished = scheduler
            .log()
            .read(execution_id)
            .unwrap()
            .into_iter()
            .find(|e| e.name == EventName::WorkflowFinished)
            .unwrap();
        assert_eq!(finished.status, EventStatus::Completed);
    }

    #[test]
    fn test_resume_restores_token_args() {
        let log = Arc::new(EventLog::new());
        let store = Arc::new(ContextStore::new(log.clone()));
        let scheduler = TokenScheduler::new(log.clone(), store.clone(), EngineConfig::default());
        let playbook = parse_playbook(ARGS).unwrap();
        let execution_id = scheduler.submit_execution(playbook.clone(), json!({})).unwrap();
        run_to_terminal(
            &scheduler,
            execution_id,
            EventStatus::Completed,
            json!({"step": "start", "result": {"count": 42}}),
        );
        let runs = scheduler.dispatch_ready(execution_id).unwrap();
        assert_eq!(runs[0].step_name, "report");

        // A restarted scheduler over the same log sees the same token.
        let restarted = TokenScheduler::new(log, store, EngineConfig::default());
        restarted.resume_execution(playbook, execution_id).unwrap();
        let claimed = restarted
            .claim_run(runs[0].step_run_id, "w2")
            .unwrap()
            .unwrap();
        assert_eq!(claimed.run.token.args, json!({"total": 42}));
    }

    #[test]
    fn test_terminal_event_idempotent_per_attempt() {
        let scheduler = scheduler();
        let playbook = parse_playbook(LINEAR).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();

        let runs = scheduler.dispatch_ready(execution_id).unwrap();
        let run = &runs[0];
        scheduler.claim_run(run.step_run_id, "w1").unwrap().unwrap();
        let tokens = scheduler
            .complete_run(
                run.step_run_id,
                "w1",
                EventName::StepDone,
                EventStatus::Completed,
                json!({"step": "start", "result": null}),
            )
            .unwrap();
        assert_eq!(tokens.len(), 1);

        // Re-deliver the recorded terminal event; no new tokens.
        let events = scheduler.log().read(execution_id).unwrap();
        let terminal = events
            .iter()
            .find(|e| e.name == EventName::StepDone)
            .unwrap()
            .clone();
        let before = scheduler.log().last_seq(execution_id).unwrap();
        let replayed = scheduler.on_terminal_event(&terminal).unwrap();
        assert!(replayed.is_empty());
        assert_eq!(scheduler.log().last_seq(execution_id).unwrap(), before);
    }

    #[test]
    fn test_late_completion_after_lease_loss_discarded() {
        let scheduler = scheduler();
        let playbook = parse_playbook(LINEAR).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();

        let runs = scheduler.dispatch_ready(execution_id).unwrap();
        let run = &runs[0];
        scheduler.claim_run(run.step_run_id, "w1").unwrap().unwrap();

        // Lease expires; the run is rescheduled and claimed by w2.
        let expired = scheduler
            .expire_leases(Utc::now() + chrono::Duration::seconds(120))
            .unwrap();
        assert_eq!(expired, vec![run.step_run_id]);
        scheduler.claim_run(run.step_run_id, "w2").unwrap().unwrap();

        // w1's late completion is discarded.
        let tokens = scheduler
            .complete_run(
                run.step_run_id,
                "w1",
                EventName::StepDone,
                EventStatus::Completed,
                json!({"step": "start"}),
            )
            .unwrap();
        assert!(tokens.is_empty());

        // w2's completion goes through.
        let tokens = scheduler
            .complete_run(
                run.step_run_id,
                "w2",
                EventName::StepDone,
                EventStatus::Completed,
                json!({"step": "start"}),
            )
            .unwrap();
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn test_heartbeat_requires_ownership() {
        let scheduler = scheduler();
        let playbook = parse_playbook(LINEAR).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();
        let runs = scheduler.dispatch_ready(execution_id).unwrap();
        scheduler.claim_run(runs[0].step_run_id, "w1").unwrap().unwrap();

        assert!(scheduler.heartbeat(runs[0].step_run_id, "w1").is_ok());
        assert!(matches!(
            scheduler.heartbeat(runs[0].step_run_id, "w2"),
            Err(EngineError::LeaseLost(_))
        ));
    }

    #[test]
    fn test_terminate_stops_routing() {
        let scheduler = scheduler();
        let playbook = parse_playbook(LINEAR).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();

        let runs = scheduler.dispatch_ready(execution_id).unwrap();
        scheduler.claim_run(runs[0].step_run_id, "w1").unwrap().unwrap();
        scheduler.terminate(execution_id).unwrap();

        // In-flight run records its terminal event but routes nothing.
        let tokens = scheduler
            .complete_run(
                runs[0].step_run_id,
                "w1",
                EventName::StepDone,
                EventStatus::Completed,
                json!({"step": "start"}),
            )
            .unwrap();
        assert!(tokens.is_empty());

        let names = names(&scheduler, execution_id);
        assert!(names.contains(&EventName::WorkflowFinished));
        let finished = scheduler
            .log()
            .read(execution_id)
            .unwrap()
            .into_iter()
            .find(|e| e.name == EventName::WorkflowFinished)
            .unwrap();
        assert_eq!(finished.status, EventStatus::Terminated);
    }

    #[test]
    fn test_unhandled_failure_fails_workflow() {
        let scheduler = scheduler();
        let playbook = parse_playbook(LINEAR).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({})).unwrap();

        // start succeeds, fetch fails with no arcs.
        let tokens = run_to_terminal(
            &scheduler,
            execution_id,
            EventStatus::Completed,
            json!({"step": "start"}),
        );
        assert_eq!(tokens[0].target_step, "fetch");
        run_to_terminal(
            &scheduler,
            execution_id,
            EventStatus::Failed,
            json!({"step": "fetch", "error": {"kind": "adapter", "message": "boom"}}),
        );

        let finished = scheduler
            .log()
            .read(execution_id)
            .unwrap()
            .into_iter()
            .find(|e| e.name == EventName::WorkflowFinished)
            .unwrap();
        assert_eq!(finished.status, EventStatus::Failed);
    }

    #[test]
    fn test_replay_matches_scheduler_view() {
        let scheduler = scheduler();
        let playbook = parse_playbook(LINEAR).unwrap();
        let execution_id = scheduler.submit_execution(playbook, json!({"extra": 2})).unwrap();
        run_to_terminal(
            &scheduler,
            execution_id,
            EventStatus::Completed,
            json!({"step": "start"}),
        );

        let events = scheduler.log().read(execution_id).unwrap();
        let state = ExecutionState::from_events(&events).unwrap();
        assert_eq!(state.workload, scheduler.store().workload(execution_id).unwrap());
        assert_eq!(state.ctx, scheduler.store().ctx(execution_id).unwrap());
        // One token pending (fetch), one run done (start).
        assert_eq!(state.runnable_tokens().len(), 1);
        assert_eq!(state.runnable_tokens()[0].target_step, "fetch");
        assert!(!scheduler.is_complete(execution_id).unwrap());
        assert_eq!(state.is_complete(), scheduler.is_complete(execution_id).unwrap());
    }
}
