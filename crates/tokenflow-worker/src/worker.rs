//! Worker pool: claims step runs, executes them, reports terminal events.
//!
//! Concurrency is bounded by a semaphore sized from
//! [`WorkerConfig::max_concurrent_runs`]. While a run executes, a background
//! task renews its lease at the configured heartbeat cadence; if the lease
//! is lost the renewal stops and the scheduler will discard any late
//! completion.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use tokenflow_core::outcome::externalize;
use tokenflow_core::{
    EngineError, EngineResult, EventName, EventStatus, ExecutionId, Playbook, StepRunId, Token,
};
use tokenflow_engine::{ClaimedRun, ContextStore, EngineConfig, EventLog, TokenScheduler};

use crate::adapter::AdapterRegistry;
use crate::config::WorkerConfig;
use crate::iteration::IterationManager;
use crate::pipeline::{PipelineExecutor, PipelineRequest, PipelineStatus};

/// A worker bound to one scheduler.
pub struct Worker {
    scheduler: Arc<TokenScheduler>,
    executor: Arc<PipelineExecutor>,
    iterations: IterationManager,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    externalize_threshold: usize,
    reference_store: String,
}

impl Worker {
    pub fn new(
        scheduler: Arc<TokenScheduler>,
        adapters: Arc<AdapterRegistry>,
        config: WorkerConfig,
        engine_config: &EngineConfig,
    ) -> Self {
        let log = scheduler.log();
        let store = scheduler.store();
        let executor = Arc::new(PipelineExecutor::new(
            adapters,
            log.clone(),
            store.clone(),
            engine_config,
        ));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_runs));
        Self {
            iterations: IterationManager::new(executor.clone(), log, store),
            scheduler,
            executor,
            config,
            semaphore,
            externalize_threshold: engine_config.externalize_threshold,
            reference_store: engine_config.reference_store.clone(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim and execute one scheduled step run to its terminal event.
    /// Returns the tokens the terminal event produced.
    pub async fn execute_run(&self, step_run_id: StepRunId) -> EngineResult<Vec<Token>> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let Some(claimed) = self.scheduler.claim_run(step_run_id, &self.config.worker_id)? else {
            return Ok(Vec::new());
        };
        debug!(
            worker_id = %self.config.worker_id,
            step = %claimed.run.step_name,
            step_run_id = %step_run_id,
            "run claimed"
        );

        let heartbeat = self.start_heartbeat(step_run_id);
        let terminal = self.run_claimed(&claimed).await;
        heartbeat.abort();

        let (name, status, data) = terminal?;
        self.scheduler
            .complete_run(step_run_id, &self.config.worker_id, name, status, data)
    }

    /// Execute everything the scheduler can dispatch, repeatedly, until the
    /// net quiesces. Runs within one wave execute concurrently.
    pub async fn drain(&self) -> EngineResult<()> {
        loop {
            let runs = self.scheduler.dispatch_ready_tokens()?;
            if runs.is_empty() {
                return Ok(());
            }
            let wave = runs
                .iter()
                .map(|run| self.execute_run(run.step_run_id));
            for result in join_all(wave).await {
                result?;
            }
        }
    }

    async fn run_claimed(
        &self,
        claimed: &ClaimedRun,
    ) -> EngineResult<(EventName, EventStatus, Value)> {
        let run = &claimed.run;
        let tasks = claimed.step.pipeline()?;

        if let Some(loop_def) = &claimed.step.loop_def {
            let outcome = match self
                .iterations
                .run_loop(run, loop_def, &tasks, json!({}))
                .await
            {
                Ok(outcome) => outcome,
                Err(err) if err.is_fatal() => {
                    warn!(step = %run.step_name, %err, "loop failed");
                    return Ok((
                        EventName::LoopDone,
                        EventStatus::Failed,
                        json!({
                            "step": run.step_name,
                            "error": {"kind": "config", "retryable": false, "message": err.to_string()},
                        }),
                    ));
                }
                Err(err) => return Err(err),
            };
            let status = if outcome.is_success() {
                EventStatus::Completed
            } else {
                EventStatus::Failed
            };
            let results = self.externalized(&Value::Array(outcome.results.clone()), run, "loop");
            return Ok((
                EventName::LoopDone,
                status,
                json!({
                    "step": run.step_name,
                    "count": outcome.count,
                    "result": results,
                    "failed_indices": outcome.failed,
                    "vars": outcome.vars,
                }),
            ));
        }

        let outcome = match self
            .executor
            .execute(PipelineRequest {
                run,
                tasks: &tasks,
                vars: json!({}),
                iter: json!({}),
                reject_vars_writes: false,
            })
            .await
        {
            Ok(outcome) => outcome,
            // A fatal engine error still terminates the run on the log;
            // only infrastructure errors (lease, durability) propagate.
            Err(err) if err.is_fatal() => {
                warn!(step = %run.step_name, %err, "pipeline failed");
                return Ok((
                    EventName::StepFailed,
                    EventStatus::Failed,
                    json!({
                        "step": run.step_name,
                        "error": {"kind": "config", "retryable": false, "message": err.to_string()},
                    }),
                ));
            }
            Err(err) => return Err(err),
        };

        match outcome.status {
            PipelineStatus::Completed | PipelineStatus::Broke => Ok((
                EventName::StepDone,
                EventStatus::Completed,
                json!({
                    "step": run.step_name,
                    "result": self.externalized(&outcome.prev, run, "result"),
                    "results": outcome.results,
                    "vars": outcome.vars,
                }),
            )),
            PipelineStatus::Failed => Ok((
                EventName::StepFailed,
                EventStatus::Failed,
                json!({
                    "step": run.step_name,
                    "error": outcome.error,
                    "failed_task": outcome.failed_task,
                    "vars": outcome.vars,
                }),
            )),
        }
    }

    fn start_heartbeat(&self, step_run_id: StepRunId) -> tokio::task::JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                match scheduler.heartbeat(step_run_id, &worker_id) {
                    Ok(()) => debug!(step_run_id = %step_run_id, "lease renewed"),
                    Err(err) => {
                        warn!(step_run_id = %step_run_id, %err, "heartbeat stopped");
                        break;
                    }
                }
            }
        })
    }

    fn externalized(&self, value: &Value, run: &tokenflow_core::StepRun, tag: &str) -> Value {
        let key = format!("{}/{}/{}", run.execution_id, run.step_run_id, tag);
        externalize(value, self.externalize_threshold, &self.reference_store, &key)
    }
}

/// In-process engine: scheduler plus one worker, sharing a log.
///
/// This is the embedding surface used by tests and the CLI; a deployment
/// would put transport between the two halves.
pub struct Runtime {
    scheduler: Arc<TokenScheduler>,
    worker: Arc<Worker>,
}

impl Runtime {
    pub fn new(adapters: AdapterRegistry) -> Self {
        Self::with_configs(adapters, EngineConfig::default(), WorkerConfig::default())
    }

    pub fn with_configs(
        adapters: AdapterRegistry,
        engine_config: EngineConfig,
        worker_config: WorkerConfig,
    ) -> Self {
        let log = Arc::new(EventLog::new());
        let store = Arc::new(ContextStore::new(log.clone()));
        let scheduler = Arc::new(TokenScheduler::new(log, store, engine_config.clone()));
        let worker = Arc::new(Worker::new(
            scheduler.clone(),
            Arc::new(adapters),
            worker_config,
            &engine_config,
        ));
        Self { scheduler, worker }
    }

    pub fn scheduler(&self) -> Arc<TokenScheduler> {
        self.scheduler.clone()
    }

    pub fn worker(&self) -> Arc<Worker> {
        self.worker.clone()
    }

    /// Submit a playbook and drive it to completion.
    pub async fn run_playbook(
        &self,
        playbook: Playbook,
        payload: Value,
    ) -> EngineResult<ExecutionId> {
        let execution_id = self.scheduler.submit_execution(playbook, payload)?;
        self.worker.drain().await?;
        info!(execution_id = %execution_id, "playbook run finished");
        Ok(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenflow_core::parse_playbook;

    #[tokio::test]
    async fn test_linear_playbook_runs_to_completion() {
        let runtime = Runtime::new(AdapterRegistry::with_builtins());
        let playbook = parse_playbook(
            r#"
apiVersion: tokenflow.dev/v1
kind: Playbook
metadata:
  name: linear
workflow:
  - step: start
    next:
      - finish
  - step: finish
    tool:
      kind: noop
      inputs:
        done: true
"#,
        )
        .unwrap();

        let execution_id = runtime.run_playbook(playbook, json!({})).await.unwrap();
        assert!(runtime.scheduler().is_complete(execution_id).unwrap());

        let events = runtime.scheduler().log().read(execution_id).unwrap();
        let finished = events
            .iter()
            .find(|e| e.name == EventName::WorkflowFinished)
            .unwrap();
        assert_eq!(finished.status, EventStatus::Completed);
        // Both steps ran.
        let done_steps: Vec<&str> = events
            .iter()
            .filter(|e| e.name == EventName::StepDone)
            .filter_map(|e| e.data_str("step"))
            .collect();
        assert_eq!(done_steps, vec!["start", "finish"]);
    }
}
