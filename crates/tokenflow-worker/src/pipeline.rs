//! Pipeline executor: an ordered interpreter over a step's tool tasks.
//!
//! The program counter starts at the first task and moves under directive
//! control: `continue` advances, `retry` re-runs the same task with backoff,
//! `jump` moves to a label, `break` ends the pipeline successfully, `fail`
//! ends the step run in failure. Every invocation is recorded as
//! task.started / task.processed before its directive is applied.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use tokenflow_core::outcome::externalize;
use tokenflow_core::value::scope;
use tokenflow_core::{
    Directive, EngineError, EngineResult, EntityKind, EvalRule, Event, EventName, EventSource,
    EventStatus, Outcome, OutcomeError, OutcomeMeta, StepRun, TaskDef, TemplateRenderer,
};
use tokenflow_engine::{ContextStore, EngineConfig, EventLog};

use crate::adapter::{AdapterError, AdapterRegistry, Invocation};
use crate::eval::decide;

/// How a pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Ran past the last task.
    Completed,
    /// Ended early via `break`; still a success.
    Broke,
    Failed,
}

impl PipelineStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, PipelineStatus::Failed)
    }
}

/// Final state of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub status: PipelineStatus,
    /// `_prev` at exit: the step's result value.
    pub prev: Value,
    /// Last outcome result per task label.
    pub results: Map<String, Value>,
    pub vars: Value,
    pub iter: Value,
    /// `set_shared` patches in application order, for the loop reducer.
    pub shared: Vec<Map<String, Value>>,
    pub error: Option<OutcomeError>,
    pub failed_task: Option<String>,
}

/// One pipeline execution request.
pub struct PipelineRequest<'a> {
    pub run: &'a StepRun,
    pub tasks: &'a [TaskDef],
    pub vars: Value,
    pub iter: Value,
    /// Set inside parallel loop iterations: plain `set_vars` writes are a
    /// deterministic configuration error there.
    pub reject_vars_writes: bool,
}

/// Executes tool pipelines against the adapter registry.
pub struct PipelineExecutor {
    adapters: Arc<AdapterRegistry>,
    renderer: Arc<TemplateRenderer>,
    log: Arc<EventLog>,
    store: Arc<ContextStore>,
    externalize_threshold: usize,
    reference_store: String,
}

impl PipelineExecutor {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        log: Arc<EventLog>,
        store: Arc<ContextStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            adapters,
            renderer: Arc::new(TemplateRenderer::new()),
            log,
            store,
            externalize_threshold: config.externalize_threshold,
            reference_store: config.reference_store.clone(),
        }
    }

    pub fn renderer(&self) -> Arc<TemplateRenderer> {
        self.renderer.clone()
    }

    pub async fn execute(&self, request: PipelineRequest<'_>) -> EngineResult<PipelineOutcome> {
        let run = request.run;
        let tasks = request.tasks;
        let mut vars = request.vars;
        let mut iter = request.iter;
        let mut shared: Vec<Map<String, Value>> = Vec::new();
        let mut results: Map<String, Value> = Map::new();
        let mut prev = Value::Null;
        let mut counts: HashMap<String, u32> = HashMap::new();
        let mut pc = 0usize;

        while pc < tasks.len() {
            let task = &tasks[pc];
            let attempt = counts.get(&task.label).copied().unwrap_or(0) + 1;

            // Scopes are re-read every invocation so ctx patches from other
            // runs become visible between tasks.
            let workload = self.store.workload(run.execution_id)?;
            let ctx = self.store.ctx(run.execution_id)?;
            let results_value = Value::Object(results.clone());
            let mut task_scope = scope(&[
                ("workload", &workload),
                ("ctx", &ctx),
                ("vars", &vars),
                ("iter", &iter),
                ("args", &run.token.args),
                ("results", &results_value),
                ("_prev", &prev),
            ]);
            task_scope.insert("_task".to_string(), json!(task.label));
            task_scope.insert("_attempt".to_string(), json!(attempt));

            self.emit_task_event(
                run,
                EventName::TaskStarted,
                EventStatus::Started,
                &task.label,
                json!({
                    "step": run.step_name,
                    "task": task.label,
                    "attempt": attempt,
                    "step_run_id": run.step_run_id.to_string(),
                }),
            )?;

            let outcome = self.invoke_task(task, attempt, &task_scope).await;

            if let Some(result) = &outcome.result {
                results.insert(task.label.clone(), result.clone());
            }

            let outcome_value = outcome.to_value();
            self.emit_task_event(
                run,
                EventName::TaskProcessed,
                if outcome.is_success() {
                    EventStatus::Completed
                } else {
                    EventStatus::Failed
                },
                &task.label,
                json!({
                    "step": run.step_name,
                    "task": task.label,
                    "attempt": attempt,
                    "step_run_id": run.step_run_id.to_string(),
                    "outcome": self.externalized(&outcome_value, run, &task.label, attempt),
                }),
            )?;

            task_scope.insert("outcome".to_string(), outcome_value);
            let decision = decide(&self.renderer, &task.eval, &task_scope, &outcome);
            let rule = decision.rule;
            debug!(
                step = %run.step_name,
                task = %task.label,
                attempt,
                directive = %rule.directive,
                "task evaluated"
            );

            // Scope writes happen before the directive moves the counter.
            if rule.set_vars.is_some() && request.reject_vars_writes {
                return Ok(PipelineOutcome {
                    status: PipelineStatus::Failed,
                    prev,
                    results,
                    vars,
                    iter,
                    shared,
                    error: Some(OutcomeError {
                        kind: "config".into(),
                        retryable: false,
                        code: None,
                        message: format!(
                            "task '{}': set_vars is not allowed in parallel iterations; \
                             use set_iter or set_shared",
                            task.label
                        ),
                        details: None,
                    }),
                    failed_task: Some(task.label.clone()),
                });
            }

            // A scope write that cannot be rendered fails the step like a
            // bad task input: recorded, routable, never a silent drop.
            let write_result = self.apply_scope_writes(
                run, &rule, &task_scope, &outcome, &mut vars, &mut iter, &mut shared,
            );
            let next_prev = match write_result {
                Ok(value) => value,
                Err(EngineError::Template(message)) => {
                    warn!(
                        step = %run.step_name,
                        task = %task.label,
                        %message,
                        "scope write rendering failed"
                    );
                    return Ok(PipelineOutcome {
                        status: PipelineStatus::Failed,
                        prev,
                        results,
                        vars,
                        iter,
                        shared,
                        error: Some(OutcomeError {
                            kind: "template".into(),
                            retryable: false,
                            code: None,
                            message,
                            details: None,
                        }),
                        failed_task: Some(task.label.clone()),
                    });
                }
                Err(err) => return Err(err),
            };

            match rule.directive {
                Directive::Continue => {
                    prev = next_prev;
                    pc += 1;
                }
                Directive::Jump => {
                    let to = rule
                        .to
                        .as_deref()
                        .ok_or_else(|| EngineError::SchemaViolation("jump without 'to'".into()))?;
                    let target = tasks.iter().position(|t| t.label == to);
                    match target {
                        Some(index) => {
                            prev = next_prev;
                            pc = index;
                        }
                        None => return Err(EngineError::UnknownJumpTarget(to.to_string())),
                    }
                }
                Directive::Retry => {
                    if attempt >= rule.max_attempts() {
                        warn!(
                            step = %run.step_name,
                            task = %task.label,
                            attempt,
                            "retry attempts exhausted"
                        );
                        return Ok(PipelineOutcome {
                            status: PipelineStatus::Failed,
                            prev,
                            results,
                            vars,
                            iter,
                            shared,
                            error: Some(outcome.error.clone().unwrap_or(OutcomeError {
                                kind: "adapter".into(),
                                retryable: false,
                                code: None,
                                message: format!(
                                    "task '{}' failed after {} attempts",
                                    task.label, attempt
                                ),
                                details: None,
                            })),
                            failed_task: Some(task.label.clone()),
                        });
                    }
                    counts.insert(task.label.clone(), attempt);
                    let delay = rule.backoff.delay_secs(rule.delay.unwrap_or(0.0), attempt);
                    if delay > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                    // pc unchanged: same task, next attempt.
                }
                Directive::Break => {
                    return Ok(PipelineOutcome {
                        status: PipelineStatus::Broke,
                        prev: next_prev,
                        results,
                        vars,
                        iter,
                        shared,
                        error: None,
                        failed_task: None,
                    });
                }
                Directive::Fail => {
                    return Ok(PipelineOutcome {
                        status: PipelineStatus::Failed,
                        prev,
                        results,
                        vars,
                        iter,
                        shared,
                        error: Some(outcome.error.clone().unwrap_or(OutcomeError {
                            kind: "eval".into(),
                            retryable: false,
                            code: None,
                            message: format!("task '{}' failed by eval rule", task.label),
                            details: None,
                        })),
                        failed_task: Some(task.label.clone()),
                    });
                }
            }
        }

        Ok(PipelineOutcome {
            status: PipelineStatus::Completed,
            prev,
            results,
            vars,
            iter,
            shared,
            error: None,
            failed_task: None,
        })
    }

    /// Apply the selected rule's scope writes and return the value `_prev`
    /// takes for the next task.
    fn apply_scope_writes(
        &self,
        run: &StepRun,
        rule: &EvalRule,
        task_scope: &Map<String, Value>,
        outcome: &Outcome,
        vars: &mut Value,
        iter: &mut Value,
        shared: &mut Vec<Map<String, Value>>,
    ) -> EngineResult<Value> {
        if let Some(set_vars) = &rule.set_vars {
            let rendered = self
                .renderer
                .render_value(&Value::Object(set_vars.clone()), task_scope)?;
            tokenflow_core::value::merge_patch(vars, &rendered);
        }
        if let Some(set_iter) = &rule.set_iter {
            let rendered = self
                .renderer
                .render_value(&Value::Object(set_iter.clone()), task_scope)?;
            tokenflow_core::value::merge_patch(iter, &rendered);
        }
        if let Some(set_ctx) = &rule.set_ctx {
            let rendered = self
                .renderer
                .render_value(&Value::Object(set_ctx.clone()), task_scope)?;
            if let Value::Object(patch) = rendered {
                self.store
                    .apply_patch(run.execution_id, &patch, &run.step_run_id.to_string())?;
            }
        }
        if let Some(set_shared) = &rule.set_shared {
            let rendered = self
                .renderer
                .render_value(&Value::Object(set_shared.clone()), task_scope)?;
            if let Value::Object(patch) = rendered {
                shared.push(patch);
            }
        }

        match &rule.set_prev {
            Some(template) => self.renderer.render_value(template, task_scope),
            None => Ok(outcome.result.clone().unwrap_or(Value::Null)),
        }
    }

    /// Render inputs and invoke the adapter, folding every failure mode
    /// into an outcome so eval rules always get a value to match on.
    async fn invoke_task(
        &self,
        task: &TaskDef,
        attempt: u32,
        task_scope: &Map<String, Value>,
    ) -> Outcome {
        let started_at = Utc::now();
        let inputs = match self
            .renderer
            .render_value(&Value::Object(task.inputs.clone()), task_scope)
        {
            Ok(inputs) => inputs,
            Err(err) => {
                return Outcome::error(
                    OutcomeError {
                        kind: "template".into(),
                        retryable: false,
                        code: None,
                        message: err.to_string(),
                        details: None,
                    },
                    OutcomeMeta::new(attempt, started_at),
                );
            }
        };

        let invocation = Invocation {
            kind: task.kind.clone(),
            label: task.label.clone(),
            inputs,
            spec: task.spec.clone(),
        };

        let invoked = match task.timeout_ms() {
            Some(ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(ms),
                    self.adapters.invoke(&invocation),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::Timeout { ms }),
                }
            }
            None => self.adapters.invoke(&invocation).await,
        };

        let meta = OutcomeMeta::new(attempt, started_at);
        match invoked {
            Ok(result) => Outcome::success(result, meta).with_kind_helpers(&task.kind),
            Err(err) => Outcome::error(err.to_outcome_error(), meta).with_kind_helpers(&task.kind),
        }
    }

    fn externalized(&self, value: &Value, run: &StepRun, label: &str, attempt: u32) -> Value {
        let key = format!(
            "{}/{}/{}/{}",
            run.execution_id, run.step_run_id, label, attempt
        );
        externalize(value, self.externalize_threshold, &self.reference_store, &key)
    }

    fn emit_task_event(
        &self,
        run: &StepRun,
        name: EventName,
        status: EventStatus,
        label: &str,
        data: Value,
    ) -> EngineResult<u64> {
        self.log.append(Event::new(
            run.execution_id,
            EventSource::Worker,
            name,
            EntityKind::Task,
            label,
            status,
            data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FixtureAdapter;
    use tokenflow_core::{Step, Token};
    use uuid::Uuid;

    struct Harness {
        executor: PipelineExecutor,
        fixture: Arc<FixtureAdapter>,
        log: Arc<EventLog>,
        run: StepRun,
    }

    fn harness() -> Harness {
        let log = Arc::new(EventLog::new());
        let store = Arc::new(ContextStore::new(log.clone()));
        let fixture = Arc::new(FixtureAdapter::new());
        let mut registry = AdapterRegistry::with_builtins();
        registry.register_arc(fixture.clone());

        let execution_id = Uuid::new_v4();
        store
            .init_execution(execution_id, json!({"region": "eu"}))
            .unwrap();
        let run = StepRun::new(Token::new(execution_id, "work", json!({"page": 1})));

        Harness {
            executor: PipelineExecutor::new(
                Arc::new(registry),
                log.clone(),
                store,
                &EngineConfig::default(),
            ),
            fixture,
            log,
            run,
        }
    }

    fn tasks(yaml: &str) -> Vec<TaskDef> {
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        step.pipeline().unwrap()
    }

    fn request<'a>(run: &'a StepRun, tasks: &'a [TaskDef]) -> PipelineRequest<'a> {
        PipelineRequest {
            run,
            tasks,
            vars: json!({}),
            iter: json!({}),
            reject_vars_writes: false,
        }
    }

    #[tokio::test]
    async fn test_linear_pipeline_threads_prev() {
        let h = harness();
        h.fixture.push_ok(json!({"count": 7}));
        h.fixture.push_ok(json!({"doubled": 14}));
        let tasks = tasks(
            r#"
step: work
tool:
  - first:
      kind: fixture
  - second:
      kind: fixture
      inputs:
        from_prev: "{{ _prev.count }}"
"#,
        );

        let out = h.executor.execute(request(&h.run, &tasks)).await.unwrap();
        assert_eq!(out.status, PipelineStatus::Completed);
        assert_eq!(out.prev, json!({"doubled": 14}));
        assert_eq!(out.results["first"], json!({"count": 7}));
        // The second task saw the first task's result as _prev.
        assert_eq!(h.fixture.calls()[1], json!({"from_prev": 7}));
    }

    #[tokio::test]
    async fn test_task_events_recorded_in_order() {
        let h = harness();
        h.fixture.push_ok(json!(null));
        let tasks = tasks("step: work\ntool:\n  kind: fixture\n");

        h.executor.execute(request(&h.run, &tasks)).await.unwrap();
        let events = h.log.read(h.run.execution_id).unwrap();
        let names: Vec<EventName> = events.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![EventName::TaskStarted, EventName::TaskProcessed]);
        assert_eq!(events[0].data["task"], "main");
        assert_eq!(events[1].data["outcome"]["status"], "success");
    }

    #[tokio::test]
    async fn test_retry_exhaustion_counts_attempts() {
        let h = harness();
        for _ in 0..3 {
            h.fixture.push_err(AdapterError::failed("http", true, "503"));
        }
        let tasks = tasks(
            r#"
step: work
tool:
  kind: fixture
  eval:
    - expr: "outcome.status == 'error'"
      do: retry
      attempts: 3
      backoff: fixed
      delay: 0
"#,
        );

        let out = h.executor.execute(request(&h.run, &tasks)).await.unwrap();
        assert_eq!(out.status, PipelineStatus::Failed);
        assert_eq!(h.fixture.call_count(), 3);
        assert_eq!(out.error.as_ref().map(|e| e.kind.as_str()), Some("http"));
        assert_eq!(out.failed_task.as_deref(), Some("main"));

        // Three task.started / task.processed pairs, attempts 1..=3.
        let events = h.log.read(h.run.execution_id).unwrap();
        let attempts: Vec<u64> = events
            .iter()
            .filter(|e| e.name == EventName::TaskProcessed)
            .filter_map(|e| e.data_u64("attempt"))
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let h = harness();
        h.fixture.push_err(AdapterError::failed("http", true, "503"));
        h.fixture.push_ok(json!({"ok": true}));
        let tasks = tasks(
            r#"
step: work
tool:
  kind: fixture
  eval:
    - expr: "outcome.status == 'error' and outcome.error.retryable"
      do: retry
      attempts: 3
      delay: 0
"#,
        );

        let out = h.executor.execute(request(&h.run, &tasks)).await.unwrap();
        assert_eq!(out.status, PipelineStatus::Completed);
        assert_eq!(out.prev, json!({"ok": true}));
        assert_eq!(h.fixture.call_count(), 2);
    }

    #[tokio::test]
    async fn test_jump_and_break_pagination() {
        let h = harness();
        h.fixture.push_ok(json!({"items": [1, 2], "next": 2}));
        h.fixture.push_ok(json!({"items": [3], "next": null}));
        let tasks = tasks(
            r#"
step: work
tool:
  - fetch:
      kind: fixture
      inputs:
        page: "{{ vars.page | default(1) }}"
      eval:
        - expr: "outcome.result.next"
          do: jump
          to: fetch
          set_vars:
            page: "{{ outcome.result.next }}"
        - else:
            do: break
"#,
        );

        let out = h.executor.execute(request(&h.run, &tasks)).await.unwrap();
        assert_eq!(out.status, PipelineStatus::Broke);
        assert_eq!(h.fixture.call_count(), 2);
        assert_eq!(h.fixture.calls()[0], json!({"page": 1}));
        assert_eq!(h.fixture.calls()[1], json!({"page": 2}));
        assert_eq!(out.vars, json!({"page": 2}));
    }

    #[tokio::test]
    async fn test_set_ctx_records_patch_event() {
        let h = harness();
        h.fixture.push_ok(json!({"rows": 5}));
        let tasks = tasks(
            r#"
step: work
tool:
  kind: fixture
  eval:
    - expr: "outcome.status == 'success'"
      do: continue
      set_ctx:
        total_rows: "{{ outcome.result.rows }}"
"#,
        );

        h.executor.execute(request(&h.run, &tasks)).await.unwrap();
        let events = h.log.read(h.run.execution_id).unwrap();
        let patch = events
            .iter()
            .find(|e| e.name == EventName::CtxPatched)
            .unwrap();
        assert_eq!(patch.data["patch"], json!({"total_rows": 5}));
    }

    #[tokio::test]
    async fn test_set_vars_rejected_in_parallel_iteration() {
        let h = harness();
        h.fixture.push_ok(json!(null));
        let tasks = tasks(
            r#"
step: work
tool:
  kind: fixture
  eval:
    - expr: "outcome.status == 'success'"
      do: continue
      set_vars:
        x: 1
"#,
        );

        let mut req = request(&h.run, &tasks);
        req.reject_vars_writes = true;
        let out = h.executor.execute(req).await.unwrap();
        assert_eq!(out.status, PipelineStatus::Failed);
        assert_eq!(out.error.as_ref().map(|e| e.kind.as_str()), Some("config"));
    }

    #[tokio::test]
    async fn test_default_fail_on_error_outcome() {
        let h = harness();
        h.fixture
            .push_err(AdapterError::failed("pg", false, "unique violation"));
        let tasks = tasks("step: work\ntool:\n  kind: fixture\n");

        let out = h.executor.execute(request(&h.run, &tasks)).await.unwrap();
        assert_eq!(out.status, PipelineStatus::Failed);
        assert_eq!(out.error.as_ref().map(|e| e.kind.as_str()), Some("pg"));
    }

    #[tokio::test]
    async fn test_template_failure_is_error_outcome() {
        let h = harness();
        h.fixture.push_ok(json!(null));
        let tasks = tasks(
            r#"
step: work
tool:
  kind: fixture
  inputs:
    bad: "{{ workload.a ~!! nonsense }}"
"#,
        );

        let out = h.executor.execute(request(&h.run, &tasks)).await.unwrap();
        assert_eq!(out.status, PipelineStatus::Failed);
        assert_eq!(out.error.as_ref().map(|e| e.kind.as_str()), Some("template"));
        // Adapter never invoked.
        assert_eq!(h.fixture.call_count(), 0);
    }

    #[tokio::test]
    async fn test_scope_write_template_failure_fails_pipeline() {
        let h = harness();
        h.fixture.push_ok(json!({"ok": true}));
        let tasks = tasks(
            r#"
step: work
tool:
  kind: fixture
  eval:
    - expr: "outcome.status == 'success'"
      do: continue
      set_vars:
        x: "{{ workload.a ~!! nonsense }}"
"#,
        );

        let out = h.executor.execute(request(&h.run, &tasks)).await.unwrap();
        assert_eq!(out.status, PipelineStatus::Failed);
        assert_eq!(out.error.as_ref().map(|e| e.kind.as_str()), Some("template"));
        assert_eq!(out.failed_task.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes() {
        let h = harness();
        let out = h.executor.execute(request(&h.run, &[])).await.unwrap();
        assert_eq!(out.status, PipelineStatus::Completed);
        assert_eq!(out.prev, Value::Null);
    }
}
