//! Iteration manager: loop steps over a resolved collection.
//!
//! Each element runs the step's pipeline once with an isolated `iter` scope.
//! Sequential mode runs in collection order and carries `vars` forward;
//! parallel mode runs under a concurrency cap with per-iteration `vars`
//! copies, and only `set_shared` patches survive, applied in ascending
//! iteration index order after every iteration has finished. Failed
//! iterations never stop their siblings.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use tokenflow_core::value::{merge_patch, scope};
use tokenflow_core::{
    EngineError, EngineResult, EntityKind, Event, EventName, EventSource, EventStatus, LoopDef,
    LoopMode, StepRun, TaskDef,
};
use tokenflow_engine::{ContextStore, EventLog};

use crate::pipeline::{PipelineExecutor, PipelineOutcome, PipelineRequest, PipelineStatus};

/// Aggregate result of a loop step.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Per-iteration result values, in collection order.
    pub results: Vec<Value>,
    /// Indices of failed iterations; empty means full success.
    pub failed: Vec<usize>,
    /// Step-run vars after the loop, including applied `set_shared` patches.
    pub vars: Value,
    pub count: usize,
}

impl LoopOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs loop steps on top of the pipeline executor.
pub struct IterationManager {
    executor: Arc<PipelineExecutor>,
    log: Arc<EventLog>,
    store: Arc<ContextStore>,
}

impl IterationManager {
    pub fn new(executor: Arc<PipelineExecutor>, log: Arc<EventLog>, store: Arc<ContextStore>) -> Self {
        Self { executor, log, store }
    }

    pub async fn run_loop(
        &self,
        run: &StepRun,
        loop_def: &LoopDef,
        tasks: &[TaskDef],
        base_vars: Value,
    ) -> EngineResult<LoopOutcome> {
        let elements = self.resolve_collection(run, loop_def, &base_vars)?;
        let count = elements.len();
        let mode = loop_def.spec.mode;
        info!(step = %run.step_name, count, mode = ?mode, "loop started");

        self.emit_loop_event(
            run,
            EventName::LoopStarted,
            EventStatus::Started,
            json!({
                "step": run.step_name,
                "count": count,
                "mode": mode,
                "iterator": loop_def.iterator,
            }),
        )?;

        let outcome = match mode {
            LoopMode::Sequential => {
                self.run_sequential(run, loop_def, tasks, base_vars, elements)
                    .await?
            }
            LoopMode::Parallel => {
                self.run_parallel(run, loop_def, tasks, base_vars, elements)
                    .await?
            }
        };

        debug!(
            step = %run.step_name,
            failed = outcome.failed.len(),
            "loop iterations finished"
        );
        Ok(outcome)
    }

    async fn run_sequential(
        &self,
        run: &StepRun,
        loop_def: &LoopDef,
        tasks: &[TaskDef],
        mut vars: Value,
        elements: Vec<Value>,
    ) -> EngineResult<LoopOutcome> {
        let count = elements.len();
        let mut results = Vec::with_capacity(count);
        let mut failed = Vec::new();

        for (index, element) in elements.into_iter().enumerate() {
            self.emit_iteration(run, index, EventName::LoopIterationStarted, EventStatus::Started)?;
            let iter = iter_scope(loop_def, &element, index, count);
            let outcome = self
                .executor
                .execute(PipelineRequest {
                    run,
                    tasks,
                    vars: vars.clone(),
                    iter,
                    reject_vars_writes: false,
                })
                .await?;

            let status = self.finish_iteration(run, index, &outcome)?;
            if status == PipelineStatus::Failed {
                failed.push(index);
            } else {
                // Sequential iterations see vars written by their
                // predecessors; shared patches fold in immediately.
                vars = outcome.vars.clone();
                for patch in &outcome.shared {
                    merge_patch(&mut vars, &Value::Object(patch.clone()));
                }
            }
            results.push(outcome.prev);
        }

        Ok(LoopOutcome {
            results,
            failed,
            vars,
            count,
        })
    }

    async fn run_parallel(
        &self,
        run: &StepRun,
        loop_def: &LoopDef,
        tasks: &[TaskDef],
        base_vars: Value,
        elements: Vec<Value>,
    ) -> EngineResult<LoopOutcome> {
        let count = elements.len();
        let limit = loop_def.spec.max_in_flight.unwrap_or(count.max(1));
        let semaphore = Arc::new(Semaphore::new(limit));

        let futures = elements.into_iter().enumerate().map(|(index, element)| {
            let semaphore = semaphore.clone();
            let vars = base_vars.clone();
            let iter = iter_scope(loop_def, &element, index, count);
            async move {
                let permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Internal(e.to_string()))?;
                self.emit_iteration(
                    run,
                    index,
                    EventName::LoopIterationStarted,
                    EventStatus::Started,
                )?;
                let outcome = self
                    .executor
                    .execute(PipelineRequest {
                        run,
                        tasks,
                        vars,
                        iter,
                        reject_vars_writes: true,
                    })
                    .await?;
                drop(permit);
                Ok::<(usize, PipelineOutcome), EngineError>((index, outcome))
            }
        });

        let mut outcomes = Vec::with_capacity(count);
        for result in join_all(futures).await {
            outcomes.push(result?);
        }
        outcomes.sort_by_key(|(index, _)| *index);

        let mut results = Vec::with_capacity(count);
        let mut failed = Vec::new();
        let mut vars = base_vars;
        for (index, outcome) in &outcomes {
            let status = self.finish_iteration(run, *index, outcome)?;
            if status == PipelineStatus::Failed {
                failed.push(*index);
            }
            results.push(outcome.prev.clone());
        }
        // Shared patches apply deterministically: ascending iteration index,
        // regardless of completion order.
        for (_, outcome) in &outcomes {
            for patch in &outcome.shared {
                merge_patch(&mut vars, &Value::Object(patch.clone()));
            }
        }

        Ok(LoopOutcome {
            results,
            failed,
            vars,
            count,
        })
    }

    fn finish_iteration(
        &self,
        run: &StepRun,
        index: usize,
        outcome: &PipelineOutcome,
    ) -> EngineResult<PipelineStatus> {
        let status = outcome.status;
        self.emit_iteration(
            run,
            index,
            EventName::LoopIterationCompleted,
            if status.is_success() {
                EventStatus::Completed
            } else {
                EventStatus::Failed
            },
        )?;
        Ok(status)
    }

    /// Resolve `loop.in` into a list of elements.
    ///
    /// Arrays iterate as-is; objects iterate as `{key, value}` pairs in key
    /// order; a non-negative integer `n` iterates `0..n`; a string is
    /// parsed as a JSON array, falling back to a comma split. Anything else
    /// is a fatal [`EngineError::InvalidCollection`].
    fn resolve_collection(
        &self,
        run: &StepRun,
        loop_def: &LoopDef,
        vars: &Value,
    ) -> EngineResult<Vec<Value>> {
        let workload = self.store.workload(run.execution_id)?;
        let ctx = self.store.ctx(run.execution_id)?;
        let loop_scope = scope(&[
            ("workload", &workload),
            ("ctx", &ctx),
            ("vars", vars),
            ("args", &run.token.args),
        ]);
        let resolved = self
            .executor
            .renderer()
            .eval_expr(&loop_def.collection, &loop_scope)
            .map_err(|e| EngineError::InvalidCollection(e.to_string()))?;

        match resolved {
            Value::Array(items) => Ok(items),
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(key, value)| json!({"key": key, "value": value}))
                .collect()),
            Value::Number(n) => match n.as_u64() {
                Some(end) => Ok((0..end).map(|i| json!(i)).collect()),
                None => Err(EngineError::InvalidCollection(format!(
                    "numeric collection must be a non-negative integer, got {}",
                    n
                ))),
            },
            Value::String(s) => {
                if let Ok(Value::Array(items)) = serde_json::from_str(&s) {
                    return Ok(items);
                }
                Ok(s.split(',')
                    .map(|part| Value::String(part.trim().to_string()))
                    .collect())
            }
            other => Err(EngineError::InvalidCollection(format!(
                "expression '{}' produced non-iterable {}",
                loop_def.collection, other
            ))),
        }
    }

    fn emit_iteration(
        &self,
        run: &StepRun,
        index: usize,
        name: EventName,
        status: EventStatus,
    ) -> EngineResult<u64> {
        self.emit_loop_event(
            run,
            name,
            status,
            json!({
                "step": run.step_name,
                "index": index,
                "step_run_id": run.step_run_id.to_string(),
            }),
        )
    }

    fn emit_loop_event(
        &self,
        run: &StepRun,
        name: EventName,
        status: EventStatus,
        data: Value,
    ) -> EngineResult<u64> {
        self.log.append(Event::new(
            run.execution_id,
            EventSource::Worker,
            name,
            EntityKind::Loop,
            run.step_run_id.to_string(),
            status,
            data,
        ))
    }
}

fn iter_scope(loop_def: &LoopDef, element: &Value, index: usize, count: usize) -> Value {
    let mut map = Map::new();
    map.insert(loop_def.iterator.clone(), element.clone());
    map.insert("index".to_string(), json!(index));
    map.insert("count".to_string(), json!(count));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterRegistry;
    use crate::tools::FixtureAdapter;
    use tokenflow_core::{Step, Token};
    use tokenflow_engine::EngineConfig;
    use uuid::Uuid;

    struct Harness {
        manager: IterationManager,
        fixture: Arc<FixtureAdapter>,
        log: Arc<EventLog>,
        run: StepRun,
    }

    fn harness(workload: Value) -> Harness {
        let log = Arc::new(EventLog::new());
        let store = Arc::new(ContextStore::new(log.clone()));
        let fixture = Arc::new(FixtureAdapter::new());
        let mut registry = AdapterRegistry::with_builtins();
        registry.register_arc(fixture.clone());

        let execution_id = Uuid::new_v4();
        store.init_execution(execution_id, workload).unwrap();
        let run = StepRun::new(Token::new(execution_id, "fan_out", json!({})));

        let executor = Arc::new(PipelineExecutor::new(
            Arc::new(registry),
            log.clone(),
            store.clone(),
            &EngineConfig::default(),
        ));
        Harness {
            manager: IterationManager::new(executor, log.clone(), store),
            fixture,
            log,
            run,
        }
    }

    fn step(yaml: &str) -> Step {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_sequential_loop_in_order() {
        let h = harness(json!({"items": ["a", "b", "c"]}));
        for _ in 0..3 {
            h.fixture.push_ok(json!("done"));
        }
        let step = step(
            r#"
step: fan_out
loop:
  in: "{{ workload.items }}"
  iterator: item
tool:
  kind: fixture
  inputs:
    current: "{{ iter.item }}"
    position: "{{ iter.index }}"
"#,
        );
        let loop_def = step.loop_def.clone().unwrap();
        let tasks = step.pipeline().unwrap();

        let out = h
            .manager
            .run_loop(&h.run, &loop_def, &tasks, json!({}))
            .await
            .unwrap();
        assert!(out.is_success());
        assert_eq!(out.count, 3);
        assert_eq!(
            h.fixture.calls(),
            vec![
                json!({"current": "a", "position": 0}),
                json!({"current": "b", "position": 1}),
                json!({"current": "c", "position": 2}),
            ]
        );
    }

    #[tokio::test]
    async fn test_parallel_iterations_isolated() {
        let h = harness(json!({"items": [1, 2, 3, 4]}));
        for _ in 0..4 {
            h.fixture.push_ok(json!("ok"));
        }
        let step = step(
            r#"
step: fan_out
loop:
  in: "{{ workload.items }}"
  iterator: n
  spec:
    mode: parallel
    max_in_flight: 2
tool:
  kind: fixture
  inputs:
    n: "{{ iter.n }}"
  eval:
    - expr: "outcome.status == 'success'"
      do: continue
      set_iter:
        local: "{{ iter.n }}"
"#,
        );
        let loop_def = step.loop_def.clone().unwrap();
        let tasks = step.pipeline().unwrap();

        let out = h
            .manager
            .run_loop(&h.run, &loop_def, &tasks, json!({"base": true}))
            .await
            .unwrap();
        assert!(out.is_success());
        // set_iter writes stay inside their iteration; vars unchanged.
        assert_eq!(out.vars, json!({"base": true}));
        assert_eq!(out.results.len(), 4);
    }

    #[tokio::test]
    async fn test_parallel_shared_patches_apply_in_index_order() {
        let h = harness(json!({"items": ["x", "y"]}));
        for _ in 0..2 {
            h.fixture.push_ok(json!("ok"));
        }
        let step = step(
            r#"
step: fan_out
loop:
  in: "{{ workload.items }}"
  iterator: item
  spec:
    mode: parallel
tool:
  kind: fixture
  eval:
    - expr: "outcome.status == 'success'"
      do: continue
      set_shared:
        last: "{{ iter.item }}"
"#,
        );
        let loop_def = step.loop_def.clone().unwrap();
        let tasks = step.pipeline().unwrap();

        let out = h
            .manager
            .run_loop(&h.run, &loop_def, &tasks, json!({}))
            .await
            .unwrap();
        // Highest index wins deterministically.
        assert_eq!(out.vars, json!({"last": "y"}));
    }

    #[tokio::test]
    async fn test_failed_iteration_does_not_stop_siblings() {
        let h = harness(json!({"items": [1, 2, 3]}));
        h.fixture.push_ok(json!("ok"));
        h.fixture
            .push_err(crate::adapter::AdapterError::failed("http", false, "410"));
        h.fixture.push_ok(json!("ok"));
        let step = step(
            r#"
step: fan_out
loop:
  in: "{{ workload.items }}"
  iterator: n
tool:
  kind: fixture
"#,
        );
        let loop_def = step.loop_def.clone().unwrap();
        let tasks = step.pipeline().unwrap();

        let out = h
            .manager
            .run_loop(&h.run, &loop_def, &tasks, json!({}))
            .await
            .unwrap();
        assert!(!out.is_success());
        assert_eq!(out.failed, vec![1]);
        assert_eq!(out.results.len(), 3);
        assert_eq!(h.fixture.call_count(), 3);
    }

    #[tokio::test]
    async fn test_object_collection_iterates_pairs() {
        let h = harness(json!({"regions": {"eu": 1, "us": 2}}));
        for _ in 0..2 {
            h.fixture.push_ok(json!("ok"));
        }
        let step = step(
            r#"
step: fan_out
loop:
  in: "{{ workload.regions }}"
  iterator: region
tool:
  kind: fixture
  inputs:
    name: "{{ iter.region.key }}"
    weight: "{{ iter.region.value }}"
"#,
        );
        let loop_def = step.loop_def.clone().unwrap();
        let tasks = step.pipeline().unwrap();

        let out = h
            .manager
            .run_loop(&h.run, &loop_def, &tasks, json!({}))
            .await
            .unwrap();
        assert!(out.is_success());
        assert_eq!(
            h.fixture.calls(),
            vec![
                json!({"name": "eu", "weight": 1}),
                json!({"name": "us", "weight": 2}),
            ]
        );
    }

    #[tokio::test]
    async fn test_integer_collection_is_range() {
        let h = harness(json!({"n": 3}));
        for _ in 0..3 {
            h.fixture.push_ok(json!("ok"));
        }
        let step = step(
            r#"
step: fan_out
loop:
  in: "{{ workload.n }}"
  iterator: i
tool:
  kind: fixture
  inputs:
    i: "{{ iter.i }}"
"#,
        );
        let loop_def = step.loop_def.clone().unwrap();
        let tasks = step.pipeline().unwrap();

        let out = h
            .manager
            .run_loop(&h.run, &loop_def, &tasks, json!({}))
            .await
            .unwrap();
        assert_eq!(out.count, 3);
        assert_eq!(h.fixture.calls()[2], json!({"i": 2}));
    }

    #[tokio::test]
    async fn test_non_iterable_collection_fails() {
        let h = harness(json!({"flag": true}));
        let step = step(
            r#"
step: fan_out
loop:
  in: "{{ workload.flag }}"
  iterator: x
tool:
  kind: fixture
"#,
        );
        let loop_def = step.loop_def.clone().unwrap();
        let tasks = step.pipeline().unwrap();

        let err = h
            .manager
            .run_loop(&h.run, &loop_def, &tasks, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidCollection(_)));
    }

    #[tokio::test]
    async fn test_loop_events_recorded() {
        let h = harness(json!({"items": [1]}));
        h.fixture.push_ok(json!("ok"));
        let step = step(
            r#"
step: fan_out
loop:
  in: "{{ workload.items }}"
  iterator: n
tool:
  kind: fixture
"#,
        );
        let loop_def = step.loop_def.clone().unwrap();
        let tasks = step.pipeline().unwrap();
        h.manager
            .run_loop(&h.run, &loop_def, &tasks, json!({}))
            .await
            .unwrap();

        let names: Vec<EventName> = h
            .log
            .read(h.run.execution_id)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&EventName::LoopStarted));
        assert!(names.contains(&EventName::LoopIterationStarted));
        assert!(names.contains(&EventName::LoopIterationCompleted));
    }
}
