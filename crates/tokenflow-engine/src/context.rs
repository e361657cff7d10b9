//! Materialized `ctx` per execution.
//!
//! `ctx` is a pure function of recorded `ctx.patched` events: every write
//! goes through [`ContextStore::apply_patch`], which appends the patch event
//! first and folds it into the cache second. Replaying the log yields the
//! same value, and snapshot-plus-tail resume lands on the same value too.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tracing::debug;

use tokenflow_core::value::merge_patch;
use tokenflow_core::{
    EngineError, EngineResult, EntityKind, Event, EventName, EventSource, EventStatus, ExecutionId,
};

use crate::log::EventLog;

/// Point-in-time view of ctx, valid as of `seq`.
#[derive(Debug, Clone, PartialEq)]
pub struct CtxSnapshot {
    pub seq: u64,
    pub ctx: Value,
}

struct ExecutionCtx {
    workload: Value,
    ctx: Value,
}

/// Store of per-execution scopes: immutable workload, patch-only ctx.
pub struct ContextStore {
    log: Arc<EventLog>,
    inner: Mutex<HashMap<ExecutionId, ExecutionCtx>>,
}

impl ContextStore {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            log,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register an execution with its immutable workload. Ctx starts empty.
    pub fn init_execution(&self, execution_id: ExecutionId, workload: Value) -> EngineResult<()> {
        let mut inner = self.lock()?;
        inner.insert(
            execution_id,
            ExecutionCtx {
                workload,
                ctx: json!({}),
            },
        );
        Ok(())
    }

    pub fn workload(&self, execution_id: ExecutionId) -> EngineResult<Value> {
        let inner = self.lock()?;
        inner
            .get(&execution_id)
            .map(|e| e.workload.clone())
            .ok_or_else(|| EngineError::Internal(format!("unknown execution {}", execution_id)))
    }

    pub fn ctx(&self, execution_id: ExecutionId) -> EngineResult<Value> {
        let inner = self.lock()?;
        inner
            .get(&execution_id)
            .map(|e| e.ctx.clone())
            .ok_or_else(|| EngineError::Internal(format!("unknown execution {}", execution_id)))
    }

    /// Apply a ctx patch: record the `ctx.patched` event, then fold it in.
    /// The event carries the full patch, so replay reproduces the merge.
    pub fn apply_patch(
        &self,
        execution_id: ExecutionId,
        patch: &Map<String, Value>,
        source_step_run: &str,
    ) -> EngineResult<u64> {
        let event = Event::new(
            execution_id,
            EventSource::Worker,
            EventName::CtxPatched,
            EntityKind::Execution,
            execution_id.to_string(),
            EventStatus::Completed,
            json!({
                "patch": Value::Object(patch.clone()),
                "step_run_id": source_step_run,
            }),
        );
        let seq = self.log.append(event)?;

        let mut inner = self.lock()?;
        let entry = inner
            .get_mut(&execution_id)
            .ok_or_else(|| EngineError::Internal(format!("unknown execution {}", execution_id)))?;
        merge_patch(&mut entry.ctx, &Value::Object(patch.clone()));
        debug!(execution_id = %execution_id, seq, "ctx patch applied");
        Ok(seq)
    }

    /// Restore cached scopes from replayed values, e.g. after a restart.
    pub fn restore(&self, execution_id: ExecutionId, workload: Value, ctx: Value) -> EngineResult<()> {
        let mut inner = self.lock()?;
        inner.insert(execution_id, ExecutionCtx { workload, ctx });
        Ok(())
    }

    /// Current ctx with the log position it reflects.
    pub fn snapshot(&self, execution_id: ExecutionId) -> EngineResult<CtxSnapshot> {
        let seq = self.log.last_seq(execution_id)?;
        Ok(CtxSnapshot {
            seq,
            ctx: self.ctx(execution_id)?,
        })
    }

    /// Fold ctx from scratch out of a recorded event sequence.
    pub fn materialize(events: &[Event]) -> Value {
        let mut ctx = json!({});
        for event in events {
            Self::fold_event(&mut ctx, event);
        }
        ctx
    }

    /// Resume from a snapshot by folding only the tail after `snapshot.seq`.
    pub fn resume(snapshot: &CtxSnapshot, tail: &[Event]) -> Value {
        let mut ctx = snapshot.ctx.clone();
        for event in tail.iter().filter(|e| e.seq > snapshot.seq) {
            Self::fold_event(&mut ctx, event);
        }
        ctx
    }

    fn fold_event(ctx: &mut Value, event: &Event) {
        if event.name == EventName::CtxPatched {
            if let Some(patch) = event.data.get("patch") {
                merge_patch(ctx, patch);
            }
        }
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, HashMap<ExecutionId, ExecutionCtx>>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Internal("context store lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn store() -> (Arc<EventLog>, ContextStore, ExecutionId) {
        let log = Arc::new(EventLog::new());
        let store = ContextStore::new(log.clone());
        let execution_id = Uuid::new_v4();
        store
            .init_execution(execution_id, json!({"region": "eu"}))
            .unwrap();
        (log, store, execution_id)
    }

    fn patch(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_ctx_starts_empty() {
        let (_, store, execution_id) = store();
        assert_eq!(store.ctx(execution_id).unwrap(), json!({}));
        assert_eq!(store.workload(execution_id).unwrap(), json!({"region": "eu"}));
    }

    #[test]
    fn test_patch_records_event_then_merges() {
        let (log, store, execution_id) = store();
        store
            .apply_patch(execution_id, &patch(json!({"page": 1})), "run-1")
            .unwrap();
        store
            .apply_patch(execution_id, &patch(json!({"page": 2, "total": 10})), "run-1")
            .unwrap();

        assert_eq!(store.ctx(execution_id).unwrap(), json!({"page": 2, "total": 10}));

        let events = log.read(execution_id).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.name == EventName::CtxPatched));
        assert_eq!(events[0].data["patch"], json!({"page": 1}));
    }

    #[test]
    fn test_materialize_equals_live_ctx() {
        let (log, store, execution_id) = store();
        store
            .apply_patch(execution_id, &patch(json!({"a": {"b": 1}})), "run-1")
            .unwrap();
        store
            .apply_patch(execution_id, &patch(json!({"a": {"c": 2}})), "run-2")
            .unwrap();

        let events = log.read(execution_id).unwrap();
        assert_eq!(ContextStore::materialize(&events), store.ctx(execution_id).unwrap());
    }

    #[test]
    fn test_snapshot_resume_equals_full_replay() {
        let (log, store, execution_id) = store();
        store
            .apply_patch(execution_id, &patch(json!({"page": 1})), "run-1")
            .unwrap();
        let snapshot = store.snapshot(execution_id).unwrap();
        store
            .apply_patch(execution_id, &patch(json!({"page": 2})), "run-2")
            .unwrap();

        let events = log.read(execution_id).unwrap();
        let resumed = ContextStore::resume(&snapshot, &events);
        assert_eq!(resumed, ContextStore::materialize(&events));
        assert_eq!(resumed, json!({"page": 2}));
    }

    #[test]
    fn test_reapplying_patch_event_is_idempotent() {
        let (log, store, execution_id) = store();
        store
            .apply_patch(execution_id, &patch(json!({"seen": {"ids": [1, 2]}})), "run-1")
            .unwrap();

        let events = log.read(execution_id).unwrap();
        let mut ctx = ContextStore::materialize(&events);
        // Folding the same recorded patch again must not change the value.
        ContextStore::fold_event(&mut ctx, &events[0]);
        assert_eq!(ctx, store.ctx(execution_id).unwrap());
    }
}
