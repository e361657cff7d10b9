//! Append-only per-execution event log.
//!
//! Events for one execution are totally ordered by `seq`, assigned under the
//! log lock at append time. An append is acknowledged only once the record
//! is in the store; derived state updates always happen after the append
//! returns.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use tokenflow_core::{EngineError, EngineResult, Event, ExecutionId};

/// In-process durable store for execution events.
///
/// Backed by memory here; the interface (ordered append, replay reads) is
/// what the rest of the engine programs against.
#[derive(Default)]
pub struct EventLog {
    inner: Mutex<HashMap<ExecutionId, Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, assigning it the next sequence number for its
    /// execution. Returns the assigned seq.
    pub fn append(&self, mut event: Event) -> EngineResult<u64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::LogDurability("log lock poisoned".into()))?;
        let events = inner.entry(event.execution_id).or_default();
        event.seq = events.len() as u64 + 1;
        let seq = event.seq;
        debug!(
            execution_id = %event.execution_id,
            seq,
            name = %event.name,
            entity_id = %event.entity_id,
            "append event"
        );
        events.push(event);
        Ok(seq)
    }

    /// Read the full event sequence for an execution.
    pub fn read(&self, execution_id: ExecutionId) -> EngineResult<Vec<Event>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::LogDurability("log lock poisoned".into()))?;
        Ok(inner.get(&execution_id).cloned().unwrap_or_default())
    }

    /// Read events with `seq > after_seq`, for incremental replay.
    pub fn read_after(&self, execution_id: ExecutionId, after_seq: u64) -> EngineResult<Vec<Event>> {
        let events = self.read(execution_id)?;
        Ok(events.into_iter().filter(|e| e.seq > after_seq).collect())
    }

    /// Highest assigned seq for an execution, zero if none.
    pub fn last_seq(&self, execution_id: ExecutionId) -> EngineResult<u64> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::LogDurability("log lock poisoned".into()))?;
        Ok(inner
            .get(&execution_id)
            .map(|events| events.len() as u64)
            .unwrap_or(0))
    }

    /// Count events matching a predicate; used by completion checks and
    /// tests.
    pub fn count_where(
        &self,
        execution_id: ExecutionId,
        predicate: impl Fn(&Event) -> bool,
    ) -> EngineResult<usize> {
        Ok(self
            .read(execution_id)?
            .iter()
            .filter(|e| predicate(e))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokenflow_core::{EntityKind, EventName, EventSource, EventStatus};
    use uuid::Uuid;

    fn event(execution_id: ExecutionId, name: EventName) -> Event {
        Event::new(
            execution_id,
            EventSource::Server,
            name,
            EntityKind::Execution,
            execution_id.to_string(),
            EventStatus::Started,
            json!({}),
        )
    }

    #[test]
    fn test_append_assigns_monotonic_seq() {
        let log = EventLog::new();
        let execution_id = Uuid::new_v4();

        let s1 = log.append(event(execution_id, EventName::WorkflowStarted)).unwrap();
        let s2 = log.append(event(execution_id, EventName::TokenEnqueued)).unwrap();
        let s3 = log.append(event(execution_id, EventName::StepScheduled)).unwrap();
        assert_eq!((s1, s2, s3), (1, 2, 3));

        let events = log.read(execution_id).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_sequences_are_per_execution() {
        let log = EventLog::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        log.append(event(a, EventName::WorkflowStarted)).unwrap();
        log.append(event(a, EventName::TokenEnqueued)).unwrap();
        let seq_b = log.append(event(b, EventName::WorkflowStarted)).unwrap();
        assert_eq!(seq_b, 1);
        assert_eq!(log.last_seq(a).unwrap(), 2);
        assert_eq!(log.last_seq(b).unwrap(), 1);
    }

    #[test]
    fn test_read_after() {
        let log = EventLog::new();
        let execution_id = Uuid::new_v4();
        for name in [
            EventName::WorkflowStarted,
            EventName::TokenEnqueued,
            EventName::StepScheduled,
        ] {
            log.append(event(execution_id, name)).unwrap();
        }
        let tail = log.read_after(execution_id, 1).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 2);
    }

    #[test]
    fn test_read_unknown_execution_is_empty() {
        let log = EventLog::new();
        assert!(log.read(Uuid::new_v4()).unwrap().is_empty());
        assert_eq!(log.last_seq(Uuid::new_v4()).unwrap(), 0);
    }
}
