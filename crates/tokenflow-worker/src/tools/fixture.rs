//! Scripted adapter for tests and dry runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::adapter::{AdapterError, Invocation, ToolAdapter};

/// Adapter that replays a scripted sequence of results and records every
/// invocation it receives. Script entries are consumed in order across all
/// calls; an exhausted script is a non-retryable failure.
#[derive(Default)]
pub struct FixtureAdapter {
    script: Mutex<VecDeque<Result<Value, AdapterError>>>,
    calls: Mutex<Vec<Value>>,
}

impl FixtureAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, result: Value) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(result));
        }
    }

    pub fn push_err(&self, error: AdapterError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
    }

    /// Rendered inputs seen so far, in call order.
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ToolAdapter for FixtureAdapter {
    fn kind(&self) -> &'static str {
        "fixture"
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<Value, AdapterError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.inputs.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(result) => result,
            None => Err(AdapterError::failed(
                "adapter",
                false,
                "fixture script exhausted",
            )),
        }
    }
}
