//! Tool adapter trait and registry.
//!
//! Adapters are the only boundary to the outside world. They receive fully
//! rendered inputs and return either a JSON result or a classified error;
//! retry policy lives in eval rules, never inside an adapter.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use tokenflow_core::OutcomeError;

/// One rendered tool invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub kind: String,
    /// Pipeline task label, for diagnostics.
    pub label: String,
    /// Rendered inputs; templates are already resolved.
    pub inputs: Value,
    /// Runtime knobs from the task's `spec` block.
    pub spec: Map<String, Value>,
}

/// Classified adapter failure.
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    #[error("no adapter registered for kind '{0}'")]
    NotFound(String),

    #[error("{message}")]
    Failed {
        /// Error class: "http", "pg", "py", "adapter".
        kind: String,
        retryable: bool,
        code: Option<String>,
        message: String,
        details: Option<Value>,
    },

    #[error("invocation timed out after {ms}ms")]
    Timeout { ms: u64 },
}

impl AdapterError {
    pub fn failed(kind: &str, retryable: bool, message: impl Into<String>) -> Self {
        AdapterError::Failed {
            kind: kind.to_string(),
            retryable,
            code: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            AdapterError::NotFound(_) => false,
            AdapterError::Failed { retryable, .. } => *retryable,
            AdapterError::Timeout { .. } => true,
        }
    }

    /// Convert into the outcome error envelope eval rules match on.
    pub fn to_outcome_error(&self) -> OutcomeError {
        match self {
            AdapterError::NotFound(kind) => OutcomeError {
                kind: "config".into(),
                retryable: false,
                code: None,
                message: format!("no adapter registered for kind '{}'", kind),
                details: None,
            },
            AdapterError::Failed {
                kind,
                retryable,
                code,
                message,
                details,
            } => OutcomeError {
                kind: kind.clone(),
                retryable: *retryable,
                code: code.clone(),
                message: message.clone(),
                details: details.clone(),
            },
            AdapterError::Timeout { ms } => OutcomeError {
                kind: "timeout".into(),
                retryable: true,
                code: None,
                message: format!("invocation timed out after {}ms", ms),
                details: None,
            },
        }
    }
}

/// Adapter for one tool kind.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// The tool kind this adapter serves.
    fn kind(&self) -> &'static str;

    /// Execute a rendered invocation.
    async fn invoke(&self, invocation: &Invocation) -> Result<Value, AdapterError>;
}

/// Registry of adapters keyed by kind.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with the built-in adapters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::tools::NoopAdapter);
        registry
    }

    pub fn register<T: ToolAdapter + 'static>(&mut self, adapter: T) {
        self.adapters
            .insert(adapter.kind().to_string(), Arc::new(adapter));
    }

    pub fn register_arc(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.kind().to_string(), adapter);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }

    pub async fn invoke(&self, invocation: &Invocation) -> Result<Value, AdapterError> {
        let adapter = self
            .get(&invocation.kind)
            .ok_or_else(|| AdapterError::NotFound(invocation.kind.clone()))?;
        adapter.invoke(invocation).await
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
