//! No-op adapter: succeeds and echoes its inputs.

use async_trait::async_trait;
use serde_json::Value;

use crate::adapter::{AdapterError, Invocation, ToolAdapter};

/// Echoes rendered inputs back as the result. Useful for pure control-flow
/// steps and for checking what a template renders to.
pub struct NoopAdapter;

#[async_trait]
impl ToolAdapter for NoopAdapter {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<Value, AdapterError> {
        Ok(invocation.inputs.clone())
    }
}
