//! Error taxonomy for the engine.
//!
//! Validation and reference errors are fatal and never retried; lease and
//! adapter failures are transient and surface through re-dispatch instead.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Playbook failed structural validation (duplicate step names, dangling
    /// arcs, missing start step, forbidden root fields, unknown tool kinds).
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Playbook could not be parsed at all.
    #[error("parse error: {0}")]
    Parse(String),

    /// A template referenced a name outside the allowed scopes.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// A `jump` directive named a task label that does not exist.
    #[error("unknown jump target '{0}'")]
    UnknownJumpTarget(String),

    /// A loop collection expression produced a non-iterable value.
    #[error("invalid loop collection: {0}")]
    InvalidCollection(String),

    /// A worker heartbeat or completion arrived after its lease was lost.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// The event log refused an append.
    #[error("log durability: {0}")]
    LogDurability(String),

    /// Template rendering failed.
    #[error("template error: {0}")]
    Template(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad engine or worker configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

impl EngineError {
    /// Fatal errors reject the submission or fail the step run outright;
    /// they are never retried by the scheduler.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::LeaseLost(_) | EngineError::LogDurability(_))
    }
}

/// Result alias used throughout the workspace.
pub type EngineResult<T> = Result<T, EngineError>;
