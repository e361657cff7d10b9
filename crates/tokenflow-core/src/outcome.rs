//! Tool invocation outcomes.
//!
//! Every adapter call yields an [`Outcome`] — never a raised error — so eval
//! rules always have a value to match on. Kind-specific helper fields (http
//! status, pg sqlstate, py exception) ride alongside the generic envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Outcome status: exactly one of success or error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "success"),
            OutcomeStatus::Error => write!(f, "error"),
        }
    }
}

/// Structured error payload on a failed outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeError {
    /// Coarse class: "http", "pg", "py", "timeout", "adapter", "config".
    pub kind: String,
    /// Whether a retry of the same invocation could plausibly succeed.
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Timing and attempt metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeMeta {
    pub attempt: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl OutcomeMeta {
    pub fn new(attempt: u32, started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            attempt,
            duration_ms,
            trace_id: None,
            started_at,
            finished_at,
        }
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    pub meta: OutcomeMeta,
    /// Kind-specific helper fields, flattened into the envelope:
    /// `http.status`, `pg.sqlstate`, `py.exception` and friends.
    #[serde(flatten)]
    pub helpers: Map<String, Value>,
}

impl Outcome {
    pub fn success(result: Value, meta: OutcomeMeta) -> Self {
        Self {
            status: OutcomeStatus::Success,
            result: Some(result),
            error: None,
            meta,
            helpers: Map::new(),
        }
    }

    pub fn error(error: OutcomeError, meta: OutcomeMeta) -> Self {
        Self {
            status: OutcomeStatus::Error,
            result: None,
            error: Some(error),
            meta,
            helpers: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == OutcomeStatus::Error
    }

    /// Attach kind helpers pulled out of a structured result or error
    /// details. HTTP results expose `http.status`/`http.headers`, postgres
    /// errors expose `pg.code`/`pg.sqlstate`, python errors expose
    /// `py.exception`/`py.traceback`.
    pub fn with_kind_helpers(mut self, kind: &str) -> Self {
        let source = match self.status {
            OutcomeStatus::Success => self.result.clone().unwrap_or(Value::Null),
            OutcomeStatus::Error => self
                .error
                .as_ref()
                .and_then(|e| e.details.clone())
                .unwrap_or(Value::Null),
        };
        let helper = match kind {
            "http" => json!({
                "status": source.get("status").cloned().unwrap_or(Value::Null),
                "headers": source.get("headers").cloned().unwrap_or(Value::Null),
            }),
            "postgres" | "pg" => json!({
                "code": source.get("code").cloned().unwrap_or(Value::Null),
                "sqlstate": source.get("sqlstate").cloned().unwrap_or(Value::Null),
            }),
            "python" | "py" => json!({
                "exception": source.get("exception").cloned().unwrap_or(Value::Null),
                "traceback": source.get("traceback").cloned().unwrap_or(Value::Null),
            }),
            _ => return self,
        };
        let key = match kind {
            "postgres" => "pg",
            "python" => "py",
            other => other,
        };
        self.helpers.insert(key.to_string(), helper);
        self
    }

    /// Serialize for template scopes. Infallible by construction: every
    /// field is already JSON-shaped.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Pointer to an externalized payload.
///
/// Large results are stored out of line; the log and downstream scopes carry
/// this handle instead of the bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reference {
    pub store: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<(u64, u64)>,
    pub size: u64,
    pub checksum: String,
}

impl Reference {
    pub fn new(store: impl Into<String>, key: impl Into<String>, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        Self {
            store: store.into(),
            key: key.into(),
            range: None,
            size: payload.len() as u64,
            checksum: format!("{:x}", hasher.finalize()),
        }
    }

    /// Wrap as the `$ref` envelope used inside event payloads.
    pub fn to_value(&self) -> Value {
        json!({ "$ref": self })
    }

    /// Recognize a `$ref` envelope.
    pub fn from_value(value: &Value) -> Option<Reference> {
        let inner = value.get("$ref")?;
        serde_json::from_value(inner.clone()).ok()
    }
}

/// Replace `value` with a [`Reference`] if its serialized size exceeds
/// `threshold` bytes. The caller owns actually persisting the payload under
/// the returned key.
pub fn externalize(value: &Value, threshold: usize, store: &str, key: &str) -> Value {
    let serialized = value.to_string();
    if serialized.len() <= threshold {
        return value.clone();
    }
    Reference::new(store, key, serialized.as_bytes()).to_value()
}
