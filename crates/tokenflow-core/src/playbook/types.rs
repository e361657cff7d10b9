//! Playbook data model.
//!
//! A playbook is a Petri net over named steps: tokens mark steps, each step
//! optionally runs an ordered tool pipeline, and `next` arcs decide which
//! tokens to enqueue from the step's terminal event.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

/// Name of the step the initial token targets.
pub const START_STEP: &str = "start";

/// Tool kinds understood out of the box. Playbooks may extend this set via
/// `executor.allow_kinds`.
pub const DEFAULT_TOOL_KINDS: &[&str] = &[
    "http", "postgres", "python", "shell", "script", "secrets", "playbook", "noop", "fixture",
];

/// Top-level playbook document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub executor: ExecutorSpec,
    /// Immutable execution input; merged with the submission payload.
    #[serde(default)]
    pub workload: Value,
    pub workflow: Vec<Step>,
    /// Optional library of named reusable task definitions. Carried through
    /// parsing; steps reference workbook tasks by copying their bodies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workbook: Option<Value>,
    /// Any other root-level key. Validation rejects these: mutable state
    /// must not be declared at the document root.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Playbook {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }
}

/// Playbook identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Executor-level knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorSpec {
    /// Extra tool kinds this playbook is allowed to reference.
    #[serde(default)]
    pub allow_kinds: Vec<String>,
}

/// A workflow step (a place in the net).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default)]
    pub spec: StepSpec,
    /// Guard expression; a false guard consumes the token without running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_def: Option<LoopDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolSection>,
    #[serde(default)]
    pub next: Vec<ArcEntry>,
}

impl Step {
    /// Normalize the tool section into an ordered, labeled pipeline.
    ///
    /// The single-task shorthand gets the label `main`. The pipeline form is
    /// a YAML list of single-key maps, `- <label>: <task>`.
    pub fn pipeline(&self) -> EngineResult<Vec<TaskDef>> {
        match &self.tool {
            None => Ok(Vec::new()),
            Some(ToolSection::Single(body)) => Ok(vec![TaskDef::labeled("main", body.clone())]),
            Some(ToolSection::Pipeline(entries)) => {
                let mut tasks = Vec::with_capacity(entries.len());
                for entry in entries {
                    if entry.len() != 1 {
                        return Err(EngineError::SchemaViolation(format!(
                            "step '{}': each pipeline entry must be a single `label: task` map",
                            self.step
                        )));
                    }
                    for (label, body) in entry {
                        tasks.push(TaskDef::labeled(label, body.clone()));
                    }
                }
                Ok(tasks)
            }
        }
    }

    /// Normalize arcs; the string shorthand is an unconditional arc.
    pub fn arcs(&self) -> Vec<ArcDef> {
        self.next
            .iter()
            .map(|entry| match entry {
                ArcEntry::Name(name) => ArcDef {
                    step: name.clone(),
                    when: None,
                    args: None,
                },
                ArcEntry::Full(arc) => arc.clone(),
            })
            .collect()
    }
}

/// Step-level spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub next_mode: NextMode,
}

/// Arc selection policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NextMode {
    /// First arc whose guard matches fires; the rest are skipped.
    #[default]
    Exclusive,
    /// Every arc whose guard matches fires, in declaration order.
    Inclusive,
}

/// One outgoing arc entry, canonical or shorthand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArcEntry {
    Full(ArcDef),
    Name(String),
}

/// A canonical outgoing arc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArcDef {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Rendered and merged into the produced token's payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

/// Loop declaration on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDef {
    /// Expression yielding the collection to iterate.
    #[serde(rename = "in")]
    pub collection: String,
    /// Name the current element is bound to in the `iter` scope.
    pub iterator: String,
    #[serde(default)]
    pub spec: LoopSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopSpec {
    #[serde(default)]
    pub mode: LoopMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Sequential,
    Parallel,
}

/// Tool section: a single task or an ordered pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolSection {
    Pipeline(Vec<HashMap<String, TaskBody>>),
    Single(TaskBody),
}

/// Body of a tool task as written in YAML, before labeling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBody {
    pub kind: String,
    /// Runtime knobs (timeout, adapter-specific settings).
    #[serde(default)]
    pub spec: Map<String, Value>,
    /// Template-rendered adapter inputs.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub eval: Vec<EvalEntry>,
}

/// A labeled pipeline task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub label: String,
    pub kind: String,
    #[serde(default)]
    pub spec: Map<String, Value>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub eval: Vec<EvalEntry>,
}

impl TaskDef {
    fn labeled(label: impl Into<String>, body: TaskBody) -> Self {
        Self {
            label: label.into(),
            kind: body.kind,
            spec: body.spec,
            inputs: body.inputs,
            eval: body.eval,
        }
    }

    /// Optional per-invocation timeout from `spec.timeout_ms`.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.spec.get("timeout_ms").and_then(|v| v.as_u64())
    }
}

/// One entry in a task's `eval` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvalEntry {
    /// Fallback arm: fires when no conditional rule matched.
    Else {
        #[serde(rename = "else")]
        rule: EvalRule,
    },
    Rule(EvalRule),
}

/// An eval rule: a guard plus a directive and its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRule {
    /// Condition over the outcome and scopes; absent on `else` arms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(rename = "do")]
    pub directive: Directive,
    /// Retry budget, counting the first invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Backoff,
    /// Base delay in seconds for retry backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
    /// Jump target label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_vars: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_iter: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_ctx: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_shared: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_prev: Option<Value>,
}

impl EvalRule {
    /// Implicit rule when an outcome succeeded and nothing matched.
    pub fn default_continue() -> Self {
        Self::bare(Directive::Continue)
    }

    /// Implicit rule when an outcome failed and nothing matched.
    pub fn default_fail() -> Self {
        Self::bare(Directive::Fail)
    }

    fn bare(directive: Directive) -> Self {
        Self {
            expr: None,
            directive,
            attempts: None,
            backoff: Backoff::Fixed,
            delay: None,
            to: None,
            set_vars: None,
            set_iter: None,
            set_ctx: None,
            set_shared: None,
            set_prev: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts.unwrap_or(3)
    }
}

/// Pipeline control directive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Directive {
    Continue,
    Retry,
    Jump,
    Break,
    Fail,
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Directive::Continue => "continue",
            Directive::Retry => "retry",
            Directive::Jump => "jump",
            Directive::Break => "break",
            Directive::Fail => "fail",
        };
        write!(f, "{}", s)
    }
}

/// Retry delay shape.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

impl Backoff {
    /// Delay in seconds before the given attempt (1-based) is retried.
    pub fn delay_secs(&self, base: f64, attempt: u32) -> f64 {
        let attempt = attempt.max(1);
        match self {
            Backoff::Fixed => base,
            Backoff::Linear => base * attempt as f64,
            Backoff::Exponential => base * 2f64.powi(attempt as i32 - 1),
        }
    }
}
