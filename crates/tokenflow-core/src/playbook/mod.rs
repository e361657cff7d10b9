//! Playbook model: parsing, structure, validation.

mod types;
mod validate;

pub use types::{
    ArcDef, ArcEntry, Backoff, Directive, EvalEntry, EvalRule, ExecutorSpec, LoopDef, LoopMode,
    LoopSpec, Metadata, NextMode, Playbook, Step, StepSpec, TaskDef, ToolSection,
    DEFAULT_TOOL_KINDS, START_STEP,
};
pub use validate::{parse_playbook, validate_playbook};
