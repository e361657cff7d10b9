//! Core types shared by the tokenflow engine and worker crates.
//!
//! Everything here is transport-agnostic: the playbook model, the event
//! envelope that the append-only log stores, tool outcomes, and the Jinja
//! template renderer used for guards, eval rules, and input rendering.

pub mod error;
pub mod event;
pub mod outcome;
pub mod playbook;
pub mod run;
pub mod template;
pub mod value;

pub use error::{EngineError, EngineResult};
pub use event::{EntityKind, Event, EventId, EventName, EventSource, EventStatus};
pub use outcome::{Outcome, OutcomeError, OutcomeMeta, OutcomeStatus, Reference};
pub use playbook::{
    parse_playbook, validate_playbook, ArcDef, Backoff, Directive, EvalEntry, EvalRule, LoopDef,
    LoopMode, NextMode, Playbook, Step, TaskDef,
};
pub use run::{ExecutionId, Lease, RunStatus, StepRun, StepRunId, Token, TokenId};
pub use template::TemplateRenderer;
