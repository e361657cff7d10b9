//! Data plane: tool adapters and the pipeline interpreter, plus the worker
//! pool that claims step runs from the scheduler and drives them to their
//! terminal events.

pub mod adapter;
pub mod config;
pub mod eval;
pub mod iteration;
pub mod pipeline;
pub mod tools;
pub mod worker;

pub use adapter::{AdapterError, AdapterRegistry, Invocation, ToolAdapter};
pub use config::WorkerConfig;
pub use iteration::{IterationManager, LoopOutcome};
pub use pipeline::{PipelineExecutor, PipelineOutcome, PipelineStatus};
pub use worker::{Runtime, Worker};
