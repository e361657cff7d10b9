//! Control plane: the append-only event log, the materialized context
//! store, replay, and the token scheduler.
//!
//! The log is the source of truth. The scheduler holds derived state for
//! speed, but everything it knows can be rebuilt by folding the log (see
//! [`replay`]).

pub mod config;
pub mod context;
pub mod log;
pub mod replay;
pub mod scheduler;

pub use config::EngineConfig;
pub use context::{ContextStore, CtxSnapshot};
pub use log::EventLog;
pub use replay::{ExecutionState, ExecutionStatus};
pub use scheduler::{ClaimedRun, TokenScheduler};
