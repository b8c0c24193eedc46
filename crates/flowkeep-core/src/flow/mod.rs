//! Durable flow execution.
//!
//! Flows are explicit state machines: a serializable struct plus an
//! `advance` transition function. The `StateMachine` drives each run through
//! its suspension points, checkpointing the struct before every suspension's
//! I/O so that a run can be rebuilt from the store and resumed.

pub mod checkpoint;
pub mod error;
pub mod logic;
pub mod machine;
pub mod observer;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{EngineError, FlowError, RunError};
pub use logic::{FlowAction, FlowContext, FlowLogic, Resumed, SuspendOn};
pub use machine::{RecoveryReport, ResumeEvent, StateMachine, StateMachineBuilder};
pub use observer::EngineObserver;
pub use registry::FlowRegistry;
